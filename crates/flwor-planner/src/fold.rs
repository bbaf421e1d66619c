//! Node-level simplification: constant folding and local rewrites applied to
//! every expression once its children are compiled.

use flwor_core::error::{Error, Result};
use flwor_core::expr::{Expr, Flag};
use flwor_core::func::Func;
use flwor_core::seqtype::ItemType;
use flwor_core::types::{self, Item, Value};

use crate::diag::Rewrite;
use crate::planner::Planner;

impl Planner<'_> {
    /// Simplifies a node whose children are already compiled. Failures of
    /// compile-time evaluation surface as static errors.
    pub fn optimize(&mut self, expr: Expr) -> Result<Expr> {
        let was_value = expr.is_value();
        let out = self.simplify(expr).map_err(into_static)?;
        if !was_value && out.is_value() {
            let detail = self.show(&out);
            self.note(Rewrite::Fold, detail);
        }
        Ok(out)
    }

    fn simplify(&mut self, expr: Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Range(a, b) => {
                if is_empty(&a) || is_empty(&b) {
                    Expr::empty()
                } else {
                    match (a.as_int(), b.as_int()) {
                        (Some(x), Some(y)) if y < x => Expr::empty(),
                        (Some(x), Some(y)) if x == y => Expr::int(x),
                        _ => Expr::Range(a, b),
                    }
                }
            }
            Expr::Seq(es) => flatten_seq(es),
            Expr::And(es) => self.junction(es, true),
            Expr::Or(es) => self.junction(es, false),
            Expr::Cmp { op, left, right } => match (left.as_value(), right.as_value()) {
                (Some(l), Some(r)) => Expr::bool(types::general_compare(op, l, r)?),
                _ => Expr::Cmp { op, left, right },
            },
            Expr::Arith { op, left, right } => {
                if is_empty(&left) || is_empty(&right) {
                    Expr::empty()
                } else {
                    match (left.as_value(), right.as_value()) {
                        (Some(l), Some(r)) => Expr::Value(types::arith(op, l, r)?),
                        _ => Expr::Arith { op, left, right },
                    }
                }
            }
            Expr::If { cond, then, els } => {
                let cond = match *cond {
                    Expr::Call {
                        func: Func::Boolean,
                        mut args,
                    } if args.len() == 1 => args.remove(0),
                    other => other,
                };
                match cond.as_value().map(Value::ebv) {
                    Some(Ok(true)) => *then,
                    Some(Ok(false)) => *els,
                    _ if then == els && !side_effects(&cond) => *then,
                    _ => Expr::If {
                        cond: Box::new(cond),
                        then,
                        els,
                    },
                }
            }
            Expr::Call { func, args } => self.call(func, args)?,
            Expr::Filter { base, preds } => simplify_filter(*base, preds),
            Expr::Path { root, steps } => {
                if is_empty(&root) {
                    Expr::empty()
                } else if steps.is_empty() {
                    *root
                } else {
                    Expr::Path { root, steps }
                }
            }
            Expr::TypeCheck { expr, ty } => {
                if let Some(v) = expr.as_value() {
                    ty.check(v)?;
                    return Ok(*expr);
                }
                let st = expr.seq_type(self.scope);
                if st.is_sub_type_of(&ty) {
                    *expr
                } else if st.is_disjoint(&ty) {
                    return Err(Error::static_err(
                        "XPTY0004",
                        format!("{} cannot be treated as {}", st, ty),
                    ));
                } else {
                    Expr::TypeCheck { expr, ty }
                }
            }
            Expr::Flwor(flwor) => return self.optimize_flwor(*flwor),
            other => other,
        })
    }

    /// `and` (`conj`) or `or`. Constant operands either decide the result or
    /// drop out; evaluation stops at a deciding constant.
    fn junction(&mut self, es: Vec<Expr>, conj: bool) -> Expr {
        let mut out: Vec<Expr> = Vec::new();
        for e in es {
            let nested = match e {
                Expr::And(inner) if conj => inner,
                Expr::Or(inner) if !conj => inner,
                other => vec![other],
            };
            for e in nested {
                match e.as_value().map(Value::ebv) {
                    Some(Ok(b)) if b == conj => {}
                    Some(Ok(_)) => {
                        if !out.iter().any(side_effects) {
                            return Expr::bool(!conj);
                        }
                        out.push(Expr::bool(!conj));
                        return rebuild(out, conj);
                    }
                    _ => out.push(e),
                }
            }
        }
        match out.len() {
            0 => Expr::bool(conj),
            1 => self.to_boolean(out.remove(0)),
            _ => rebuild(out, conj),
        }
    }

    pub(crate) fn to_boolean(&self, expr: Expr) -> Expr {
        let st = expr.seq_type(self.scope);
        if st.one() && st.item == ItemType::Boolean {
            expr
        } else {
            Expr::call(Func::Boolean, vec![expr])
        }
    }

    fn call(&mut self, func: Func, args: Vec<Expr>) -> Result<Expr> {
        if func.is_pure() && args.iter().all(Expr::is_value) {
            let values: Vec<Value> = args
                .into_iter()
                .map(|a| match a {
                    Expr::Value(v) => v,
                    _ => Value::empty(),
                })
                .collect();
            return Ok(Expr::Value(func.eval_pure(&values)?));
        }
        let known = match args.first() {
            Some(arg) if args.len() == 1 && !side_effects(arg) => arg.size(self.scope),
            _ => None,
        };
        Ok(match (func, known) {
            (Func::Count, Some(n)) if i64::try_from(n).is_ok() => Expr::int(n as i64),
            (Func::Empty, Some(n)) => Expr::bool(n == 0),
            (Func::Exists, Some(n)) => Expr::bool(n > 0),
            (Func::Boolean, _) if args.len() == 1 => {
                let st = args[0].seq_type(self.scope);
                if st.one() && st.item == ItemType::Boolean {
                    args.into_iter().next().unwrap_or_default()
                } else {
                    Expr::Call { func, args }
                }
            }
            _ => Expr::Call { func, args },
        })
    }
}

fn rebuild(es: Vec<Expr>, conj: bool) -> Expr {
    if conj {
        Expr::And(es)
    } else {
        Expr::Or(es)
    }
}

fn is_empty(e: &Expr) -> bool {
    e.as_value().map_or(false, Value::is_empty)
}

fn side_effects(e: &Expr) -> bool {
    e.has(Flag::Ndt) || e.has(Flag::Upd)
}

fn flatten_seq(es: Vec<Expr>) -> Expr {
    let mut out: Vec<Expr> = Vec::new();
    for e in es {
        let parts = match e {
            Expr::Seq(inner) => inner,
            other => vec![other],
        };
        for part in parts {
            match part {
                Expr::Value(v) if v.is_empty() => {}
                Expr::Value(v) => match out.last_mut() {
                    Some(Expr::Value(prev)) => prev.extend(v),
                    _ => out.push(Expr::Value(v)),
                },
                other => out.push(other),
            }
        }
    }
    match out.len() {
        0 => Expr::empty(),
        1 => out.remove(0),
        _ => Expr::Seq(out),
    }
}

fn simplify_filter(base: Expr, mut preds: Vec<Expr>) -> Expr {
    if is_empty(&base) {
        return Expr::empty();
    }
    // leading constant predicates
    let mut base = base;
    while let Some(first) = preds.first() {
        let Some(v) = first.as_value() else { break };
        match v.items() {
            [Item::Int(i)] => match &base {
                Expr::Value(values) => {
                    let picked = usize::try_from(*i)
                        .ok()
                        .and_then(|i| i.checked_sub(1))
                        .and_then(|i| values.items().get(i).cloned());
                    base = Expr::Value(picked.map(Value::single).unwrap_or_default());
                    preds.remove(0);
                }
                _ => break,
            },
            [Item::Double(_)] => break,
            _ => match v.ebv() {
                Ok(true) => {
                    preds.remove(0);
                }
                Ok(false) => return Expr::empty(),
                Err(_) => break,
            },
        }
    }
    if preds.is_empty() {
        base
    } else {
        Expr::Filter {
            base: Box::new(base),
            preds,
        }
    }
}

/// Errors raised while evaluating at compile time are static errors.
fn into_static(err: Error) -> Error {
    match err {
        Error::Dynamic { code, message } => Error::Static { code, message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use flwor_core::config::EngineConfig;
    use flwor_core::types::{ArithOp, CmpOp};
    use flwor_core::var::VarScope;

    use super::*;
    use crate::diag::{CollectingSink, NullSink};

    fn compile(expr: Expr) -> Result<Expr> {
        let mut scope = VarScope::new();
        let mut sink = NullSink;
        Planner::new(&mut scope, &mut sink, &EngineConfig::default()).compile(expr)
    }

    #[test]
    fn arithmetic_and_comparisons_fold() {
        let sum = Expr::arith(ArithOp::Add, Expr::int(1), Expr::int(2));
        assert_eq!(compile(sum).unwrap(), Expr::int(3));
        let cmp = Expr::cmp(
            CmpOp::Lt,
            Expr::Value(Value::ints([1, 5])),
            Expr::int(2),
        );
        assert_eq!(compile(cmp).unwrap(), Expr::bool(true));
    }

    #[test]
    fn sequences_flatten_and_merge() {
        let seq = Expr::Seq(vec![
            Expr::int(1),
            Expr::Seq(vec![Expr::empty(), Expr::int(2)]),
            Expr::range(Expr::int(3), Expr::int(3)),
        ]);
        assert_eq!(compile(seq).unwrap(), Expr::Value(Value::ints([1, 2, 3])));
    }

    #[test]
    fn junctions_keep_a_single_boolean_operand() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let mut sink = CollectingSink::new();
        let mut planner = Planner::new(&mut scope, &mut sink, &EngineConfig::default());
        let and = Expr::And(vec![Expr::bool(true), Expr::var(x)]);
        assert_eq!(
            planner.compile(and).unwrap(),
            Expr::call(Func::Boolean, vec![Expr::var(x)])
        );
        let or = Expr::Or(vec![Expr::var(x), Expr::bool(true)]);
        assert_eq!(planner.compile(or).unwrap(), Expr::bool(true));
    }

    #[test]
    fn folding_failures_are_static() {
        let div = Expr::arith(ArithOp::IDiv, Expr::int(1), Expr::int(0));
        let err = compile(div).unwrap_err();
        assert!(matches!(err, Error::Static { .. }));
        assert_eq!(err.code(), Some("FOAR0001"));
    }

    #[test]
    fn failing_branch_is_deferred() {
        let raise = Expr::call(Func::Error, vec![Expr::str("APP01")]);
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let mut sink = NullSink;
        let mut planner = Planner::new(&mut scope, &mut sink, &EngineConfig::default());
        let cond = Expr::cmp(CmpOp::Eq, Expr::var(x), Expr::int(1));
        let out = planner
            .compile(Expr::iff(cond, raise, Expr::int(2)))
            .unwrap();
        let Expr::If { then, .. } = out else {
            panic!("expected if, got {:?}", out);
        };
        assert!(matches!(*then, Expr::Raise { ref code, .. } if code == "APP01"));
    }

    #[test]
    fn positional_filter_on_values() {
        let filter = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([4, 5, 6]))),
            preds: vec![Expr::int(2)],
        };
        assert_eq!(compile(filter).unwrap(), Expr::int(5));
        let out_of_range = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([4]))),
            preds: vec![Expr::int(3)],
        };
        assert_eq!(compile(out_of_range).unwrap(), Expr::empty());
    }

    #[test]
    fn count_of_known_size_folds() {
        let count = Expr::call(
            Func::Count,
            vec![Expr::range(Expr::int(1), Expr::int(10))],
        );
        assert_eq!(compile(count).unwrap(), Expr::int(10));
    }

    #[test]
    fn unbounded_range_sizes_stay_dynamic() {
        let whole = || Expr::range(Expr::int(i64::MIN), Expr::int(i64::MAX));
        let exists = Expr::call(Func::Exists, vec![whole()]);
        assert_eq!(compile(exists.clone()).unwrap(), exists);

        let negatives = Expr::range(Expr::int(i64::MIN), Expr::int(-1));
        let count = Expr::call(Func::Count, vec![negatives]);
        assert_eq!(compile(count.clone()).unwrap(), count);
    }
}
