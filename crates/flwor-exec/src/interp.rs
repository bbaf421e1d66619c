//! Expression interpreter.
//!
//! `value` evaluates an expression to a materialized sequence; `iter`
//! returns a pull iterator, lazy for FLWORs, ranges, sequences and
//! conditionals and buffered for everything else.

use std::collections::HashSet;

use flwor_core::error::{Error, Result};
use flwor_core::expr::{Axis, Expr, Step};
use flwor_core::func::Func;
use flwor_core::id::NodeId;
use flwor_core::types::{self, Item, Node, Value};

use crate::context::{Focus, QueryContext};
use crate::eval::FlworIter;

/// A single-pass item sequence pulled through the dynamic context.
pub trait ItemIter {
    fn next_item(&mut self, qc: &mut QueryContext) -> Result<Option<Item>>;
}

struct Buffered(std::vec::IntoIter<Item>);

impl ItemIter for Buffered {
    fn next_item(&mut self, _qc: &mut QueryContext) -> Result<Option<Item>> {
        Ok(self.0.next())
    }
}

struct RangeIter {
    next: Option<i64>,
    hi: i64,
}

impl ItemIter for RangeIter {
    fn next_item(&mut self, _qc: &mut QueryContext) -> Result<Option<Item>> {
        let Some(v) = self.next else {
            return Ok(None);
        };
        self.next = if v < self.hi { Some(v + 1) } else { None };
        Ok(Some(Item::Int(v)))
    }
}

struct SeqIter<'a> {
    exprs: &'a [Expr],
    idx: usize,
    cur: Option<Box<dyn ItemIter + 'a>>,
}

impl<'a> ItemIter for SeqIter<'a> {
    fn next_item(&mut self, qc: &mut QueryContext) -> Result<Option<Item>> {
        loop {
            if let Some(cur) = self.cur.as_mut() {
                if let Some(item) = cur.next_item(qc)? {
                    return Ok(Some(item));
                }
                self.cur = None;
            }
            let Some(e) = self.exprs.get(self.idx) else {
                return Ok(None);
            };
            self.idx += 1;
            self.cur = Some(iter(e, qc)?);
        }
    }
}

pub fn iter<'a>(expr: &'a Expr, qc: &mut QueryContext) -> Result<Box<dyn ItemIter + 'a>> {
    Ok(match expr {
        Expr::Flwor(f) => Box::new(FlworIter::new(f)),
        Expr::Range(a, b) => {
            let next = range_bounds(a, b, qc)?;
            Box::new(RangeIter {
                next: next.map(|(lo, _)| lo),
                hi: next.map_or(0, |(_, hi)| hi),
            })
        }
        Expr::Seq(es) => Box::new(SeqIter {
            exprs: es,
            idx: 0,
            cur: None,
        }),
        Expr::If { cond, then, els } => {
            if value(cond, qc)?.ebv()? {
                iter(then, qc)?
            } else {
                iter(els, qc)?
            }
        }
        other => Box::new(Buffered(value(other, qc)?.into_iter())),
    })
}

/// Drains an iterator into a value.
pub fn collect(mut it: Box<dyn ItemIter + '_>, qc: &mut QueryContext) -> Result<Value> {
    let mut out = Value::empty();
    while let Some(item) = it.next_item(qc)? {
        out.push(item);
    }
    Ok(out)
}

pub fn value(expr: &Expr, qc: &mut QueryContext) -> Result<Value> {
    match expr {
        Expr::Value(v) => Ok(v.clone()),
        Expr::VarRef(v) => qc.lookup(*v),
        Expr::ContextItem => Ok(Value::single(qc.focus()?.item.clone())),
        Expr::Range(..) | Expr::Seq(_) | Expr::Flwor(_) => collect(iter(expr, qc)?, qc),
        Expr::And(es) => {
            for e in es {
                if !value(e, qc)?.ebv()? {
                    return Ok(Value::bool(false));
                }
            }
            Ok(Value::bool(true))
        }
        Expr::Or(es) => {
            for e in es {
                if value(e, qc)?.ebv()? {
                    return Ok(Value::bool(true));
                }
            }
            Ok(Value::bool(false))
        }
        Expr::Cmp { op, left, right } => {
            let (l, r) = (value(left, qc)?, value(right, qc)?);
            Ok(Value::bool(types::general_compare(*op, &l, &r)?))
        }
        Expr::Arith { op, left, right } => {
            let (l, r) = (value(left, qc)?, value(right, qc)?);
            types::arith(*op, &l, &r)
        }
        Expr::If { cond, then, els } => {
            if value(cond, qc)?.ebv()? {
                value(then, qc)
            } else {
                value(els, qc)
            }
        }
        Expr::Call { func, args } => call(*func, args, qc),
        Expr::Element { name, content } => element(name, content, qc),
        Expr::Filter { base, preds } => {
            let items = value(base, qc)?.0;
            Ok(Value(filter(items, preds, qc)?))
        }
        Expr::Path { root, steps } => path(root, steps, qc),
        Expr::TypeCheck { expr, ty } => {
            let v = value(expr, qc)?;
            ty.check(&v)?;
            Ok(v)
        }
        Expr::Raise { code, message, .. } => Err(Error::dynamic(code, message.clone())),
    }
}

fn range_bounds(a: &Expr, b: &Expr, qc: &mut QueryContext) -> Result<Option<(i64, i64)>> {
    let bound = |v: Value| -> Result<Option<i64>> {
        match v.atomize().as_slice() {
            [] => Ok(None),
            [Item::Int(i)] => Ok(Some(*i)),
            _ => Err(Error::dynamic(
                "XPTY0004",
                format!("range bound must be a single integer, got {}", v),
            )),
        }
    };
    let lo = bound(value(a, qc)?)?;
    let hi = bound(value(b, qc)?)?;
    Ok(match (lo, hi) {
        (Some(lo), Some(hi)) if lo <= hi => Some((lo, hi)),
        _ => None,
    })
}

fn call(func: Func, args: &[Expr], qc: &mut QueryContext) -> Result<Value> {
    match func {
        Func::Position => Ok(Value::int(qc.focus()?.pos as i64)),
        Func::Last => Ok(Value::int(qc.focus()?.last as i64)),
        Func::Counter => {
            let name = name_arg(args, qc)?;
            Ok(Value::int(qc.counter(&name)))
        }
        Func::Put => {
            let name = name_arg(args, qc)?;
            let v = match args.get(1) {
                Some(e) => value(e, qc)?,
                None => Value::empty(),
            };
            qc.record_update(name, v);
            Ok(Value::empty())
        }
        pure => {
            let vals = args
                .iter()
                .map(|a| value(a, qc))
                .collect::<Result<Vec<_>>>()?;
            pure.eval_pure(&vals)
        }
    }
}

fn name_arg(args: &[Expr], qc: &mut QueryContext) -> Result<String> {
    let v = match args.first() {
        Some(e) => value(e, qc)?,
        None => Value::empty(),
    };
    match v.items() {
        [item] => Ok(item.string_value()),
        _ => Err(Error::dynamic(
            "XPTY0004",
            format!("expected a single name, got {}", v),
        )),
    }
}

fn element(name: &str, content: &Expr, qc: &mut QueryContext) -> Result<Value> {
    let items = value(content, qc)?;
    let id = qc.fresh_node_id();
    let mut text: Vec<String> = Vec::new();
    let mut children = Vec::new();
    for item in items.items() {
        match item {
            Item::Node(n) => children.push(qc.copy_node(n)),
            atom => text.push(atom.string_value()),
        }
    }
    Ok(Value::single(Item::Node(Node {
        id,
        name: name.to_string(),
        text: text.join(" "),
        children,
    })))
}

/// Applies predicates left to right. A numeric predicate value selects by
/// position, anything else by effective boolean value.
fn filter(mut items: Vec<Item>, preds: &[Expr], qc: &mut QueryContext) -> Result<Vec<Item>> {
    for pred in preds {
        let last = items.len();
        let mut kept = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            qc.push_focus(Focus {
                item: item.clone(),
                pos: i + 1,
                last,
            });
            let v = value(pred, qc);
            qc.pop_focus();
            if matches_pred(&v?, i + 1)? {
                kept.push(item);
            }
        }
        items = kept;
    }
    Ok(items)
}

fn matches_pred(v: &Value, pos: usize) -> Result<bool> {
    match v.items() {
        [Item::Int(i)] => Ok(*i == pos as i64),
        [Item::Double(d)] => Ok(*d == pos as f64),
        _ => v.ebv(),
    }
}

fn path(root: &Expr, steps: &[Step], qc: &mut QueryContext) -> Result<Value> {
    let mut nodes = Vec::new();
    for item in value(root, qc)?.into_iter() {
        match item {
            Item::Node(n) => nodes.push(n),
            other => {
                return Err(Error::dynamic(
                    "XPTY0019",
                    format!("path root must be a node, got {}", other.type_name()),
                ))
            }
        }
    }
    for step in steps {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut next = Vec::new();
        for ctx in &nodes {
            let candidates: Vec<Item> = match step.axis {
                Axis::Child => ctx.children.iter().collect(),
                Axis::SelfAxis => vec![ctx],
                Axis::Descendant => ctx.descendants(),
            }
            .into_iter()
            .filter(|n| step.matches(n))
            .map(|n| Item::Node(n.clone()))
            .collect();
            for item in filter(candidates, &step.preds, qc)? {
                if let Item::Node(n) = item {
                    if seen.insert(n.id) {
                        next.push(n);
                    }
                }
            }
        }
        nodes = next;
    }
    Ok(Value(nodes.into_iter().map(Item::Node).collect()))
}

#[cfg(test)]
mod tests {
    use flwor_core::seqtype::SeqType;
    use flwor_core::types::{ArithOp, CmpOp};
    use flwor_core::var::VarScope;

    use super::*;

    fn eval(expr: &Expr) -> Result<Value> {
        let scope = VarScope::new();
        let mut qc = QueryContext::new(&scope);
        value(expr, &mut qc)
    }

    fn elem(name: &str, content: Expr) -> Expr {
        Expr::Element {
            name: name.into(),
            content: Box::new(content),
        }
    }

    #[test]
    fn arithmetic_and_comparison() {
        let e = Expr::arith(ArithOp::Mul, Expr::int(6), Expr::int(7));
        assert_eq!(eval(&e).unwrap(), Value::int(42));
        let c = Expr::cmp(
            CmpOp::Eq,
            Expr::Value(Value::ints([1, 2, 3])),
            Expr::int(2),
        );
        assert_eq!(eval(&c).unwrap(), Value::bool(true));
    }

    #[test]
    fn ranges_are_inclusive() {
        let r = Expr::range(Expr::int(2), Expr::int(5));
        assert_eq!(eval(&r).unwrap(), Value::ints([2, 3, 4, 5]));
        let empty = Expr::range(Expr::int(5), Expr::int(2));
        assert_eq!(eval(&empty).unwrap(), Value::empty());
    }

    #[test]
    fn numeric_predicates_select_by_position() {
        let f = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([10, 20, 30]))),
            preds: vec![Expr::int(2)],
        };
        assert_eq!(eval(&f).unwrap(), Value::int(20));
        let last = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([10, 20, 30]))),
            preds: vec![Expr::call(Func::Last, vec![])],
        };
        assert_eq!(eval(&last).unwrap(), Value::int(30));
        let cond = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([10, 20, 30]))),
            preds: vec![Expr::cmp(CmpOp::Gt, Expr::ContextItem, Expr::int(15))],
        };
        assert_eq!(eval(&cond).unwrap(), Value::ints([20, 30]));
    }

    #[test]
    fn context_item_needs_a_focus() {
        let err = eval(&Expr::ContextItem).unwrap_err();
        assert_eq!(err.code(), Some("XPDY0002"));
    }

    #[test]
    fn constructed_nodes_get_fresh_ids() {
        let pair = Expr::Seq(vec![elem("a", Expr::empty()), elem("a", Expr::empty())]);
        let v = eval(&pair).unwrap();
        match v.items() {
            [Item::Node(x), Item::Node(y)] => assert_ne!(x.id, y.id),
            other => panic!("expected two nodes, got {:?}", other),
        }
    }

    #[test]
    fn paths_walk_children_and_descendants() {
        let doc = elem(
            "root",
            Expr::Seq(vec![
                elem("a", Expr::str("x")),
                elem("b", elem("a", Expr::str("y"))),
            ]),
        );
        let child = Expr::Path {
            root: Box::new(doc.clone()),
            steps: vec![Step::new(Axis::Child, Some("a"))],
        };
        let v = eval(&child).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v.items()[0].string_value(), "x");

        let desc = Expr::Path {
            root: Box::new(doc),
            steps: vec![Step::new(Axis::Descendant, Some("a"))],
        };
        let texts: Vec<String> = eval(&desc)
            .unwrap()
            .items()
            .iter()
            .map(Item::string_value)
            .collect();
        assert_eq!(texts, vec!["x", "y"]);

        let bad = Expr::Path {
            root: Box::new(Expr::int(1)),
            steps: vec![Step::new(Axis::Child, None)],
        };
        assert_eq!(eval(&bad).unwrap_err().code(), Some("XPTY0019"));
    }

    #[test]
    fn side_channels_are_recorded() {
        let scope = VarScope::new();
        let mut qc = QueryContext::new(&scope);
        let tick = Expr::call(Func::Counter, vec![Expr::str("c")]);
        assert_eq!(value(&tick, &mut qc).unwrap(), Value::int(1));
        assert_eq!(value(&tick, &mut qc).unwrap(), Value::int(2));
        let put = Expr::call(Func::Put, vec![Expr::str("k"), Expr::int(5)]);
        assert_eq!(value(&put, &mut qc).unwrap(), Value::empty());
        assert_eq!(qc.updates().len(), 1);
        assert_eq!(qc.updates()[0].value, Value::int(5));
    }

    #[test]
    fn raise_and_type_checks_fail_at_runtime() {
        let raise = Expr::Raise {
            code: "APP01".into(),
            message: "deferred".into(),
            ty: SeqType::ITEM_ZM,
        };
        assert_eq!(eval(&raise).unwrap_err().code(), Some("APP01"));
        let treat = Expr::type_check(Expr::str("a"), SeqType::INTEGER);
        assert_eq!(eval(&treat).unwrap_err().code(), Some("XPTY0004"));
    }

    #[test]
    fn and_short_circuits() {
        let e = Expr::And(vec![
            Expr::bool(false),
            Expr::call(Func::Error, vec![Expr::str("NOPE")]),
        ]);
        assert_eq!(eval(&e).unwrap(), Value::bool(false));
    }
}
