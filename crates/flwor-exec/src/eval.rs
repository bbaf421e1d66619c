//! FLWOR evaluator chain.
//!
//! Each clause wraps the stage built for the clauses before it. A stage is
//! a pull state machine: `next` either updates the round bindings in the
//! query context and returns true, or returns false for good.
//!
//! Invariants:
//! - `next` is never called again after it returned false.
//! - A stage only writes the bindings of the variables its clause declares.

use flwor_core::clause::{Clause, Count, Flwor, For, Let, Where};
use flwor_core::error::Result;
use flwor_core::expr::Expr;
use flwor_core::types::{Item, Value};

use crate::context::QueryContext;
use crate::group::GroupByEval;
use crate::interp::{self, ItemIter};
use crate::order::OrderByEval;
use crate::window::WindowEval;

pub trait Eval {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool>;
}

/// Succeeds exactly once: the single empty round the first clause extends.
#[derive(Default)]
pub struct Start {
    done: bool,
}

impl Eval for Start {
    fn next(&mut self, _qc: &mut QueryContext) -> Result<bool> {
        Ok(!std::mem::replace(&mut self.done, true))
    }
}

struct ForEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a For,
    src: Option<Box<dyn ItemIter + 'a>>,
    pos: i64,
}

impl ForEval<'_> {
    fn bind(&self, qc: &mut QueryContext, v: Value) -> Result<()> {
        if !v.is_empty() {
            qc.check(self.clause.var, &v)?;
        }
        if let Some(score) = self.clause.score {
            qc.bind(score, Value::single(Item::Double(v.score())));
        }
        if let Some(pos) = self.clause.pos {
            qc.bind(pos, Value::int(self.pos));
        }
        qc.bind(self.clause.var, v);
        Ok(())
    }
}

impl Eval for ForEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        loop {
            if let Some(src) = self.src.as_mut() {
                match src.next_item(qc)? {
                    Some(item) => {
                        self.pos += 1;
                        self.bind(qc, Value::single(item))?;
                        return Ok(true);
                    }
                    None => {
                        self.src = None;
                        if self.pos == 0 && self.clause.allow_empty {
                            self.bind(qc, Value::empty())?;
                            return Ok(true);
                        }
                    }
                }
            }
            if !self.up.next(qc)? {
                return Ok(false);
            }
            self.src = Some(interp::iter(&self.clause.expr, qc)?);
            self.pos = 0;
        }
    }
}

struct LetEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a Let,
}

impl Eval for LetEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        if !self.up.next(qc)? {
            return Ok(false);
        }
        let mut v = interp::value(&self.clause.expr, qc)?;
        if self.clause.score {
            v = Value::single(Item::Double(v.score()));
        }
        qc.check(self.clause.var, &v)?;
        qc.bind(self.clause.var, v);
        Ok(true)
    }
}

struct WhereEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a Where,
}

impl Eval for WhereEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        while self.up.next(qc)? {
            if interp::value(&self.clause.pred, qc)?.ebv()? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct CountEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a Count,
    n: i64,
}

impl Eval for CountEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        if !self.up.next(qc)? {
            return Ok(false);
        }
        self.n += 1;
        qc.bind(self.clause.var, Value::int(self.n));
        Ok(true)
    }
}

/// Wraps `up` into the stage for `clause`.
pub fn stage<'a>(clause: &'a Clause, up: Box<dyn Eval + 'a>) -> Box<dyn Eval + 'a> {
    match clause {
        Clause::For(f) => Box::new(ForEval {
            up,
            clause: f,
            src: None,
            pos: 0,
        }),
        Clause::Let(l) => Box::new(LetEval { up, clause: l }),
        Clause::Where(w) => Box::new(WhereEval { up, clause: w }),
        Clause::Count(c) => Box::new(CountEval { up, clause: c, n: 0 }),
        Clause::OrderBy(o) => Box::new(OrderByEval::new(up, o)),
        Clause::GroupBy(g) => Box::new(GroupByEval::new(up, g)),
        Clause::Window(w) => Box::new(WindowEval::new(up, w)),
    }
}

/// Builds the chain for a compiled clause list.
pub fn chain(clauses: &[Clause]) -> Box<dyn Eval + '_> {
    let start: Box<dyn Eval + '_> = Box::new(Start::default());
    clauses.iter().fold(start, |up, c| stage(c, up))
}

/// Lazy, single-pass result of a FLWOR expression. Once the chain is
/// exhausted (or a pull failed) it stays exhausted.
pub struct FlworIter<'a> {
    chain: Box<dyn Eval + 'a>,
    ret: &'a Expr,
    sub: Option<Box<dyn ItemIter + 'a>>,
    done: bool,
}

impl<'a> FlworIter<'a> {
    pub fn new(flwor: &'a Flwor) -> Self {
        Self {
            chain: chain(&flwor.clauses),
            ret: &flwor.ret,
            sub: None,
            done: false,
        }
    }

    fn advance(&mut self, qc: &mut QueryContext) -> Result<Option<Item>> {
        loop {
            if let Some(sub) = self.sub.as_mut() {
                if let Some(item) = sub.next_item(qc)? {
                    return Ok(Some(item));
                }
                self.sub = None;
            }
            qc.check_stop()?;
            if !self.chain.next(qc)? {
                return Ok(None);
            }
            self.sub = Some(interp::iter(self.ret, qc)?);
        }
    }
}

impl ItemIter for FlworIter<'_> {
    fn next_item(&mut self, qc: &mut QueryContext) -> Result<Option<Item>> {
        if self.done {
            return Ok(None);
        }
        let out = self.advance(qc);
        if !matches!(out, Ok(Some(_))) {
            self.done = true;
            self.sub = None;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use flwor_core::clause::{For, Let, OrderBy, OrderKey, Where};
    use flwor_core::func::Func;
    use flwor_core::seqtype::SeqType;
    use flwor_core::types::{ArithOp, CmpOp};
    use flwor_core::var::VarScope;

    use super::*;

    fn run(flwor: Flwor, scope: &VarScope) -> Result<Value> {
        let mut qc = QueryContext::new(scope);
        interp::value(&Expr::from(flwor), &mut qc)
    }

    #[test]
    fn nested_loops_with_where() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare("y");
        let flwor = Flwor::new(
            vec![
                Clause::For(For::new(x, Expr::Value(Value::ints([1, 2])))),
                Clause::For(For::new(y, Expr::Value(Value::ints([1, 2])))),
                Clause::Where(Where {
                    pred: Expr::cmp(CmpOp::Eq, Expr::var(x), Expr::var(y)),
                }),
            ],
            Expr::Seq(vec![Expr::var(x), Expr::var(y)]),
        );
        assert_eq!(run(flwor, &scope).unwrap(), Value::ints([1, 1, 2, 2]));
    }

    #[test]
    fn allowing_empty_yields_one_round() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let p = scope.declare("p");
        let mut f = For::new(x, Expr::empty());
        f.allow_empty = true;
        f.pos = Some(p);
        let flwor = Flwor::new(
            vec![Clause::For(f)],
            Expr::Seq(vec![Expr::call(Func::Count, vec![Expr::var(x)]), Expr::var(p)]),
        );
        assert_eq!(run(flwor, &scope).unwrap(), Value::ints([0, 0]));
    }

    #[test]
    fn positions_and_counts() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let p = scope.declare("p");
        let c = scope.declare("c");
        let mut f = For::new(x, Expr::Value(Value::ints([7, 8, 9])));
        f.pos = Some(p);
        let flwor = Flwor::new(
            vec![
                Clause::For(f),
                Clause::Where(Where {
                    pred: Expr::cmp(CmpOp::Gt, Expr::var(x), Expr::int(7)),
                }),
                Clause::Count(Count { var: c }),
            ],
            Expr::arith(ArithOp::Mul, Expr::var(p), Expr::var(c)),
        );
        // (p, c) = (2, 1), (3, 2)
        assert_eq!(run(flwor, &scope).unwrap(), Value::ints([2, 6]));
    }

    #[test]
    fn let_type_is_checked_per_round() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare_typed("y", SeqType::INTEGER, true);
        let flwor = Flwor::new(
            vec![
                Clause::For(For::new(x, Expr::Value(Value::ints([1, 2])))),
                Clause::Let(Let::new(
                    y,
                    Expr::iff(
                        Expr::cmp(CmpOp::Eq, Expr::var(x), Expr::int(1)),
                        Expr::var(x),
                        Expr::str("two"),
                    ),
                )),
            ],
            Expr::var(y),
        );
        let err = run(flwor, &scope).unwrap_err();
        assert_eq!(err.code(), Some("XPTY0004"));
    }

    #[test]
    fn order_by_sorts_stably_and_carries_variables() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let k = scope.declare("k");
        let flwor = Flwor::new(
            vec![
                Clause::For(For::new(x, Expr::Value(Value::ints([3, 1, 2, 1])))),
                Clause::Let(Let::new(
                    k,
                    Expr::arith(ArithOp::Mul, Expr::var(x), Expr::int(10)),
                )),
                Clause::OrderBy(OrderBy {
                    keys: vec![OrderKey {
                        expr: Expr::var(x),
                        descending: true,
                        empty_least: true,
                    }],
                    refs: vec![x, k],
                }),
            ],
            Expr::var(k),
        );
        assert_eq!(run(flwor, &scope).unwrap(), Value::ints([30, 20, 10, 10]));
    }

    #[test]
    fn return_items_stream_lazily() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let flwor = Flwor::new(
            vec![Clause::For(For::new(
                x,
                Expr::range(Expr::int(1), Expr::int(i64::MAX)),
            ))],
            Expr::var(x),
        );
        let mut qc = QueryContext::new(&scope);
        let mut it = FlworIter::new(&flwor);
        assert_eq!(it.next_item(&mut qc).unwrap(), Some(Item::Int(1)));
        assert_eq!(it.next_item(&mut qc).unwrap(), Some(Item::Int(2)));
    }

    #[test]
    fn failure_exhausts_the_stream() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let flwor = Flwor::new(
            vec![Clause::For(For::new(x, Expr::Value(Value::ints([1, 0, 2]))))],
            Expr::arith(ArithOp::IDiv, Expr::int(6), Expr::var(x)),
        );
        let mut qc = QueryContext::new(&scope);
        let mut it = FlworIter::new(&flwor);
        assert_eq!(it.next_item(&mut qc).unwrap(), Some(Item::Int(6)));
        assert_eq!(it.next_item(&mut qc).unwrap_err().code(), Some("FOAR0001"));
        assert_eq!(it.next_item(&mut qc).unwrap(), None);
    }
}
