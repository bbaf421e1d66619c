//! `order by`: materializes every upstream round, then replays them sorted.

use std::cmp::Ordering;

use flwor_core::clause::OrderBy;
use flwor_core::error::{Error, Result};
use flwor_core::types::{order_cmp, Item, Value};

use crate::context::QueryContext;
use crate::eval::Eval;
use crate::interp;

struct Row {
    keys: Vec<Option<Item>>,
    vals: Vec<Option<Value>>,
}

pub(crate) struct OrderByEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a OrderBy,
    rows: Option<std::vec::IntoIter<Row>>,
}

impl<'a> OrderByEval<'a> {
    pub(crate) fn new(up: Box<dyn Eval + 'a>, clause: &'a OrderBy) -> Self {
        Self {
            up,
            clause,
            rows: None,
        }
    }

    fn materialize(&mut self, qc: &mut QueryContext) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.up.next(qc)? {
            let keys = self
                .clause
                .keys
                .iter()
                .map(|k| sort_key(interp::value(&k.expr, qc)?))
                .collect::<Result<Vec<_>>>()?;
            let vals = self
                .clause
                .refs
                .iter()
                .map(|v| qc.binding(*v).cloned())
                .collect();
            rows.push(Row { keys, vals });
        }
        let keys = &self.clause.keys;
        rows.sort_by(|a, b| {
            for (i, k) in keys.iter().enumerate() {
                let ord = order_cmp(a.keys[i].as_ref(), b.keys[i].as_ref(), k.empty_least);
                let ord = if k.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(rows)
    }
}

fn sort_key(v: Value) -> Result<Option<Item>> {
    let mut atoms = v.atomize();
    match atoms.len() {
        0 => Ok(None),
        1 => Ok(atoms.pop()),
        n => Err(Error::dynamic(
            "XPTY0004",
            format!("order key must be at most one item, got {}", n),
        )),
    }
}

impl Eval for OrderByEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        if self.rows.is_none() {
            let rows = self.materialize(qc)?;
            self.rows = Some(rows.into_iter());
        }
        let Some(row) = self.rows.as_mut().and_then(Iterator::next) else {
            return Ok(false);
        };
        for (var, val) in self.clause.refs.iter().zip(row.vals) {
            qc.set(*var, val);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use flwor_core::clause::{Clause, Flwor, For, OrderKey};
    use flwor_core::expr::Expr;
    use flwor_core::var::VarScope;

    use super::*;

    #[test]
    fn empty_greatest_sorts_empty_keys_last() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        // key: $x[. > 1], empty for 1
        let key = Expr::Filter {
            base: Box::new(Expr::var(x)),
            preds: vec![Expr::cmp(
                flwor_core::types::CmpOp::Gt,
                Expr::ContextItem,
                Expr::int(1),
            )],
        };
        let order = |empty_least: bool| {
            Expr::from(Flwor::new(
                vec![
                    Clause::For(For::new(x, Expr::Value(Value::ints([1, 3, 2])))),
                    Clause::OrderBy(OrderBy {
                        keys: vec![OrderKey {
                            expr: key.clone(),
                            descending: false,
                            empty_least,
                        }],
                        refs: vec![x],
                    }),
                ],
                Expr::var(x),
            ))
        };
        let mut qc = QueryContext::new(&scope);
        assert_eq!(
            interp::value(&order(true), &mut qc).unwrap(),
            Value::ints([1, 2, 3])
        );
        assert_eq!(
            interp::value(&order(false), &mut qc).unwrap(),
            Value::ints([2, 3, 1])
        );
    }

    #[test]
    fn multi_item_key_is_an_error() {
        assert!(sort_key(Value::ints([1, 2])).is_err());
        assert_eq!(sort_key(Value::empty()).unwrap(), None);
    }
}
