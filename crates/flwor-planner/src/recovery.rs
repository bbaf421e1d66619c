//! Compile-time error recovery inside FLWOR clause lists.
//!
//! A clause whose compilation fails only needs to fail if a tuple ever
//! reaches it. When a filtering clause (`for`, window or `where`) precedes
//! it, the list is cut after that clause and the return expression becomes
//! a deferred raise, so the error surfaces only for non-empty input.

use flwor_core::clause::{Clause, Flwor};
use flwor_core::display::render_clause;
use flwor_core::error::{Error, Result};
use flwor_core::expr::Expr;
use flwor_core::seqtype::SeqType;

use crate::diag::Rewrite;
use crate::planner::Planner;

impl Planner<'_> {
    /// Handles `err`, raised while compiling clause `idx` (or the return
    /// expression when `idx == clauses.len()`). Returns the error when it
    /// cannot be deferred.
    pub(crate) fn clause_error(
        &mut self,
        flwor: &mut Flwor,
        err: Error,
        idx: usize,
        ret_ty: SeqType,
    ) -> Result<()> {
        if !err.is_checked() {
            return Err(err);
        }
        let end = idx.min(flwor.clauses.len());
        let Some(cut) = flwor.clauses[..end]
            .iter()
            .rposition(|c| matches!(c, Clause::For(_) | Clause::Window(_) | Clause::Where(_)))
        else {
            return Err(err);
        };
        let detail = format!(
            "{} deferred after `{}`",
            err,
            render_clause(&flwor.clauses[cut], self.scope)
        );
        flwor.clauses.truncate(cut + 1);
        flwor.ret = Expr::raise(&err, ret_ty);
        self.note(Rewrite::Recovered, detail);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flwor_core::clause::{For, Let, Where};
    use flwor_core::config::EngineConfig;
    use flwor_core::func::Func;
    use flwor_core::types::{ArithOp, CmpOp, Value};
    use flwor_core::var::VarScope;

    use super::*;
    use crate::diag::CollectingSink;

    fn raise() -> Expr {
        Expr::call(Func::Error, vec![Expr::str("APP01")])
    }

    #[test]
    fn error_after_for_is_deferred() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare("y");
        let flwor = Expr::from(Flwor::new(
            vec![
                Clause::For(For::new(x, Expr::var(scope.declare("src")))),
                Clause::Let(Let::new(y, raise())),
            ],
            Expr::arith(ArithOp::Add, Expr::var(x), Expr::var(y)),
        ));
        let mut sink = CollectingSink::new();
        let out = Planner::new(&mut scope, &mut sink, &EngineConfig::default())
            .compile(flwor)
            .unwrap();
        let Expr::Flwor(f) = out else {
            panic!("expected flwor, got {:?}", out);
        };
        assert_eq!(f.clauses.len(), 1);
        assert!(matches!(f.ret, Expr::Raise { ref code, .. } if code == "APP01"));
        assert!(sink.contains(Rewrite::Recovered));
    }

    #[test]
    fn error_without_filtering_clause_propagates() {
        let mut scope = VarScope::new();
        let y = scope.declare("y");
        let flwor = Expr::from(Flwor::new(
            vec![Clause::Let(Let::new(y, raise()))],
            Expr::var(y),
        ));
        let mut sink = CollectingSink::new();
        let err = Planner::new(&mut scope, &mut sink, &EngineConfig::default())
            .compile(flwor)
            .unwrap_err();
        assert_eq!(err.code(), Some("APP01"));
    }

    #[test]
    fn where_is_a_cut_point() {
        let mut scope = VarScope::new();
        let p = scope.declare("p");
        let y = scope.declare("y");
        let flwor = Flwor::new(
            vec![
                Clause::Where(Where {
                    pred: Expr::cmp(CmpOp::Eq, Expr::var(p), Expr::int(1)),
                }),
                Clause::Let(Let::new(y, Expr::Value(Value::ints([1])))),
            ],
            Expr::var(y),
        );
        let mut target = flwor.clone();
        let mut sink = CollectingSink::new();
        let mut planner = Planner::new(&mut scope, &mut sink, &EngineConfig::default());
        let err = Error::dynamic("FOAR0001", "division by zero");
        planner
            .clause_error(&mut target, err, 1, SeqType::ITEM_ZM)
            .unwrap();
        assert_eq!(target.clauses, flwor.clauses[..1].to_vec());
        assert!(matches!(target.ret, Expr::Raise { .. }));

        let invariant = Error::Invariant("broken".into());
        assert!(planner
            .clause_error(&mut target, invariant, 1, SeqType::ITEM_ZM)
            .is_err());
    }
}
