//! Runtime: prepare a query into a plan, execute it as a lazy item stream.
//!
//! - `Engine::prepare` compiles (and, per config, optimizes) the query and
//!   fingerprints the result.
//! - `Engine::execute` gives every execution a fresh dynamic context with
//!   its own stop check; the stream is pulled by the caller.
//! - `item_limit` and `timeout_ms` from the config surface as
//!   `Error::Interrupted` on the stream.

use std::time::Duration;

use thiserror::Error;

use flwor_core::config::EngineConfig;
use flwor_core::display::Plan;
use flwor_core::error::{Error, Result};
use flwor_core::expr::Expr;
use flwor_core::hash::{hash_serde, Hash256};
use flwor_core::types::Item;
use flwor_core::var::VarScope;

use flwor_planner::{CollectingSink, Diagnostic, DiagnosticSink, DslError, NullSink, ParsedQuery};

use crate::context::{CancelHandle, PendingUpdate, QueryContext, StopCheck};
use crate::interp::{self, ItemIter};
use crate::metrics::emit_span;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Query(#[from] Error),
    #[error("query document: {0}")]
    Document(#[from] DslError),
    #[error("hashing error: {0}")]
    Hash(String),
}

/// A compiled query, ready to be executed any number of times.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// The query as loaded, before compilation.
    pub original: Expr,
    pub expr: Expr,
    pub scope: VarScope,
    /// Applied rewrites, when `collect_diagnostics` is set.
    pub diagnostics: Vec<Diagnostic>,
    pub fingerprint: Hash256,
    /// Statically known number of result items.
    pub size: Option<u64>,
}

impl Prepared {
    pub fn plan(&self) -> Plan<'_> {
        Plan::new(&self.expr, &self.scope)
    }

    pub fn original_plan(&self) -> Plan<'_> {
        Plan::new(&self.original, &self.scope)
    }

    /// Whether the top-level return expression is evaluated at most once.
    pub fn tail_call_eligible(&self) -> bool {
        match &self.expr {
            Expr::Flwor(f) => f.tail_call_eligible(&self.scope),
            _ => true,
        }
    }
}

pub struct Engine {
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> std::result::Result<Self, ExecError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Compiles a loaded query document.
    pub fn prepare(&self, query: ParsedQuery) -> std::result::Result<Prepared, ExecError> {
        self.prepare_expr(query.expr, query.scope)
    }

    pub fn prepare_expr(
        &self,
        expr: Expr,
        mut scope: VarScope,
    ) -> std::result::Result<Prepared, ExecError> {
        let original = expr.clone();
        let mut collecting = CollectingSink::new();
        let mut null = NullSink;
        let sink: &mut dyn DiagnosticSink = if self.cfg.collect_diagnostics {
            &mut collecting
        } else {
            &mut null
        };
        let expr = flwor_planner::plan(expr, &mut scope, &self.cfg, sink)?;

        let fingerprint = hash_serde(&expr).map_err(|e| ExecError::Hash(e.to_string()))?;
        let size = expr.size(&scope);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            fingerprint = %fingerprint.short(),
            rewrites = collecting.diagnostics.len(),
            "prepared"
        );
        emit_span(
            "prepare",
            &[
                ("fingerprint", fingerprint.short()),
                ("nodes", expr.expr_size().to_string()),
            ],
        );

        Ok(Prepared {
            original,
            expr,
            scope,
            diagnostics: collecting.diagnostics,
            fingerprint,
            size,
        })
    }

    pub fn execute<'a>(&self, prepared: &'a Prepared) -> ItemStream<'a> {
        self.execute_with(prepared, CancelHandle::new())
    }

    /// Like `execute`, aborting at the next pull once `cancel` fires.
    pub fn execute_with<'a>(&self, prepared: &'a Prepared, cancel: CancelHandle) -> ItemStream<'a> {
        let timeout = self.cfg.timeout_ms.map(Duration::from_millis);
        let qc = QueryContext::new(&prepared.scope).with_stop(StopCheck::new(cancel, timeout));
        ItemStream {
            expr: &prepared.expr,
            qc,
            inner: None,
            produced: 0,
            limit: self.cfg.item_limit,
            finished: false,
        }
    }

    /// Executes and collects every item.
    pub fn evaluate(&self, prepared: &Prepared) -> std::result::Result<Vec<Item>, ExecError> {
        let items = self.execute(prepared).collect::<Result<Vec<_>>>()?;
        Ok(items)
    }
}

/// Lazy result of one execution. The first error ends the stream.
pub struct ItemStream<'a> {
    expr: &'a Expr,
    qc: QueryContext,
    inner: Option<Box<dyn ItemIter + 'a>>,
    produced: u64,
    limit: Option<u64>,
    finished: bool,
}

impl ItemStream<'_> {
    /// Updates recorded so far by `put`.
    pub fn updates(&self) -> &[PendingUpdate] {
        self.qc.updates()
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn pull(&mut self) -> Result<Option<Item>> {
        self.qc.check_stop()?;
        if self.inner.is_none() {
            self.inner = Some(interp::iter(self.expr, &mut self.qc)?);
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        let Some(item) = inner.next_item(&mut self.qc)? else {
            return Ok(None);
        };
        if let Some(limit) = self.limit {
            if self.produced >= limit {
                return Err(Error::Interrupted(format!("item limit {} reached", limit)));
            }
        }
        self.produced += 1;
        Ok(Some(item))
    }
}

impl Iterator for ItemStream<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.pull() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                emit_span("execute", &[("items", self.produced.to_string())]);
                None
            }
            Err(e) => {
                self.finished = true;
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, produced = self.produced, "execution failed");
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use flwor_core::clause::{Clause, Flwor, For, Let};
    use flwor_core::func::Func;
    use flwor_core::types::{ArithOp, Value};

    use super::*;

    fn squares_of_unbound(scope: &mut VarScope) -> Expr {
        let x = scope.declare("x");
        Expr::from(Flwor::new(
            vec![Clause::For(For::new(
                x,
                Expr::range(
                    Expr::int(1),
                    Expr::call(Func::Count, vec![Expr::var(scope.declare("src"))]),
                ),
            ))],
            Expr::arith(ArithOp::Mul, Expr::var(x), Expr::var(x)),
        ))
    }

    fn range_flwor(scope: &mut VarScope, n: i64) -> Expr {
        let x = scope.declare("x");
        Expr::from(Flwor::new(
            vec![Clause::For(For::new(
                x,
                Expr::range(Expr::int(1), Expr::int(n)),
            ))],
            Expr::arith(ArithOp::Mul, Expr::var(x), Expr::var(x)),
        ))
    }

    #[test]
    fn prepare_and_evaluate() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut scope = VarScope::new();
        let expr = range_flwor(&mut scope, 3);
        let prepared = engine.prepare_expr(expr, scope).unwrap();
        let items = engine.evaluate(&prepared).unwrap();
        assert_eq!(Value(items), Value::ints([1, 4, 9]));
        assert_eq!(prepared.size, Some(3));
    }

    #[test]
    fn unbound_input_fails_on_first_pull() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut scope = VarScope::new();
        let expr = squares_of_unbound(&mut scope);
        let prepared = engine.prepare_expr(expr, scope).unwrap();
        let mut stream = engine.execute(&prepared);
        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.code(), Some("XPDY0002"));
        assert!(stream.next().is_none());
    }

    #[test]
    fn item_limit_interrupts() {
        let cfg = EngineConfig {
            item_limit: Some(2),
            ..Default::default()
        };
        let engine = Engine::new(cfg).unwrap();
        let mut scope = VarScope::new();
        let expr = range_flwor(&mut scope, 5);
        let prepared = engine.prepare_expr(expr, scope).unwrap();
        let out: Vec<_> = engine.execute(&prepared).collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[2], Err(Error::Interrupted(_))));
    }

    #[test]
    fn cancelled_execution_stops() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut scope = VarScope::new();
        let expr = range_flwor(&mut scope, 5);
        let prepared = engine.prepare_expr(expr, scope).unwrap();
        let cancel = CancelHandle::new();
        let mut stream = engine.execute_with(&prepared, cancel.clone());
        assert!(stream.next().unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(stream.next(), Some(Err(Error::Interrupted(_)))));
    }

    #[test]
    fn fingerprints_follow_the_plan() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut a = VarScope::new();
        let mut b = VarScope::new();
        let pa = engine.prepare_expr(range_flwor(&mut a, 3), a).unwrap();
        let pb = engine.prepare_expr(range_flwor(&mut b, 3), b).unwrap();
        assert_eq!(pa.fingerprint, pb.fingerprint);
        let mut c = VarScope::new();
        let pc = engine.prepare_expr(range_flwor(&mut c, 4), c).unwrap();
        assert_ne!(pa.fingerprint, pc.fingerprint);
    }

    #[test]
    fn diagnostics_are_collected_on_request() {
        let cfg = EngineConfig {
            collect_diagnostics: true,
            ..Default::default()
        };
        let engine = Engine::new(cfg).unwrap();
        let mut scope = VarScope::new();
        let y = scope.declare("y");
        let expr = Expr::from(Flwor::new(
            vec![Clause::Let(Let::new(y, Expr::int(5)))],
            Expr::arith(ArithOp::Add, Expr::var(y), Expr::var(y)),
        ));
        let prepared = engine.prepare_expr(expr, scope).unwrap();
        assert!(!prepared.diagnostics.is_empty());
        assert_eq!(prepared.expr, Expr::int(10));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = EngineConfig {
            max_optimizer_rounds: 0,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(cfg),
            Err(ExecError::Query(Error::Config(_)))
        ));
    }
}
