#![forbid(unsafe_code)]
//! flwor-planner: compilation and optimization of FLWOR query trees.
//!
//! Design:
//! - Expression and clause types live in `flwor-core`; this crate only
//!   rewrites them.
//! - `Planner::compile` folds constants bottom-up, refines variable types,
//!   defers checked errors inside FLWORs and conditionals (`recovery`), and
//!   runs the fixed-point FLWOR rules (`rules`).
//! - Every applied rewrite is reported to a `DiagnosticSink`.
//! - `dsl` loads YAML query documents into expression trees.

pub mod diag;
pub mod dsl;
mod fold;
pub mod planner;
mod recovery;
mod rules;

pub use diag::{CollectingSink, Diagnostic, DiagnosticSink, NullSink, Rewrite};
pub use dsl::yaml::{parse_yaml_query, ParsedQuery, QueryDoc};
pub use dsl::DslError;
pub use planner::Planner;

use flwor_core::config::EngineConfig;
use flwor_core::error::Result;
use flwor_core::expr::Expr;
use flwor_core::var::VarScope;

/// Compiles `expr` under `cfg`, reporting rewrites to `sink`.
pub fn plan(
    expr: Expr,
    scope: &mut VarScope,
    cfg: &EngineConfig,
    sink: &mut dyn DiagnosticSink,
) -> Result<Expr> {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("plan", optimize = cfg.optimize).entered();
    Planner::new(scope, sink, cfg).compile(expr)
}
