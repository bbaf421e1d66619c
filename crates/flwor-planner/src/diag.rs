//! Rewrite diagnostics.
//!
//! Every successful rewrite is reported to a `DiagnosticSink`; with the
//! `tracing` feature it is also emitted as a trace event.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rewrite {
    /// Constant subexpression pre-evaluated.
    Fold,
    /// `where A and B` split into two clauses.
    SplitWhere,
    ForToLet,
    SlideLet,
    InlineLet,
    /// Let binding without later uses removed.
    DropLet,
    /// Dead carried/rebound variables removed from order by / group by.
    CleanVars,
    /// Clauses of a nested FLWOR spliced into the enclosing one.
    Unnest,
    /// Leading lets of a nested FLWOR pulled out.
    PullLets,
    HoistWhere,
    /// Where clause turned into a predicate on its for source.
    WherePredicate,
    /// Statically true where clause removed.
    DropWhere,
    MergeWheres,
    /// `for $x in E return $x` rewritten to `E`.
    TailCollapse,
    /// Count after a leading for turned into a positional variable.
    CountToPosition,
    /// FLWOR without clauses replaced by its return expression.
    RemoveFlwor,
    /// FLWOR that cannot yield items replaced by `()`.
    EmptyFlwor,
    /// Leading where turned into a conditional.
    WhereToIf,
    /// Type check of an inlined binding dropped or kept as `treat as`.
    TypeCheck,
    /// Clause list truncated after a compile-time error.
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rewrite: Rewrite,
    pub detail: String,
}

pub trait DiagnosticSink {
    fn rewrite(&mut self, diagnostic: Diagnostic);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn rewrite(&mut self, _diagnostic: Diagnostic) {}
}

/// Keeps every diagnostic in order, for `explain` and tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub diagnostics: Vec<Diagnostic>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, rewrite: Rewrite) -> usize {
        self.diagnostics.iter().filter(|d| d.rewrite == rewrite).count()
    }

    pub fn contains(&self, rewrite: Rewrite) -> bool {
        self.count(rewrite) > 0
    }
}

impl DiagnosticSink for CollectingSink {
    fn rewrite(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }
}
