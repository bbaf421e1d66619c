//! Compilation driver: recursive descent over the expression tree, constant
//! folding at every node, type refinement of clause variables, and the
//! FLWOR rewrite rules (`rules`) once a FLWOR's parts are compiled.

use std::mem;

use flwor_core::clause::{Clause, Flwor};
use flwor_core::config::EngineConfig;
use flwor_core::display::Plan;
use flwor_core::error::Result;
use flwor_core::expr::Expr;
use flwor_core::seqtype::{ItemType, Occ, SeqType};
use flwor_core::var::VarScope;

use crate::diag::{Diagnostic, DiagnosticSink, Rewrite};

pub struct Planner<'a> {
    pub(crate) scope: &'a mut VarScope,
    sink: &'a mut dyn DiagnosticSink,
    /// Apply FLWOR rewrites; folding and recovery always run.
    pub(crate) rewrite: bool,
    pub(crate) max_rounds: usize,
}

impl<'a> Planner<'a> {
    pub fn new(
        scope: &'a mut VarScope,
        sink: &'a mut dyn DiagnosticSink,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            scope,
            sink,
            rewrite: cfg.optimize,
            max_rounds: cfg.max_optimizer_rounds,
        }
    }

    pub fn scope(&self) -> &VarScope {
        self.scope
    }

    /// Compiles `expr` bottom-up. Checked errors inside a FLWOR clause or an
    /// `if` branch are deferred where possible; others are returned.
    pub fn compile(&mut self, expr: Expr) -> Result<Expr> {
        match expr {
            Expr::Flwor(flwor) => self.compile_flwor(*flwor),
            Expr::If { cond, then, els } => {
                let cond = self.compile(*cond)?;
                let then = self.compile_branch(*then)?;
                let els = self.compile_branch(*els)?;
                self.optimize(Expr::iff(cond, then, els))
            }
            mut other => {
                for child in other.children_mut() {
                    *child = self.compile(mem::take(child))?;
                }
                self.optimize(other)
            }
        }
    }

    fn compile_branch(&mut self, branch: Expr) -> Result<Expr> {
        let ty = branch.seq_type(self.scope);
        match self.compile(branch) {
            Err(err) if err.is_checked() => {
                self.note(Rewrite::Recovered, format!("branch deferred: {}", err));
                Ok(Expr::raise(&err, ty))
            }
            other => other,
        }
    }

    fn compile_flwor(&mut self, mut flwor: Flwor) -> Result<Expr> {
        let mut failure = None;
        for i in 0..flwor.clauses.len() {
            if let Err(err) = self.compile_clause(&mut flwor.clauses[i]) {
                failure = Some((err, i));
                break;
            }
        }
        let ret_ty = flwor.ret.seq_type(self.scope);
        if failure.is_none() {
            match self.compile(mem::take(&mut flwor.ret)) {
                Ok(ret) => flwor.ret = ret,
                Err(err) => failure = Some((err, flwor.clauses.len())),
            }
        }
        if let Some((err, idx)) = failure {
            self.clause_error(&mut flwor, err, idx, ret_ty)?;
        }
        self.optimize_flwor(flwor)
    }

    pub(crate) fn compile_clause(&mut self, clause: &mut Clause) -> Result<()> {
        for e in clause.exprs_mut() {
            *e = self.compile(mem::take(e))?;
        }
        self.refine(clause);
        Ok(())
    }

    /// Records the static types of the variables `clause` binds.
    pub(crate) fn refine(&mut self, clause: &Clause) {
        let scope = &mut *self.scope;
        match clause {
            Clause::For(f) => {
                let src = f.expr.seq_type(scope);
                let item = if src.zero() { ItemType::Item } else { src.item };
                let occ = if f.allow_empty && src.occ.min() == 0 {
                    Occ::ZeroOrOne
                } else {
                    Occ::One
                };
                scope.refine(f.var, SeqType::new(item, occ));
                if let Some(p) = f.pos {
                    scope.refine(p, SeqType::INTEGER);
                }
                if let Some(s) = f.score {
                    scope.refine(s, SeqType::new(ItemType::Double, Occ::One));
                }
            }
            Clause::Let(l) => {
                let ty = if l.score {
                    SeqType::new(ItemType::Double, Occ::One)
                } else {
                    l.expr.seq_type(scope)
                };
                scope.refine(l.var, ty);
            }
            Clause::Count(c) => scope.refine(c.var, SeqType::INTEGER),
            Clause::GroupBy(g) => {
                for s in &g.specs {
                    scope.refine(s.var, SeqType::new(ItemType::Item, Occ::ZeroOrOne));
                }
            }
            Clause::Window(w) => {
                let src = w.expr.seq_type(scope);
                let item = if src.zero() { ItemType::Item } else { src.item };
                scope.refine(w.var, SeqType::new(item, Occ::OneOrMore));
                let conds = std::iter::once(&w.start).chain(w.end.iter());
                for c in conds {
                    if let Some(v) = c.item {
                        scope.refine(v, SeqType::new(item, Occ::One));
                    }
                    for v in [c.prev, c.next].into_iter().flatten() {
                        scope.refine(v, SeqType::new(item, Occ::ZeroOrOne));
                    }
                    if let Some(p) = c.pos {
                        scope.refine(p, SeqType::INTEGER);
                    }
                }
            }
            Clause::Where(_) | Clause::OrderBy(_) => {}
        }
    }

    pub(crate) fn note(&mut self, rewrite: Rewrite, detail: String) {
        #[cfg(feature = "tracing")]
        tracing::trace!(rewrite = ?rewrite, %detail, "rewrite");
        self.sink.rewrite(Diagnostic { rewrite, detail });
    }

    pub(crate) fn show(&self, expr: &Expr) -> String {
        Plan::new(expr, self.scope).to_string()
    }
}
