//! Query-like rendering of plans, used by `explain` and in diagnostics.

use std::fmt::{self, Write as _};

use crate::clause::{Clause, Flwor, WindowCond};
use crate::expr::{Axis, Expr};
use crate::id::VarId;
use crate::var::VarScope;

/// Renders an expression, naming variables through `scope` when given
/// (`$x`) and by id otherwise (`$v3`).
pub struct Plan<'a> {
    pub expr: &'a Expr,
    pub scope: Option<&'a VarScope>,
}

impl<'a> Plan<'a> {
    pub fn new(expr: &'a Expr, scope: &'a VarScope) -> Self {
        Self {
            expr,
            scope: Some(scope),
        }
    }
}

impl fmt::Display for Plan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer { scope: self.scope }.expr(self.expr, f)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer { scope: None }.expr(self, f)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer { scope: None }.clause(self, f)
    }
}

/// Renders a single clause with variable names.
pub fn render_clause(clause: &Clause, scope: &VarScope) -> String {
    let mut out = String::new();
    let _ = write!(out, "{}", ClausePlan { clause, scope });
    out
}

struct ClausePlan<'a> {
    clause: &'a Clause,
    scope: &'a VarScope,
}

impl fmt::Display for ClausePlan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer {
            scope: Some(self.scope),
        }
        .clause(self.clause, f)
    }
}

#[derive(Clone, Copy)]
struct Printer<'a> {
    scope: Option<&'a VarScope>,
}

impl Printer<'_> {
    fn var(&self, v: VarId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(scope) if v.index() < scope.len() => write!(f, "${}", scope.name(v)),
            _ => write!(f, "${}", v),
        }
    }

    fn list(&self, es: &[Expr], sep: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in es.iter().enumerate() {
            if i > 0 {
                f.write_str(sep)?;
            }
            self.expr(e, f)?;
        }
        Ok(())
    }

    fn preds(&self, preds: &[Expr], f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in preds {
            f.write_str("[")?;
            self.expr(p, f)?;
            f.write_str("]")?;
        }
        Ok(())
    }

    fn expr(&self, e: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match e {
            Expr::Value(v) => write!(f, "{}", v),
            Expr::VarRef(v) => self.var(*v, f),
            Expr::ContextItem => f.write_str("."),
            Expr::Range(a, b) => {
                f.write_str("(")?;
                self.expr(a, f)?;
                f.write_str(" to ")?;
                self.expr(b, f)?;
                f.write_str(")")
            }
            Expr::Seq(es) => {
                f.write_str("(")?;
                self.list(es, ", ", f)?;
                f.write_str(")")
            }
            Expr::And(es) | Expr::Or(es) => {
                let sep = if matches!(e, Expr::And(_)) { " and " } else { " or " };
                f.write_str("(")?;
                self.list(es, sep, f)?;
                f.write_str(")")
            }
            Expr::Cmp { op, left, right } => {
                self.expr(left, f)?;
                write!(f, " {} ", op.symbol())?;
                self.expr(right, f)
            }
            Expr::Arith { op, left, right } => {
                f.write_str("(")?;
                self.expr(left, f)?;
                write!(f, " {} ", op.symbol())?;
                self.expr(right, f)?;
                f.write_str(")")
            }
            Expr::If { cond, then, els } => {
                f.write_str("if(")?;
                self.expr(cond, f)?;
                f.write_str(") then ")?;
                self.expr(then, f)?;
                f.write_str(" else ")?;
                self.expr(els, f)
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                self.list(args, ", ", f)?;
                f.write_str(")")
            }
            Expr::Element { name, content } => {
                write!(f, "element {} {{ ", name)?;
                self.expr(content, f)?;
                f.write_str(" }")
            }
            Expr::Filter { base, preds } => {
                self.expr(base, f)?;
                self.preds(preds, f)
            }
            Expr::Path { root, steps } => {
                self.expr(root, f)?;
                for s in steps {
                    let axis = match s.axis {
                        Axis::Child => "child",
                        Axis::SelfAxis => "self",
                        Axis::Descendant => "descendant",
                    };
                    write!(f, "/{}::{}", axis, s.test.as_deref().unwrap_or("*"))?;
                    self.preds(&s.preds, f)?;
                }
                Ok(())
            }
            Expr::TypeCheck { expr, ty } => {
                f.write_str("(")?;
                self.expr(expr, f)?;
                write!(f, " treat as {})", ty)
            }
            Expr::Flwor(flwor) => self.flwor(flwor, f),
            Expr::Raise { code, .. } => write!(f, "error(\"{}\")", code),
        }
    }

    fn flwor(&self, flwor: &Flwor, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for c in &flwor.clauses {
            self.clause(c, f)?;
            f.write_str(" ")?;
        }
        f.write_str("return ")?;
        self.expr(&flwor.ret, f)?;
        f.write_str(")")
    }

    fn cond(&self, kw: &str, c: &WindowCond, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " {}", kw)?;
        if let Some(v) = c.item {
            f.write_str(" ")?;
            self.var(v, f)?;
        }
        if let Some(v) = c.pos {
            f.write_str(" at ")?;
            self.var(v, f)?;
        }
        if let Some(v) = c.prev {
            f.write_str(" previous ")?;
            self.var(v, f)?;
        }
        if let Some(v) = c.next {
            f.write_str(" next ")?;
            self.var(v, f)?;
        }
        f.write_str(" when ")?;
        self.expr(&c.expr, f)
    }

    fn clause(&self, c: &Clause, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match c {
            Clause::For(fr) => {
                f.write_str("for ")?;
                self.var(fr.var, f)?;
                if fr.allow_empty {
                    f.write_str(" allowing empty")?;
                }
                if let Some(p) = fr.pos {
                    f.write_str(" at ")?;
                    self.var(p, f)?;
                }
                if let Some(s) = fr.score {
                    f.write_str(" score ")?;
                    self.var(s, f)?;
                }
                f.write_str(" in ")?;
                self.expr(&fr.expr, f)
            }
            Clause::Let(l) => {
                f.write_str(if l.score { "let score " } else { "let " })?;
                self.var(l.var, f)?;
                f.write_str(" := ")?;
                self.expr(&l.expr, f)
            }
            Clause::Where(w) => {
                f.write_str("where ")?;
                self.expr(&w.pred, f)
            }
            Clause::Count(cnt) => {
                f.write_str("count ")?;
                self.var(cnt.var, f)
            }
            Clause::OrderBy(o) => {
                f.write_str("order by ")?;
                for (i, k) in o.keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.expr(&k.expr, f)?;
                    if k.descending {
                        f.write_str(" descending")?;
                    }
                    if !k.empty_least {
                        f.write_str(" empty greatest")?;
                    }
                }
                Ok(())
            }
            Clause::GroupBy(g) => {
                f.write_str("group by ")?;
                for (i, s) in g.specs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.var(s.var, f)?;
                    f.write_str(" := ")?;
                    self.expr(&s.expr, f)?;
                }
                Ok(())
            }
            Clause::Window(w) => {
                write!(
                    f,
                    "for {} window ",
                    if w.sliding { "sliding" } else { "tumbling" }
                )?;
                self.var(w.var, f)?;
                f.write_str(" in ")?;
                self.expr(&w.expr, f)?;
                self.cond("start", &w.start, f)?;
                if let Some(end) = &w.end {
                    self.cond(if w.only_end { "only end" } else { "end" }, end, f)?;
                }
                Ok(())
            }
        }
    }
}
