//! FLWOR clauses and the uniform clause contract.
//!
//! A clause declares variables (by id), owns its expressions and reports
//! flags, usage counts and its effect on the running tuple-count interval.
//! Clauses are never iterated on their own; the evaluator chain in
//! `flwor-exec` wraps them into stages.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Flag};
use crate::id::VarId;
use crate::seqtype::SeqType;
use crate::size::SizeBounds;
use crate::usage::VarUsage;
use crate::var::VarScope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct For {
    pub var: VarId,
    #[serde(default)]
    pub pos: Option<VarId>,
    #[serde(default)]
    pub score: Option<VarId>,
    pub expr: Expr,
    /// `allowing empty`: an empty source yields one round with `var = ()`.
    #[serde(default)]
    pub allow_empty: bool,
}

impl For {
    pub fn new(var: VarId, expr: Expr) -> Self {
        Self {
            var,
            pos: None,
            score: None,
            expr,
            allow_empty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Let {
    pub var: VarId,
    pub expr: Expr,
    /// `let score $v := E` binds the relevance score of E.
    #[serde(default)]
    pub score: bool,
}

impl Let {
    pub fn new(var: VarId, expr: Expr) -> Self {
        Self {
            var,
            expr,
            score: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
    pub pred: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Count {
    pub var: VarId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub expr: Expr,
    #[serde(default)]
    pub descending: bool,
    /// `empty least` (the default) or `empty greatest`.
    #[serde(default = "default_true")]
    pub empty_least: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub keys: Vec<OrderKey>,
    /// Variables whose bindings travel with each sorted tuple.
    pub refs: Vec<VarId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub var: VarId,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBy {
    pub specs: Vec<GroupSpec>,
    /// Non-grouping values, evaluated per incoming tuple ...
    pub pre: Vec<Expr>,
    /// ... and rebound, concatenated per group, to these variables.
    pub post: Vec<VarId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCond {
    #[serde(default)]
    pub item: Option<VarId>,
    #[serde(default)]
    pub pos: Option<VarId>,
    #[serde(default)]
    pub prev: Option<VarId>,
    #[serde(default)]
    pub next: Option<VarId>,
    pub expr: Expr,
}

impl WindowCond {
    pub fn when(expr: Expr) -> Self {
        Self {
            item: None,
            pos: None,
            prev: None,
            next: None,
            expr,
        }
    }

    pub fn vars(&self) -> impl Iterator<Item = VarId> + '_ {
        [self.item, self.pos, self.prev, self.next].into_iter().flatten()
    }

    fn copy_with(&self, scope: &mut VarScope, map: &mut HashMap<VarId, VarId>) -> WindowCond {
        let mut dup = |v: Option<VarId>, map: &mut HashMap<VarId, VarId>| {
            v.map(|v| {
                let fresh = scope.duplicate(v);
                map.insert(v, fresh);
                fresh
            })
        };
        let item = dup(self.item, map);
        let pos = dup(self.pos, map);
        let prev = dup(self.prev, map);
        let next = dup(self.next, map);
        WindowCond {
            item,
            pos,
            prev,
            next,
            expr: self.expr.copy_with(scope, map),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub sliding: bool,
    pub var: VarId,
    pub expr: Expr,
    pub start: WindowCond,
    #[serde(default)]
    pub end: Option<WindowCond>,
    #[serde(default)]
    pub only_end: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    For(For),
    Let(Let),
    Where(Where),
    Count(Count),
    OrderBy(OrderBy),
    GroupBy(GroupBy),
    Window(Window),
}

impl Clause {
    pub fn kind(&self) -> &'static str {
        match self {
            Clause::For(_) => "for",
            Clause::Let(_) => "let",
            Clause::Where(_) => "where",
            Clause::Count(_) => "count",
            Clause::OrderBy(_) => "order by",
            Clause::GroupBy(_) => "group by",
            Clause::Window(_) => "window",
        }
    }

    /// Variables declared by this clause.
    pub fn vars(&self) -> Vec<VarId> {
        match self {
            Clause::For(f) => [Some(f.var), f.pos, f.score].into_iter().flatten().collect(),
            Clause::Let(l) => vec![l.var],
            Clause::Count(c) => vec![c.var],
            Clause::Where(_) | Clause::OrderBy(_) => Vec::new(),
            Clause::GroupBy(g) => g
                .specs
                .iter()
                .map(|s| s.var)
                .chain(g.post.iter().copied())
                .collect(),
            Clause::Window(w) => {
                let mut out = vec![w.var];
                out.extend(w.start.vars());
                if let Some(end) = &w.end {
                    out.extend(end.vars());
                }
                out
            }
        }
    }

    pub fn declares(&self, var: VarId) -> bool {
        self.vars().contains(&var)
    }

    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Clause::For(f) => vec![&f.expr],
            Clause::Let(l) => vec![&l.expr],
            Clause::Where(w) => vec![&w.pred],
            Clause::Count(_) => Vec::new(),
            Clause::OrderBy(o) => o.keys.iter().map(|k| &k.expr).collect(),
            Clause::GroupBy(g) => g.specs.iter().map(|s| &s.expr).chain(g.pre.iter()).collect(),
            Clause::Window(w) => {
                let mut out = vec![&w.expr, &w.start.expr];
                if let Some(end) = &w.end {
                    out.push(&end.expr);
                }
                out
            }
        }
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Clause::For(f) => vec![&mut f.expr],
            Clause::Let(l) => vec![&mut l.expr],
            Clause::Where(w) => vec![&mut w.pred],
            Clause::Count(_) => Vec::new(),
            Clause::OrderBy(o) => o.keys.iter_mut().map(|k| &mut k.expr).collect(),
            Clause::GroupBy(g) => g
                .specs
                .iter_mut()
                .map(|s| &mut s.expr)
                .chain(g.pre.iter_mut())
                .collect(),
            Clause::Window(w) => {
                let mut out = vec![&mut w.expr, &mut w.start.expr];
                if let Some(end) = &mut w.end {
                    out.push(&mut end.expr);
                }
                out
            }
        }
    }

    pub fn has(&self, flag: Flag) -> bool {
        self.exprs().into_iter().any(|e| e.has(flag))
    }

    pub fn accept(&self, visit: &mut dyn FnMut(VarId) -> bool) -> bool {
        if !self.exprs().into_iter().all(|e| e.accept(&mut *visit)) {
            return false;
        }
        match self {
            Clause::OrderBy(o) => o.refs.iter().all(|v| visit(*v)),
            _ => true,
        }
    }

    pub fn uses(&self, var: VarId) -> bool {
        !self.accept(&mut |v| v != var)
    }

    /// True iff `other` references none of the variables declared here, so
    /// `other` may be moved in front of this clause.
    pub fn skippable(&self, other: &Clause) -> bool {
        let vars = self.vars();
        other.accept(&mut |v| !vars.contains(&v))
    }

    pub fn count(&self, var: VarId, scope: &VarScope) -> VarUsage {
        match self {
            Clause::For(f) => f.expr.count(var, scope),
            Clause::Let(l) => l.expr.count(var, scope),
            Clause::Where(w) => w.pred.count(var, scope),
            Clause::Count(_) => VarUsage::Never,
            Clause::OrderBy(o) => {
                let carried = if o.refs.contains(&var) {
                    VarUsage::Once
                } else {
                    VarUsage::Never
                };
                VarUsage::sum(var, o.keys.iter().map(|k| &k.expr), scope).plus(carried)
            }
            Clause::GroupBy(g) => VarUsage::sum(var, g.specs.iter().map(|s| &s.expr), scope)
                .plus(VarUsage::sum(var, g.pre.iter(), scope)),
            Clause::Window(w) => {
                let conds = std::iter::once(&w.start.expr).chain(w.end.iter().map(|e| &e.expr));
                w.expr
                    .count(var, scope)
                    .plus(VarUsage::sum(var, conds, scope).times(None))
            }
        }
    }

    /// Updates the interval of tuples flowing out of this clause.
    pub fn calc_size(&self, bounds: &mut SizeBounds, scope: &VarScope) {
        match self {
            Clause::For(f) => {
                let mut src = f.expr.bounds(scope);
                if f.allow_empty {
                    src = src.at_least_one();
                }
                *bounds = bounds.times(src);
            }
            Clause::Where(w) => {
                if w.pred.as_value().and_then(|v| v.ebv().ok()) == Some(false) {
                    *bounds = SizeBounds::EMPTY;
                } else {
                    bounds.min = 0;
                }
            }
            Clause::Let(_) | Clause::Count(_) | Clause::OrderBy(_) => {}
            Clause::GroupBy(_) => bounds.min = bounds.min.min(1),
            Clause::Window(_) => {
                if !bounds.is_empty() {
                    *bounds = SizeBounds::ANY;
                }
            }
        }
    }

    /// Drops carried/rebound variables that no later clause uses. `decl`
    /// holds the variables declared by the enclosing FLWOR.
    pub fn clean(&mut self, decl: &HashSet<VarId>, used: &HashSet<VarId>) -> bool {
        match self {
            Clause::OrderBy(o) => {
                let before = o.refs.len();
                o.refs.retain(|v| !decl.contains(v) || used.contains(v));
                o.refs.len() != before
            }
            Clause::GroupBy(g) => {
                let before = g.post.len();
                let keep: Vec<bool> = g.post.iter().map(|v| used.contains(v)).collect();
                let mut flags = keep.iter();
                g.pre.retain(|_| flags.next().copied().unwrap_or(true));
                let mut flags = keep.iter();
                g.post.retain(|_| flags.next().copied().unwrap_or(true));
                g.post.len() != before
            }
            _ => false,
        }
    }

    pub fn inline_var(&mut self, var: VarId, with: &Expr, scope: &mut VarScope) -> bool {
        let mut changed = false;
        for e in self.exprs_mut() {
            changed |= e.inline_var(var, with, scope);
        }
        if let Clause::OrderBy(o) = self {
            if let Some(i) = o.refs.iter().position(|v| *v == var) {
                o.refs.remove(i);
                // the replacement's own variables now have to travel instead
                with.accept(&mut |v| {
                    if !o.refs.contains(&v) {
                        o.refs.push(v);
                    }
                    true
                });
                changed = true;
            }
        }
        changed
    }

    pub fn copy_with(&self, scope: &mut VarScope, map: &mut HashMap<VarId, VarId>) -> Clause {
        fn fresh(v: VarId, scope: &mut VarScope, map: &mut HashMap<VarId, VarId>) -> VarId {
            let id = scope.duplicate(v);
            map.insert(v, id);
            id
        }
        match self {
            Clause::For(f) => {
                let expr = f.expr.copy_with(scope, map);
                Clause::For(For {
                    var: fresh(f.var, scope, map),
                    pos: f.pos.map(|p| fresh(p, scope, map)),
                    score: f.score.map(|s| fresh(s, scope, map)),
                    expr,
                    allow_empty: f.allow_empty,
                })
            }
            Clause::Let(l) => {
                let expr = l.expr.copy_with(scope, map);
                Clause::Let(Let {
                    var: fresh(l.var, scope, map),
                    expr,
                    score: l.score,
                })
            }
            Clause::Where(w) => Clause::Where(Where {
                pred: w.pred.copy_with(scope, map),
            }),
            Clause::Count(c) => Clause::Count(Count {
                var: fresh(c.var, scope, map),
            }),
            Clause::OrderBy(o) => Clause::OrderBy(OrderBy {
                keys: o
                    .keys
                    .iter()
                    .map(|k| OrderKey {
                        expr: k.expr.copy_with(scope, map),
                        ..*k
                    })
                    .collect(),
                refs: o
                    .refs
                    .iter()
                    .map(|v| map.get(v).copied().unwrap_or(*v))
                    .collect(),
            }),
            Clause::GroupBy(g) => {
                let exprs: Vec<Expr> = g.specs.iter().map(|s| s.expr.copy_with(scope, map)).collect();
                let pre = g.pre.iter().map(|e| e.copy_with(scope, map)).collect();
                let specs = g
                    .specs
                    .iter()
                    .zip(exprs)
                    .map(|(s, expr)| GroupSpec {
                        var: fresh(s.var, scope, map),
                        expr,
                    })
                    .collect();
                let post = g.post.iter().map(|v| fresh(*v, scope, map)).collect();
                Clause::GroupBy(GroupBy { specs, pre, post })
            }
            Clause::Window(w) => {
                let expr = w.expr.copy_with(scope, map);
                let start = w.start.copy_with(scope, map);
                let end = w.end.as_ref().map(|e| e.copy_with(scope, map));
                Clause::Window(Window {
                    sliding: w.sliding,
                    var: fresh(w.var, scope, map),
                    expr,
                    start,
                    end,
                    only_end: w.only_end,
                })
            }
        }
    }

    pub fn expr_size(&self) -> usize {
        1 + self.exprs().into_iter().map(Expr::expr_size).sum::<usize>()
    }
}

/// A clause list plus the return expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flwor {
    pub clauses: Vec<Clause>,
    pub ret: Expr,
}

impl Flwor {
    pub fn new(clauses: Vec<Clause>, ret: Expr) -> Self {
        Self { clauses, ret }
    }

    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.clauses.iter().flat_map(Clause::exprs).collect();
        out.push(&self.ret);
        out
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out: Vec<&mut Expr> = self.clauses.iter_mut().flat_map(Clause::exprs_mut).collect();
        out.push(&mut self.ret);
        out
    }

    pub fn has(&self, flag: Flag) -> bool {
        self.clauses.iter().any(|c| c.has(flag)) || self.ret.has(flag)
    }

    pub fn accept(&self, visit: &mut dyn FnMut(VarId) -> bool) -> bool {
        self.clauses.iter().all(|c| c.accept(&mut *visit)) && self.ret.accept(visit)
    }

    pub fn removable(&self, var: VarId) -> bool {
        let carried = self.clauses.iter().any(|c| match c {
            Clause::OrderBy(o) => o.refs.contains(&var),
            _ => false,
        });
        !carried && self.exprs().into_iter().all(|e| e.removable(var))
    }

    pub fn count(&self, var: VarId, scope: &VarScope) -> VarUsage {
        self.count_from(var, 0, scope)
    }

    /// Usage of `var` from clause `from` on, each clause weighted by the
    /// maximum number of tuples reaching it.
    pub fn count_from(&self, var: VarId, from: usize, scope: &VarScope) -> VarUsage {
        let mut bounds = SizeBounds::ONE;
        let mut uses = VarUsage::Never;
        for clause in self.clauses.iter().skip(from) {
            uses = uses.plus(clause.count(var, scope).times(bounds.max));
            clause.calc_size(&mut bounds, scope);
        }
        uses.plus(self.ret.count(var, scope).times(bounds.max))
    }

    /// Interval of tuples reaching the return expression.
    pub fn calc_bounds(&self, scope: &VarScope) -> SizeBounds {
        let mut bounds = SizeBounds::ONE;
        for clause in &self.clauses {
            clause.calc_size(&mut bounds, scope);
            if bounds.is_empty() {
                break;
            }
        }
        bounds
    }

    pub fn size(&self, scope: &VarScope) -> Option<u64> {
        let output = self.ret.size(scope);
        if output == Some(0) {
            return Some(0);
        }
        let bounds = self.calc_bounds(scope);
        if bounds.is_empty() {
            return Some(0);
        }
        match (bounds.exact_value(), output) {
            (Some(n), Some(out)) => n.checked_mul(out),
            _ => None,
        }
    }

    pub fn seq_type(&self, scope: &VarScope) -> SeqType {
        let ret = self.ret.seq_type(scope);
        let bounds = match self.size(scope) {
            Some(n) => SizeBounds::exact(n),
            None => self.calc_bounds(scope).times(self.ret.bounds(scope)),
        };
        if bounds.is_empty() {
            return SeqType::EMPTY;
        }
        ret.with_occ(bounds.occ())
    }

    /// Only for, let and where clauses.
    pub fn is_flwr(&self) -> bool {
        self.clauses
            .iter()
            .all(|c| matches!(c, Clause::For(_) | Clause::Let(_) | Clause::Where(_)))
    }

    /// The return expression is evaluated at most once per evaluation of
    /// this FLWOR, so calls in it are tail calls.
    pub fn tail_call_eligible(&self, scope: &VarScope) -> bool {
        let mut bounds = SizeBounds::ONE;
        for clause in &self.clauses {
            clause.calc_size(&mut bounds, scope);
            if bounds.max.map_or(true, |m| m > 1) {
                return false;
            }
        }
        true
    }

    pub fn inline_var(&mut self, var: VarId, with: &Expr, scope: &mut VarScope) -> bool {
        let mut changed = false;
        for clause in &mut self.clauses {
            changed |= clause.inline_var(var, with, scope);
        }
        changed | self.ret.inline_var(var, with, scope)
    }

    pub fn copy_with(&self, scope: &mut VarScope, map: &mut HashMap<VarId, VarId>) -> Flwor {
        let clauses = self.clauses.iter().map(|c| c.copy_with(scope, map)).collect();
        Flwor {
            clauses,
            ret: self.ret.copy_with(scope, map),
        }
    }

    pub fn expr_size(&self) -> usize {
        1 + self.clauses.iter().map(Clause::expr_size).sum::<usize>() + self.ret.expr_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CmpOp, Value};

    #[test]
    fn skippable_checks_declared_references() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare("y");
        let for_x = Clause::For(For::new(x, Expr::Value(Value::ints([1, 2]))));
        let uses_x = Clause::Let(Let::new(y, Expr::var(x)));
        let constant = Clause::Where(Where {
            pred: Expr::bool(true),
        });
        assert!(!for_x.skippable(&uses_x));
        assert!(for_x.skippable(&constant));
    }

    #[test]
    fn bounds_follow_the_clause_list() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare("y");
        let flwor = Flwor::new(
            vec![
                Clause::For(For::new(x, Expr::Value(Value::ints([1, 2])))),
                Clause::For(For::new(y, Expr::Value(Value::ints([1, 2, 3])))),
            ],
            Expr::var(x),
        );
        assert_eq!(flwor.calc_bounds(&scope), SizeBounds::exact(6));

        let mut filtered = flwor.clone();
        filtered.clauses.push(Clause::Where(Where {
            pred: Expr::cmp(CmpOp::Eq, Expr::var(x), Expr::var(y)),
        }));
        assert_eq!(filtered.calc_bounds(&scope), SizeBounds { min: 0, max: Some(6) });
        assert_eq!(filtered.size(&scope), None);

        let mut dead = flwor;
        dead.clauses.insert(
            0,
            Clause::Where(Where {
                pred: Expr::bool(false),
            }),
        );
        assert_eq!(dead.size(&scope), Some(0));
    }

    #[test]
    fn count_weights_by_running_max() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let y = scope.declare("y");
        let body = Flwor::new(
            vec![
                Clause::Let(Let::new(x, Expr::int(1))),
                Clause::For(For::new(y, Expr::Value(Value::ints([1, 2])))),
            ],
            Expr::var(x),
        );
        assert_eq!(body.count_from(x, 1, &scope), VarUsage::Many);
        assert_eq!(body.count_from(x, 2, &scope), VarUsage::Once);
        assert_eq!(body.count_from(y, 0, &scope), VarUsage::Never);
    }

    #[test]
    fn copy_declares_fresh_variables() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let flwor = Flwor::new(
            vec![Clause::For(For::new(x, Expr::Value(Value::ints([1]))))],
            Expr::var(x),
        );
        let copy = flwor.copy_with(&mut scope, &mut HashMap::new());
        let Clause::For(f) = &copy.clauses[0] else {
            panic!("expected for clause");
        };
        assert_ne!(f.var, x);
        assert_eq!(copy.ret, Expr::var(f.var));
        assert_eq!(scope.name(f.var), "x");
    }

    #[test]
    fn group_by_clean_drops_unused_pairs() {
        let mut scope = VarScope::new();
        let k = scope.declare("k");
        let a = scope.declare("a");
        let b = scope.declare("b");
        let a2 = scope.declare("a");
        let b2 = scope.declare("b");
        let mut clause = Clause::GroupBy(GroupBy {
            specs: vec![GroupSpec {
                var: k,
                expr: Expr::var(a),
            }],
            pre: vec![Expr::var(a), Expr::var(b)],
            post: vec![a2, b2],
        });
        let decl: HashSet<VarId> = [k, a, b, a2, b2].into_iter().collect();
        let used: HashSet<VarId> = [b2].into_iter().collect();
        assert!(clause.clean(&decl, &used));
        let Clause::GroupBy(g) = clause else {
            panic!("expected group by");
        };
        assert_eq!(g.post, vec![b2]);
        assert_eq!(g.pre, vec![Expr::var(b)]);
    }
}
