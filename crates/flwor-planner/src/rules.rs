//! FLWOR rewrite rules, applied to a compiled clause list until nothing
//! changes.
//!
//! Order of one round: for-to-let, let sliding, let inlining, dead variable
//! cleanup, unnesting, where hoisting; then the rules that look at the ends
//! of the list (empty list, tail collapse, leading `for`, return
//! flattening). After the fixed point adjacent wheres are merged, provably
//! empty FLWORs vanish and a leading where becomes a conditional.

use std::collections::HashSet;
use std::mem;

use flwor_core::clause::{Clause, Count, Flwor, For, Let, Where};
use flwor_core::display::render_clause;
use flwor_core::error::{Error, Result};
use flwor_core::expr::{Expr, Flag};
use flwor_core::func::Func;
use flwor_core::id::VarId;
use flwor_core::types::{Item, Value};
use flwor_core::usage::VarUsage;

use crate::diag::Rewrite;
use crate::planner::Planner;

impl Planner<'_> {
    pub(crate) fn optimize_flwor(&mut self, mut flwor: Flwor) -> Result<Expr> {
        if !self.rewrite {
            return Ok(Expr::from(flwor));
        }
        self.split_wheres(&mut flwor);

        let mut rounds = 0;
        loop {
            rounds += 1;
            if rounds > self.max_rounds {
                return Err(Error::Invariant(format!(
                    "FLWOR rewrites did not reach a fixed point within {} rounds",
                    self.max_rounds
                )));
            }
            let mut changed = self.for_to_let(&mut flwor);
            changed |= self.slide_lets_out(&mut flwor);
            changed |= self.inline_lets(&mut flwor)?;
            changed |= self.clean_dead_vars(&mut flwor);
            changed |= self.unnest_flwr(&mut flwor)?;
            changed |= self.optimize_where(&mut flwor)?;

            if flwor.clauses.is_empty() {
                let detail = self.show(&flwor.ret);
                self.note(Rewrite::RemoveFlwor, detail);
                return Ok(flwor.ret);
            }
            changed |= self.collapse_tail(&mut flwor);
            changed |= self.unnest_first_for(&mut flwor);
            changed |= self.flatten_return(&mut flwor)?;
            if !changed {
                break;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(rounds, clauses = flwor.clauses.len(), "flwor fixed point");

        self.merge_wheres(&mut flwor);

        if flwor.size(self.scope) == Some(0) && !flwor.has(Flag::Ndt) && !flwor.has(Flag::Upd) {
            let detail = self.show(&Expr::from(flwor));
            self.note(Rewrite::EmptyFlwor, detail);
            return Ok(Expr::empty());
        }

        if matches!(flwor.clauses.first(), Some(Clause::Where(_))) {
            if let Clause::Where(w) = flwor.clauses.remove(0) {
                let rest = if flwor.clauses.is_empty() {
                    flwor.ret
                } else {
                    Expr::from(flwor)
                };
                let cond = Expr::iff(w.pred, rest, Expr::empty());
                let detail = self.show(&cond);
                self.note(Rewrite::WhereToIf, detail);
                return self.optimize(cond);
            }
        }
        Ok(Expr::from(flwor))
    }

    /// `where A and B` becomes `where A where B`, so each part can move on
    /// its own.
    fn split_wheres(&mut self, flwor: &mut Flwor) {
        let mut i = 0;
        while i < flwor.clauses.len() {
            if matches!(&flwor.clauses[i], Clause::Where(Where { pred: Expr::And(_) })) {
                if let Clause::Where(Where {
                    pred: Expr::And(preds),
                }) = flwor.clauses.remove(i)
                {
                    let n = preds.len();
                    let parts = preds.into_iter().map(|pred| Clause::Where(Where { pred }));
                    flwor.clauses.splice(i..i, parts);
                    self.note(Rewrite::SplitWhere, format!("{} conditions", n));
                    i += n;
                    continue;
                }
            }
            i += 1;
        }
    }

    /// A `for` over exactly one item binds like a `let`.
    fn for_to_let(&mut self, flwor: &mut Flwor) -> bool {
        let mut changed = false;
        for i in (0..flwor.clauses.len()).rev() {
            let Clause::For(f) = &flwor.clauses[i] else {
                continue;
            };
            let single =
                f.expr.size(self.scope) == Some(1) || f.expr.seq_type(self.scope).one();
            if !single || self.scope.checks_type(f.var) {
                continue;
            }
            if let Clause::For(f) = flwor.clauses.remove(i) {
                let mut lets = vec![Clause::Let(Let::new(f.var, f.expr))];
                if let Some(pos) = f.pos {
                    lets.push(Clause::Let(Let::new(pos, Expr::int(1))));
                }
                if let Some(score) = f.score {
                    lets.push(Clause::Let(Let {
                        var: score,
                        expr: Expr::var(f.var),
                        score: true,
                    }));
                }
                for l in &lets {
                    self.refine(l);
                }
                let detail = render_clause(&lets[0], self.scope);
                flwor.clauses.splice(i..i, lets);
                self.note(Rewrite::ForToLet, detail);
                changed = true;
            }
        }
        changed
    }

    /// Moves lets in front of the loops they do not depend on, so they are
    /// evaluated once.
    fn slide_lets_out(&mut self, flwor: &mut Flwor) -> bool {
        let mut changed = false;
        for i in 1..flwor.clauses.len() {
            let clause = &flwor.clauses[i];
            let Clause::Let(l) = clause else { continue };
            if l.expr.has(Flag::Ndt) || l.expr.has(Flag::Cns) || l.expr.has(Flag::Upd) {
                continue;
            }
            let mut insert = None;
            for j in (0..i).rev() {
                let curr = &flwor.clauses[j];
                if matches!(curr, Clause::OrderBy(_) | Clause::GroupBy(_)) || !curr.skippable(clause)
                {
                    break;
                }
                if matches!(curr, Clause::For(_) | Clause::Window(_)) {
                    insert = Some(j);
                }
            }
            if let Some(j) = insert {
                let moved = flwor.clauses.remove(i);
                let detail = render_clause(&moved, self.scope);
                flwor.clauses.insert(j, moved);
                self.note(Rewrite::SlideLet, detail);
                changed = true;
            }
        }
        changed
    }

    /// Drops unused lets and inlines the ones whose binding is a value, a
    /// variable, a cheap path or used at most once.
    fn inline_lets(&mut self, flwor: &mut Flwor) -> Result<bool> {
        let mut changed = false;
        'restart: loop {
            for i in 0..flwor.clauses.len() {
                let Clause::Let(l) = &flwor.clauses[i] else {
                    continue;
                };
                if l.expr.has(Flag::Ndt) || l.expr.has(Flag::Upd) {
                    continue;
                }
                let var = l.var;
                let usage = flwor.count_from(var, i + 1, self.scope);
                if usage == VarUsage::Never {
                    let dropped = flwor.clauses.remove(i);
                    let detail = render_clause(&dropped, self.scope);
                    self.note(Rewrite::DropLet, detail);
                    changed = true;
                    continue 'restart;
                }
                let expr = &l.expr;
                let inlinable = expr.is_value()
                    || (matches!(expr, Expr::VarRef(_)) && !self.scope.checks_type(var))
                    || expr.is_cheap_path()
                    || (usage == VarUsage::Once && !expr.has(Flag::Ctx) && !expr.has(Flag::Cns));
                if !inlinable {
                    continue;
                }
                let replacement = match self.binding(l) {
                    Ok(Some(e)) => e,
                    Ok(None) => continue,
                    Err(err) => {
                        let ty = flwor.ret.seq_type(self.scope);
                        self.clause_error(flwor, err, i, ty)?;
                        changed = true;
                        continue 'restart;
                    }
                };
                let detail = format!("${} := {}", self.scope.name(var), self.show(&replacement));
                self.note(Rewrite::InlineLet, detail);
                self.inline_from(flwor, var, &replacement, i + 1)?;
                if matches!(flwor.clauses.get(i), Some(Clause::Let(l)) if l.var == var) {
                    flwor.clauses.remove(i);
                }
                changed = true;
                continue 'restart;
            }
            break;
        }
        Ok(changed)
    }

    /// The expression to substitute for a let variable, with the variable's
    /// type check applied. `None` if the binding has to stay.
    fn binding(&mut self, l: &Let) -> Result<Option<Expr>> {
        if l.score {
            return Ok(l
                .expr
                .as_value()
                .map(|v| Expr::Value(Value::single(Item::Double(v.score())))));
        }
        let var = self.scope.get(l.var).clone();
        if !var.checks_type() {
            return Ok(Some(l.expr.clone()));
        }
        let st = l.expr.seq_type(self.scope);
        if st.is_disjoint(&var.declared) {
            return Err(Error::static_err(
                "XPTY0004",
                format!("${} as {} cannot be bound to {}", var.name, var.declared, st),
            ));
        }
        if st.is_sub_type_of(&var.declared) {
            self.note(Rewrite::TypeCheck, format!("${}: check dropped", var.name));
            Ok(Some(l.expr.clone()))
        } else {
            self.note(Rewrite::TypeCheck, format!("${}: treat as {}", var.name, var.declared));
            Ok(Some(Expr::type_check(l.expr.clone(), var.declared)))
        }
    }

    /// Substitutes `with` for `var` in clauses `from..` and the return
    /// expression, recompiling whatever changed.
    pub(crate) fn inline_from(
        &mut self,
        flwor: &mut Flwor,
        var: VarId,
        with: &Expr,
        from: usize,
    ) -> Result<bool> {
        let mut changed = false;
        for i in from..flwor.clauses.len() {
            if !flwor.clauses[i].inline_var(var, with, self.scope) {
                continue;
            }
            changed = true;
            if let Err(err) = self.compile_clause(&mut flwor.clauses[i]) {
                let ty = flwor.ret.seq_type(self.scope);
                self.clause_error(flwor, err, i, ty)?;
                return Ok(true);
            }
        }
        if flwor.ret.inline_var(var, with, self.scope) {
            changed = true;
            let ty = flwor.ret.seq_type(self.scope);
            match self.compile(mem::take(&mut flwor.ret)) {
                Ok(ret) => flwor.ret = ret,
                Err(err) => {
                    let idx = flwor.clauses.len();
                    self.clause_error(flwor, err, idx, ty)?;
                }
            }
        }
        Ok(changed)
    }

    /// Removes order-by and group-by variables nothing downstream reads.
    fn clean_dead_vars(&mut self, flwor: &mut Flwor) -> bool {
        let decl: HashSet<VarId> = flwor.clauses.iter().flat_map(Clause::vars).collect();
        let mut used = HashSet::new();
        flwor.ret.accept(&mut |v| {
            used.insert(v);
            true
        });
        let mut changed = false;
        for clause in flwor.clauses.iter_mut().rev() {
            if clause.clean(&decl, &used) {
                changed = true;
            }
            clause.accept(&mut |v| {
                used.insert(v);
                true
            });
        }
        if changed {
            self.note(Rewrite::CleanVars, "unused carried variables removed".into());
        }
        changed
    }

    /// Splices nested for/let/where FLWORs bound by a `for`, and pulls the
    /// leading lets out of nested FLWORs bound by `for` or `let`.
    fn unnest_flwr(&mut self, flwor: &mut Flwor) -> Result<bool> {
        let mut changed = false;
        'restart: loop {
            for i in 0..flwor.clauses.len() {
                let splice = matches!(
                    &flwor.clauses[i],
                    Clause::For(For { expr: Expr::Flwor(sub), allow_empty: false, pos: None, .. })
                        if sub.is_flwr()
                );
                if splice {
                    if let Clause::For(mut f) = flwor.clauses.remove(i) {
                        if let Expr::Flwor(sub) = mem::take(&mut f.expr) {
                            let sub = *sub;
                            f.expr = sub.ret;
                            let mut clauses = sub.clauses;
                            clauses.push(Clause::For(f));
                            flwor.clauses.splice(i..i, clauses);
                        }
                    }
                    self.note(Rewrite::Unnest, format!("for source at clause {}", i));
                    changed = true;
                    continue 'restart;
                }

                let leading = match &flwor.clauses[i] {
                    Clause::For(For {
                        expr: Expr::Flwor(sub),
                        ..
                    })
                    | Clause::Let(Let {
                        expr: Expr::Flwor(sub),
                        ..
                    }) => leading_lets(sub),
                    _ => 0,
                };
                if leading == 0 {
                    continue;
                }
                let mut clause = flwor.clauses.remove(i);
                if let Some(target) = binding_expr_mut(&mut clause) {
                    if let Expr::Flwor(sub) = mem::take(target) {
                        let mut sub = *sub;
                        let lets: Vec<Clause> = sub.clauses.drain(..leading).collect();
                        *target = if sub.clauses.is_empty() {
                            sub.ret
                        } else {
                            self.optimize_flwor(sub)?
                        };
                        self.refine(&clause);
                        flwor
                            .clauses
                            .splice(i..i, lets.into_iter().chain(std::iter::once(clause)));
                    }
                }
                self.note(Rewrite::PullLets, format!("{} lets", leading));
                changed = true;
                continue 'restart;
            }
            break;
        }
        Ok(changed)
    }

    /// Moves each where clause as far up as its variables allow, and turns
    /// it into a predicate of the `for` in front of it when possible.
    fn optimize_where(&mut self, flwor: &mut Flwor) -> Result<bool> {
        let mut changed = false;
        let mut i = 0;
        while i < flwor.clauses.len() {
            let Clause::Where(w) = &flwor.clauses[i] else {
                i += 1;
                continue;
            };
            if w.pred.has(Flag::Ndt) || w.pred.has(Flag::Upd) {
                i += 1;
                continue;
            }
            if let Some(v) = w.pred.as_value() {
                match v.ebv() {
                    Ok(true) => {
                        flwor.clauses.remove(i);
                        self.note(Rewrite::DropWhere, "where true()".into());
                        changed = true;
                        continue;
                    }
                    Ok(false) => {
                        flwor.clauses[i] = Clause::Where(Where {
                            pred: Expr::bool(false),
                        });
                        break;
                    }
                    Err(_) => {
                        i += 1;
                        continue;
                    }
                }
            }

            let mut insert = None;
            for j in (0..i).rev() {
                let curr = &flwor.clauses[j];
                if curr.has(Flag::Ndt)
                    || curr.has(Flag::Upd)
                    || matches!(curr, Clause::Count(_))
                    || !curr.skippable(&flwor.clauses[i])
                {
                    break;
                }
                if !matches!(curr, Clause::Where(_)) {
                    insert = Some(j);
                }
            }
            if let Some(j) = insert {
                let moved = flwor.clauses.remove(i);
                let detail = render_clause(&moved, self.scope);
                flwor.clauses.insert(j, moved);
                self.note(Rewrite::HoistWhere, detail);
                changed = true;
            }

            let at = insert.unwrap_or(i);
            let mut merged = false;
            for b4 in (0..at).rev() {
                if matches!(flwor.clauses[b4], Clause::Where(_)) {
                    continue;
                }
                if matches!(flwor.clauses[b4], Clause::For(_)) {
                    merged = self.to_pred(flwor, b4, at);
                }
                break;
            }
            if merged {
                flwor.clauses.remove(at);
                changed = true;
                continue;
            }
            i += 1;
        }
        Ok(changed)
    }

    /// Attaches the where clause at `wi` as a predicate to the source of the
    /// `for` clause at `fi`, with the loop variable replaced by `.`.
    fn to_pred(&mut self, flwor: &mut Flwor, fi: usize, wi: usize) -> bool {
        let (Clause::For(f), Clause::Where(w)) = (&flwor.clauses[fi], &flwor.clauses[wi]) else {
            return false;
        };
        if f.allow_empty
            || f.pos.is_some()
            || f.score.is_some()
            || self.scope.checks_type(f.var)
            || !w.pred.uses(f.var)
            || !w.pred.removable(f.var)
            || w.pred.has(Flag::Ctx)
        {
            return false;
        }
        let var = f.var;
        let mut pred = w.pred.clone();
        pred.inline_var(var, &Expr::ContextItem, self.scope);
        if pred.seq_type(self.scope).may_be_number() {
            pred = Expr::call(Func::Boolean, vec![pred]);
        }
        let detail = format!("${}[{}]", self.scope.name(var), self.show(&pred));
        if let Clause::For(f) = &mut flwor.clauses[fi] {
            f.expr = match mem::take(&mut f.expr) {
                Expr::Path { root, mut steps } if !steps.is_empty() => {
                    if let Some(last) = steps.last_mut() {
                        last.preds.push(pred);
                    }
                    Expr::Path { root, steps }
                }
                Expr::Filter { base, mut preds } => {
                    preds.push(pred);
                    Expr::Filter { base, preds }
                }
                other => Expr::Filter {
                    base: Box::new(other),
                    preds: vec![pred],
                },
            };
        }
        self.note(Rewrite::WherePredicate, detail);
        true
    }

    /// `for $x in E return $x` is `E`.
    fn collapse_tail(&mut self, flwor: &mut Flwor) -> bool {
        let Some(Clause::For(last)) = flwor.clauses.last() else {
            return false;
        };
        if flwor.ret != Expr::var(last.var) || self.scope.checks_type(last.var) {
            return false;
        }
        if let Some(Clause::For(last)) = flwor.clauses.pop() {
            let detail = format!("${}", self.scope.name(last.var));
            flwor.ret = last.expr;
            self.note(Rewrite::TailCollapse, detail);
        }
        true
    }

    /// Rewrites around a leading `for`: a nested FLWOR source is spliced in
    /// (its position variable becomes a `count`), and a `count` right after
    /// it becomes its positional variable.
    fn unnest_first_for(&mut self, flwor: &mut Flwor) -> bool {
        let Some(Clause::For(first)) = flwor.clauses.first() else {
            return false;
        };
        if first.allow_empty {
            return false;
        }
        if matches!(first.expr, Expr::Flwor(_)) {
            if let Clause::For(mut f) = flwor.clauses.remove(0) {
                if let Expr::Flwor(sub) = mem::take(&mut f.expr) {
                    let sub = *sub;
                    let pos = f.pos.take();
                    f.expr = sub.ret;
                    let mut head = sub.clauses;
                    head.push(Clause::For(f));
                    if let Some(var) = pos {
                        head.push(Clause::Count(Count { var }));
                    }
                    flwor.clauses.splice(0..0, head);
                }
            }
            self.note(Rewrite::Unnest, "leading for source".into());
            return true;
        }
        if !matches!(flwor.clauses.get(1), Some(Clause::Count(_))) {
            return false;
        }
        if let Clause::Count(count) = flwor.clauses.remove(1) {
            if let Clause::For(f) = &mut flwor.clauses[0] {
                match f.pos {
                    Some(pos) => {
                        let alias = Clause::Let(Let::new(count.var, Expr::var(pos)));
                        self.refine(&alias);
                        flwor.clauses.insert(1, alias);
                    }
                    None => f.pos = Some(count.var),
                }
            }
            let detail = format!("${}", self.scope.name(count.var));
            self.note(Rewrite::CountToPosition, detail);
        }
        true
    }

    /// Appends the clauses of a for/let/where FLWOR in return position, and
    /// pulls leading lets out of any other nested FLWOR there.
    fn flatten_return(&mut self, flwor: &mut Flwor) -> Result<bool> {
        let mut changed = false;
        if matches!(&flwor.ret, Expr::Flwor(sub) if sub.is_flwr() && !positional(sub)) {
            if let Expr::Flwor(sub) = mem::take(&mut flwor.ret) {
                let sub = *sub;
                flwor.clauses.extend(sub.clauses);
                flwor.ret = sub.ret;
            }
            self.note(Rewrite::Unnest, "return clause".into());
            changed = true;
        }

        let checked = matches!(flwor.ret, Expr::TypeCheck { .. });
        let target = match &mut flwor.ret {
            Expr::TypeCheck { expr, .. } => &mut **expr,
            other => other,
        };
        let leading = match &*target {
            Expr::Flwor(sub) => leading_lets(sub),
            _ => 0,
        };
        if leading > 0 {
            if let Expr::Flwor(sub) = mem::take(target) {
                let mut sub = *sub;
                flwor.clauses.extend(sub.clauses.drain(..leading));
                *target = if sub.clauses.is_empty() {
                    sub.ret
                } else {
                    self.optimize_flwor(sub)?
                };
            }
            if checked {
                flwor.ret = self.optimize(mem::take(&mut flwor.ret))?;
            }
            self.note(Rewrite::PullLets, format!("{} lets from return", leading));
            changed = true;
        }
        Ok(changed)
    }

    /// Adjacent wheres become one conjunction. Stops at a statically false
    /// where.
    fn merge_wheres(&mut self, flwor: &mut Flwor) {
        let mut i = 0;
        while i < flwor.clauses.len() {
            let Clause::Where(w) = &flwor.clauses[i] else {
                i += 1;
                continue;
            };
            if w.pred.as_value().and_then(Value::as_bool) == Some(false) {
                return;
            }
            if i > 0 && matches!(flwor.clauses[i - 1], Clause::Where(_)) {
                if let Clause::Where(w) = flwor.clauses.remove(i) {
                    if let Clause::Where(before) = &mut flwor.clauses[i - 1] {
                        before.pred = match mem::take(&mut before.pred) {
                            Expr::And(mut es) => {
                                es.push(w.pred);
                                Expr::And(es)
                            }
                            other => Expr::And(vec![other, w.pred]),
                        };
                    }
                }
                self.note(Rewrite::MergeWheres, format!("at clause {}", i - 1));
                continue;
            }
            i += 1;
        }
    }
}

/// Position variables restart with every evaluation of the nested FLWOR,
/// so a FLWOR binding one stays nested.
fn positional(flwor: &Flwor) -> bool {
    flwor
        .clauses
        .iter()
        .any(|c| matches!(c, Clause::For(For { pos: Some(_), .. })))
}

fn leading_lets(flwor: &Flwor) -> usize {
    flwor
        .clauses
        .iter()
        .take_while(|c| matches!(c, Clause::Let(_)))
        .count()
}

fn binding_expr_mut(clause: &mut Clause) -> Option<&mut Expr> {
    match clause {
        Clause::For(f) => Some(&mut f.expr),
        Clause::Let(l) => Some(&mut l.expr),
        _ => None,
    }
}
