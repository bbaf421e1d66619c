//! Tumbling and sliding windows.
//!
//! For every upstream round the source is materialized and the windows are
//! computed up front as inclusive `(start, end)` index pairs; each window
//! is then emitted as one round.

use flwor_core::clause::{Window, WindowCond};
use flwor_core::error::Result;
use flwor_core::types::{Item, Value};

use crate::context::QueryContext;
use crate::eval::Eval;
use crate::interp;

pub(crate) struct WindowEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a Window,
    items: Vec<Item>,
    windows: std::vec::IntoIter<(usize, usize)>,
}

impl<'a> WindowEval<'a> {
    pub(crate) fn new(up: Box<dyn Eval + 'a>, clause: &'a Window) -> Self {
        Self {
            up,
            clause,
            items: Vec::new(),
            windows: Vec::new().into_iter(),
        }
    }
}

impl Eval for WindowEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        loop {
            if let Some((s, e)) = self.windows.next() {
                let w = self.clause;
                bind_cond(qc, &w.start, &self.items, s);
                if let Some(end) = &w.end {
                    bind_cond(qc, end, &self.items, e);
                }
                qc.bind(w.var, Value(self.items[s..=e].to_vec()));
                return Ok(true);
            }
            if !self.up.next(qc)? {
                return Ok(false);
            }
            self.items = interp::value(&self.clause.expr, qc)?.0;
            self.windows = windows(self.clause, &self.items, qc)?.into_iter();
        }
    }
}

/// Binds the item, position, previous and next variables of `cond` for
/// the item at index `i`.
fn bind_cond(qc: &mut QueryContext, cond: &WindowCond, items: &[Item], i: usize) {
    let at = |j: Option<usize>| {
        j.and_then(|j| items.get(j))
            .cloned()
            .map(Value::single)
            .unwrap_or_default()
    };
    if let Some(v) = cond.item {
        qc.bind(v, at(Some(i)));
    }
    if let Some(v) = cond.pos {
        qc.bind(v, Value::int(i as i64 + 1));
    }
    if let Some(v) = cond.prev {
        qc.bind(v, at(i.checked_sub(1)));
    }
    if let Some(v) = cond.next {
        qc.bind(v, at(Some(i + 1)));
    }
}

fn holds(qc: &mut QueryContext, cond: &WindowCond, items: &[Item], i: usize) -> Result<bool> {
    bind_cond(qc, cond, items, i);
    interp::value(&cond.expr, qc)?.ebv()
}

/// First index `j >= s` at which the end condition holds for a window
/// starting at `s`.
fn find_end(qc: &mut QueryContext, w: &Window, items: &[Item], s: usize) -> Result<Option<usize>> {
    let Some(end) = &w.end else {
        return Ok(None);
    };
    for j in s..items.len() {
        bind_cond(qc, &w.start, items, s);
        if holds(qc, end, items, j)? {
            return Ok(Some(j));
        }
    }
    Ok(None)
}

fn windows(w: &Window, items: &[Item], qc: &mut QueryContext) -> Result<Vec<(usize, usize)>> {
    let n = items.len();
    let mut out = Vec::new();
    if w.sliding {
        for s in 0..n {
            if !holds(qc, &w.start, items, s)? {
                continue;
            }
            match find_end(qc, w, items, s)? {
                Some(e) => out.push((s, e)),
                None if !w.only_end => out.push((s, n - 1)),
                None => {}
            }
        }
        return Ok(out);
    }

    let mut i = 0;
    let mut started = None;
    while i < n {
        let s = match started.take() {
            Some(s) => s,
            None if holds(qc, &w.start, items, i)? => i,
            None => {
                i += 1;
                continue;
            }
        };
        let e = if w.end.is_some() {
            match find_end(qc, w, items, s)? {
                Some(e) => e,
                None if w.only_end => break,
                None => n - 1,
            }
        } else {
            // without an end condition the next start closes the window
            let mut e = n - 1;
            for j in s + 1..n {
                if holds(qc, &w.start, items, j)? {
                    e = j - 1;
                    started = Some(j);
                    break;
                }
            }
            e
        };
        out.push((s, e));
        i = e + 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use flwor_core::clause::{Clause, Flwor};
    use flwor_core::expr::Expr;
    use flwor_core::func::Func;
    use flwor_core::id::VarId;
    use flwor_core::types::{ArithOp, CmpOp};
    use flwor_core::var::VarScope;

    use super::*;

    fn sums(w: Window, scope: &VarScope) -> Value {
        let var = w.var;
        let flwor = Expr::from(Flwor::new(
            vec![Clause::Window(w)],
            Expr::call(Func::Sum, vec![Expr::var(var)]),
        ));
        let mut qc = QueryContext::new(scope);
        interp::value(&flwor, &mut qc).unwrap()
    }

    fn cond_at(pos: VarId, expr: Expr) -> WindowCond {
        WindowCond {
            pos: Some(pos),
            ..WindowCond::when(expr)
        }
    }

    /// Start when `pos mod 3 = 1`.
    fn every_third(pos: VarId) -> Expr {
        Expr::cmp(
            CmpOp::Eq,
            Expr::arith(ArithOp::Mod, Expr::var(pos), Expr::int(3)),
            Expr::int(1),
        )
    }

    #[test]
    fn tumbling_without_end() {
        let mut scope = VarScope::new();
        let w = scope.declare("w");
        let s = scope.declare("s");
        let window = Window {
            sliding: false,
            var: w,
            expr: Expr::range(Expr::int(1), Expr::int(7)),
            start: cond_at(s, every_third(s)),
            end: None,
            only_end: false,
        };
        // (1,2,3) (4,5,6) (7)
        assert_eq!(sums(window, &scope), Value::ints([6, 15, 7]));
    }

    #[test]
    fn tumbling_with_only_end_drops_open_window() {
        let mut scope = VarScope::new();
        let w = scope.declare("w");
        let s = scope.declare("s");
        let e = scope.declare("e");
        let mut window = Window {
            sliding: false,
            var: w,
            expr: Expr::range(Expr::int(1), Expr::int(7)),
            start: cond_at(s, Expr::bool(true)),
            end: Some(cond_at(
                e,
                Expr::cmp(
                    CmpOp::Eq,
                    Expr::arith(ArithOp::Sub, Expr::var(e), Expr::var(s)),
                    Expr::int(2),
                ),
            )),
            only_end: true,
        };
        // (1,2,3) (4,5,6); (7) never closes
        assert_eq!(sums(window.clone(), &scope), Value::ints([6, 15]));
        window.only_end = false;
        assert_eq!(sums(window, &scope), Value::ints([6, 15, 7]));
    }

    #[test]
    fn sliding_windows_overlap() {
        let mut scope = VarScope::new();
        let w = scope.declare("w");
        let s = scope.declare("s");
        let e = scope.declare("e");
        let window = Window {
            sliding: true,
            var: w,
            expr: Expr::range(Expr::int(1), Expr::int(4)),
            start: cond_at(s, Expr::bool(true)),
            end: Some(cond_at(
                e,
                Expr::cmp(
                    CmpOp::Eq,
                    Expr::arith(ArithOp::Sub, Expr::var(e), Expr::var(s)),
                    Expr::int(1),
                ),
            )),
            only_end: true,
        };
        // (1,2) (2,3) (3,4)
        assert_eq!(sums(window, &scope), Value::ints([3, 5, 7]));
    }

    #[test]
    fn previous_and_next_items_are_bound() {
        let mut scope = VarScope::new();
        let w = scope.declare("w");
        let cur = scope.declare("cur");
        let next = scope.declare("next");
        // start anywhere, end where there is no next item
        let start = WindowCond {
            item: Some(cur),
            next: Some(next),
            ..WindowCond::when(Expr::bool(true))
        };
        let end = WindowCond {
            item: Some(scope.declare("last")),
            next: Some(scope.declare("after")),
            ..WindowCond::when(Expr::bool(false))
        };
        let mut window = Window {
            sliding: false,
            var: w,
            expr: Expr::Value(Value::ints([1, 2, 3])),
            start,
            end: Some(end),
            only_end: false,
        };
        let after = window.end.as_ref().and_then(|e| e.next).unwrap();
        window.end.as_mut().unwrap().expr =
            Expr::call(Func::Empty, vec![Expr::var(after)]);
        // the end condition holds only at the last item
        assert_eq!(sums(window, &scope), Value::ints([6]));
    }
}
