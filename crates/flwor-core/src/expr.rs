//! Expression tree and the static contract the optimizer relies on: effect
//! flags, variable references, weighted usage counts, static size and type,
//! substitution and deep copies with fresh variables.
//!
//! Expressions refer to variables by `VarId` only; everything else about a
//! variable lives in the `VarScope` arena passed alongside.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clause::Flwor;
use crate::error::Error;
use crate::func::Func;
use crate::id::VarId;
use crate::seqtype::{ItemType, Occ, SeqType};
use crate::size::SizeBounds;
use crate::types::{ArithOp, CmpOp, Item, Node, Value};
use crate::usage::VarUsage;
use crate::var::VarScope;

/// Effect flags. Monotone over subtrees; every rewrite checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    /// Non-deterministic: repeated evaluation may differ (or fail).
    Ndt,
    /// Reads the context item or its position.
    Ctx,
    /// Constructs nodes with fresh identities.
    Cns,
    /// Records pending updates.
    Upd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Child,
    #[serde(rename = "self")]
    SelfAxis,
    Descendant,
}

/// One path step: axis, optional element name test, predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub axis: Axis,
    /// Element name, `None` for any element.
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub preds: Vec<Expr>,
}

impl Step {
    pub fn new(axis: Axis, test: Option<&str>) -> Self {
        Self {
            axis,
            test: test.map(str::to_string),
            preds: Vec::new(),
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.test.as_deref().map_or(true, |t| t == node.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Value(Value),
    VarRef(VarId),
    ContextItem,
    Range(Box<Expr>, Box<Expr>),
    Seq(Vec<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cmp {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
    Element {
        name: String,
        content: Box<Expr>,
    },
    Filter {
        base: Box<Expr>,
        preds: Vec<Expr>,
    },
    Path {
        root: Box<Expr>,
        steps: Vec<Step>,
    },
    TypeCheck {
        expr: Box<Expr>,
        ty: SeqType,
    },
    Flwor(Box<Flwor>),
    /// Deferred failure: raises the captured error when evaluated.
    Raise {
        code: String,
        message: String,
        ty: SeqType,
    },
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Value(Value::empty())
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Value(v)
    }
}

impl From<Flwor> for Expr {
    fn from(f: Flwor) -> Self {
        Expr::Flwor(Box::new(f))
    }
}

// ---- constructors ----

impl Expr {
    pub fn empty() -> Expr {
        Expr::Value(Value::empty())
    }

    pub fn int(i: i64) -> Expr {
        Expr::Value(Value::int(i))
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Value(Value::bool(b))
    }

    pub fn str(s: impl Into<String>) -> Expr {
        Expr::Value(Value::single(Item::Str(s.into())))
    }

    pub fn var(id: VarId) -> Expr {
        Expr::VarRef(id)
    }

    pub fn range(from: Expr, to: Expr) -> Expr {
        Expr::Range(Box::new(from), Box::new(to))
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Expr {
        Expr::Cmp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Expr {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn iff(cond: Expr, then: Expr, els: Expr) -> Expr {
        Expr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        }
    }

    pub fn call(func: Func, args: Vec<Expr>) -> Expr {
        Expr::Call { func, args }
    }

    pub fn type_check(expr: Expr, ty: SeqType) -> Expr {
        Expr::TypeCheck {
            expr: Box::new(expr),
            ty,
        }
    }

    /// Deferred failure carrying a checked error.
    pub fn raise(err: &Error, ty: SeqType) -> Expr {
        let (code, message) = match err {
            Error::Static { code, message } | Error::Dynamic { code, message } => {
                (code.clone(), message.clone())
            }
            other => ("FOER0000".to_string(), other.to_string()),
        };
        Expr::Raise { code, message, ty }
    }
}

// ---- static contract ----

impl Expr {
    pub fn is_value(&self) -> bool {
        matches!(self, Expr::Value(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Expr::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.as_value().map(|v| v.items()) {
            Some([Item::Int(i)]) => Some(*i),
            _ => None,
        }
    }

    /// Direct subexpressions. Predicates of filters and path steps are
    /// included; clause expressions of a nested FLWOR too.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Value(_) | Expr::VarRef(_) | Expr::ContextItem | Expr::Raise { .. } => Vec::new(),
            Expr::Range(a, b) => vec![&**a, &**b],
            Expr::Seq(es) | Expr::And(es) | Expr::Or(es) => es.iter().collect(),
            Expr::Cmp { left, right, .. } | Expr::Arith { left, right, .. } => {
                vec![&**left, &**right]
            }
            Expr::If { cond, then, els } => vec![&**cond, &**then, &**els],
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Element { content, .. } => vec![&**content],
            Expr::Filter { base, preds } => {
                let mut out = vec![&**base];
                out.extend(preds.iter());
                out
            }
            Expr::Path { root, steps } => {
                let mut out = vec![&**root];
                out.extend(steps.iter().flat_map(|s| s.preds.iter()));
                out
            }
            Expr::TypeCheck { expr, .. } => vec![&**expr],
            Expr::Flwor(f) => f.exprs(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Value(_) | Expr::VarRef(_) | Expr::ContextItem | Expr::Raise { .. } => Vec::new(),
            Expr::Range(a, b) => vec![&mut **a, &mut **b],
            Expr::Seq(es) | Expr::And(es) | Expr::Or(es) => es.iter_mut().collect(),
            Expr::Cmp { left, right, .. } | Expr::Arith { left, right, .. } => {
                vec![&mut **left, &mut **right]
            }
            Expr::If { cond, then, els } => vec![&mut **cond, &mut **then, &mut **els],
            Expr::Call { args, .. } => args.iter_mut().collect(),
            Expr::Element { content, .. } => vec![&mut **content],
            Expr::Filter { base, preds } => {
                let mut out = vec![&mut **base];
                out.extend(preds.iter_mut());
                out
            }
            Expr::Path { root, steps } => {
                let mut out = vec![&mut **root];
                out.extend(steps.iter_mut().flat_map(|s| s.preds.iter_mut()));
                out
            }
            Expr::TypeCheck { expr, .. } => vec![&mut **expr],
            Expr::Flwor(f) => f.exprs_mut(),
        }
    }

    pub fn has(&self, flag: Flag) -> bool {
        match self {
            Expr::Value(_) | Expr::VarRef(_) => false,
            Expr::ContextItem => flag == Flag::Ctx,
            Expr::Raise { .. } => flag == Flag::Ndt,
            Expr::Call { func, args } => func.has(flag) || args.iter().any(|a| a.has(flag)),
            Expr::Element { content, .. } => flag == Flag::Cns || content.has(flag),
            // predicates get their own focus
            Expr::Filter { base, preds } => {
                base.has(flag) || (flag != Flag::Ctx && preds.iter().any(|p| p.has(flag)))
            }
            Expr::Path { root, steps } => {
                root.has(flag)
                    || (flag != Flag::Ctx
                        && steps.iter().flat_map(|s| s.preds.iter()).any(|p| p.has(flag)))
            }
            Expr::Flwor(f) => f.has(flag),
            other => other.children().into_iter().any(|c| c.has(flag)),
        }
    }

    /// Visits every variable reference; stops as soon as `visit` returns false.
    pub fn accept(&self, visit: &mut dyn FnMut(VarId) -> bool) -> bool {
        match self {
            Expr::VarRef(v) => visit(*v),
            Expr::Flwor(f) => f.accept(visit),
            other => other.children().into_iter().all(|c| c.accept(&mut *visit)),
        }
    }

    pub fn uses(&self, var: VarId) -> bool {
        !self.accept(&mut |v| v != var)
    }

    /// Weighted number of evaluations of `var`. Predicates run once per
    /// item, so uses inside them count as many.
    pub fn count(&self, var: VarId, scope: &VarScope) -> VarUsage {
        match self {
            Expr::VarRef(v) => {
                if *v == var {
                    VarUsage::Once
                } else {
                    VarUsage::Never
                }
            }
            Expr::If { cond, then, els } => cond
                .count(var, scope)
                .plus(then.count(var, scope).max(els.count(var, scope))),
            Expr::Filter { base, preds } => base
                .count(var, scope)
                .plus(VarUsage::sum(var, preds.iter(), scope).times(None)),
            Expr::Path { root, steps } => {
                let preds = steps.iter().flat_map(|s| s.preds.iter());
                root.count(var, scope)
                    .plus(VarUsage::sum(var, preds, scope).times(None))
            }
            Expr::Flwor(f) => f.count(var, scope),
            other => VarUsage::sum(var, other.children().into_iter(), scope),
        }
    }

    /// Whether every reference to `var` could be replaced by the context item,
    /// i.e. none of them sits below a focus-changing predicate.
    pub fn removable(&self, var: VarId) -> bool {
        match self {
            Expr::Filter { base, preds } => {
                base.removable(var) && !preds.iter().any(|p| p.uses(var))
            }
            Expr::Path { root, steps } => {
                root.removable(var)
                    && !steps.iter().flat_map(|s| s.preds.iter()).any(|p| p.uses(var))
            }
            Expr::Flwor(f) => f.removable(var),
            other => other.children().into_iter().all(|c| c.removable(var)),
        }
    }

    /// Replaces every reference to `var` by a fresh copy of `with`.
    pub fn inline_var(&mut self, var: VarId, with: &Expr, scope: &mut VarScope) -> bool {
        match self {
            Expr::VarRef(v) if *v == var => {
                *self = with.copy(scope);
                true
            }
            Expr::Flwor(f) => f.inline_var(var, with, scope),
            other => {
                let mut changed = false;
                for c in other.children_mut() {
                    changed |= c.inline_var(var, with, scope);
                }
                changed
            }
        }
    }

    /// Deep copy; variables declared inside get fresh ids.
    pub fn copy(&self, scope: &mut VarScope) -> Expr {
        self.copy_with(scope, &mut HashMap::new())
    }

    pub fn copy_with(&self, scope: &mut VarScope, map: &mut HashMap<VarId, VarId>) -> Expr {
        match self {
            Expr::VarRef(v) => Expr::VarRef(map.get(v).copied().unwrap_or(*v)),
            Expr::Flwor(f) => Expr::Flwor(Box::new(f.copy_with(scope, map))),
            other => {
                let mut out = other.clone();
                for c in out.children_mut() {
                    *c = c.copy_with(scope, map);
                }
                out
            }
        }
    }

    /// Statically known number of result items.
    pub fn size(&self, scope: &VarScope) -> Option<u64> {
        match self {
            Expr::Value(v) => Some(v.len() as u64),
            Expr::ContextItem
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Cmp { .. }
            | Expr::Element { .. } => Some(1),
            Expr::Range(a, b) => match (a.as_int(), b.as_int()) {
                (Some(a), Some(b)) if b >= a => b.abs_diff(a).checked_add(1),
                (Some(_), Some(_)) => Some(0),
                _ => None,
            },
            Expr::Seq(es) => es
                .iter()
                .try_fold(0u64, |acc, e| e.size(scope).and_then(|n| acc.checked_add(n))),
            Expr::If { then, els, .. } => match (then.size(scope), els.size(scope)) {
                (Some(a), Some(b)) if a == b => Some(a),
                _ => None,
            },
            Expr::TypeCheck { expr, .. } => expr.size(scope),
            Expr::Flwor(f) => f.size(scope),
            Expr::Raise { .. } => None,
            other => other.seq_type(scope).exact_size(),
        }
    }

    pub fn seq_type(&self, scope: &VarScope) -> SeqType {
        match self {
            Expr::Value(v) => SeqType::of_value(v),
            Expr::VarRef(id) => scope.get(*id).seq_type(),
            Expr::ContextItem => SeqType::ITEM,
            Expr::Range(..) => {
                let occ = match self.size(scope) {
                    Some(n) => Occ::from_bounds(n, Some(n)),
                    None => Occ::ZeroOrMore,
                };
                SeqType::new(ItemType::Integer, occ)
            }
            Expr::Seq(es) => {
                let mut bounds = SizeBounds::EMPTY;
                let mut item: Option<ItemType> = None;
                for e in es {
                    let st = e.seq_type(scope);
                    if !st.zero() {
                        item = Some(item.map_or(st.item, |i| i.union(st.item)));
                    }
                    bounds = bounds.plus(e.bounds(scope));
                }
                SeqType::new(item.unwrap_or(ItemType::Item), bounds.occ())
            }
            Expr::And(_) | Expr::Or(_) | Expr::Cmp { .. } => SeqType::BOOLEAN,
            Expr::Arith { op, left, right } => {
                let (l, r) = (left.seq_type(scope), right.seq_type(scope));
                let item = match (l.item, r.item) {
                    (ItemType::Integer, ItemType::Integer) if *op != ArithOp::Div => {
                        ItemType::Integer
                    }
                    (ItemType::Double, ItemType::Integer | ItemType::Double)
                    | (ItemType::Integer, ItemType::Double) => ItemType::Double,
                    _ => ItemType::Item,
                };
                let occ = if l.zero() || r.zero() {
                    Occ::Zero
                } else if l.one() && r.one() {
                    Occ::One
                } else {
                    Occ::ZeroOrOne
                };
                SeqType::new(item, occ)
            }
            Expr::If { then, els, .. } => then.seq_type(scope).union(&els.seq_type(scope)),
            Expr::Call { func, .. } => func.seq_type(),
            Expr::Element { .. } => SeqType::new(ItemType::Node, Occ::One),
            Expr::Filter { base, .. } => {
                let st = base.seq_type(scope);
                st.with_occ(Occ::from_bounds(0, st.occ.max()))
            }
            Expr::Path { root, .. } => {
                if root.seq_type(scope).zero() {
                    SeqType::EMPTY
                } else {
                    SeqType::new(ItemType::Node, Occ::ZeroOrMore)
                }
            }
            Expr::TypeCheck { expr, ty } => {
                let st = expr.seq_type(scope);
                if st.is_sub_type_of(ty) {
                    st
                } else {
                    *ty
                }
            }
            Expr::Flwor(f) => f.seq_type(scope),
            Expr::Raise { ty, .. } => *ty,
        }
    }

    /// Cardinality interval: exact when the size is known, else the
    /// occurrence indicator of the static type.
    pub fn bounds(&self, scope: &VarScope) -> SizeBounds {
        match self.size(scope) {
            Some(n) => SizeBounds::exact(n),
            None => SizeBounds::of_occ(self.seq_type(scope).occ),
        }
    }

    /// Number of nodes in this tree.
    pub fn expr_size(&self) -> usize {
        match self {
            Expr::Flwor(f) => f.expr_size(),
            other => 1 + other.children().into_iter().map(Expr::expr_size).sum::<usize>(),
        }
    }

    /// Root is a variable or value and every step is a predicate-free
    /// child or self step.
    pub fn is_cheap_path(&self) -> bool {
        match self {
            Expr::Path { root, steps } => {
                matches!(**root, Expr::VarRef(_) | Expr::Value(_))
                    && steps
                        .iter()
                        .all(|s| s.axis != Axis::Descendant && s.preds.is_empty())
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(names: &[&str]) -> (VarScope, Vec<VarId>) {
        let mut scope = VarScope::new();
        let ids = names.iter().map(|n| scope.declare(*n)).collect();
        (scope, ids)
    }

    #[test]
    fn predicates_hide_context_dependence() {
        let filter = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([1, 2]))),
            preds: vec![Expr::cmp(CmpOp::Gt, Expr::ContextItem, Expr::int(1))],
        };
        assert!(!filter.has(Flag::Ctx));
        assert!(Expr::ContextItem.has(Flag::Ctx));
        let elem = Expr::Element {
            name: "a".into(),
            content: Box::new(Expr::empty()),
        };
        assert!(elem.has(Flag::Cns));
    }

    #[test]
    fn usage_inside_predicates_counts_as_many() {
        let (scope, ids) = scope_with(&["x"]);
        let x = ids[0];
        let filter = Expr::Filter {
            base: Box::new(Expr::Value(Value::ints([1, 2]))),
            preds: vec![Expr::cmp(CmpOp::Eq, Expr::ContextItem, Expr::var(x))],
        };
        assert_eq!(filter.count(x, &scope), VarUsage::Many);
        assert!(!filter.removable(x));
        let branches = Expr::iff(Expr::bool(true), Expr::var(x), Expr::var(x));
        assert_eq!(branches.count(x, &scope), VarUsage::Once);
    }

    #[test]
    fn range_size_is_static() {
        let scope = VarScope::new();
        assert_eq!(Expr::range(Expr::int(1), Expr::int(4)).size(&scope), Some(4));
        assert_eq!(Expr::range(Expr::int(4), Expr::int(1)).size(&scope), Some(0));
        let seq = Expr::Seq(vec![Expr::int(1), Expr::range(Expr::int(1), Expr::int(3))]);
        assert_eq!(seq.size(&scope), Some(4));
        assert_eq!(seq.seq_type(&scope).item, ItemType::Integer);
    }

    #[test]
    fn full_integer_range_has_no_static_size() {
        let scope = VarScope::new();
        let whole = Expr::range(Expr::int(i64::MIN), Expr::int(i64::MAX));
        assert_eq!(whole.size(&scope), None);
        assert_eq!(whole.bounds(&scope).max, None);
        let upper = Expr::range(Expr::int(0), Expr::int(i64::MAX));
        assert_eq!(upper.size(&scope), Some(1 << 63));
    }

    #[test]
    fn inline_replaces_every_reference() {
        let (mut scope, ids) = scope_with(&["x", "y"]);
        let mut e = Expr::arith(ArithOp::Add, Expr::var(ids[0]), Expr::var(ids[0]));
        assert!(e.inline_var(ids[0], &Expr::int(5), &mut scope));
        assert!(!e.uses(ids[0]));
        assert!(!e.inline_var(ids[1], &Expr::int(1), &mut scope));
    }

    #[test]
    fn cheap_paths() {
        let (_, ids) = scope_with(&["d"]);
        let mut path = Expr::Path {
            root: Box::new(Expr::var(ids[0])),
            steps: vec![Step::new(Axis::Child, Some("a"))],
        };
        assert!(path.is_cheap_path());
        if let Expr::Path { steps, .. } = &mut path {
            steps[0].preds.push(Expr::int(1));
        }
        assert!(!path.is_cheap_path());
    }
}
