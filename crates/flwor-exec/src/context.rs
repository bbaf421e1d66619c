//! Dynamic context of one execution: variable bindings, focus, counters,
//! pending updates and the stop check.
//!
//! Every execution owns a fresh context. Bindings are indexed by `VarId`;
//! a binding is overwritten in place by the clause that declares it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use flwor_core::error::{Error, Result};
use flwor_core::id::{NodeId, VarId};
use flwor_core::seqtype::SeqType;
use flwor_core::types::{Item, Node, Value};
use flwor_core::var::VarScope;

/// Shared flag that aborts a running execution at its next pull.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cancellation flag plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct StopCheck {
    cancel: CancelHandle,
    deadline: Option<Instant>,
}

impl StopCheck {
    pub fn new(cancel: CancelHandle, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted("cancelled".into()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Interrupted("deadline exceeded".into()));
            }
        }
        Ok(())
    }
}

/// Focus of a predicate: context item, its position and the size of the
/// filtered sequence.
#[derive(Debug, Clone)]
pub struct Focus {
    pub item: Item,
    pub pos: usize,
    pub last: usize,
}

/// An update recorded by `put($name, $value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub name: String,
    pub value: Value,
}

#[derive(Debug)]
pub struct QueryContext {
    bindings: Vec<Option<Value>>,
    /// Declared types of variables bound with a runtime type check.
    checks: Vec<Option<SeqType>>,
    names: Vec<String>,
    focus: Vec<Focus>,
    counters: HashMap<String, i64>,
    updates: Vec<PendingUpdate>,
    next_node: u32,
    stop: StopCheck,
}

impl QueryContext {
    pub fn new(scope: &VarScope) -> Self {
        Self {
            bindings: vec![None; scope.len()],
            checks: scope
                .iter()
                .map(|v| v.checks_type().then_some(v.declared))
                .collect(),
            names: scope.iter().map(|v| v.name.clone()).collect(),
            focus: Vec::new(),
            counters: HashMap::new(),
            updates: Vec::new(),
            next_node: 0,
            stop: StopCheck::default(),
        }
    }

    pub fn with_stop(mut self, stop: StopCheck) -> Self {
        self.stop = stop;
        self
    }

    pub fn check_stop(&self) -> Result<()> {
        self.stop.check()
    }

    // ---- bindings ----

    pub fn bind(&mut self, var: VarId, value: Value) {
        let idx = var.index();
        if idx >= self.bindings.len() {
            self.bindings.resize(idx + 1, None);
        }
        self.bindings[idx] = Some(value);
    }

    /// Restores a binding captured with `binding`.
    pub fn set(&mut self, var: VarId, value: Option<Value>) {
        match value {
            Some(v) => self.bind(var, v),
            None => {
                if let Some(slot) = self.bindings.get_mut(var.index()) {
                    *slot = None;
                }
            }
        }
    }

    pub fn binding(&self, var: VarId) -> Option<&Value> {
        self.bindings.get(var.index()).and_then(Option::as_ref)
    }

    pub fn lookup(&self, var: VarId) -> Result<Value> {
        self.binding(var).cloned().ok_or_else(|| {
            Error::dynamic(
                "XPDY0002",
                format!("variable ${} is not bound", self.var_name(var)),
            )
        })
    }

    fn var_name(&self, var: VarId) -> String {
        self.names
            .get(var.index())
            .cloned()
            .unwrap_or_else(|| var.to_string())
    }

    /// Type check a value about to be bound to `var`, if `var` carries one.
    pub fn check(&self, var: VarId, value: &Value) -> Result<()> {
        match self.checks.get(var.index()).copied().flatten() {
            Some(ty) => ty.check(value).map_err(|_| {
                Error::dynamic(
                    "XPTY0004",
                    format!(
                        "${} as {}: {} does not match",
                        self.var_name(var),
                        ty,
                        value
                    ),
                )
            }),
            None => Ok(()),
        }
    }

    // ---- focus ----

    pub fn push_focus(&mut self, focus: Focus) {
        self.focus.push(focus);
    }

    pub fn pop_focus(&mut self) {
        self.focus.pop();
    }

    pub fn focus(&self) -> Result<&Focus> {
        self.focus
            .last()
            .ok_or_else(|| Error::dynamic("XPDY0002", "context item is undefined"))
    }

    // ---- side channels ----

    /// Increments counter `name` and returns its new value.
    pub fn counter(&mut self, name: &str) -> i64 {
        let c = self.counters.entry(name.to_string()).or_insert(0);
        *c += 1;
        *c
    }

    pub fn record_update(&mut self, name: String, value: Value) {
        self.updates.push(PendingUpdate { name, value });
    }

    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    pub fn take_updates(&mut self) -> Vec<PendingUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Fresh identity for a constructed node.
    pub fn fresh_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    /// Deep copy of `node` with fresh identities, as element constructors
    /// copy their node content.
    pub fn copy_node(&mut self, node: &Node) -> Node {
        let id = self.fresh_node_id();
        let children = node.children.iter().map(|c| self.copy_node(c)).collect();
        Node {
            id,
            name: node.name.clone(),
            text: node.text.clone(),
            children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_variable_is_a_dynamic_error() {
        let mut scope = VarScope::new();
        let x = scope.declare("x");
        let mut qc = QueryContext::new(&scope);
        let err = qc.lookup(x).unwrap_err();
        assert_eq!(err.code(), Some("XPDY0002"));
        assert!(err.to_string().contains("$x"));
        qc.bind(x, Value::int(1));
        assert_eq!(qc.lookup(x).unwrap(), Value::int(1));
    }

    #[test]
    fn declared_types_are_checked() {
        let mut scope = VarScope::new();
        let x = scope.declare_typed("x", SeqType::INTEGER, true);
        let qc = QueryContext::new(&scope);
        assert!(qc.check(x, &Value::int(3)).is_ok());
        let err = qc.check(x, &Value::ints([1, 2])).unwrap_err();
        assert_eq!(err.code(), Some("XPTY0004"));
    }

    #[test]
    fn counters_are_per_name() {
        let qc_scope = VarScope::new();
        let mut qc = QueryContext::new(&qc_scope);
        assert_eq!(qc.counter("a"), 1);
        assert_eq!(qc.counter("a"), 2);
        assert_eq!(qc.counter("b"), 1);
    }

    #[test]
    fn cancellation_stops() {
        let cancel = CancelHandle::new();
        let stop = StopCheck::new(cancel.clone(), None);
        assert!(stop.check().is_ok());
        cancel.cancel();
        assert!(matches!(stop.check(), Err(Error::Interrupted(_))));

        let expired = StopCheck::new(CancelHandle::new(), Some(Duration::ZERO));
        assert!(matches!(expired.check(), Err(Error::Interrupted(_))));
    }
}
