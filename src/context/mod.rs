//! Context propagated across one dispatch call tree.
//!
//! A [`ConquerorContext`] is a cheaply cloneable handle to a guarded map of
//! string key/value pairs. Every clone refers to the same data, so values set
//! by an early middleware are visible to later middleware, to the handler and
//! to nested dispatches that reuse the context.
//!
//! Data is kept in three directions:
//!
//! - **downstream**: flows from caller to callee (client to server)
//! - **upstream**: flows from callee back to caller
//! - **bidirectional**: flows both ways
//!
//! Each entry is scoped either to the current process or across transports;
//! only [`DataScope::AcrossTransports`] entries are written onto the wire (see
//! [`ConquerorContext::encode_downstream`]).
//!
//! Concurrent sub-operations of one call tree share the guarded map. Callers
//! that need isolation branch explicitly with [`ConquerorContext::fork`] or
//! [`ConquerorContext::scope`].
//!
//! # Example
//!
//! ```
//! use conqueror::ConquerorContext;
//!
//! let ctx = ConquerorContext::new();
//! ctx.set("tenant", "acme");
//!
//! let shared = ctx.clone();
//! assert_eq!(shared.get("tenant").as_deref(), Some("acme"));
//!
//! let isolated = ctx.fork();
//! isolated.set("tenant", "other");
//! assert_eq!(ctx.get("tenant").as_deref(), Some("acme"));
//! ```

mod format;
mod principal;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use ulid::Ulid;

pub use format::{CONTEXT_HEADER, TRACE_PARENT_HEADER};
pub use principal::Principal;

/// Direction in which a context entry flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Caller to callee.
    Downstream,
    /// Callee to caller.
    Upstream,
    /// Both ways.
    Bidirectional,
}

/// Visibility of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataScope {
    /// Visible only inside the current process.
    InProcess,
    /// Also propagated across transport boundaries.
    AcrossTransports,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: String,
    scope: DataScope,
}

type DataMap = BTreeMap<String, Entry>;

#[derive(Debug, Default)]
struct ContextState {
    trace_id: String,
    principal: Option<Principal>,
    downstream: DataMap,
    upstream: DataMap,
    bidirectional: DataMap,
}

impl ContextState {
    fn map(&self, direction: Direction) -> &DataMap {
        match direction {
            Direction::Downstream => &self.downstream,
            Direction::Upstream => &self.upstream,
            Direction::Bidirectional => &self.bidirectional,
        }
    }

    fn map_mut(&mut self, direction: Direction) -> &mut DataMap {
        match direction {
            Direction::Downstream => &mut self.downstream,
            Direction::Upstream => &mut self.upstream,
            Direction::Bidirectional => &mut self.bidirectional,
        }
    }
}

/// Shared key/value context for one dispatch call tree.
#[derive(Clone, Default)]
pub struct ConquerorContext {
    inner: Arc<RwLock<ContextState>>,
}

impl ConquerorContext {
    /// Create an empty context with a fresh trace ID.
    pub fn new() -> Self {
        Self::with_trace_id(generate_trace_id())
    }

    /// Create an empty context with the given trace ID.
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                trace_id: trace_id.into(),
                ..ContextState::default()
            })),
        }
    }

    /// Trace ID shared by every operation in this call tree.
    pub fn trace_id(&self) -> String {
        self.inner.read().trace_id.clone()
    }

    /// Replace the trace ID (e.g. with one received from a remote caller).
    pub fn set_trace_id(&self, trace_id: impl Into<String>) {
        self.inner.write().trace_id = trace_id.into();
    }

    /// Caller executing the current call tree, if one was established.
    pub fn principal(&self) -> Option<Principal> {
        self.inner.read().principal.clone()
    }

    /// Attach the caller. Forked contexts inherit it.
    pub fn set_principal(&self, principal: Principal) {
        self.inner.write().principal = Some(principal);
    }

    /// Detach the caller, returning it if one was set.
    pub fn clear_principal(&self) -> Option<Principal> {
        self.inner.write().principal.take()
    }

    /// Set a bidirectional value that propagates across transports.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.bidirectional()
            .set_with_scope(key, value, DataScope::AcrossTransports);
    }

    /// Get a bidirectional value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.bidirectional().get(key)
    }

    /// Remove a bidirectional value, returning it if present.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.bidirectional().remove(key)
    }

    /// Downstream data view.
    pub fn downstream(&self) -> ContextData<'_> {
        self.data(Direction::Downstream)
    }

    /// Upstream data view.
    pub fn upstream(&self) -> ContextData<'_> {
        self.data(Direction::Upstream)
    }

    /// Bidirectional data view.
    pub fn bidirectional(&self) -> ContextData<'_> {
        self.data(Direction::Bidirectional)
    }

    /// Data view for the given direction.
    pub fn data(&self, direction: Direction) -> ContextData<'_> {
        ContextData {
            context: self,
            direction,
        }
    }

    /// Whether both handles refer to the same underlying context.
    #[inline]
    pub fn same_as(&self, other: &ConquerorContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create an isolated child context.
    ///
    /// The child starts with a copy of the trace ID, the downstream data and
    /// the bidirectional data. Changes in either context are not visible in
    /// the other.
    pub fn fork(&self) -> ConquerorContext {
        let state = self.inner.read();
        ConquerorContext {
            inner: Arc::new(RwLock::new(ContextState {
                trace_id: state.trace_id.clone(),
                principal: state.principal.clone(),
                downstream: state.downstream.clone(),
                upstream: DataMap::new(),
                bidirectional: state.bidirectional.clone(),
            })),
        }
    }

    /// Fork a child context that merges back into this one when dropped.
    ///
    /// On drop, the child's upstream data is copied into this context and
    /// this context's bidirectional data is replaced by the child's, so
    /// removals in the child propagate as well.
    pub fn scope(&self) -> ContextScope {
        ContextScope {
            parent: self.clone(),
            child: self.fork(),
        }
    }

    fn merge_from_child(&self, child: &ConquerorContext) {
        if self.same_as(child) {
            return;
        }
        let child_state = child.inner.read();
        let mut state = self.inner.write();
        for (key, entry) in &child_state.upstream {
            state.upstream.insert(key.clone(), entry.clone());
        }
        state.bidirectional = child_state.bidirectional.clone();
    }
}

impl fmt::Debug for ConquerorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("ConquerorContext")
            .field("trace_id", &state.trace_id)
            .field("principal", &state.principal.as_ref().map(Principal::name))
            .field("downstream", &state.downstream.len())
            .field("upstream", &state.upstream.len())
            .field("bidirectional", &state.bidirectional.len())
            .finish()
    }
}

/// View on one direction of a [`ConquerorContext`].
pub struct ContextData<'a> {
    context: &'a ConquerorContext,
    direction: Direction,
}

impl ContextData<'_> {
    /// Set a value that propagates across transports.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.set_with_scope(key, value, DataScope::AcrossTransports);
    }

    /// Set a value with an explicit scope.
    pub fn set_with_scope(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        scope: DataScope,
    ) {
        let mut state = self.context.inner.write();
        state.map_mut(self.direction).insert(
            key.into(),
            Entry {
                value: value.into(),
                scope,
            },
        );
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.context.inner.read();
        state
            .map(self.direction)
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Get a value together with its scope.
    pub fn get_with_scope(&self, key: &str) -> Option<(String, DataScope)> {
        let state = self.context.inner.read();
        state
            .map(self.direction)
            .get(key)
            .map(|entry| (entry.value.clone(), entry.scope))
    }

    /// Remove a value, returning it if present.
    pub fn remove(&self, key: &str) -> Option<String> {
        let mut state = self.context.inner.write();
        state
            .map_mut(self.direction)
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Remove every value in this direction.
    pub fn clear(&self) {
        self.context.inner.write().map_mut(self.direction).clear();
    }

    /// Snapshot of all entries, ordered by key.
    pub fn entries(&self) -> Vec<(String, String, DataScope)> {
        let state = self.context.inner.read();
        state
            .map(self.direction)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.scope))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.context.inner.read().map(self.direction).len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard around a forked child context.
///
/// Dereferences to the child. When dropped, the child's upstream and
/// bidirectional data flow back into the parent.
pub struct ContextScope {
    parent: ConquerorContext,
    child: ConquerorContext,
}

impl ContextScope {
    /// The child context held by this scope.
    pub fn context(&self) -> &ConquerorContext {
        &self.child
    }
}

impl Deref for ContextScope {
    type Target = ConquerorContext;

    fn deref(&self) -> &Self::Target {
        &self.child
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.parent.merge_from_child(&self.child);
    }
}

/// Generate a 32-character lowercase hex trace ID.
pub fn generate_trace_id() -> String {
    format!("{:032x}", u128::from(Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_has_trace_id() {
        let ctx = ConquerorContext::new();
        let trace_id = ctx.trace_id();
        assert_eq!(trace_id.len(), 32);
        assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(trace_id, ConquerorContext::new().trace_id());
    }

    #[test]
    fn test_clones_share_data() {
        let ctx = ConquerorContext::new();
        let clone = ctx.clone();

        clone.set("key", "value");
        assert_eq!(ctx.get("key").as_deref(), Some("value"));
        assert!(ctx.same_as(&clone));

        assert_eq!(ctx.remove("key").as_deref(), Some("value"));
        assert!(clone.get("key").is_none());
    }

    #[test]
    fn test_directions_are_separate() {
        let ctx = ConquerorContext::new();
        ctx.downstream().set("k", "down");
        ctx.upstream().set("k", "up");
        ctx.set("k", "both");

        assert_eq!(ctx.downstream().get("k").as_deref(), Some("down"));
        assert_eq!(ctx.upstream().get("k").as_deref(), Some("up"));
        assert_eq!(ctx.get("k").as_deref(), Some("both"));
        assert_eq!(ctx.bidirectional().len(), 1);
    }

    #[test]
    fn test_scope_is_recorded() {
        let ctx = ConquerorContext::new();
        ctx.downstream()
            .set_with_scope("local", "1", DataScope::InProcess);

        assert_eq!(
            ctx.downstream().get_with_scope("local"),
            Some(("1".to_string(), DataScope::InProcess))
        );
    }

    #[test]
    fn test_fork_is_isolated() {
        let ctx = ConquerorContext::new();
        ctx.set("shared", "1");
        ctx.downstream().set("down", "2");
        ctx.upstream().set("up", "3");

        let child = ctx.fork();
        assert!(!child.same_as(&ctx));
        assert_eq!(child.trace_id(), ctx.trace_id());
        assert_eq!(child.get("shared").as_deref(), Some("1"));
        assert_eq!(child.downstream().get("down").as_deref(), Some("2"));
        assert!(child.upstream().is_empty());

        child.set("shared", "changed");
        assert_eq!(ctx.get("shared").as_deref(), Some("1"));
    }

    #[test]
    fn test_principal_is_inherited_but_not_encoded() {
        let ctx = ConquerorContext::new();
        ctx.set_principal(Principal::new("alice").with_role("admin"));

        let child = ctx.fork();
        assert_eq!(child.principal().map(|p| p.name().to_string()).as_deref(), Some("alice"));
        assert!(child.clear_principal().is_some());
        assert!(ctx.principal().is_some_and(|p| p.has_role("admin")));

        assert_eq!(ctx.encode_downstream(), None);
    }

    #[test]
    fn test_scope_merges_back_on_drop() {
        let ctx = ConquerorContext::new();
        ctx.set("keep", "1");
        ctx.set("drop", "2");

        {
            let scope = ctx.scope();
            scope.upstream().set("result", "ok");
            scope.set("new", "3");
            scope.remove("drop");
            scope.downstream().set("ignored", "x");

            assert!(ctx.upstream().get("result").is_none());
        }

        assert_eq!(ctx.upstream().get("result").as_deref(), Some("ok"));
        assert_eq!(ctx.get("keep").as_deref(), Some("1"));
        assert_eq!(ctx.get("new").as_deref(), Some("3"));
        assert!(ctx.get("drop").is_none());
        assert!(ctx.downstream().get("ignored").is_none());
    }

    #[test]
    fn test_entries_are_sorted_by_key() {
        let ctx = ConquerorContext::new();
        ctx.set("b", "2");
        ctx.set("a", "1");

        let keys: Vec<String> = ctx
            .bidirectional()
            .entries()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
