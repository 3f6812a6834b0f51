//! Execution state
//!
//! An `ExecutionState` is the per-call view of a scope:
//! - variable bindings (shared with brace children)
//! - the pending result slot (private to each state)
//! - the last boolean status
//! - the module environment names resolve against
//!
//! Every reference held in a binding, the result slot, a bubble or the
//! transient list carries one store claim. States do not release on drop
//! because releasing needs the store; owners call [`ExecutionState::release`]
//! when the scope ends.

use crate::ast::{ObjectRef, Value};
use crate::module_env::ModuleEnvironment;
use crate::store::ObjectStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

fn locked<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Arguments of the macro invocation a command runs under
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroFrame {
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
}

impl MacroFrame {
    pub fn new(args: Vec<Value>, named: BTreeMap<String, Value>) -> Self {
        MacroFrame { args, named }
    }
}

/// Bindings that outlive a single command
#[derive(Default)]
pub struct Scope {
    variables: Mutex<HashMap<String, Value>>,
    /// Claims held for the life of the scope (brace results spliced as markers)
    transient: Mutex<Vec<ObjectRef>>,
    bubbles: Mutex<BTreeMap<String, Vec<Value>>>,
}

pub struct ExecutionState {
    scope: Arc<Scope>,
    result: Mutex<Option<Value>>,
    /// Caller's result when a brace child was created, read by `get_result`
    outer_result: Option<Value>,
    last_status: AtomicBool,
    env: Arc<ModuleEnvironment>,
    owns_scope: bool,
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("result", &*locked(&self.result))
            .field("last_status", &self.last_status())
            .field("owns_scope", &self.owns_scope)
            .finish()
    }
}

impl ExecutionState {
    /// Fresh top-level state over an environment
    pub fn new(env: Arc<ModuleEnvironment>) -> Self {
        ExecutionState {
            scope: Arc::new(Scope::default()),
            result: Mutex::new(None),
            outer_result: None,
            last_status: AtomicBool::new(true),
            env,
            owns_scope: true,
        }
    }

    /// State for a brace sub-expression: same variables, own result slot
    pub fn brace_child(&self) -> Self {
        ExecutionState {
            scope: Arc::clone(&self.scope),
            result: Mutex::new(None),
            outer_result: self.result(),
            last_status: AtomicBool::new(true),
            env: Arc::clone(&self.env),
            owns_scope: false,
        }
    }

    /// State for a macro invocation: new variables and environment
    pub fn macro_child(&self, env: Arc<ModuleEnvironment>) -> Self {
        ExecutionState::new(env)
    }

    pub fn env(&self) -> &Arc<ModuleEnvironment> {
        &self.env
    }

    pub fn shares_scope_with(&self, other: &ExecutionState) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope)
    }

    // === Variables ===

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        locked(&self.scope.variables).get(name).cloned()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        locked(&self.scope.variables).contains_key(name)
    }

    /// Bind a variable, claiming the new value and releasing the old one
    pub fn set_variable(&self, store: &ObjectStore, name: &str, value: Value) {
        store.claim_value(&value);
        let old = locked(&self.scope.variables).insert(name.to_string(), value);
        debug!(target: "tether::variable", "set {}", name);
        if let Some(old) = old {
            store.release_value(&old);
        }
    }

    pub fn remove_variable(&self, store: &ObjectStore, name: &str) -> bool {
        let old = locked(&self.scope.variables).remove(name);
        match old {
            Some(old) => {
                store.release_value(&old);
                debug!(target: "tether::variable", "removed {}", name);
                true
            }
            None => false,
        }
    }

    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = locked(&self.scope.variables).keys().cloned().collect();
        names.sort();
        names
    }

    // === Result slot ===

    pub fn result(&self) -> Option<Value> {
        locked(&self.result).clone()
    }

    /// Result of the command line a brace child was spawned from. The
    /// caller keeps the claim while its command is being substituted.
    pub fn outer_result(&self) -> Option<Value> {
        self.outer_result.clone()
    }

    pub fn has_result(&self) -> bool {
        locked(&self.result).is_some()
    }

    pub fn set_result(&self, store: &ObjectStore, value: Option<Value>) {
        if let Some(v) = &value {
            store.claim_value(v);
        }
        let old = std::mem::replace(&mut *locked(&self.result), value);
        if let Some(old) = old {
            store.release_value(&old);
        }
    }

    /// Move the result out together with its claim
    pub fn take_result(&self) -> Option<Value> {
        locked(&self.result).take()
    }

    /// Install a value whose claim the caller hands over
    pub fn put_result(&self, store: &ObjectStore, value: Option<Value>) {
        let old = std::mem::replace(&mut *locked(&self.result), value);
        if let Some(old) = old {
            store.release_value(&old);
        }
    }

    pub fn clear_result(&self, store: &ObjectStore) {
        self.put_result(store, None);
    }

    // === Status ===

    pub fn last_status(&self) -> bool {
        self.last_status.load(Ordering::SeqCst)
    }

    pub fn set_last_status(&self, status: bool) {
        self.last_status.store(status, Ordering::SeqCst);
    }

    // === Scope-lifetime claims ===

    /// Keep a claimed reference alive until the scope ends
    pub fn hold(&self, r: ObjectRef) {
        locked(&self.scope.transient).push(r);
    }

    pub fn add_bubble(&self, store: &ObjectStore, flavor: &str, value: Value) {
        store.claim_value(&value);
        locked(&self.scope.bubbles)
            .entry(flavor.to_string())
            .or_default()
            .push(value);
    }

    pub fn bubbles(&self, flavor: &str) -> Vec<Value> {
        locked(&self.scope.bubbles)
            .get(flavor)
            .cloned()
            .unwrap_or_default()
    }

    pub fn bubble_flavors(&self) -> Vec<String> {
        locked(&self.scope.bubbles).keys().cloned().collect()
    }

    /// Move every bubble out together with its claim
    pub fn take_bubbles(&self) -> BTreeMap<String, Vec<Value>> {
        std::mem::take(&mut *locked(&self.scope.bubbles))
    }

    /// Adopt bubbles (and their claims) raised in a callee scope
    pub fn absorb_bubbles(&self, bubbles: BTreeMap<String, Vec<Value>>) {
        let mut mine = locked(&self.scope.bubbles);
        for (flavor, values) in bubbles {
            mine.entry(flavor).or_default().extend(values);
        }
    }

    /// Release everything this state owns. Brace children only own their
    /// result slot; the shared scope is released by the state that made it.
    pub fn release(&self, store: &ObjectStore) {
        self.clear_result(store);
        if !self.owns_scope {
            return;
        }
        let variables: Vec<Value> = locked(&self.scope.variables).drain().map(|(_, v)| v).collect();
        let transient: Vec<ObjectRef> = locked(&self.scope.transient).drain(..).collect();
        let bubbles: Vec<Value> = std::mem::take(&mut *locked(&self.scope.bubbles))
            .into_values()
            .flatten()
            .collect();
        for value in variables.iter().chain(bubbles.iter()) {
            store.release_value(value);
        }
        for r in transient {
            store.release(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stored;

    fn state() -> ExecutionState {
        ExecutionState::new(Arc::new(ModuleEnvironment::new()))
    }

    #[test]
    fn test_brace_child_shares_variables_not_result() {
        let store = ObjectStore::new();
        let parent = state();
        let child = parent.brace_child();
        child.set_variable(&store, "x", Value::Int(1));
        child.set_result(&store, Some(Value::Int(9)));
        assert_eq!(parent.get_variable("x"), Some(Value::Int(1)));
        assert_eq!(parent.result(), None);
        assert!(parent.shares_scope_with(&child));
    }

    #[test]
    fn test_brace_child_sees_outer_result() {
        let store = ObjectStore::new();
        let parent = state();
        parent.set_result(&store, Some(Value::Int(4)));
        let child = parent.brace_child();
        assert_eq!(child.result(), None);
        assert_eq!(child.outer_result(), Some(Value::Int(4)));
    }

    #[test]
    fn test_macro_child_isolated() {
        let parent = state();
        let child = parent.macro_child(Arc::new(ModuleEnvironment::new()));
        assert!(!parent.shares_scope_with(&child));
    }

    #[test]
    fn test_variable_claims_and_releases() {
        let store = ObjectStore::new();
        let s = state();
        let r = store.store(Stored::Str("v".into()));
        s.set_variable(&store, "a", Value::Ref(r));
        assert_eq!(store.refcount(r), Some(1));
        s.set_variable(&store, "a", Value::Int(2));
        assert!(store.get(r).is_none());
    }

    #[test]
    fn test_take_result_moves_claim() {
        let store = ObjectStore::new();
        let s = state();
        let r = store.store(Stored::Str("v".into()));
        s.set_result(&store, Some(Value::Ref(r)));
        let taken = s.take_result();
        assert_eq!(taken, Some(Value::Ref(r)));
        assert_eq!(store.refcount(r), Some(1));
        s.release(&store);
        assert_eq!(store.refcount(r), Some(1));
    }

    #[test]
    fn test_release_scope() {
        let store = ObjectStore::new();
        let s = state();
        let a = store.store(Stored::Str("a".into()));
        let b = store.store(Stored::Str("b".into()));
        s.set_variable(&store, "a", Value::Ref(a));
        store.claim(b);
        s.hold(b);
        s.add_bubble(&store, "f", Value::Int(1));
        s.release(&store);
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_none());
        assert!(s.bubbles("f").is_empty());
    }

    #[test]
    fn test_bubbles_move_to_caller() {
        let store = ObjectStore::new();
        let caller = state();
        let callee = caller.macro_child(Arc::new(ModuleEnvironment::new()));
        callee.add_bubble(&store, "warn", Value::quoted("a"));
        caller.add_bubble(&store, "warn", Value::quoted("b"));
        caller.absorb_bubbles(callee.take_bubbles());
        assert_eq!(caller.bubbles("warn"), vec![Value::quoted("b"), Value::quoted("a")]);
        assert!(callee.bubble_flavors().is_empty());
    }
}
