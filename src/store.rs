//! Reference-counted object store
//!
//! Every by-reference value (lists, macros, tokens, commands, large strings
//! and blocks, collaborator-owned channel/fiber payloads) lives here under an
//! integer id. Entries start unclaimed; whoever binds the reference into a
//! durable place claims it. When a claimed entry drops back to zero it is
//! evicted and the references it directly nests are released in turn.

use crate::ast::{format_float, ObjectKind, ObjectRef, Value};
use crate::executor::Handler;
use crate::list::StoredList;
use crate::module_env::Macro;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Nesting depth past which display stops descending into lists
const MAX_DISPLAY_DEPTH: usize = 32;

/// A heap value held by the store
#[derive(Clone)]
pub enum Stored {
    List(StoredList),
    Str(String),
    Block(String),
    Macro(Arc<Macro>),
    Command(Handler),
    /// Id of an entry in the executor's token table
    Token(String),
    /// Channel and fiber payloads, owned by their subsystems
    Opaque {
        kind: ObjectKind,
        payload: Arc<dyn Any + Send + Sync>,
    },
}

impl Stored {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Stored::List(_) => ObjectKind::List,
            Stored::Str(_) => ObjectKind::Str,
            Stored::Block(_) => ObjectKind::Block,
            Stored::Macro(_) => ObjectKind::Macro,
            Stored::Command(_) => ObjectKind::Command,
            Stored::Token(_) => ObjectKind::Token,
            Stored::Opaque { kind, .. } => *kind,
        }
    }
}

impl fmt::Debug for Stored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stored::List(list) => f.debug_tuple("List").field(list).finish(),
            Stored::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Stored::Block(s) => f.debug_tuple("Block").field(s).finish(),
            Stored::Macro(m) => f.debug_tuple("Macro").field(&m.body).finish(),
            Stored::Command(_) => f.write_str("Command(..)"),
            Stored::Token(id) => f.debug_tuple("Token").field(id).finish(),
            Stored::Opaque { kind, .. } => write!(f, "Opaque({})", kind.name()),
        }
    }
}

struct Entry {
    value: Stored,
    refcount: usize,
}

struct StoreInner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

/// Reference-counted table from id to heap value
pub struct ObjectStore {
    inner: Mutex<StoreInner>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        ObjectStore {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a value unclaimed. Ids are never reused, so a stale reference
    /// can only miss, never alias a newer object.
    pub fn store(&self, value: Stored) -> ObjectRef {
        let kind = value.kind();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Entry { value, refcount: 0 });
        debug!(target: "tether::memory", "stored object {} ({}, refcount 0)", id, kind.name());
        ObjectRef::new(kind, id)
    }

    /// Store a list, claiming the references it nests
    pub fn store_list(&self, list: StoredList) -> ObjectRef {
        for nested in list.nested_refs() {
            self.claim(nested);
        }
        self.store(Stored::List(list))
    }

    pub fn get(&self, r: ObjectRef) -> Option<Stored> {
        self.lock().entries.get(&r.id).map(|e| e.value.clone())
    }

    pub fn get_list(&self, r: ObjectRef) -> Option<StoredList> {
        match self.get(r)? {
            Stored::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn contains(&self, r: ObjectRef) -> bool {
        self.lock().entries.contains_key(&r.id)
    }

    pub fn refcount(&self, r: ObjectRef) -> Option<usize> {
        self.lock().entries.get(&r.id).map(|e| e.refcount)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Increment the reference count. Returns false for unknown ids.
    pub fn claim(&self, r: ObjectRef) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(&r.id) {
            Some(entry) => {
                entry.refcount += 1;
                debug!(target: "tether::memory", "object {} refcount -> {}", r.id, entry.refcount);
                true
            }
            None => {
                warn!(target: "tether::memory", "claim of unknown object {}", r.id);
                false
            }
        }
    }

    /// Decrement the reference count, evicting at zero and releasing the
    /// directly nested references afterwards (outside the lock)
    pub fn release(&self, r: ObjectRef) {
        let evicted = {
            let mut inner = self.lock();
            let Some(entry) = inner.entries.get_mut(&r.id) else {
                warn!(target: "tether::memory", "release of unknown object {}", r.id);
                return;
            };
            if entry.refcount == 0 {
                warn!(target: "tether::memory", "release of unclaimed object {}", r.id);
                return;
            }
            entry.refcount -= 1;
            debug!(target: "tether::memory", "object {} refcount -> {}", r.id, entry.refcount);
            if entry.refcount > 0 {
                return;
            }
            inner.entries.remove(&r.id)
        };

        if let Some(entry) = evicted {
            debug!(target: "tether::memory", "evicted object {} ({})", r.id, r.kind.name());
            if let Stored::List(list) = entry.value {
                for nested in list.nested_refs() {
                    self.release(nested);
                }
            }
        }
    }

    pub fn claim_value(&self, value: &Value) {
        if let Value::Ref(r) = value {
            self.claim(*r);
        }
    }

    pub fn release_value(&self, value: &Value) {
        if let Value::Ref(r) = value {
            self.release(*r);
        }
    }

    /// Human-readable rendering, resolving references
    pub fn display(&self, value: &Value) -> String {
        self.display_depth(value, 0, false)
    }

    fn display_depth(&self, value: &Value, depth: usize, nested: bool) -> String {
        match value {
            Value::Quoted(s) if nested => format!("\"{}\"", escape_quoted(s)),
            Value::Block(s) => format!("({})", s),
            Value::Ref(r) => match self.get(*r) {
                Some(Stored::List(list)) => {
                    if depth >= MAX_DISPLAY_DEPTH {
                        return "(...)".to_string();
                    }
                    let mut parts: Vec<String> = list
                        .items()
                        .iter()
                        .map(|v| self.display_depth(v, depth + 1, true))
                        .collect();
                    parts.extend(list.named().iter().map(|(k, v)| {
                        format!("{}: {}", k, self.display_depth(v, depth + 1, true))
                    }));
                    format!("({})", parts.join(", "))
                }
                Some(Stored::Str(s)) if nested => format!("\"{}\"", escape_quoted(&s)),
                Some(Stored::Str(s)) => s,
                Some(Stored::Block(s)) => format!("({})", s),
                Some(Stored::Token(id)) => format!("<token {}>", id),
                Some(_) => r.to_string(),
                None => format!("<stale {} {}>", r.kind.name(), r.id),
            },
            other => other.as_text(),
        }
    }

    /// Text that re-parses to the same typed value
    pub fn format_for_reparse(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Quoted(s) => format!("\"{}\"", escape_quoted(s)),
            Value::Block(s) => format!("({})", s),
            Value::Ref(r) => r.to_marker(),
            Value::Float(n) => format_float(*n),
            other => other.as_text(),
        }
    }

    /// JSON view of a value; opaque handles become their display text
    pub fn to_json(&self, value: &Value) -> JsonValue {
        match value {
            Value::Nil => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(n) => JsonValue::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Symbol(s) | Value::Quoted(s) | Value::Block(s) => JsonValue::String(s.clone()),
            Value::Ref(r) => match self.get(*r) {
                Some(Stored::List(list)) if list.named().is_empty() => {
                    JsonValue::Array(list.items().iter().map(|v| self.to_json(v)).collect())
                }
                Some(Stored::List(list)) => {
                    let mut map = serde_json::Map::new();
                    for (i, v) in list.items().iter().enumerate() {
                        map.insert(i.to_string(), self.to_json(v));
                    }
                    for (k, v) in list.named() {
                        map.insert(k.clone(), self.to_json(v));
                    }
                    JsonValue::Object(map)
                }
                Some(Stored::Str(s)) | Some(Stored::Block(s)) => JsonValue::String(s),
                _ => JsonValue::String(r.to_string()),
            },
        }
    }
}

/// Escape backslashes and double quotes for embedding in a quoted string
pub fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_unclaimed() {
        let store = ObjectStore::new();
        let r = store.store(Stored::Str("hello".into()));
        assert_eq!(store.refcount(r), Some(0));
        assert!(store.get(r).is_some());
    }

    #[test]
    fn test_release_to_zero_evicts() {
        let store = ObjectStore::new();
        let r = store.store(Stored::Str("x".into()));
        store.claim(r);
        store.claim(r);
        store.release(r);
        assert_eq!(store.refcount(r), Some(1));
        store.release(r);
        assert!(store.get(r).is_none());
        // Releasing again is a logged no-op, never negative
        store.release(r);
        assert_eq!(store.refcount(r), None);
    }

    #[test]
    fn test_release_unclaimed_is_noop() {
        let store = ObjectStore::new();
        let r = store.store(Stored::Str("x".into()));
        store.release(r);
        assert_eq!(store.refcount(r), Some(0));
    }

    #[test]
    fn test_nested_release_is_one_level() {
        let store = ObjectStore::new();
        let inner = store.store_list(StoredList::new(vec![Value::Int(1)]));
        let outer = store.store_list(StoredList::new(vec![Value::Ref(inner)]));
        assert_eq!(store.refcount(inner), Some(1));

        // Someone else also holds the inner list
        store.claim(inner);
        store.claim(outer);
        store.release(outer);
        assert!(store.get(outer).is_none());
        assert_eq!(store.refcount(inner), Some(1));

        store.release(inner);
        assert!(store.get(inner).is_none());
    }

    #[test]
    fn test_ids_not_reused() {
        let store = ObjectStore::new();
        let a = store.store(Stored::Str("a".into()));
        store.claim(a);
        store.release(a);
        let b = store.store(Stored::Str("b".into()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_display_list() {
        let store = ObjectStore::new();
        let mut named = std::collections::BTreeMap::new();
        named.insert("k".to_string(), Value::Int(2));
        let r = store.store_list(StoredList::with_named(
            vec![Value::Int(1), Value::quoted("s")],
            named,
        ));
        assert_eq!(store.display(&Value::Ref(r)), "(1, \"s\", k: 2)");
    }

    #[test]
    fn test_format_for_reparse() {
        let store = ObjectStore::new();
        assert_eq!(store.format_for_reparse(&Value::quoted("a\"b")), "\"a\\\"b\"");
        assert_eq!(store.format_for_reparse(&Value::Block("x".into())), "(x)");
        assert_eq!(store.format_for_reparse(&Value::Nil), "nil");
    }
}
