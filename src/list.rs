//! Stored lists
//!
//! A list is an immutable sequence of positional items plus an unordered map
//! of named items. Structural operations never mutate: they build a new list
//! and merge the type-tracking metadata of the inputs instead of rescanning.

use crate::ast::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Dominant element type of one side (items or named values) of a list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElemType {
    Empty,
    Nil,
    Undefined,
    Of(&'static str),
    Mixed,
}

impl ElemType {
    pub fn name(&self) -> &'static str {
        match self {
            ElemType::Empty => "empty",
            ElemType::Nil => "nil",
            ElemType::Undefined => "undefined",
            ElemType::Of(name) => name,
            ElemType::Mixed => "mixed",
        }
    }

    fn is_absent(&self) -> bool {
        matches!(self, ElemType::Nil | ElemType::Undefined)
    }
}

/// Type-tracking metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub elem: ElemType,
    /// No nil/undefined members
    pub solid: bool,
    /// No opaque handles (channels, fibers, commands, macros)
    pub serializable: bool,
}

impl Default for TypeInfo {
    fn default() -> Self {
        TypeInfo {
            elem: ElemType::Empty,
            solid: true,
            serializable: true,
        }
    }
}

/// Classify a single value: (type, serializable, absent)
fn classify(value: &Value) -> (ElemType, bool, bool) {
    match value {
        Value::Nil => (ElemType::Nil, true, true),
        Value::Symbol(s) if s == "undefined" => (ElemType::Undefined, true, true),
        Value::Ref(r) => (ElemType::Of(r.kind.name()), r.kind.is_serializable(), false),
        other => (ElemType::Of(other.type_name()), true, false),
    }
}

impl TypeInfo {
    /// Fold one more value into the metadata
    pub fn with(&self, value: &Value) -> TypeInfo {
        let (ty, serializable, absent) = classify(value);
        let mut result = self.clone();
        if absent {
            result.solid = false;
        }
        if !serializable {
            result.serializable = false;
        }
        result.elem = match &self.elem {
            ElemType::Empty => ty,
            ElemType::Nil | ElemType::Undefined => {
                if !absent {
                    ty
                } else if self.elem != ty {
                    ElemType::Mixed
                } else {
                    self.elem.clone()
                }
            }
            ElemType::Mixed => ElemType::Mixed,
            current => {
                if absent || *current == ty {
                    current.clone()
                } else {
                    ElemType::Mixed
                }
            }
        };
        result
    }

    pub fn of_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> TypeInfo {
        values
            .into_iter()
            .fold(TypeInfo::default(), |info, v| info.with(v))
    }

    /// Merge the metadata of two lists being concatenated
    pub fn merge(&self, other: &TypeInfo) -> TypeInfo {
        let elem = match (&self.elem, &other.elem) {
            (ElemType::Empty, b) => b.clone(),
            (a, ElemType::Empty) => a.clone(),
            (ElemType::Mixed, _) | (_, ElemType::Mixed) => ElemType::Mixed,
            (a, b) if a == b => a.clone(),
            (a, b) if a.is_absent() && !b.is_absent() => b.clone(),
            (a, b) if b.is_absent() && !a.is_absent() => a.clone(),
            _ => ElemType::Mixed,
        };
        TypeInfo {
            elem,
            solid: self.solid && other.solid,
            serializable: self.serializable && other.serializable,
        }
    }
}

/// Immutable list value stored in the object store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredList {
    items: Arc<Vec<Value>>,
    named: Arc<BTreeMap<String, Value>>,
    items_info: TypeInfo,
    named_info: TypeInfo,
}

impl Default for StoredList {
    fn default() -> Self {
        StoredList::new(Vec::new())
    }
}

impl StoredList {
    pub fn new(items: Vec<Value>) -> Self {
        StoredList::with_named(items, BTreeMap::new())
    }

    pub fn with_named(items: Vec<Value>, named: BTreeMap<String, Value>) -> Self {
        let items_info = TypeInfo::of_values(&items);
        let named_info = TypeInfo::of_values(named.values());
        StoredList {
            items: Arc::new(items),
            named: Arc::new(named),
            items_info,
            named_info,
        }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn named(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.named.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn items_info(&self) -> &TypeInfo {
        &self.items_info
    }

    pub fn named_info(&self) -> &TypeInfo {
        &self.named_info
    }

    /// New list with `value` appended; named items are shared, not copied
    pub fn append(&self, value: Value) -> StoredList {
        let items_info = self.items_info.with(&value);
        let mut items = Vec::with_capacity(self.items.len() + 1);
        items.extend(self.items.iter().cloned());
        items.push(value);
        StoredList {
            items: Arc::new(items),
            named: Arc::clone(&self.named),
            items_info,
            named_info: self.named_info.clone(),
        }
    }

    /// New list holding `items[start..end]` (clamped); named items are kept
    pub fn slice(&self, start: usize, end: usize) -> StoredList {
        let end = end.min(self.items.len());
        let start = start.min(end);
        let items: Vec<Value> = self.items[start..end].to_vec();
        StoredList {
            items_info: TypeInfo::of_values(&items),
            items: Arc::new(items),
            named: Arc::clone(&self.named),
            named_info: self.named_info.clone(),
        }
    }

    /// New list with the items of `other` after ours; on a named-key clash
    /// the right-hand value wins
    pub fn concat(&self, other: &StoredList) -> StoredList {
        let mut items = Vec::with_capacity(self.items.len() + other.items.len());
        items.extend(self.items.iter().cloned());
        items.extend(other.items.iter().cloned());
        let (named, named_info) = if other.named.is_empty() {
            (Arc::clone(&self.named), self.named_info.clone())
        } else if self.named.is_empty() {
            (Arc::clone(&other.named), other.named_info.clone())
        } else {
            let mut merged = (*self.named).clone();
            merged.extend(other.named.iter().map(|(k, v)| (k.clone(), v.clone())));
            let info = TypeInfo::of_values(merged.values());
            (Arc::new(merged), info)
        };
        StoredList {
            items: Arc::new(items),
            named,
            items_info: self.items_info.merge(&other.items_info),
            named_info,
        }
    }

    /// Every reference directly nested in this list (one level)
    pub fn nested_refs(&self) -> Vec<crate::ast::ObjectRef> {
        self.items
            .iter()
            .chain(self.named.values())
            .filter_map(Value::as_ref)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ObjectKind, ObjectRef};

    #[test]
    fn test_type_info_uniform() {
        let list = StoredList::new(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.items_info().elem, ElemType::Of("int"));
        assert!(list.items_info().solid);
        assert!(list.items_info().serializable);
    }

    #[test]
    fn test_type_info_mixed_and_nil() {
        let list = StoredList::new(vec![Value::Int(1), Value::Nil, Value::quoted("x")]);
        assert_eq!(list.items_info().elem, ElemType::Mixed);
        assert!(!list.items_info().solid);
    }

    #[test]
    fn test_nil_then_type_takes_over() {
        let list = StoredList::new(vec![Value::Nil, Value::Int(3)]);
        assert_eq!(list.items_info().elem, ElemType::Of("int"));
        assert!(!list.items_info().solid);
    }

    #[test]
    fn test_opaque_handle_not_serializable() {
        let m = Value::Ref(ObjectRef::new(ObjectKind::Macro, 1));
        let list = StoredList::new(vec![m]);
        assert!(!list.items_info().serializable);
    }

    #[test]
    fn test_append_leaves_original() {
        let a = StoredList::new(vec![Value::Int(1)]);
        let b = a.append(Value::quoted("s"));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
        assert_eq!(b.items_info().elem, ElemType::Mixed);
    }

    #[test]
    fn test_concat_merges_info() {
        let a = StoredList::new(vec![Value::Nil]);
        let b = StoredList::new(vec![Value::Int(2)]);
        let c = a.concat(&b);
        assert_eq!(c.len(), 2);
        assert_eq!(c.items_info().elem, ElemType::Of("int"));
        assert!(!c.items_info().solid);
    }

    #[test]
    fn test_slice_clamps() {
        let a = StoredList::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(a.slice(1, 10).items(), &[Value::Int(2), Value::Int(3)]);
        assert!(a.slice(5, 2).items().is_empty());
    }
}
