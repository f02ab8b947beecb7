// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device object: a typed, ordered property bag plus capability set.
//!
//! Generalizes the accessor shape of `devicemapper-rs`'s `DeviceInfo`
//! (`version()`, `name()`, `uuid()`, `flags()` — narrow typed views over
//! a single ioctl reply) to an arbitrary, growable bag of typed
//! properties (spec.md §3).

use std::collections::HashMap;

use crate::{
    core::types::UdiBuf,
    result::{ErrorKind, HalError, HalResult},
};

/// The well-known property holding a device's capability set.
pub const CAPABILITIES_KEY: &str = "info.capabilities";

/// A typed property value. One of the six types spec.md §3 names.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string.
    Str(String),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Unsigned 64-bit integer.
    Uint64(u64),
    /// IEEE-754 double. Compared per spec.md §9: `NaN != NaN`.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Ordered list of strings.
    StrList(Vec<String>),
}

/// A property's type tag, independent of its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// See [`Value::Str`].
    Str,
    /// See [`Value::Int32`].
    Int32,
    /// See [`Value::Uint64`].
    Uint64,
    /// See [`Value::Double`].
    Double,
    /// See [`Value::Bool`].
    Bool,
    /// See [`Value::StrList`].
    StrList,
}

impl Value {
    /// This value's type tag.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Str(_) => ValueType::Str,
            Value::Int32(_) => ValueType::Int32,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Double(_) => ValueType::Double,
            Value::Bool(_) => ValueType::Bool,
            Value::StrList(_) => ValueType::StrList,
        }
    }

    /// `string` / `int` / `uint64` / `bool` / `double` scalar equality,
    /// or `empty`/`exists` style tests delegate to the caller; this is
    /// strict same-type-and-value equality used by set-if-different
    /// (spec.md §4.2) and by `DeviceStore::matches` (spec.md §4.1).
    ///
    /// IEEE-754 equality is used as-is for `Double`: `NaN != NaN`
    /// (spec.md §9 Open Question).
    pub fn same_as(&self, other: &Value) -> bool {
        self == other
    }

    /// Returns the string slice if this is `Value::Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list slice if this is `Value::StrList`.
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Value::StrList(v) => Some(v),
            _ => None,
        }
    }

    /// True if this value is "empty" per the `empty` match operator:
    /// a zero-length string, or a zero-length list. Scalars are never
    /// empty.
    pub fn is_empty_value(&self) -> bool {
        match self {
            Value::Str(s) => s.is_empty(),
            Value::StrList(v) => v.is_empty(),
            _ => false,
        }
    }
}

/// A single (key, value) property, as handed out by iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Property<'a> {
    /// The property's dotted key.
    pub key: &'a str,
    /// The property's typed value.
    pub value: &'a Value,
}

impl<'a> Property<'a> {
    /// True if this property is private: its key begins with `.` and it
    /// MUST NOT be emitted over IPC nor matched (spec.md §3).
    pub fn is_private(&self) -> bool {
        self.key.starts_with('.')
    }
}

/// An ordered, unique-keyed bag of properties.
///
/// Order of insertion is preserved (spec.md §4.2: list operations and
/// `PropertyModified` batching both require stable ordering).
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    order: Vec<String>,
    values: HashMap<String, Value>,
}

impl PropertyBag {
    /// A new, empty bag.
    pub fn new() -> PropertyBag {
        PropertyBag::default()
    }

    /// Looks up a property by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// True if a property with this key exists, regardless of type.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterates properties in insertion order, skipping none.
    pub fn iter(&self) -> impl Iterator<Item = Property<'_>> {
        self.order.iter().map(move |k| Property {
            key: k,
            value: self.values.get(k).expect("order/values invariant"),
        })
    }

    /// Iterates only public (non-`.`-prefixed) properties, the subset
    /// that may be emitted over IPC or matched (spec.md §3).
    pub fn iter_public(&self) -> impl Iterator<Item = Property<'_>> {
        self.iter().filter(|p| !p.is_private())
    }

    /// Sets a property, applying set-if-different semantics
    /// (spec.md §4.2): returns `Ok(true)` if the stored value actually
    /// changed (including first insertion), `Ok(false)` if the new
    /// value is identical to the existing one (no-op, no notification
    /// should be emitted by the caller). Fails with `TypeMismatch` if an
    /// existing property of the same key has a different type, and
    /// leaves the bag unmodified.
    pub fn set(&mut self, key: &str, value: Value) -> HalResult<bool> {
        if let Some(existing) = self.values.get(key) {
            if existing.value_type() != value.value_type() {
                return Err(HalError::Hal(
                    ErrorKind::TypeMismatch,
                    format!(
                        "property {:?} is {:?}, cannot set to {:?}",
                        key,
                        existing.value_type(),
                        value.value_type()
                    ),
                ));
            }
            if existing.same_as(&value) {
                return Ok(false);
            }
        } else {
            self.order.push(key.to_string());
        }
        self.values.insert(key.to_string(), value);
        Ok(true)
    }

    /// Removes a property unconditionally. Returns `true` if it was
    /// present.
    pub fn remove(&mut self, key: &str) -> bool {
        if self.values.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    /// Appends `s` to the list property at `key`, creating it if
    /// absent. If `only_if_unique`, does nothing when `s` is already
    /// present (spec.md §4.2 `append`).
    pub fn list_append(&mut self, key: &str, s: &str, only_if_unique: bool) -> HalResult<bool> {
        self.mutate_list(key, |list| {
            if only_if_unique && list.iter().any(|x| x == s) {
                false
            } else {
                list.push(s.to_string());
                true
            }
        })
    }

    /// Prepends `s` to the list property at `key`, creating it if
    /// absent (spec.md §4.2 `prepend`).
    pub fn list_prepend(&mut self, key: &str, s: &str) -> HalResult<bool> {
        self.mutate_list(key, |list| {
            list.insert(0, s.to_string());
            true
        })
    }

    /// Idempotent append: does nothing if `s` is already present
    /// (spec.md §3 `addset`, §4.2 `add`).
    pub fn list_add(&mut self, key: &str, s: &str) -> HalResult<bool> {
        self.list_append(key, s, true)
    }

    /// Removes every occurrence of `s` from the list property at `key`.
    pub fn list_remove(&mut self, key: &str, s: &str) -> HalResult<bool> {
        self.mutate_list(key, |list| {
            let before = list.len();
            list.retain(|x| x != s);
            before != list.len()
        })
    }

    /// Removes the element at `index` from the list property at `key`.
    pub fn list_remove_at(&mut self, key: &str, index: usize) -> HalResult<bool> {
        self.mutate_list(key, |list| {
            if index < list.len() {
                list.remove(index);
                true
            } else {
                false
            }
        })
    }

    fn mutate_list(
        &mut self,
        key: &str,
        f: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> HalResult<bool> {
        match self.values.get_mut(key) {
            Some(Value::StrList(list)) => Ok(f(list)),
            Some(other) => Err(HalError::Hal(
                ErrorKind::TypeMismatch,
                format!("property {:?} is {:?}, not a list", key, other.value_type()),
            )),
            None => {
                let mut list = Vec::new();
                let changed = f(&mut list);
                if changed {
                    self.order.push(key.to_string());
                    self.values.insert(key.to_string(), Value::StrList(list));
                }
                Ok(changed)
            }
        }
    }
}

/// A device: identity, properties, and a weak parent reference.
///
/// The store (`core::store::DeviceStore`) owns the arena slot; `Device`
/// itself holds no pointer to its parent/children, only the parent's
/// UDI, resolved lazily through the store (spec.md §3, §4.1).
#[derive(Debug, Clone)]
pub struct Device {
    udi: UdiBuf,
    parent: Option<UdiBuf>,
    properties: PropertyBag,
    renamed: bool,
}

impl Device {
    /// Creates a blank device with the given (typically temporary) UDI.
    pub fn new(udi: UdiBuf) -> Device {
        Device {
            udi,
            parent: None,
            properties: PropertyBag::new(),
            renamed: false,
        }
    }

    /// This device's current UDI.
    pub fn udi(&self) -> &UdiBuf {
        &self.udi
    }

    /// The parent device's UDI, if set. A weak reference: the parent
    /// may since have disappeared (spec.md §3).
    pub fn parent(&self) -> Option<&UdiBuf> {
        self.parent.as_ref()
    }

    /// Sets the parent UDI.
    pub fn set_parent(&mut self, parent: UdiBuf) {
        self.parent = Some(parent);
    }

    /// Clears the parent reference, e.g. when the backend reparents an
    /// orphaned child (spec.md §3).
    pub fn clear_parent(&mut self) {
        self.parent = None;
    }

    /// Read-only access to this device's properties.
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Mutable access to this device's properties. Callers outside
    /// `core::store` should prefer `DeviceStore::set_property` and
    /// friends, which handle notification and atomic-update batching;
    /// this is the low-level entry point those build on.
    pub fn properties_mut(&mut self) -> &mut PropertyBag {
        &mut self.properties
    }

    /// True once this device has been renamed from its temporary UDI
    /// (spec.md §3: a device may be renamed exactly once).
    pub fn is_renamed(&self) -> bool {
        self.renamed
    }

    /// Renames this device's UDI. Callers (`core::store::DeviceStore`,
    /// `core::rename`) must enforce the "exactly once" invariant; this
    /// method only performs the mechanical rename and marks it done.
    pub fn rename(&mut self, new_udi: UdiBuf) {
        self.udi = new_udi;
        self.renamed = true;
    }

    /// The device's capability set, read from `info.capabilities`.
    /// Empty if the property is absent or not a list.
    pub fn capabilities(&self) -> &[String] {
        match self.properties.get(CAPABILITIES_KEY) {
            Some(Value::StrList(list)) => list,
            _ => &[],
        }
    }

    /// True if this device has the given capability.
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities().iter().any(|c| c == cap)
    }

    /// Adds a capability. Idempotent (spec.md §3): returns `true` only
    /// if the capability was newly added, which the caller uses to
    /// decide whether to emit `NewCapability`.
    pub fn add_capability(&mut self, cap: &str) -> HalResult<bool> {
        self.properties.list_add(CAPABILITIES_KEY, cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_set_if_different_suppresses_noop() {
        let mut bag = PropertyBag::new();
        assert_eq!(bag.set("block.major", Value::Int32(8)).unwrap(), true);
        assert_eq!(bag.set("block.major", Value::Int32(8)).unwrap(), false);
        assert_eq!(bag.set("block.major", Value::Int32(9)).unwrap(), true);
    }

    #[test]
    fn test_set_type_mismatch_leaves_state() {
        let mut bag = PropertyBag::new();
        bag.set("x", Value::Int32(1)).unwrap();
        let err = bag.set("x", Value::Str("y".into())).unwrap_err();
        assert_matches!(err, HalError::Hal(ErrorKind::TypeMismatch, _));
        assert_eq!(bag.get("x"), Some(&Value::Int32(1)));
    }

    #[test]
    fn test_list_ops_preserve_order() {
        let mut bag = PropertyBag::new();
        bag.list_append("info.capabilities", "block", false).unwrap();
        bag.list_append("info.capabilities", "storage", false).unwrap();
        bag.list_prepend("info.capabilities", "first").unwrap();
        assert_eq!(
            bag.get("info.capabilities").unwrap().as_str_list().unwrap(),
            &["first".to_string(), "block".to_string(), "storage".to_string()]
        );
    }

    #[test]
    fn test_addset_idempotent() {
        let mut bag = PropertyBag::new();
        assert!(bag.list_add("info.capabilities", "block").unwrap());
        assert!(!bag.list_add("info.capabilities", "block").unwrap());
        assert_eq!(bag.get("info.capabilities").unwrap().as_str_list().unwrap().len(), 1);
    }

    #[test]
    fn test_private_keys_excluded_from_public_iter() {
        let mut bag = PropertyBag::new();
        bag.set(".internal.lock", Value::Bool(true)).unwrap();
        bag.set("info.product", Value::Str("Widget".into())).unwrap();
        let public: Vec<_> = bag.iter_public().map(|p| p.key.to_string()).collect();
        assert_eq!(public, vec!["info.product".to_string()]);
    }

    #[test]
    fn test_capability_add_idempotent_on_device() {
        let mut dev = Device::new(UdiBuf::new("/dev/foo").unwrap());
        assert!(dev.add_capability("block").unwrap());
        assert!(!dev.add_capability("block").unwrap());
        assert!(dev.has_capability("block"));
    }

    #[test]
    fn test_rename_marks_renamed() {
        let mut dev = Device::new(UdiBuf::temporary(1));
        assert!(!dev.is_renamed());
        dev.rename(UdiBuf::new("/dev/final").unwrap());
        assert!(dev.is_renamed());
        assert_eq!(dev.udi().as_str(), "/dev/final");
    }

    #[test]
    fn test_nan_double_not_equal_to_itself() {
        let nan = Value::Double(f64::NAN);
        assert!(!nan.same_as(&nan));
    }
}
