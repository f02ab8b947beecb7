// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device store: owns every device object, indexes it, and batches
//! change notifications.
//!
//! Replaces the original `hald/device_store.c` intrusive doubly-linked
//! list with a generational arena (spec.md §9 "Intrusive linked lists"):
//! each slot carries a generation counter, so an iterator holding a
//! stale `(index, generation)` pair silently skips a removed-and-reused
//! slot instead of dereferencing a dangling pointer.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use crate::{
    core::{
        device::{Device, Value, CAPABILITIES_KEY},
        types::{Namespace, Udi, UdiBuf},
    },
    result::{ErrorKind, HalError, HalResult},
};

/// A stable handle to a device slot in the arena. Carries a generation
/// so that a key captured before a `destroy()` is detected as stale
/// rather than aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    device: Option<Device>,
    in_gdl: bool,
}

/// One entry in a `PropertyModified` batch: the key, whether this event
/// is a removal, and whether it is a fresh addition. Both false means
/// an in-place value change on a pre-existing key (spec.md §4.2, §5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// The property's key.
    pub key: String,
    /// True if the property was removed by this change.
    pub removed: bool,
    /// True if the property did not exist before this change.
    pub added: bool,
}

/// Receives batched change notifications from the store. Implemented by
/// the bus adapter (`crate::notify`); a no-op/collecting implementation
/// is used in tests.
pub trait StoreListener {
    /// One buffered `PropertyModified` batch has drained for `udi`.
    fn property_modified(&mut self, udi: &Udi, in_gdl: bool, changes: &[PropertyChange]);
    /// A device was added to or removed from the GDL.
    fn gdl_changed(&mut self, udi: &Udi, is_added: bool);
    /// A capability was added (capability removal is not supported,
    /// spec.md §3).
    fn new_capability(&mut self, udi: &Udi, cap: &str, in_gdl: bool);
}

/// A `StoreListener` that does nothing; the default for a `DeviceStore`
/// built without an explicit listener (e.g. in unit tests that only
/// check state, not notifications).
#[derive(Default)]
pub struct NullListener;

impl StoreListener for NullListener {
    fn property_modified(&mut self, _udi: &Udi, _in_gdl: bool, _changes: &[PropertyChange]) {}
    fn gdl_changed(&mut self, _udi: &Udi, _is_added: bool) {}
    fn new_capability(&mut self, _udi: &Udi, _cap: &str, _in_gdl: bool) {}
}

type FindCallback = Box<dyn FnOnce(Option<&Device>)>;

struct PendingWait {
    key: String,
    value: Value,
    wait_for_in_gdl: bool,
    deadline: Instant,
    callback: Option<FindCallback>,
}

/// The device object store: TDL + GDL, indices, atomic-update batching,
/// and asynchronous property waits (spec.md §4.1).
pub struct DeviceStore<L: StoreListener = NullListener> {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    udi_index: HashMap<String, DeviceKey>,
    capability_index: HashMap<String, HashSet<DeviceKey>>,
    temp_counter: u64,
    atomic_depth: u32,
    pending_changes: HashMap<DeviceKey, Vec<PropertyChange>>,
    waits: Vec<PendingWait>,
    /// devices currently undergoing a rename-and-merge attempt
    /// (spec.md §2 supplement: reentrant-rename guard).
    pub(crate) merging: HashSet<DeviceKey>,
    listener: L,
}

impl DeviceStore<NullListener> {
    /// A store with no listener; change notifications are dropped.
    pub fn new() -> DeviceStore<NullListener> {
        DeviceStore::with_listener(NullListener)
    }
}

impl Default for DeviceStore<NullListener> {
    fn default() -> Self {
        DeviceStore::new()
    }
}

impl<L: StoreListener> DeviceStore<L> {
    /// A store that reports changes to `listener`.
    pub fn with_listener(listener: L) -> DeviceStore<L> {
        DeviceStore {
            slots: Vec::new(),
            free_list: Vec::new(),
            udi_index: HashMap::new(),
            capability_index: HashMap::new(),
            temp_counter: 0,
            atomic_depth: 0,
            pending_changes: HashMap::new(),
            waits: Vec::new(),
            merging: HashSet::new(),
            listener,
        }
    }

    /// Creates a device in the TDL with a synthesized temporary UDI. Not
    /// visible to `find`-by-public-query operations other than direct
    /// UDI lookup and `async_find_by_string` with `wait_for_in_gdl =
    /// false` (spec.md §4.1).
    pub fn new_device(&mut self) -> DeviceKey {
        self.temp_counter += 1;
        let udi = UdiBuf::temporary(self.temp_counter);
        let device = Device::new(udi.clone());
        let key = self.insert_slot(device);
        self.udi_index.insert(udi.to_string(), key);
        key
    }

    fn insert_slot(&mut self, device: Device) -> DeviceKey {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.device = Some(device);
            slot.in_gdl = false;
            DeviceKey {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                device: Some(device),
                in_gdl: false,
            });
            DeviceKey {
                index,
                generation: 0,
            }
        }
    }

    fn slot(&self, key: DeviceKey) -> Option<&Slot> {
        self.slots.get(key.index as usize).filter(|s| s.generation == key.generation)
    }

    fn slot_mut(&mut self, key: DeviceKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
    }

    /// Borrows the device at `key`, if the key is still live.
    pub fn get(&self, key: DeviceKey) -> Option<&Device> {
        self.slot(key).and_then(|s| s.device.as_ref())
    }

    /// True if `key` names a device currently published in the GDL.
    pub fn in_gdl(&self, key: DeviceKey) -> bool {
        self.slot(key).map(|s| s.in_gdl).unwrap_or(false)
    }

    /// Looks up a device by UDI in either list. O(1) expected
    /// (spec.md §4.1).
    pub fn find(&self, udi: &Udi) -> Option<DeviceKey> {
        self.udi_index.get(udi.as_str()).copied()
    }

    /// Iterates GDL device keys. The iterator's safety against
    /// mid-iteration removal comes from `DeviceKey`'s generation check
    /// in `get()`/`in_gdl()`: a removed slot's generation no longer
    /// matches, so looking it up afterwards yields `None` rather than a
    /// stale device (spec.md §4.1, §9; the Open Question in
    /// `SPEC_FULL.md` §4 resolves this as skip-on-stale-generation).
    pub fn iter_gdl(&self) -> impl Iterator<Item = DeviceKey> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            if s.in_gdl {
                Some(DeviceKey {
                    index: i as u32,
                    generation: s.generation,
                })
            } else {
                None
            }
        })
    }

    /// Renames a device's UDI without touching GDL membership. Fails
    /// with `UdiInUse` if a *different* live device already holds
    /// `new_udi` (spec.md §4.5 step 1: the UDI is assigned before the
    /// evaluator runs, and only then is the device published), or if
    /// `key` is already published: a device may be renamed from its
    /// temporary UDI exactly once (spec.md §3); repeated calls while
    /// still in the TDL (e.g. `core::rename::claim_udi`'s
    /// suffix-collision retries) are one logical claim attempt, not
    /// repeat renames, and remain allowed.
    pub fn rename_device(&mut self, key: DeviceKey, new_udi: UdiBuf) -> HalResult<()> {
        if self.in_gdl(key) {
            return Err(HalError::Hal(
                ErrorKind::UdiInUse,
                "device is already published; its UDI is final".to_string(),
            ));
        }
        if let Some(existing) = self.find(&new_udi) {
            if existing != key {
                return Err(HalError::Hal(
                    ErrorKind::UdiInUse,
                    format!("UDI {} already in use", new_udi),
                ));
            }
        }
        let old_udi = {
            let dev = self.get(key).ok_or_else(no_such_device)?;
            dev.udi().clone()
        };
        {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.rename(new_udi.clone());
        }
        self.udi_index.remove(old_udi.as_str());
        self.udi_index.insert(new_udi.to_string(), key);
        Ok(())
    }

    /// Publishes an already-UDI'd device into the GDL. Emits
    /// `gdl_changed(true)` (spec.md §4.1, §4.5 step 2).
    pub fn publish_to_gdl(&mut self, key: DeviceKey) -> HalResult<()> {
        let udi = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            slot.in_gdl = true;
            slot.device.as_ref().expect("slot invariant").udi().clone()
        };
        self.reindex_capabilities(key);
        self.check_waits(key);
        self.listener.gdl_changed(&udi, true);
        Ok(())
    }

    /// Atomically renames a TDL device to `final_udi` and moves it to
    /// the GDL. Fails with `UdiInUse` if a GDL device already has that
    /// UDI (spec.md §4.1). Equivalent to `rename_device` followed by
    /// `publish_to_gdl`, for callers that don't need the evaluator to
    /// run against the device before it is published.
    pub fn commit_to_gdl(&mut self, key: DeviceKey, final_udi: UdiBuf) -> HalResult<()> {
        if let Some(existing) = self.find(&final_udi) {
            if self.in_gdl(existing) {
                return Err(HalError::Hal(
                    ErrorKind::UdiInUse,
                    format!("UDI {} already published", final_udi),
                ));
            }
        }
        self.rename_device(key, final_udi)?;
        self.publish_to_gdl(key)
    }

    /// Removes the device from whichever list holds it. Emits
    /// `gdl_changed(false)` if it was published (spec.md §4.1, §5:
    /// `DeviceRemoved` fires only after the device is unreachable via
    /// `find`).
    pub fn destroy(&mut self, key: DeviceKey) -> HalResult<()> {
        let (udi, was_in_gdl) = {
            let dev = self.get(key).ok_or_else(no_such_device)?;
            (dev.udi().clone(), self.in_gdl(key))
        };
        self.udi_index.remove(udi.as_str());
        for set in self.capability_index.values_mut() {
            set.remove(&key);
        }
        self.pending_changes.remove(&key);
        self.merging.remove(&key);
        if let Some(slot) = self.slots.get_mut(key.index as usize) {
            slot.device = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.free_list.push(key.index);
        if was_in_gdl {
            self.listener.gdl_changed(&udi, false);
        }
        Ok(())
    }

    /// Copies every property of `source` into `target`, overwriting on
    /// key collision, preserving each key's type (spec.md §4.1: a
    /// second-discovery merge, "second wins").
    pub fn merge(&mut self, target: DeviceKey, source: DeviceKey) -> HalResult<()> {
        let incoming: Vec<(String, Value)> = {
            let src = self.get(source).ok_or_else(no_such_device)?;
            src.properties()
                .iter()
                .map(|p| (p.key.to_string(), p.value.clone()))
                .collect()
        };
        for (key, value) in incoming {
            // Cross-key-type collisions (source's type differs from an
            // existing same-named target property) overwrite rather
            // than error: merge is the backend re-asserting fresher
            // facts, not a third-party client set.
            self.force_set_property(target, &key, value)?;
        }
        Ok(())
    }

    /// True iff every property of `a` whose key starts with
    /// `namespace` exists in `b` with equal type and equal value.
    /// Not symmetric (spec.md §4.1).
    pub fn matches(&self, a: DeviceKey, b: DeviceKey, namespace: Namespace<'_>) -> bool {
        let (da, db) = match (self.get(a), self.get(b)) {
            (Some(da), Some(db)) => (da, db),
            _ => return false,
        };
        da.properties()
            .iter()
            .filter(|p| p.key.starts_with(namespace.0))
            .all(|p| db.properties().get(p.key).map(|v| v.same_as(p.value)).unwrap_or(false))
    }

    /// Begins an atomic update span; spans nest (spec.md §4.2).
    pub fn atomic_update_begin(&mut self) {
        self.atomic_depth += 1;
    }

    /// Ends an atomic update span. On transition to zero nesting,
    /// drains every device's buffered changes and emits one
    /// `PropertyModified` event per device, in queued order.
    pub fn atomic_update_end(&mut self) {
        assert!(self.atomic_depth > 0, "atomic_update_end without begin");
        self.atomic_depth -= 1;
        if self.atomic_depth == 0 {
            let drained: Vec<_> = self.pending_changes.drain().collect();
            for (key, changes) in drained {
                if changes.is_empty() {
                    continue;
                }
                if let Some(dev) = self.get(key) {
                    let udi = dev.udi().clone();
                    let in_gdl = self.in_gdl(key);
                    self.listener.property_modified(&udi, in_gdl, &changes);
                }
            }
        }
    }

    /// Sets a property on the device at `key`, applying set-if-different
    /// and queuing (or immediately emitting) the resulting
    /// `PropertyChange` (spec.md §4.2).
    pub fn set_property(&mut self, key: DeviceKey, prop_key: &str, value: Value) -> HalResult<()> {
        let existed = self
            .get(key)
            .ok_or_else(no_such_device)?
            .properties()
            .contains(prop_key);
        let changed = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.properties_mut().set(prop_key, value)?
        };
        if changed {
            self.queue_change(key, PropertyChange {
                key: prop_key.to_string(),
                removed: false,
                added: !existed,
            });
            self.check_waits(key);
        }
        Ok(())
    }

    /// Sets a property, overwriting across a type change if needed; used
    /// internally by `merge` where fresher bus-specific facts should
    /// win outright rather than fail on `TypeMismatch`.
    fn force_set_property(&mut self, key: DeviceKey, prop_key: &str, value: Value) -> HalResult<()> {
        let existed = self
            .get(key)
            .ok_or_else(no_such_device)?
            .properties()
            .contains(prop_key);
        {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            if existed {
                dev.properties_mut().remove(prop_key);
            }
            dev.properties_mut().set(prop_key, value)?;
        }
        self.queue_change(key, PropertyChange {
            key: prop_key.to_string(),
            removed: false,
            added: !existed,
        });
        self.check_waits(key);
        Ok(())
    }

    /// Appends `s` to the list property `prop_key` on the device at
    /// `key`. `only_if_unique` selects `append` (false) vs. `addset`
    /// (true) semantics (spec.md §4.2).
    pub fn list_append(
        &mut self,
        key: DeviceKey,
        prop_key: &str,
        s: &str,
        only_if_unique: bool,
    ) -> HalResult<()> {
        let existed = self
            .get(key)
            .ok_or_else(no_such_device)?
            .properties()
            .contains(prop_key);
        let changed = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.properties_mut().list_append(prop_key, s, only_if_unique)?
        };
        if changed {
            self.queue_change(key, PropertyChange {
                key: prop_key.to_string(),
                removed: false,
                added: !existed,
            });
            if prop_key == CAPABILITIES_KEY {
                self.reindex_capabilities(key);
            }
            self.check_waits(key);
        }
        Ok(())
    }

    /// Prepends `s` to the list property `prop_key` (spec.md §4.2
    /// `prepend`).
    pub fn list_prepend(&mut self, key: DeviceKey, prop_key: &str, s: &str) -> HalResult<()> {
        let existed = self
            .get(key)
            .ok_or_else(no_such_device)?
            .properties()
            .contains(prop_key);
        let changed = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.properties_mut().list_prepend(prop_key, s)?
        };
        if changed {
            self.queue_change(key, PropertyChange {
                key: prop_key.to_string(),
                removed: false,
                added: !existed,
            });
            self.check_waits(key);
        }
        Ok(())
    }

    /// Removes every occurrence of `s` from the list property `prop_key`
    /// (spec.md §4.2 `remove` on a list).
    pub fn list_remove(&mut self, key: DeviceKey, prop_key: &str, s: &str) -> HalResult<()> {
        let changed = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.properties_mut().list_remove(prop_key, s)?
        };
        if changed {
            self.queue_change(key, PropertyChange {
                key: prop_key.to_string(),
                removed: false,
                added: false,
            });
        }
        Ok(())
    }

    /// Removes a property from the device at `key`.
    pub fn remove_property(&mut self, key: DeviceKey, prop_key: &str) -> HalResult<()> {
        let removed = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.properties_mut().remove(prop_key)
        };
        if removed {
            self.queue_change(key, PropertyChange {
                key: prop_key.to_string(),
                removed: true,
                added: false,
            });
        }
        Ok(())
    }

    /// Adds a capability to the device at `key`. Idempotent; emits
    /// `new_capability` only when newly added (spec.md §3).
    pub fn add_capability(&mut self, key: DeviceKey, cap: &str) -> HalResult<()> {
        let existed = self
            .get(key)
            .ok_or_else(no_such_device)?
            .properties()
            .contains(CAPABILITIES_KEY);
        let newly_added = {
            let slot = self.slot_mut(key).ok_or_else(no_such_device)?;
            let dev = slot.device.as_mut().expect("slot invariant");
            dev.add_capability(cap)?
        };
        if newly_added {
            self.queue_change(key, PropertyChange {
                key: CAPABILITIES_KEY.to_string(),
                removed: false,
                added: !existed,
            });
            self.reindex_capabilities(key);
            let udi = self.get(key).expect("just mutated").udi().clone();
            let in_gdl = self.in_gdl(key);
            self.listener.new_capability(&udi, cap, in_gdl);
        }
        Ok(())
    }

    fn reindex_capabilities(&mut self, key: DeviceKey) {
        if let Some(dev) = self.get(key) {
            for cap in dev.capabilities().to_vec() {
                self.capability_index.entry(cap).or_default().insert(key);
            }
        }
    }

    /// All GDL devices asserting `cap` (spec.md §4.6 `FindDeviceByCapability`).
    pub fn find_by_capability(&self, cap: &str) -> Vec<DeviceKey> {
        self.capability_index
            .get(cap)
            .into_iter()
            .flat_map(|set| set.iter().copied())
            .filter(|k| self.in_gdl(*k))
            .collect()
    }

    fn queue_change(&mut self, key: DeviceKey, change: PropertyChange) {
        if self.atomic_depth > 0 {
            self.pending_changes.entry(key).or_default().push(change);
        } else {
            if let Some(dev) = self.get(key) {
                let udi = dev.udi().clone();
                let in_gdl = self.in_gdl(key);
                self.listener.property_modified(&udi, in_gdl, &[change]);
            }
        }
    }

    /// Schedules `k` to run when a device with property `prop_key ==
    /// value` appears (or already exists). If `wait_for_in_gdl`, only
    /// GDL devices satisfy the wait. Fires `k(None)` if `timeout_ms`
    /// elapses first; the Daemon event loop must drive this by calling
    /// [`DeviceStore::poll_timeouts`] periodically (spec.md §4.1, §5).
    pub fn async_find_by_string(
        &mut self,
        prop_key: &str,
        value: &str,
        wait_for_in_gdl: bool,
        timeout_ms: u64,
        k: impl FnOnce(Option<&Device>) + 'static,
    ) {
        if let Some(found) = self.find_matching(prop_key, value, wait_for_in_gdl) {
            k(self.get(found));
            return;
        }
        self.waits.push(PendingWait {
            key: prop_key.to_string(),
            value: Value::Str(value.to_string()),
            wait_for_in_gdl,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            callback: Some(Box::new(k)),
        });
    }

    fn find_matching(&self, prop_key: &str, value: &str, wait_for_in_gdl: bool) -> Option<DeviceKey> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            let dev = s.device.as_ref()?;
            if wait_for_in_gdl && !s.in_gdl {
                return None;
            }
            match dev.properties().get(prop_key) {
                Some(Value::Str(v)) if v == value => Some(DeviceKey {
                    index: i as u32,
                    generation: s.generation,
                }),
                _ => None,
            }
        })
    }

    fn check_waits(&mut self, key: DeviceKey) {
        if self.waits.is_empty() {
            return;
        }
        let mut remaining = Vec::with_capacity(self.waits.len());
        let mut fired: Vec<FindCallback> = Vec::new();
        for mut wait in self.waits.drain(..) {
            let matches = self.get(key).map_or(false, |dev| {
                (!wait.wait_for_in_gdl || self.in_gdl(key))
                    && dev
                        .properties()
                        .get(&wait.key)
                        .map(|v| v.same_as(&wait.value))
                        .unwrap_or(false)
            });
            if matches {
                fired.push(wait.callback.take().expect("callback present"));
            } else {
                remaining.push(wait);
            }
        }
        self.waits = remaining;
        for cb in fired {
            cb(self.get(key));
        }
    }

    /// Fires `k(None)` for every pending wait whose deadline has passed
    /// as of `now`. Must be driven by the event loop's I/O-readiness
    /// suspension points (spec.md §5).
    pub fn poll_timeouts(&mut self, now: Instant) {
        let mut remaining = Vec::with_capacity(self.waits.len());
        let mut expired: Vec<FindCallback> = Vec::new();
        for mut wait in self.waits.drain(..) {
            if wait.deadline <= now {
                expired.push(wait.callback.take().expect("callback present"));
            } else {
                remaining.push(wait);
            }
        }
        self.waits = remaining;
        for cb in expired {
            cb(None);
        }
    }

    /// Number of pending asynchronous waits, for test assertions.
    pub fn pending_wait_count(&self) -> usize {
        self.waits.len()
    }

    /// Borrows the listener, for callers (tests, the daemon) that need
    /// to inspect what it has recorded so far.
    pub fn listener(&self) -> &L {
        &self.listener
    }
}

fn no_such_device() -> HalError {
    HalError::Hal(ErrorKind::NoSuchDevice, "UDI does not resolve".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Default, Clone)]
    struct RecordingListener {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl StoreListener for RecordingListener {
        fn property_modified(&mut self, udi: &Udi, in_gdl: bool, changes: &[PropertyChange]) {
            self.events.borrow_mut().push(format!(
                "PropertyModified({}, in_gdl={}, count={})",
                udi,
                in_gdl,
                changes.len()
            ));
        }
        fn gdl_changed(&mut self, udi: &Udi, is_added: bool) {
            self.events
                .borrow_mut()
                .push(format!("GdlChanged({}, added={})", udi, is_added));
        }
        fn new_capability(&mut self, udi: &Udi, cap: &str, in_gdl: bool) {
            self.events
                .borrow_mut()
                .push(format!("NewCapability({}, {}, in_gdl={})", udi, cap, in_gdl));
        }
    }

    #[test]
    fn test_find_and_commit_uniqueness() {
        let mut store = DeviceStore::new();
        let key = store.new_device();
        store
            .commit_to_gdl(key, UdiBuf::new("/dev/block_8_0").unwrap())
            .unwrap();
        let found = store.find(Udi::new("/dev/block_8_0").unwrap()).unwrap();
        assert_eq!(found, key);

        let key2 = store.new_device();
        let err = store
            .commit_to_gdl(key2, UdiBuf::new("/dev/block_8_0").unwrap())
            .unwrap_err();
        assert_matches!(err, HalError::Hal(ErrorKind::UdiInUse, _));
    }

    #[test]
    fn test_rename_after_publish_is_rejected() {
        let mut store = DeviceStore::new();
        let key = store.new_device();
        store.commit_to_gdl(key, UdiBuf::new("/dev/sda").unwrap()).unwrap();
        let err = store.rename_device(key, UdiBuf::new("/dev/sdb").unwrap()).unwrap_err();
        assert_matches!(err, HalError::Hal(ErrorKind::UdiInUse, _));
        // unaffected: still reachable under its original, final UDI.
        assert_eq!(store.find(Udi::new("/dev/sda").unwrap()), Some(key));
    }

    #[test]
    fn test_destroy_removes_from_find() {
        let mut store = DeviceStore::new();
        let key = store.new_device();
        store
            .commit_to_gdl(key, UdiBuf::new("/dev/x").unwrap())
            .unwrap();
        store.destroy(key).unwrap();
        assert!(store.find(Udi::new("/dev/x").unwrap()).is_none());
        assert!(store.get(key).is_none());
    }

    // S1. Property mutation notifies once.
    #[test]
    fn test_s1_property_mutation_notifies_once() {
        let listener = RecordingListener::default();
        let events = listener.events.clone();
        let mut store = DeviceStore::with_listener(listener);
        let key = store.new_device();
        store.set_property(key, "block.major", Value::Int32(8)).unwrap();
        store.set_property(key, "block.minor", Value::Int32(0)).unwrap();
        store
            .commit_to_gdl(key, UdiBuf::new("/dev/block_8_0").unwrap())
            .unwrap();
        events.borrow_mut().clear();

        store.atomic_update_begin();
        store.set_property(key, "block.major", Value::Int32(8)).unwrap(); // no-op
        store
            .set_property(key, "info.product", Value::Str("Disk".to_string()))
            .unwrap();
        store.atomic_update_end();

        let log = events.borrow();
        assert_eq!(log.len(), 1, "expected exactly one PropertyModified: {:?}", log);
        assert_eq!(log[0], "PropertyModified(/dev/block_8_0, in_gdl=true, count=1)");
    }

    #[test]
    fn test_atomic_nesting_emits_once_per_device() {
        let mut store = DeviceStore::new();
        let a = store.new_device();
        let b = store.new_device();
        store.atomic_update_begin();
        store.atomic_update_begin();
        store.set_property(a, "x", Value::Int32(1)).unwrap();
        store.set_property(a, "y", Value::Int32(2)).unwrap();
        store.set_property(b, "z", Value::Int32(3)).unwrap();
        store.atomic_update_end();
        assert_eq!(store.pending_changes.len(), 2);
        store.atomic_update_end();
        assert_eq!(store.pending_changes.len(), 0);
    }

    #[test]
    fn test_matches_not_symmetric() {
        let mut store = DeviceStore::new();
        let a = store.new_device();
        let b = store.new_device();
        store.set_property(a, "usb.vendor_id", Value::Int32(1)).unwrap();
        store.set_property(a, "usb.product_id", Value::Int32(2)).unwrap();
        store.set_property(b, "usb.vendor_id", Value::Int32(1)).unwrap();
        // b lacks usb.product_id
        assert!(!store.matches(a, b, Namespace("usb")));
        assert!(store.matches(b, a, Namespace("usb")));
    }

    #[test]
    fn test_capability_query() {
        let mut store = DeviceStore::new();
        let key = store.new_device();
        store.add_capability(key, "block").unwrap();
        store
            .commit_to_gdl(key, UdiBuf::new("/dev/sda").unwrap())
            .unwrap();
        assert_eq!(store.find_by_capability("block"), vec![key]);
        assert!(store.find_by_capability("net.ethernet").is_empty());
    }

    // S4. Async find completes on late parent.
    #[test]
    fn test_s4_async_find_completes_on_late_commit() {
        let mut store = DeviceStore::new();
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        store.async_find_by_string(
            "linux.sysfs_path_device",
            "/sys/bus/pci/devices/0000:00:1d.0",
            true,
            5000,
            move |dev| {
                *fired2.borrow_mut() = dev.map(|d| d.udi().to_string());
            },
        );
        assert_eq!(store.pending_wait_count(), 1);

        let key = store.new_device();
        store
            .set_property(
                key,
                "linux.sysfs_path_device",
                Value::Str("/sys/bus/pci/devices/0000:00:1d.0".to_string()),
            )
            .unwrap();
        // Not in GDL yet: wait_for_in_gdl=true must not fire.
        assert_eq!(store.pending_wait_count(), 1);
        assert!(fired.borrow().is_none());

        store
            .commit_to_gdl(key, UdiBuf::new("/dev/pci_1d_0").unwrap())
            .unwrap();
        assert_eq!(store.pending_wait_count(), 0);
        assert_eq!(fired.borrow().as_deref(), Some("/dev/pci_1d_0"));
    }

    #[test]
    fn test_async_find_times_out() {
        let mut store = DeviceStore::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        store.async_find_by_string("no.such.key", "x", false, 0, move |dev| {
            *fired2.borrow_mut() = true;
            assert!(dev.is_none());
        });
        store.poll_timeouts(Instant::now() + Duration::from_millis(1));
        assert!(*fired.borrow());
        assert_eq!(store.pending_wait_count(), 0);
    }
}
