// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Translates `DeviceStore` callbacks into the bus event set (spec.md
//! §4.6), preserving the §5 ordering guarantees. No transport is
//! implemented here (spec.md §1 non-goal on IPC); a `BusSink` is
//! whatever the daemon wires up to actually deliver these.

use serde::{Deserialize, Serialize};

use crate::{
    core::{
        store::{PropertyChange, StoreListener},
        types::Udi,
    },
};

/// One entry of a `PropertyModified` batch, mirroring
/// `core::store::PropertyChange` in the wire-friendly shape spec.md §4.6
/// describes: `(key, was_removed, was_added)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChangeEvent {
    pub key: String,
    pub was_removed: bool,
    pub was_added: bool,
}

impl From<&PropertyChange> for PropertyChangeEvent {
    fn from(change: &PropertyChange) -> Self {
        PropertyChangeEvent {
            key: change.key.clone(),
            was_removed: change.removed,
            was_added: change.added,
        }
    }
}

/// The bus event set (spec.md §4.6). `DeviceAdded`/`DeviceRemoved`/
/// `NewCapability` are emitted on the manager path; `PropertyModified`
/// and `Condition` on the device's own path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    DeviceAdded { udi: String },
    DeviceRemoved { udi: String },
    NewCapability { udi: String, capability: String },
    PropertyModified { udi: String, changes: Vec<PropertyChangeEvent> },
    /// Ad-hoc signal not modeled as a property change, e.g.
    /// `BlockMountEvent`/`NetLinkEvent` (spec.md §4.6).
    Condition { udi: String, name: String, args: Vec<String> },
}

/// Receives dispatched bus events. The daemon's actual IPC transport
/// implements this; `Vec<Event>` is used directly in tests.
pub trait BusSink {
    fn emit(&mut self, event: Event);
}

impl BusSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// A `StoreListener` that forwards every callback to a `BusSink`,
/// applying no buffering of its own — `DeviceStore` already batches
/// `PropertyModified` across an atomic-update span (spec.md §4.2), so by
/// the time `property_modified` fires here, the span has ended and the
/// ordering guarantees of spec.md §5 already hold. `DeviceAdded`/
/// `PropertyModified`/`NewCapability` for TDL-only devices (`in_gdl ==
/// false`) are suppressed: the bus only ever discusses published
/// devices (spec.md §4.1, §5 "DeviceAdded ... before any PropertyModified
/// ... because rule evaluation happens before commit to GDL").
pub struct BusAdapter<S: BusSink> {
    sink: S,
}

impl<S: BusSink> BusAdapter<S> {
    pub fn new(sink: S) -> BusAdapter<S> {
        BusAdapter { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Emits an ad-hoc `Condition` signal on `udi`'s device path, for a
    /// backend-delivered event with no property-change counterpart
    /// (spec.md §4.6, §4.8).
    pub fn emit_condition(&mut self, udi: &Udi, name: &str, args: &[String]) {
        self.sink.emit(Event::Condition {
            udi: udi.to_string(),
            name: name.to_string(),
            args: args.to_vec(),
        });
    }
}

impl<S: BusSink> StoreListener for BusAdapter<S> {
    fn property_modified(&mut self, udi: &Udi, in_gdl: bool, changes: &[PropertyChange]) {
        if !in_gdl || changes.is_empty() {
            return;
        }
        self.sink.emit(Event::PropertyModified {
            udi: udi.to_string(),
            changes: changes.iter().map(PropertyChangeEvent::from).collect(),
        });
    }

    fn gdl_changed(&mut self, udi: &Udi, is_added: bool) {
        let event = if is_added {
            Event::DeviceAdded { udi: udi.to_string() }
        } else {
            Event::DeviceRemoved { udi: udi.to_string() }
        };
        self.sink.emit(event);
    }

    fn new_capability(&mut self, udi: &Udi, cap: &str, in_gdl: bool) {
        if !in_gdl {
            return;
        }
        self.sink.emit(Event::NewCapability {
            udi: udi.to_string(),
            capability: cap.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        device::Value,
        store::DeviceStore,
        types::UdiBuf,
    };

    // S1-adjacent: DeviceAdded precedes any PropertyModified for the same
    // device, and pre-GDL property writes never reach the bus at all
    // (spec.md §5).
    #[test]
    fn test_device_added_precedes_property_modified() {
        let mut store = DeviceStore::with_listener(BusAdapter::new(Vec::<Event>::new()));
        let key = store.new_device();
        store.set_property(key, "info.product", Value::Str("Disk".to_string())).unwrap();
        store.commit_to_gdl(key, UdiBuf::new("/dev/sda").unwrap()).unwrap();

        store.atomic_update_begin();
        store.set_property(key, "info.vendor", Value::Str("ACME".to_string())).unwrap();
        store.atomic_update_end();

        let events = store.listener().sink();
        assert_eq!(
            events,
            &vec![
                Event::DeviceAdded { udi: "/dev/sda".to_string() },
                Event::PropertyModified {
                    udi: "/dev/sda".to_string(),
                    changes: vec![PropertyChangeEvent {
                        key: "info.vendor".to_string(),
                        was_removed: false,
                        was_added: true,
                    }],
                },
            ],
        );
    }

    #[test]
    fn test_tdl_only_changes_are_suppressed() {
        let sink: Vec<Event> = Vec::new();
        let mut adapter = BusAdapter::new(sink);
        adapter.property_modified(
            Udi::new("/org/freedesktop/Hal/devices/temp/1").unwrap(),
            false,
            &[PropertyChange { key: "x".to_string(), removed: false, added: true }],
        );
        adapter.new_capability(Udi::new("/org/freedesktop/Hal/devices/temp/1").unwrap(), "block", false);
        assert!(adapter.into_inner().is_empty());
    }

    #[test]
    fn test_gdl_changed_maps_to_added_and_removed() {
        let sink: Vec<Event> = Vec::new();
        let mut adapter = BusAdapter::new(sink);
        let udi = Udi::new("/dev/sda").unwrap();
        adapter.gdl_changed(udi, true);
        adapter.gdl_changed(udi, false);
        let events = adapter.into_inner();
        assert_eq!(events, vec![
            Event::DeviceAdded { udi: "/dev/sda".to_string() },
            Event::DeviceRemoved { udi: "/dev/sda".to_string() },
        ]);
    }

    #[test]
    fn test_condition_signal() {
        let sink: Vec<Event> = Vec::new();
        let mut adapter = BusAdapter::new(sink);
        let udi = Udi::new("/dev/sda1").unwrap();
        adapter.emit_condition(udi, "BlockMountEvent", &["/mnt/usb".to_string()]);
        let events = adapter.into_inner();
        assert_eq!(
            events,
            vec![Event::Condition {
                udi: "/dev/sda1".to_string(),
                name: "BlockMountEvent".to_string(),
                args: vec!["/mnt/usb".to_string()],
            }]
        );
    }
}
