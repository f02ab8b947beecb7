// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Rename-and-merge: promotes a TDL device to its final, permanent UDI.
//!
//! Grounded on `hald/device_store.c`'s rename/merge path: a freshly
//! probed device either turns out to be a second discovery of a device
//! already in the GDL (matched by a namespace of shared properties, see
//! [`DeviceStore::matches`]), in which case its properties are folded
//! into the existing device and the TDL copy is destroyed, or it is
//! genuinely new, in which case it claims a UDI (appending `_2`, `_3`,
//! ... on collision), runs the rule evaluator against its new identity,
//! and is published.

use crate::{
    core::{
        store::{DeviceKey, DeviceStore, StoreListener},
        types::{Namespace, Udi, UdiBuf},
    },
    result::{ErrorKind, HalError, HalResult},
};

/// Promotes the TDL device at `key` to a permanent identity.
///
/// `base_udi` is the UDI the caller would like to use; `namespace` is
/// the property-key prefix used to decide whether another GDL device is
/// really the same physical device (spec.md §4.5). `run_rules` runs the
/// Information and Policy phases against the device's *new* UDI, after
/// it is assigned but before the device is published — callers pass a
/// closure over `crate::eval` rather than this module depending on it
/// directly, so the evaluator can in turn depend on `core::rename` for
/// `SPAWN` handling without a cycle.
///
/// Returns the UDI the device ended up with: either its own newly
/// claimed one, or the existing device's (if merged into it, in which
/// case `key` no longer resolves to a live device).
pub fn rename_and_merge<L: StoreListener>(
    store: &mut DeviceStore<L>,
    key: DeviceKey,
    base_udi: &Udi,
    namespace: Namespace<'_>,
    mut run_rules: impl FnMut(&mut DeviceStore<L>, DeviceKey) -> HalResult<()>,
) -> HalResult<UdiBuf> {
    if !store.merging.insert(key) {
        return Err(HalError::Hal(
            ErrorKind::UdiInUse,
            "rename-and-merge already in progress for this device".to_string(),
        ));
    }

    let result = (|| {
        if let Some(target) = find_merge_target(store, key, namespace) {
            store.merge(target, key)?;
            store.destroy(key)?;
            return Ok(store.get(target).expect("just merged into").udi().clone());
        }

        let final_udi = claim_udi(store, key, base_udi)?;
        run_rules(store, key)?;
        store.publish_to_gdl(key)?;
        Ok(final_udi)
    })();

    store.merging.remove(&key);
    result
}

/// The first GDL device (other than `key` itself) whose `namespace`
/// properties all match `key`'s, if any.
fn find_merge_target<L: StoreListener>(
    store: &DeviceStore<L>,
    key: DeviceKey,
    namespace: Namespace<'_>,
) -> Option<DeviceKey> {
    store
        .iter_gdl()
        .find(|&other| other != key && store.matches(key, other, namespace))
}

/// Renames `key` to `base_udi`, or `base_udi` with an incrementing
/// numeric suffix if it collides with a different live device
/// (spec.md §4.5).
fn claim_udi<L: StoreListener>(
    store: &mut DeviceStore<L>,
    key: DeviceKey,
    base_udi: &Udi,
) -> HalResult<UdiBuf> {
    let mut candidate = base_udi.to_owned();
    let mut suffix = 1u32;
    loop {
        match store.rename_device(key, candidate.clone()) {
            Ok(()) => return Ok(candidate),
            Err(HalError::Hal(ErrorKind::UdiInUse, _)) => {
                suffix += 1;
                candidate = UdiBuf::new(format!("{}_{}", base_udi, suffix))?;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::core::device::Value;

    fn noop_rules<L: StoreListener>(_: &mut DeviceStore<L>, _: DeviceKey) -> HalResult<()> {
        Ok(())
    }

    // S6. Rename collides then resolves with a numeric suffix.
    #[test]
    fn test_s6_rename_collision_appends_suffix() {
        let mut store = DeviceStore::new();

        let first = store.new_device();
        let final1 = rename_and_merge(
            &mut store,
            first,
            Udi::new("/dev/sda").unwrap(),
            Namespace("block"),
            noop_rules,
        )
        .unwrap();
        assert_eq!(final1.as_str(), "/dev/sda");

        let second = store.new_device();
        // No shared "block" properties with `first`, so this is a
        // genuinely distinct device that must fall back to a suffix.
        let final2 = rename_and_merge(
            &mut store,
            second,
            Udi::new("/dev/sda").unwrap(),
            Namespace("block"),
            noop_rules,
        )
        .unwrap();
        assert_eq!(final2.as_str(), "/dev/sda_2");

        assert!(store.find(Udi::new("/dev/sda").unwrap()).is_some());
        assert!(store.find(Udi::new("/dev/sda_2").unwrap()).is_some());
    }

    #[test]
    fn test_merge_target_folds_properties_and_destroys_tdl_copy() {
        let mut store = DeviceStore::new();

        let existing = store.new_device();
        store
            .set_property(existing, "usb.vendor_id", Value::Int32(0x046d))
            .unwrap();
        store
            .set_property(existing, "usb.product_id", Value::Int32(0xc52b))
            .unwrap();
        rename_and_merge(
            &mut store,
            existing,
            Udi::new("/dev/usb_1").unwrap(),
            Namespace("usb"),
            noop_rules,
        )
        .unwrap();

        let rediscovered = store.new_device();
        store
            .set_property(rediscovered, "usb.vendor_id", Value::Int32(0x046d))
            .unwrap();
        store
            .set_property(rediscovered, "usb.product_id", Value::Int32(0xc52b))
            .unwrap();
        store
            .set_property(rediscovered, "usb.serial", Value::Str("XYZ".to_string()))
            .unwrap();

        let result = rename_and_merge(
            &mut store,
            rediscovered,
            Udi::new("/dev/usb_2").unwrap(),
            Namespace("usb"),
            noop_rules,
        )
        .unwrap();

        assert_eq!(result.as_str(), "/dev/usb_1");
        assert!(store.get(rediscovered).is_none());
        let merged = store.find(Udi::new("/dev/usb_1").unwrap()).unwrap();
        assert_eq!(
            store.get(merged).unwrap().properties().get("usb.serial"),
            Some(&Value::Str("XYZ".to_string()))
        );
    }

    #[test]
    fn test_reentrant_rename_is_rejected() {
        let mut store = DeviceStore::new();
        let key = store.new_device();
        let err = rename_and_merge(
            &mut store,
            key,
            Udi::new("/dev/x").unwrap(),
            Namespace("x"),
            |store, key| {
                rename_and_merge(store, key, Udi::new("/dev/y").unwrap(), Namespace("x"), noop_rules)
                    .map(|_| ())
            },
        )
        .unwrap_err();
        assert_matches!(err, HalError::Hal(ErrorKind::UdiInUse, _));
    }
}
