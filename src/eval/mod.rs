// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The rule evaluator: walks a compiled [`RuleCache`] region against a
//! device, mutating it via [`DeviceStore`] as `merge`/`append`/etc.
//! records fire.
//!
//! A single program-counter-driven pass covers an entire region
//! (spec.md §4.4): `Match` records skip forward to `jump_position` on
//! failure and otherwise simply fall through into their nested block,
//! so no recursive descent is needed. `Spawn` is the only record kind
//! that changes which device subsequent rules target; a small stack of
//! `(DeviceKey, end_offset)` frames tracks that, popping back to the
//! parent device once the program counter reaches a frame's recorded
//! end (the same `jump_position` field `Match` uses for its own
//! skip-to offset).

use crate::{
    cache::{
        format::{MatchOp, MergeType, Phase, RuleKind},
        reader::{RecordView, RuleCache},
    },
    core::{
        device::Value,
        store::{DeviceKey, DeviceStore, StoreListener},
        types::UdiBuf,
    },
    result::{CoreError, HalError, HalResult},
};

struct Frame {
    key: DeviceKey,
    end: u32,
}

/// Runs every rule in `phase`'s region against `root`, spawning any
/// devices `<spawn>` blocks declare along the way. Returns the spawned
/// devices' keys in the order they were created, so the caller (e.g.
/// `core::rename`'s successor, or the daemon's probe driver) can run
/// the same or later phases against them too.
pub fn evaluate_phase<L: StoreListener>(
    store: &mut DeviceStore<L>,
    cache: &RuleCache<'_>,
    phase: Phase,
    root: DeviceKey,
) -> HalResult<Vec<DeviceKey>> {
    let region_end = cache.region_end(phase)?;
    let mut pc = cache.region_start(phase)?;
    let mut stack = vec![Frame { key: root, end: region_end }];
    let mut spawned = Vec::new();

    while pc < region_end {
        while stack.len() > 1 && pc >= stack.last().expect("non-empty").end {
            stack.pop();
        }
        let current = stack.last().expect("root frame never popped").key;
        let record = cache.read_record(pc)?;

        match record.rtype {
            RuleKind::Eof | RuleKind::Unknown => {
                pc = record.next_offset();
            }
            RuleKind::Match => {
                pc = if evaluate_match(store, current, &record)? {
                    record.next_offset()
                } else {
                    record.jump_position
                };
            }
            RuleKind::Spawn => {
                let new_key = store.new_device();
                // `record.value` is the `<spawn udi="...">` target UDI
                // (spec.md §4.4 SPAWN); materialize it on the synthetic
                // device right away so two `<spawn udi="x">` rules (or
                // one rule re-evaluated) consistently identify the same
                // device rather than each getting an arbitrary temp UDI.
                if !record.value.is_empty() {
                    let target_udi = UdiBuf::new(record.value)?;
                    store.rename_device(new_key, target_udi)?;
                }
                spawned.push(new_key);
                stack.push(Frame { key: new_key, end: record.jump_position });
                pc = record.next_offset();
            }
            RuleKind::Merge
            | RuleKind::Append
            | RuleKind::Prepend
            | RuleKind::Addset
            | RuleKind::Remove
            | RuleKind::Clear => {
                apply_mutation(store, current, &record)?;
                pc = record.next_offset();
            }
        }
    }
    Ok(spawned)
}

fn apply_mutation<L: StoreListener>(
    store: &mut DeviceStore<L>,
    key: DeviceKey,
    record: &RecordView<'_>,
) -> HalResult<()> {
    match record.rtype {
        RuleKind::Clear => {
            store.remove_property(key, record.key)?;
        }
        RuleKind::Remove => match record.type_merge {
            Some(MergeType::Remove) | None => {
                store.remove_property(key, record.key)?;
            }
            Some(_) => {
                store.list_remove(key, record.key, record.value)?;
            }
        },
        RuleKind::Append => {
            store.list_append(key, record.key, record.value, false)?;
        }
        RuleKind::Prepend => {
            store.list_prepend(key, record.key, record.value)?;
        }
        RuleKind::Addset => {
            store.list_append(key, record.key, record.value, true)?;
        }
        RuleKind::Merge => apply_merge(store, key, record)?,
        _ => unreachable!("apply_mutation called with a non-mutating record"),
    }
    Ok(())
}

fn apply_merge<L: StoreListener>(
    store: &mut DeviceStore<L>,
    key: DeviceKey,
    record: &RecordView<'_>,
) -> HalResult<()> {
    let merge_type = record.type_merge.ok_or_else(|| {
        HalError::Core(CoreError::MalformedCache("merge record missing type_merge".to_string()))
    })?;
    match merge_type {
        MergeType::Remove => {
            store.remove_property(key, record.key)?;
        }
        MergeType::CopyProperty => {
            let source = store
                .get(key)
                .ok_or_else(no_such_device)?
                .properties()
                .get(record.value)
                .cloned();
            if let Some(value) = source {
                store.set_property(key, record.key, value)?;
            }
        }
        MergeType::None => {}
        other => {
            let value = parse_scalar(other, record.value)?;
            store.set_property(key, record.key, value)?;
        }
    }
    Ok(())
}

fn parse_scalar(merge_type: MergeType, raw: &str) -> HalResult<Value> {
    Ok(match merge_type {
        MergeType::Str => Value::Str(raw.to_string()),
        MergeType::Bool => Value::Bool(parse_bool(raw)?),
        MergeType::Int => Value::Int32(parse_i32(raw)?),
        MergeType::Uint64 => Value::Uint64(parse_u64(raw)?),
        MergeType::Double => Value::Double(parse_f64(raw)?),
        MergeType::Strlist => Value::StrList(split_list(raw)),
        MergeType::None | MergeType::CopyProperty | MergeType::Remove => {
            unreachable!("handled by caller")
        }
    })
}

/// Multi-valued FDI attributes (`strlist` merges, the `_outof` match
/// operators' right-hand sides) are `;`-separated; no escaping is
/// defined, matching the delimiter `hald`'s own property dumper uses
/// for list-typed values in its textual debug output.
fn split_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(';').map(|s| s.to_string()).collect()
    }
}

fn parse_bool(raw: &str) -> HalResult<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(HalError::Core(CoreError::MalformedCache(format!("not a bool: {:?}", raw)))),
    }
}

fn parse_i32(raw: &str) -> HalResult<i32> {
    raw.parse()
        .map_err(|_| HalError::Core(CoreError::MalformedCache(format!("not an int32: {:?}", raw))))
}

fn parse_u64(raw: &str) -> HalResult<u64> {
    raw.parse()
        .map_err(|_| HalError::Core(CoreError::MalformedCache(format!("not a uint64: {:?}", raw))))
}

fn parse_f64(raw: &str) -> HalResult<f64> {
    raw.parse()
        .map_err(|_| HalError::Core(CoreError::MalformedCache(format!("not a double: {:?}", raw))))
}

/// Extracts a device property as `f64` for the numeric comparison
/// operators, regardless of which of the three numeric types it is
/// stored as.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int32(n) => Some(*n as f64),
        Value::Uint64(n) => Some(*n as f64),
        Value::Double(n) => Some(*n),
        _ => None,
    }
}

fn evaluate_match<L: StoreListener>(
    store: &DeviceStore<L>,
    key: DeviceKey,
    record: &RecordView<'_>,
) -> HalResult<bool> {
    let op = record.type_match.ok_or_else(|| {
        HalError::Core(CoreError::MalformedCache("match record missing type_match".to_string()))
    })?;
    let device = store.get(key).ok_or_else(no_such_device)?;
    let current = device.properties().get(record.key);

    Ok(match op {
        MatchOp::None => false,
        MatchOp::Exists => current.is_some(),
        MatchOp::Empty => current.map(|v| v.is_empty_value()).unwrap_or(true),
        MatchOp::String => current.and_then(Value::as_str) == Some(record.value),
        MatchOp::Int => matches!(current, Some(Value::Int32(n)) if *n == parse_i32(record.value)?),
        MatchOp::Uint64 => matches!(current, Some(Value::Uint64(n)) if *n == parse_u64(record.value)?),
        MatchOp::Bool => matches!(current, Some(Value::Bool(b)) if *b == parse_bool(record.value)?),
        MatchOp::Double => matches!(current, Some(Value::Double(n)) if *n == parse_f64(record.value)?),
        MatchOp::IsAscii => current.and_then(Value::as_str).map(|s| s.is_ascii()).unwrap_or(false),
        MatchOp::IsAbsolutePath => {
            current.and_then(Value::as_str).map(|s| s.starts_with('/')).unwrap_or(false)
        }
        MatchOp::Contains => {
            current.and_then(Value::as_str).map(|s| s.contains(record.value)).unwrap_or(false)
        }
        MatchOp::ContainsNcase => current
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase().contains(&record.value.to_lowercase()))
            .unwrap_or(false),
        MatchOp::ContainsNot => {
            !current.and_then(Value::as_str).map(|s| s.contains(record.value)).unwrap_or(false)
        }
        MatchOp::Prefix => {
            current.and_then(Value::as_str).map(|s| s.starts_with(record.value)).unwrap_or(false)
        }
        MatchOp::PrefixNcase => current
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase().starts_with(&record.value.to_lowercase()))
            .unwrap_or(false),
        MatchOp::Suffix => {
            current.and_then(Value::as_str).map(|s| s.ends_with(record.value)).unwrap_or(false)
        }
        MatchOp::SuffixNcase => current
            .and_then(Value::as_str)
            .map(|s| s.to_lowercase().ends_with(&record.value.to_lowercase()))
            .unwrap_or(false),
        MatchOp::CompareLt | MatchOp::CompareLe | MatchOp::CompareGt | MatchOp::CompareGe => {
            let lhs = current.and_then(as_f64);
            let rhs = parse_f64(record.value).ok();
            match (lhs, rhs) {
                (Some(l), Some(r)) => match op {
                    MatchOp::CompareLt => l < r,
                    MatchOp::CompareLe => l <= r,
                    MatchOp::CompareGt => l > r,
                    MatchOp::CompareGe => l >= r,
                    _ => unreachable!(),
                },
                _ => false,
            }
        }
        MatchOp::CompareNe => {
            let lhs = current.and_then(as_f64);
            let rhs = parse_f64(record.value).ok();
            match (lhs, rhs) {
                (Some(l), Some(r)) => l != r,
                _ => false,
            }
        }
        MatchOp::SiblingContains => {
            let parent = device.parent().cloned();
            parent
                .and_then(|p| store.find(&p))
                .map(|parent_key| {
                    store.iter_gdl().filter(|&k| k != key).any(|sibling| {
                        store
                            .get(sibling)
                            .and_then(|d| d.parent().cloned())
                            .map(|sp| store.find(&sp) == Some(parent_key))
                            .unwrap_or(false)
                            && store
                                .get(sibling)
                                .and_then(|d| d.properties().get(record.key))
                                .and_then(Value::as_str)
                                .map(|s| s.contains(record.value))
                                .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
        }
        MatchOp::ContainsOutof => {
            let s = current.and_then(Value::as_str);
            s.map(|s| split_list(record.value).iter().any(|alt| s.contains(alt.as_str()))).unwrap_or(false)
        }
        MatchOp::IntOutof => matches!(current, Some(Value::Int32(n)) if split_list(record.value)
            .iter()
            .filter_map(|a| a.parse::<i32>().ok())
            .any(|alt| alt == *n)),
        MatchOp::PrefixOutof => {
            let s = current.and_then(Value::as_str);
            s.map(|s| split_list(record.value).iter().any(|alt| s.starts_with(alt.as_str()))).unwrap_or(false)
        }
        MatchOp::StringOutof => {
            let s = current.and_then(Value::as_str);
            s.map(|s| split_list(record.value).iter().any(|alt| alt == s)).unwrap_or(false)
        }
    })
}

fn no_such_device() -> HalError {
    use crate::result::ErrorKind;
    HalError::Hal(ErrorKind::NoSuchDevice, "UDI does not resolve".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compiler::compile_source;
    use std::io::Write;

    fn write_fdi(dir: &std::path::Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn three_dirs(tmp: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
        let preprobe = tmp.join("preprobe");
        let information = tmp.join("information");
        let policy = tmp.join("policy");
        std::fs::create_dir(&preprobe).unwrap();
        std::fs::create_dir(&information).unwrap();
        std::fs::create_dir(&policy).unwrap();
        (preprobe, information, policy)
    }

    // S2. A failing match skips its nested block; a passing one runs it.
    #[test]
    fn test_s2_match_skip_and_fallthrough() {
        let tmp = tempfile::tempdir().unwrap();
        let (preprobe, information, policy) = three_dirs(tmp.path());
        write_fdi(
            &information,
            "10-usb.fdi",
            r#"<deviceinfo version="0.2">
 <device>
  <match key="usb.vendor_id" int="1133">
   <merge key="info.vendor" type="string">Logitech</merge>
  </match>
  <match key="usb.vendor_id" int="9999">
   <merge key="info.vendor" type="string">Nobody</merge>
  </match>
  <merge key="info.category" type="string">input</merge>
 </device>
</deviceinfo>"#,
        );
        let compiled = compile_source(&preprobe, &information, &policy).unwrap();
        assert!(compiled.skipped_files.is_empty());
        let cache = RuleCache::from_bytes(&compiled.bytes).unwrap();

        let mut store = DeviceStore::new();
        let key = store.new_device();
        store.set_property(key, "usb.vendor_id", Value::Int32(1133)).unwrap();

        let spawned = evaluate_phase(&mut store, &cache, Phase::Information, key).unwrap();
        assert!(spawned.is_empty());

        let dev = store.get(key).unwrap();
        assert_eq!(dev.properties().get("info.vendor"), Some(&Value::Str("Logitech".to_string())));
        assert_eq!(dev.properties().get("info.category"), Some(&Value::Str("input".to_string())));
    }

    #[test]
    fn test_spawn_creates_nested_device_and_scopes_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let (preprobe, information, policy) = three_dirs(tmp.path());
        write_fdi(
            &information,
            "10-spawn.fdi",
            r#"<deviceinfo version="0.2">
 <device>
  <spawn udi="/org/freedesktop/Hal/devices/temp/spawned">
   <merge key="info.category" type="string">volume</merge>
  </spawn>
  <merge key="info.category" type="string">storage</merge>
 </device>
</deviceinfo>"#,
        );
        let compiled = compile_source(&preprobe, &information, &policy).unwrap();
        let cache = RuleCache::from_bytes(&compiled.bytes).unwrap();

        let mut store = DeviceStore::new();
        let key = store.new_device();
        let spawned = evaluate_phase(&mut store, &cache, Phase::Information, key).unwrap();

        assert_eq!(spawned.len(), 1);
        let child = store.get(spawned[0]).unwrap();
        assert_eq!(child.udi().as_str(), "/org/freedesktop/Hal/devices/temp/spawned");
        assert_eq!(child.properties().get("info.category"), Some(&Value::Str("volume".to_string())));
        let parent = store.get(key).unwrap();
        assert_eq!(parent.properties().get("info.category"), Some(&Value::Str("storage".to_string())));
    }

    #[test]
    fn test_addset_merge_copy_property_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let (preprobe, information, policy) = three_dirs(tmp.path());
        write_fdi(
            &information,
            "10-ops.fdi",
            r#"<deviceinfo version="0.2">
 <device>
  <addset key="info.capabilities" type="strlist">block</addset>
  <addset key="info.capabilities" type="strlist">block</addset>
  <merge key="block.device" type="string">/dev/sda</merge>
  <merge key="info.product" type="copy_property">block.device</merge>
  <clear key="info.category"/>
 </device>
</deviceinfo>"#,
        );
        let compiled = compile_source(&preprobe, &information, &policy).unwrap();
        let cache = RuleCache::from_bytes(&compiled.bytes).unwrap();

        let mut store = DeviceStore::new();
        let key = store.new_device();
        store.set_property(key, "info.category", Value::Str("placeholder".to_string())).unwrap();
        evaluate_phase(&mut store, &cache, Phase::Information, key).unwrap();

        let dev = store.get(key).unwrap();
        assert_eq!(dev.capabilities(), &["block".to_string()]);
        assert_eq!(dev.properties().get("info.product"), Some(&Value::Str("/dev/sda".to_string())));
        assert!(dev.properties().get("info.category").is_none());
    }
}
