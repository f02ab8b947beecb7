// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! FDI source tree -> packed rule cache (spec.md §4.3).
//!
//! A SAX-style walk (`quick_xml`) over each `.fdi` file produces a
//! linear record stream directly into the growing blob buffer. Value
//! strings are interned in a `HashMap<String, (offset, len)>` "string
//! pool": the first record needing a given value owns the bytes
//! (written immediately after its key, still inside its own record
//! footprint); every later record with an equal value just points at
//! that earlier offset. A record with no value points at the header's
//! fixed 4-byte empty-string sentinel (spec.md §6).

use std::{
    collections::HashMap,
    fs,
    io::BufReader,
    path::{Path, PathBuf},
};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::{
    cache::format::{
        align, MatchOp, MergeType, Phase, RuleKind, HDR_OFF_EMPTY_STRING, HDR_OFF_INFORMATION,
        HDR_OFF_POLICY, HDR_OFF_PREPROBE, HDR_OFF_TOTAL_SIZE, HEADER_SIZE, MAX_NESTING_DEPTH,
        RECORD_FIXED_FIELDS,
    },
    result::{CoreError, HalError, HalResult},
};

/// The result of compiling a source tree: the packed bytes, plus every
/// file elided for being malformed (spec.md §4.3 failure policy).
pub struct CompiledCache {
    /// The packed, little-endian cache blob.
    pub bytes: Vec<u8>,
    /// FDI files skipped due to a parse error, in the order they were
    /// encountered.
    pub skipped_files: Vec<PathBuf>,
}

impl CompiledCache {
    /// The compiler CLI exit code this result maps to (spec.md §6):
    /// `0` if every file compiled, `2` if some were skipped. A fatal
    /// (`1`) exit belongs to the I/O-error path, which surfaces as
    /// `Err` from [`compile_source`] rather than as a `CompiledCache`.
    pub fn exit_code(&self) -> i32 {
        if self.skipped_files.is_empty() {
            0
        } else {
            2
        }
    }
}

type StringPool = HashMap<String, (u32, u32)>;

/// Compiles the three FDI source directories into a packed cache blob.
/// A malformed file is logged and elided; compilation continues with
/// the rest of the tree (spec.md §4.3).
pub fn compile_source(
    preprobe_dir: &Path,
    information_dir: &Path,
    policy_dir: &Path,
) -> HalResult<CompiledCache> {
    let mut buf = vec![0u8; HEADER_SIZE as usize];
    let mut pool: StringPool = StringPool::new();
    pool.insert(String::new(), (HDR_OFF_EMPTY_STRING as u32, 1));

    let mut skipped = Vec::new();
    let mut region_starts = [0u32; 3];
    let phases = [
        (Phase::Preprobe, preprobe_dir),
        (Phase::Information, information_dir),
        (Phase::Policy, policy_dir),
    ];

    for (i, (phase, dir)) in phases.into_iter().enumerate() {
        region_starts[i] = buf.len() as u32;
        for file in collect_fdi_files(dir)? {
            let buf_snapshot = buf.len();
            let pool_keys_before: Vec<String> = pool.keys().cloned().collect();
            match compile_file(&file, &mut buf, &mut pool) {
                Ok(()) => {
                    log::debug!("compiled {:?} rules from {}", phase, file.display());
                }
                Err(err) => {
                    log::error!("skipping malformed FDI file {}: {}", file.display(), err);
                    buf.truncate(buf_snapshot);
                    pool.retain(|k, _| pool_keys_before.contains(k) || k.is_empty());
                    skipped.push(file);
                }
            }
        }
    }

    let total_size = buf.len() as u32;
    buf[HDR_OFF_PREPROBE..HDR_OFF_PREPROBE + 4].copy_from_slice(&region_starts[0].to_le_bytes());
    buf[HDR_OFF_INFORMATION..HDR_OFF_INFORMATION + 4].copy_from_slice(&region_starts[1].to_le_bytes());
    buf[HDR_OFF_POLICY..HDR_OFF_POLICY + 4].copy_from_slice(&region_starts[2].to_le_bytes());
    buf[HDR_OFF_TOTAL_SIZE..HDR_OFF_TOTAL_SIZE + 4].copy_from_slice(&total_size.to_le_bytes());

    Ok(CompiledCache {
        bytes: buf,
        skipped_files: skipped,
    })
}

/// Compiles `preprobe_dir`/`information_dir`/`policy_dir` and writes the
/// result to `out_path` via a temporary sibling file and an atomic
/// rename (spec.md §4.3: `<cache>~` then renamed over the target).
pub fn compile_to_path(
    preprobe_dir: &Path,
    information_dir: &Path,
    policy_dir: &Path,
    out_path: &Path,
) -> HalResult<CompiledCache> {
    let result = compile_source(preprobe_dir, information_dir, policy_dir)?;
    let tmp_path = {
        let mut s = out_path.as_os_str().to_owned();
        s.push("~");
        PathBuf::from(s)
    };
    fs::write(&tmp_path, &result.bytes)?;
    fs::rename(&tmp_path, out_path)?;
    Ok(result)
}

fn collect_fdi_files(dir: &Path) -> HalResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_fdi_files_into(dir, &mut out)?;
    // Reverse alphabetical order per directory (spec.md §4.3, §9: this
    // is the observed, intentional behavior — later-numbered override
    // files win).
    out.sort_by(|a, b| b.cmp(a));
    Ok(out)
}

fn collect_fdi_files_into(dir: &Path, out: &mut Vec<PathBuf>) -> HalResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if name.starts_with('.') {
                continue;
            }
            collect_fdi_files_into(&path, out)?;
        } else if name.ends_with(".fdi") {
            out.push(path);
        }
    }
    Ok(())
}

enum Frame {
    /// A `<deviceinfo>`/`<device>` structural wrapper, or any unknown
    /// element: carries no record.
    Ignored,
    /// A `<match>` block: patch `jump_position` at `record_offset + 4`
    /// once its `</match>` is seen.
    Match { record_offset: u32 },
    /// A `<spawn>` block: same backpatch target, used by the evaluator
    /// to know where the nested, spawned-device-targeted block ends.
    Spawn { record_offset: u32 },
    /// A leaf element accumulating character data until its closing
    /// tag: `<merge>`/`<append>`/`<prepend>`/`<addset>`/`<remove>`.
    Leaf {
        rtype: RuleKind,
        type_merge: MergeType,
        key: String,
        text: String,
    },
}

fn compile_file(path: &Path, buf: &mut Vec<u8>, pool: &mut StringPool) -> HalResult<()> {
    let file = fs::File::open(path)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.trim_text(true);

    let mut xml_buf = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut xml_buf)
            .map_err(|err| CoreError::XmlSyntax(format!("{}: {}", path.display(), err)))?;
        match event {
            Event::Eof => break,
            Event::Start(e) => start_element(&e, buf, pool, &mut stack)?,
            Event::Empty(e) => {
                start_element(&e, buf, pool, &mut stack)?;
                end_element(buf, pool, &mut stack)?;
            }
            Event::End(_) => end_element(buf, pool, &mut stack)?,
            Event::Text(text) => {
                if let Some(Frame::Leaf { text: acc, .. }) = stack.last_mut() {
                    let decoded = text
                        .unescape()
                        .map_err(|err| CoreError::XmlSyntax(err.to_string()))?;
                    acc.push_str(&decoded);
                }
            }
            _ => {}
        }
        xml_buf.clear();
    }

    if !stack.is_empty() {
        return Err(HalError::Core(CoreError::XmlSyntax(format!(
            "{}: unclosed element(s) at end of file",
            path.display()
        ))));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    emit_record(buf, pool, RuleKind::Eof, 0, 0, "", &file_name);
    Ok(())
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> HalResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CoreError::XmlSyntax(err.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| CoreError::XmlSyntax(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn match_operator_attr(e: &BytesStart<'_>) -> HalResult<Option<(MatchOp, String)>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CoreError::XmlSyntax(err.to_string()))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if name == "key" {
            continue;
        }
        if let Some(op) = MatchOp::from_attr_name(&name) {
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            return Ok(Some((op, value)));
        }
    }
    Ok(None)
}

fn start_element(
    e: &BytesStart<'_>,
    buf: &mut Vec<u8>,
    pool: &mut StringPool,
    stack: &mut Vec<Frame>,
) -> HalResult<()> {
    if stack.len() >= MAX_NESTING_DEPTH {
        return Err(HalError::Core(CoreError::NestingTooDeep));
    }
    let name = tag_name(e);
    let key = attr_value(e, "key")?.unwrap_or_default();

    let frame = match name.as_str() {
        "match" => {
            let (op, rhs) = match_operator_attr(e)?.ok_or_else(|| {
                HalError::Core(CoreError::XmlSyntax("<match> missing operator attribute".to_string()))
            })?;
            let offset = emit_record(buf, pool, RuleKind::Match, op as u32, 0, &key, &rhs);
            Frame::Match { record_offset: offset }
        }
        "spawn" => {
            let udi = attr_value(e, "udi")?.unwrap_or_default();
            let offset = emit_record(buf, pool, RuleKind::Spawn, 0, 0, "", &udi);
            Frame::Spawn { record_offset: offset }
        }
        "remove" if attr_value(e, "type")?.is_none() => {
            // An untyped `<remove key="x"/>` is unconditional property
            // removal, not a list-element removal; no value to read.
            Frame::Leaf {
                rtype: RuleKind::Remove,
                type_merge: MergeType::None,
                key,
                text: String::new(),
            }
        }
        "merge" | "append" | "prepend" | "addset" | "remove" => {
            let rtype = leaf_rule_kind(&name);
            let type_attr = attr_value(e, "type")?.unwrap_or_default();
            let type_merge = MergeType::from_attr_value(&type_attr).ok_or_else(|| {
                HalError::Core(CoreError::XmlSyntax(format!("unknown merge type {:?}", type_attr)))
            })?;
            Frame::Leaf {
                rtype,
                type_merge,
                key,
                text: String::new(),
            }
        }
        "clear" => {
            emit_record(buf, pool, RuleKind::Clear, 0, 0, &key, "");
            Frame::Ignored
        }
        _ => Frame::Ignored,
    };
    stack.push(frame);
    Ok(())
}

fn end_element(buf: &mut Vec<u8>, pool: &mut StringPool, stack: &mut Vec<Frame>) -> HalResult<()> {
    let frame = stack
        .pop()
        .ok_or_else(|| HalError::Core(CoreError::XmlSyntax("unbalanced close tag".to_string())))?;
    match frame {
        Frame::Match { record_offset } | Frame::Spawn { record_offset } => {
            let next = buf.len() as u32;
            buf[record_offset as usize + 4..record_offset as usize + 8]
                .copy_from_slice(&next.to_le_bytes());
        }
        Frame::Leaf { rtype, type_merge, key, text } => {
            emit_record(buf, pool, rtype, 0, type_merge as u32, &key, &text);
        }
        Frame::Ignored => {}
    }
    Ok(())
}

fn leaf_rule_kind(name: &str) -> RuleKind {
    match name {
        "merge" => RuleKind::Merge,
        "append" => RuleKind::Append,
        "prepend" => RuleKind::Prepend,
        "addset" => RuleKind::Addset,
        "remove" => RuleKind::Remove,
        _ => unreachable!("leaf_rule_kind called with non-leaf tag"),
    }
}

/// Appends one record to `buf`, resolving `value`'s position via the
/// string pool (see module docs), and returns the record's own offset.
fn emit_record(
    buf: &mut Vec<u8>,
    pool: &mut StringPool,
    rtype: RuleKind,
    type_match: u32,
    type_merge: u32,
    key: &str,
    value: &str,
) -> u32 {
    let record_offset = buf.len() as u32;
    let key_len = (key.len() + 1) as u32;

    let (value_offset, value_len, owns_value) = if value.is_empty() {
        (HDR_OFF_EMPTY_STRING as u32, 1u32, false)
    } else if let Some(&(off, len)) = pool.get(value) {
        (off, len, false)
    } else {
        let off = record_offset + RECORD_FIXED_FIELDS + align(key_len);
        let len = (value.len() + 1) as u32;
        pool.insert(value.to_string(), (off, len));
        (off, len, true)
    };

    // Placeholder rule_size, patched below.
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // jump_position, patched by caller if needed
    buf.extend_from_slice(&(rtype as u32).to_le_bytes());
    buf.extend_from_slice(&type_match.to_le_bytes());
    buf.extend_from_slice(&type_merge.to_le_bytes());
    buf.extend_from_slice(&value_offset.to_le_bytes());
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(&key_len.to_le_bytes());

    write_padded_cstr(buf, key);
    if owns_value {
        write_padded_cstr(buf, value);
    }

    let rule_size = buf.len() as u32 - record_offset;
    buf[record_offset as usize..record_offset as usize + 4].copy_from_slice(&rule_size.to_le_bytes());
    record_offset
}

fn write_padded_cstr(buf: &mut Vec<u8>, s: &str) {
    let start = buf.len();
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    let written = (buf.len() - start) as u32;
    let padded = align(written);
    buf.resize(start + padded as usize, 0);
}
