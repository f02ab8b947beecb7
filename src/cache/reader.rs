// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Zero-copy, bounds-checked view over a compiled rule cache.
//!
//! Replaces the original's raw pointer arithmetic over a memory map
//! (spec.md §9 "Packed pointer-based cache") with a typed view over a
//! borrowed byte slice: every offset is checked against the slice
//! length before use, so a truncated or corrupt cache produces a
//! `HalError`, never undefined behavior.

use crate::{
    cache::format::{
        self, MatchOp, MergeType, Phase, RuleKind, HDR_OFF_INFORMATION, HDR_OFF_POLICY,
        HDR_OFF_PREPROBE, HDR_OFF_TOTAL_SIZE, HEADER_SIZE,
    },
    result::{CoreError, HalError, HalResult},
};

fn malformed(msg: impl Into<String>) -> HalError {
    HalError::Core(CoreError::MalformedCache(msg.into()))
}

fn read_u32(bytes: &[u8], offset: usize) -> HalResult<u32> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| malformed("u32 offset overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or_else(|| malformed(format!("u32 read at {} out of bounds ({})", offset, bytes.len())))?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

fn read_cstr(bytes: &[u8], offset: usize, len: usize) -> HalResult<&str> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| malformed("string offset overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or_else(|| malformed(format!("string read at {} out of bounds", offset)))?;
    let without_nul = match slice.split_last() {
        Some((b'\0', rest)) => rest,
        _ => return Err(malformed("string field not NUL-terminated")),
    };
    std::str::from_utf8(without_nul).map_err(|e| malformed(format!("non-UTF8 string: {}", e)))
}

/// A decoded view of one compiled rule record (spec.md §3, §6).
#[derive(Debug, Clone)]
pub struct RecordView<'m> {
    /// This record's own byte offset within the cache.
    pub offset: u32,
    /// Bytes from the start of this record to the next.
    pub rule_size: u32,
    /// For `Match`: offset to skip to on failure. For `Spawn`: offset
    /// where the nested block (targeting the spawned device) ends.
    /// Zero otherwise.
    pub jump_position: u32,
    /// The record's rule kind.
    pub rtype: RuleKind,
    /// The match operator, if `rtype == Match`.
    pub type_match: Option<MatchOp>,
    /// The merge type, if `rtype` is a mutating kind.
    pub type_merge: Option<MergeType>,
    /// The record's key (property name), or the source filename for
    /// `Eof`.
    pub key: &'m str,
    /// The record's value string (RHS for `Match`, the value to merge
    /// for mutating kinds).
    pub value: &'m str,
}

impl<'m> RecordView<'m> {
    /// The offset of the record immediately following this one.
    pub fn next_offset(&self) -> u32 {
        self.offset + self.rule_size
    }
}

/// A validated, read-only view over a compiled cache's bytes, typically
/// backed by a `memmap2::Mmap` (spec.md §5: "shared read-only between
/// the daemon and any auxiliary tool").
pub struct RuleCache<'m> {
    bytes: &'m [u8],
}

impl<'m> RuleCache<'m> {
    /// Validates the header and wraps `bytes`.
    pub fn from_bytes(bytes: &'m [u8]) -> HalResult<RuleCache<'m>> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(malformed("shorter than the fixed header"));
        }
        let total_size = read_u32(bytes, HDR_OFF_TOTAL_SIZE)?;
        if total_size as usize != bytes.len() {
            return Err(malformed(format!(
                "all_rules_size {} does not match blob length {}",
                total_size,
                bytes.len()
            )));
        }
        let cache = RuleCache { bytes };
        // Validate each phase's region start is in-bounds up front so
        // callers don't have to handle a bad header on first access.
        for phase in Phase::all() {
            let start = cache.region_start(phase)?;
            if (start as usize) > bytes.len() {
                return Err(malformed(format!(
                    "{:?} region start {} exceeds blob length",
                    phase, start
                )));
            }
        }
        Ok(cache)
    }

    /// The raw bytes backing this view.
    pub fn bytes(&self) -> &'m [u8] {
        self.bytes
    }

    /// The byte offset where `phase`'s region begins.
    pub fn region_start(&self, phase: Phase) -> HalResult<u32> {
        let off = match phase {
            Phase::Preprobe => HDR_OFF_PREPROBE,
            Phase::Information => HDR_OFF_INFORMATION,
            Phase::Policy => HDR_OFF_POLICY,
        };
        read_u32(self.bytes, off)
    }

    /// Reads the record at `offset`.
    pub fn read_record(&self, offset: u32) -> HalResult<RecordView<'m>> {
        let base = offset as usize;
        let rule_size = read_u32(self.bytes, base)?;
        let jump_position = read_u32(self.bytes, base + 4)?;
        let rtype_raw = read_u32(self.bytes, base + 8)?;
        let type_match_raw = read_u32(self.bytes, base + 12)?;
        let type_merge_raw = read_u32(self.bytes, base + 16)?;
        let value_offset = read_u32(self.bytes, base + 20)?;
        let value_len = read_u32(self.bytes, base + 24)?;
        let key_len = read_u32(self.bytes, base + 28)?;

        let rtype = RuleKind::from_u32(rtype_raw)
            .ok_or_else(|| malformed(format!("unknown rtype {}", rtype_raw)))?;
        let type_match = if type_match_raw == 0 {
            None
        } else {
            Some(MatchOp::from_u32(type_match_raw).ok_or_else(|| malformed("unknown type_match"))?)
        };
        let type_merge = if type_merge_raw == 0 {
            None
        } else {
            Some(MergeType::from_u32(type_merge_raw).ok_or_else(|| malformed("unknown type_merge"))?)
        };

        let key_start = base + format::RECORD_FIXED_FIELDS as usize;
        let key = read_cstr(self.bytes, key_start, key_len as usize)?;
        let value = read_cstr(self.bytes, value_offset as usize, value_len as usize)?;

        Ok(RecordView {
            offset,
            rule_size,
            jump_position,
            rtype,
            type_match,
            type_merge,
            key,
            value,
        })
    }

    /// The byte offset where `phase`'s region ends: the next phase's
    /// region start in layout order (preprobe, information, policy), or
    /// the end of the blob for the last phase. Relies on the compiler
    /// laying regions out in that fixed order (spec.md §6 header field
    /// order).
    pub fn region_end(&self, phase: Phase) -> HalResult<u32> {
        Ok(match phase {
            Phase::Preprobe => self.region_start(Phase::Information)?,
            Phase::Information => self.region_start(Phase::Policy)?,
            Phase::Policy => self.bytes.len() as u32,
        })
    }

    /// Iterates every record in `phase`'s region, in source order. A
    /// file boundary's `Eof` sentinel is yielded like any other record
    /// (for diagnostics) but does NOT stop iteration — rules compiled
    /// from the next file in the same region immediately follow it
    /// (spec.md §4.3).
    pub fn iter_region(&self, phase: Phase) -> HalResult<RegionIter<'m, '_>> {
        let start = self.region_start(phase)?;
        let end = self.region_end(phase)?;
        Ok(RegionIter {
            cache: self,
            offset: Some(start),
            end,
        })
    }
}

/// Iterator over a cache region's records.
pub struct RegionIter<'m, 'c> {
    cache: &'c RuleCache<'m>,
    offset: Option<u32>,
    end: u32,
}

impl<'m, 'c> Iterator for RegionIter<'m, 'c> {
    type Item = HalResult<RecordView<'m>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset?;
        if offset >= self.end {
            self.offset = None;
            return None;
        }
        match self.cache.read_record(offset) {
            Ok(record) => {
                let next = record.next_offset();
                self.offset = if next >= self.end { None } else { Some(next) };
                Some(Ok(record))
            }
            Err(err) => {
                self.offset = None;
                Some(Err(err))
            }
        }
    }
}
