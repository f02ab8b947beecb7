// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binary layout of the compiled rule cache (spec.md §3, §6).
//!
//! Little-endian, 32-bit-aligned records (spec.md §9: tightened from the
//! original's host-endian layout so a cache is portable across
//! identical architectures regardless of endianness flags).

/// Alignment, in bytes, every record and the header regions are padded
/// to.
pub const RECORD_ALIGN: u32 = 4;

/// Byte size of the fixed header (spec.md §6).
pub const HEADER_SIZE: u32 = 20;

/// Byte offset of `fdi_rules_preprobe` in the header.
pub const HDR_OFF_PREPROBE: usize = 0;
/// Byte offset of `fdi_rules_information` in the header.
pub const HDR_OFF_INFORMATION: usize = 4;
/// Byte offset of `fdi_rules_policy` in the header.
pub const HDR_OFF_POLICY: usize = 8;
/// Byte offset of `all_rules_size` in the header.
pub const HDR_OFF_TOTAL_SIZE: usize = 12;
/// Byte offset of the 4-byte empty string sentinel in the header.
pub const HDR_OFF_EMPTY_STRING: usize = 16;

/// Maximum nesting depth the compiler will accept for `<match>`/
/// `<merge>`/`<spawn>` blocks (spec.md §4.3: "MUST NOT exceed a fixed
/// bound (≥ 64)").
pub const MAX_NESTING_DEPTH: usize = 64;

/// One of the three rule regions a device is evaluated against in
/// sequence (spec.md GLOSSARY "Phase").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Runs first, before any bus-specific probing.
    Preprobe,
    /// Runs after preprobing; the bulk of vendor/quirk decoration.
    Information,
    /// Runs last; governs user-policy-sensitive properties.
    Policy,
}

impl Phase {
    /// The header offset holding this phase's region start.
    pub fn header_offset(self) -> usize {
        match self {
            Phase::Preprobe => HDR_OFF_PREPROBE,
            Phase::Information => HDR_OFF_INFORMATION,
            Phase::Policy => HDR_OFF_POLICY,
        }
    }

    /// The directory name conventionally holding this phase's FDI
    /// sources (`preprobe`, `information`, `policy`).
    pub fn dir_name(self) -> &'static str {
        match self {
            Phase::Preprobe => "preprobe",
            Phase::Information => "information",
            Phase::Policy => "policy",
        }
    }

    /// All three phases, in evaluation order.
    pub fn all() -> [Phase; 3] {
        [Phase::Preprobe, Phase::Information, Phase::Policy]
    }
}

/// The kind of a compiled rule record (spec.md §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuleKind {
    /// Reserved; never written by the compiler.
    Unknown = 0,
    /// `<match>`: conditional block, may skip via `jump_position`.
    Match = 1,
    /// `<merge>`: set/replace a scalar or list property.
    Merge = 2,
    /// `<append>`: append to a list property.
    Append = 3,
    /// `<prepend>`: prepend to a list property.
    Prepend = 4,
    /// `<remove>`: remove a property, or a list element.
    Remove = 5,
    /// `<clear>`: remove a property unconditionally.
    Clear = 6,
    /// `<spawn>`: declare a secondary device; nested rules target it.
    Spawn = 7,
    /// End-of-file sentinel; value carries the source filename.
    Eof = 8,
    /// `<addset>`: idempotent list append.
    Addset = 9,
}

impl RuleKind {
    /// Decodes a `rtype` value read from a compiled record.
    pub fn from_u32(v: u32) -> Option<RuleKind> {
        Some(match v {
            0 => RuleKind::Unknown,
            1 => RuleKind::Match,
            2 => RuleKind::Merge,
            3 => RuleKind::Append,
            4 => RuleKind::Prepend,
            5 => RuleKind::Remove,
            6 => RuleKind::Clear,
            7 => RuleKind::Spawn,
            8 => RuleKind::Eof,
            9 => RuleKind::Addset,
            _ => return None,
        })
    }
}

/// A `<match>` operator (spec.md §3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MatchOp {
    /// Reserved.
    None = 0,
    String,
    Int,
    Uint64,
    Bool,
    Double,
    Exists,
    Empty,
    IsAscii,
    IsAbsolutePath,
    Contains,
    ContainsNcase,
    Prefix,
    PrefixNcase,
    Suffix,
    SuffixNcase,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    CompareNe,
    SiblingContains,
    ContainsNot,
    ContainsOutof,
    IntOutof,
    PrefixOutof,
    StringOutof,
}

impl MatchOp {
    /// Decodes a `type_match` value.
    pub fn from_u32(v: u32) -> Option<MatchOp> {
        use MatchOp::*;
        const TABLE: &[MatchOp] = &[
            None, String, Int, Uint64, Bool, Double, Exists, Empty, IsAscii, IsAbsolutePath,
            Contains, ContainsNcase, Prefix, PrefixNcase, Suffix, SuffixNcase, CompareLt,
            CompareLe, CompareGt, CompareGe, CompareNe, SiblingContains, ContainsNot,
            ContainsOutof, IntOutof, PrefixOutof, StringOutof,
        ];
        TABLE.get(v as usize).copied()
    }

    /// Parses the XML attribute name used for this operator in an FDI
    /// `<match>` element (e.g. `OP="string"` -> the attribute is
    /// literally named `string`).
    pub fn from_attr_name(name: &str) -> Option<MatchOp> {
        Some(match name {
            "string" => MatchOp::String,
            "int" => MatchOp::Int,
            "uint64" => MatchOp::Uint64,
            "bool" => MatchOp::Bool,
            "double" => MatchOp::Double,
            "exists" => MatchOp::Exists,
            "empty" => MatchOp::Empty,
            "is_ascii" => MatchOp::IsAscii,
            "is_absolute_path" => MatchOp::IsAbsolutePath,
            "contains" => MatchOp::Contains,
            "contains_ncase" => MatchOp::ContainsNcase,
            "prefix" => MatchOp::Prefix,
            "prefix_ncase" => MatchOp::PrefixNcase,
            "suffix" => MatchOp::Suffix,
            "suffix_ncase" => MatchOp::SuffixNcase,
            "compare_lt" => MatchOp::CompareLt,
            "compare_le" => MatchOp::CompareLe,
            "compare_gt" => MatchOp::CompareGt,
            "compare_ge" => MatchOp::CompareGe,
            "compare_ne" => MatchOp::CompareNe,
            "sibling_contains" => MatchOp::SiblingContains,
            "contains_not" => MatchOp::ContainsNot,
            "contains_outof" => MatchOp::ContainsOutof,
            "int_outof" => MatchOp::IntOutof,
            "prefix_outof" => MatchOp::PrefixOutof,
            "string_outof" => MatchOp::StringOutof,
            _ => return None,
        })
    }
}

/// A merge type (spec.md §3 list; `remove` doubles as both a merge type
/// here and the `<remove>` rule kind, per spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MergeType {
    /// Reserved.
    None = 0,
    Str,
    Bool,
    Int,
    Uint64,
    Double,
    Strlist,
    CopyProperty,
    Remove,
}

impl MergeType {
    /// Decodes a `type_merge` value.
    pub fn from_u32(v: u32) -> Option<MergeType> {
        use MergeType::*;
        const TABLE: &[MergeType] = &[None, Str, Bool, Int, Uint64, Double, Strlist, CopyProperty, Remove];
        TABLE.get(v as usize).copied()
    }

    /// Parses the FDI `type="…"` attribute value.
    pub fn from_attr_value(v: &str) -> Option<MergeType> {
        Some(match v {
            "string" => MergeType::Str,
            "bool" => MergeType::Bool,
            "int" => MergeType::Int,
            "uint64" => MergeType::Uint64,
            "double" => MergeType::Double,
            "strlist" => MergeType::Strlist,
            "copy_property" => MergeType::CopyProperty,
            "remove" => MergeType::Remove,
            _ => return None,
        })
    }
}

/// Rounds `n` up to the next multiple of `RECORD_ALIGN`.
pub fn align(n: u32) -> u32 {
    (n + RECORD_ALIGN - 1) / RECORD_ALIGN * RECORD_ALIGN
}

/// Fixed byte size of a record's field block, excluding the
/// variable-length, NUL-terminated `key` bytes (spec.md §6):
/// `rule_size, jump_position, rtype, type_match, type_merge,
/// value_offset, value_len, key_len` — eight `u32`s.
pub const RECORD_FIXED_FIELDS: u32 = 8 * 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 4);
        assert_eq!(align(4), 4);
        assert_eq!(align(5), 8);
    }

    #[test]
    fn test_rule_kind_round_trip() {
        for v in 0..=9u32 {
            let kind = RuleKind::from_u32(v).unwrap();
            assert_eq!(kind as u32, v);
        }
        assert!(RuleKind::from_u32(10).is_none());
    }

    #[test]
    fn test_match_op_attr_name_parse() {
        assert_eq!(MatchOp::from_attr_name("string"), Some(MatchOp::String));
        assert_eq!(MatchOp::from_attr_name("contains_ncase"), Some(MatchOp::ContainsNcase));
        assert_eq!(MatchOp::from_attr_name("bogus"), None);
    }

    #[test]
    fn test_merge_type_attr_value_parse() {
        assert_eq!(MergeType::from_attr_value("strlist"), Some(MergeType::Strlist));
        assert_eq!(MergeType::from_attr_value("bogus"), None);
    }
}
