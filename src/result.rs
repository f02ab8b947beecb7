// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Crate-wide error type.
//!
//! Mirrors the two-level shape used throughout the core: a `Core` face
//! for I/O/XML/lock faults that never reach an IPC caller, and a `Hal`
//! face carrying the §7 error taxonomy that is surfaced on the bus.

use std::{error::Error as StdError, fmt, io};

/// The kind of failure surfaced to an IPC caller. Names match spec.md §7
/// exactly; do not rename these without updating the bus adapter's
/// method-error mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// UDI does not resolve in either the TDL or the GDL.
    NoSuchDevice,
    /// Key not present on the device.
    NoSuchProperty,
    /// Set operation on an existing property of a different type.
    TypeMismatch,
    /// Commit target UDI already taken by a live GDL device.
    UdiInUse,
    /// Malformed IPC request.
    SyntaxError,
    /// Malformed FDI file; compilation continues without it.
    RuleCompileFailure,
    /// Coherency check failed; regeneration was attempted.
    CacheStale,
    /// External helper process exited non-zero.
    HelperFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NoSuchDevice => "NoSuchDevice",
            ErrorKind::NoSuchProperty => "NoSuchProperty",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::UdiInUse => "UdiInUse",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::RuleCompileFailure => "RuleCompileFailure",
            ErrorKind::CacheStale => "CacheStale",
            ErrorKind::HelperFailure => "HelperFailure",
        };
        write!(f, "{}", s)
    }
}

/// Lower-level faults that are logged and wrapped, never surfaced
/// directly to an IPC caller under their own name.
#[derive(Debug)]
pub enum CoreError {
    /// Wraps a `std::io::Error` encountered while reading/writing the
    /// cache, an FDI source tree, or the mount-state file.
    Io(io::Error),
    /// The compiled cache is truncated, misaligned, or has an
    /// out-of-bounds offset.
    MalformedCache(String),
    /// The FDI XML could not be parsed.
    XmlSyntax(String),
    /// A regeneration or lock acquisition could not complete in time.
    Timeout(String),
    /// Depth of nested `<match>`/`<merge>` exceeded the compiler's bound.
    NestingTooDeep,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(err) => write!(f, "I/O error: {}", err),
            CoreError::MalformedCache(msg) => write!(f, "malformed rule cache: {}", msg),
            CoreError::XmlSyntax(msg) => write!(f, "FDI syntax error: {}", msg),
            CoreError::Timeout(msg) => write!(f, "timed out: {}", msg),
            CoreError::NestingTooDeep => write!(f, "match/merge nesting exceeds compiler bound"),
        }
    }
}

impl StdError for CoreError {}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> CoreError {
        CoreError::Io(err)
    }
}

/// The crate-wide error type. Analogous to `devicemapper-rs`'s `DmError`.
#[derive(Debug)]
pub enum HalError {
    /// A lower-level fault, not part of the §7 IPC taxonomy.
    Core(CoreError),
    /// A §7 IPC-surfaced error, with a human-readable detail message.
    Hal(ErrorKind, String),
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::Core(err) => write!(f, "{}", err),
            HalError::Hal(kind, msg) => write!(f, "{}: {}", kind, msg),
        }
    }
}

impl StdError for HalError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            HalError::Core(err) => Some(err),
            HalError::Hal(..) => None,
        }
    }
}

impl From<io::Error> for HalError {
    fn from(err: io::Error) -> HalError {
        HalError::Core(CoreError::Io(err))
    }
}

impl From<CoreError> for HalError {
    fn from(err: CoreError) -> HalError {
        HalError::Core(err)
    }
}

impl HalError {
    /// The §7 `ErrorKind` this error maps to on the bus, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            HalError::Hal(kind, _) => Some(*kind),
            HalError::Core(_) => None,
        }
    }
}

/// Crate-wide result alias, analogous to `devicemapper-rs`'s `DmResult`.
pub type HalResult<T> = Result<T, HalError>;
