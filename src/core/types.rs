// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Validated identifier types.
//!
//! `Udi`/`UdiBuf` are the borrowed/owned pair for a Unique Device
//! Identifier, following the same shape as `devicemapper-rs`'s
//! `DmName`/`DmNameBuf`: a `#[repr(transparent)]` borrowed wrapper with
//! a validating constructor, plus an owned `String`-backed buffer that
//! derefs to it.

use std::{borrow::Borrow, fmt, ops::Deref};

use crate::result::{ErrorKind, HalError, HalResult};

fn is_udi_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'/' | b'.' | b'-')
}

fn validate_udi(s: &str) -> HalResult<()> {
    if s.is_empty() {
        return Err(HalError::Hal(
            ErrorKind::SyntaxError,
            "UDI must not be empty".to_string(),
        ));
    }
    if let Some(bad) = s.bytes().find(|&b| !is_udi_byte(b)) {
        return Err(HalError::Hal(
            ErrorKind::SyntaxError,
            format!("UDI {:?} contains disallowed byte {:?}", s, bad as char),
        ));
    }
    Ok(())
}

/// A borrowed, validated Unique Device Identifier.
///
/// UDIs are ASCII strings matching `[A-Za-z0-9_/.-]+` (spec.md §6).
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Udi(str);

impl Udi {
    /// Validates `s` and returns a borrowed `Udi` over it.
    pub fn new(s: &str) -> HalResult<&Udi> {
        validate_udi(s)?;
        Ok(unsafe { &*(s as *const str as *const Udi) })
    }

    /// The underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Udi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl ToOwned for Udi {
    type Owned = UdiBuf;
    fn to_owned(&self) -> UdiBuf {
        UdiBuf(self.0.to_owned())
    }
}

/// An owned, validated Unique Device Identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UdiBuf(String);

impl UdiBuf {
    /// Validates `s` and takes ownership of it.
    pub fn new(s: impl Into<String>) -> HalResult<UdiBuf> {
        let s = s.into();
        validate_udi(&s)?;
        Ok(UdiBuf(s))
    }

    /// Synthesizes a temporary UDI from a monotonic counter, per spec.md
    /// §4.1: `/org/freedesktop/Hal/devices/temp/<n>`.
    pub fn temporary(counter: u64) -> UdiBuf {
        UdiBuf(format!(
            "/org/freedesktop/Hal/devices/temp/{}",
            counter
        ))
    }
}

impl Deref for UdiBuf {
    type Target = Udi;
    fn deref(&self) -> &Udi {
        Udi::new(&self.0).expect("UdiBuf invariant: contents were validated at construction")
    }
}

impl Borrow<Udi> for UdiBuf {
    fn borrow(&self) -> &Udi {
        self
    }
}

impl fmt::Display for UdiBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&Udi> for UdiBuf {
    fn from(udi: &Udi) -> UdiBuf {
        udi.to_owned()
    }
}

/// A rename-and-merge namespace (spec.md §4.5), e.g. `usb`, `pci`: the
/// property-key prefix used by `DeviceStore::matches` to decide whether
/// two discoveries name the same physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace<'a>(pub &'a str);

impl<'a> fmt::Display for Namespace<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
