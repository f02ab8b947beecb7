// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device object store and property-overlay rule engine for a hardware
//! abstraction daemon.
//!
//! # Overview
//!
//! A backend (a Linux `sysfs`/`udev` walk, or anything else that can
//! hand over `(sysfs_path, attributes)` tuples) pushes newly-discovered
//! devices into a [`core::store::DeviceStore`], which holds them first
//! in a temporary list, then — once a stable Unique Device Identifier
//! has been assigned by [`core::rename::rename_and_merge`] — in the
//! global device list that the rest of the system queries.
//!
//! Between those two states, every device is decorated by the
//! [`eval`] rule engine, walking a compiled cache of FDI rules
//! ([`cache`]) across three phases (`preprobe`, `information`,
//! `policy`). The cache itself is kept fresh against its FDI source
//! trees by [`cache::coherency::CacheController`].
//!
//! [`notify`] turns store callbacks into the bus event set an IPC layer
//! (not part of this crate) would deliver; [`mtab`] tracks what helper
//! sub-processes have mounted where; [`daemon::Daemon`] is the single
//! owner threading all of the above through one cooperative event loop.
//!
//! # Usage
//!
//! A consumer binary calls [`logging::init()`] once at startup, builds
//! a [`config::FdiSourceConfig`] and [`config::CacheConfig`] (reading
//! environment overrides), constructs a [`daemon::Daemon`] with its own
//! [`notify::BusSink`] implementation, and drives discovery through
//! [`daemon::Daemon::discover_device`] /
//! [`daemon::Daemon::rename_and_merge`], calling
//! [`daemon::Daemon::tick`] at each I/O-readiness suspension point.

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod core;
pub mod daemon;
pub mod eval;
pub mod logging;
pub mod mtab;
pub mod notify;
pub mod result;

pub use crate::{
    core::{
        device::{Device, Property, Value},
        store::{DeviceKey, DeviceStore},
        types::{Namespace, Udi, UdiBuf},
    },
    daemon::Daemon,
    notify::{BusAdapter, BusSink, Event},
    result::{ErrorKind, HalError, HalResult},
};
