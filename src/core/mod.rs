// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device object model: identifiers, properties, the store, and the
//! rename-and-merge routine (spec.md §3, §4.1, §4.2, §4.5).

pub mod device;
pub mod rename;
pub mod store;
pub mod types;
