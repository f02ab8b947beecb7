// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The packed rule cache: format, compiler, zero-copy reader, and the
//! coherency controller that keeps it fresh (spec.md §4.3, §4.7, §6).

pub mod coherency;
pub mod compiler;
pub mod format;
pub mod reader;
