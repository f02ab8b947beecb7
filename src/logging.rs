// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logging initialization. Every side-effecting module traces through
//! the `log` facade (cache regeneration, rule compilation, rename-and-merge,
//! mtab rewrite); this module is just the one-time `env_logger` wiring a
//! consumer binary calls at startup.

use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// `HALD_VERBOSE` set (to anything) selects `Debug`; otherwise the
/// default filter is `Info`, overridable as usual via `RUST_LOG`.
const ENV_VERBOSE: &str = "HALD_VERBOSE";

/// `HALD_USE_SYSLOG` set selects a long-format line (timestamp + target
/// + level) resembling a syslog line; unset keeps `env_logger`'s default
/// compact format. No actual syslog transport is wired up — that's an
/// IPC/transport concern out of scope here, same as the bus itself.
const ENV_USE_SYSLOG: &str = "HALD_USE_SYSLOG";

/// Initializes the global logger. Idempotent-safe to call at most once;
/// a second call is a programming error in the caller, matching
/// `env_logger::Builder::init`'s own panic-on-reinit behavior.
pub fn init() {
    let default_level = if std::env::var(ENV_VERBOSE).is_ok() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.target(Target::Stderr);

    if std::env::var(ENV_USE_SYSLOG).is_ok() {
        builder.format_timestamp_millis().format_module_path(true).format_level(true);
    }

    builder.init();
}
