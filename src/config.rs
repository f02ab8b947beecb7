// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Source-directory and cache-path configuration, read from the
//! environment the way the teacher reads `DM_DEV_DIR`-style overrides:
//! defaults are associated constants, overridden by `std::env::var` when
//! set, no separate config file format.

use std::path::PathBuf;

use lazy_static::lazy_static;

const DEFAULT_PREPROBE_DIR: &str = "/usr/share/hal/fdi/preprobe";
const DEFAULT_INFORMATION_DIR: &str = "/usr/share/hal/fdi/information";
const DEFAULT_POLICY_DIR: &str = "/usr/share/hal/fdi/policy";
const DEFAULT_CACHE_NAME: &str = "/var/cache/hal/fdi-cache";

lazy_static! {
    static ref DEFAULT_PREPROBE_PATH: PathBuf = PathBuf::from(DEFAULT_PREPROBE_DIR);
    static ref DEFAULT_INFORMATION_PATH: PathBuf = PathBuf::from(DEFAULT_INFORMATION_DIR);
    static ref DEFAULT_POLICY_PATH: PathBuf = PathBuf::from(DEFAULT_POLICY_DIR);
    static ref DEFAULT_CACHE_PATH: PathBuf = PathBuf::from(DEFAULT_CACHE_NAME);
}

fn env_path_or(var: &str, default: &PathBuf) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| default.clone())
}

/// The three FDI source directories (spec.md §4.3), each overridable by
/// its own environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdiSourceConfig {
    pub preprobe_dir: PathBuf,
    pub information_dir: PathBuf,
    pub policy_dir: PathBuf,
}

impl FdiSourceConfig {
    pub const ENV_PREPROBE: &'static str = "HAL_FDI_SOURCE_PREPROBE";
    pub const ENV_INFORMATION: &'static str = "HAL_FDI_SOURCE_INFORMATION";
    pub const ENV_POLICY: &'static str = "HAL_FDI_SOURCE_POLICY";

    /// Reads overrides from the environment, falling back to the
    /// compiled-in defaults.
    pub fn from_env() -> FdiSourceConfig {
        FdiSourceConfig {
            preprobe_dir: env_path_or(Self::ENV_PREPROBE, &DEFAULT_PREPROBE_PATH),
            information_dir: env_path_or(Self::ENV_INFORMATION, &DEFAULT_INFORMATION_PATH),
            policy_dir: env_path_or(Self::ENV_POLICY, &DEFAULT_POLICY_PATH),
        }
    }
}

impl Default for FdiSourceConfig {
    fn default() -> FdiSourceConfig {
        FdiSourceConfig {
            preprobe_dir: DEFAULT_PREPROBE_PATH.clone(),
            information_dir: DEFAULT_INFORMATION_PATH.clone(),
            policy_dir: DEFAULT_POLICY_PATH.clone(),
        }
    }
}

/// The compiled cache's path, overridable by `HAL_FDI_CACHE_NAME`
/// (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_path: PathBuf,
}

impl CacheConfig {
    pub const ENV_CACHE_NAME: &'static str = "HAL_FDI_CACHE_NAME";

    pub fn from_env() -> CacheConfig {
        CacheConfig {
            cache_path: env_path_or(Self::ENV_CACHE_NAME, &DEFAULT_CACHE_PATH),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            cache_path: DEFAULT_CACHE_PATH.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    lazy_static! {
        static ref ENV_LOCK: Mutex<()> = Mutex::new(());
    }

    #[test]
    fn test_defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(FdiSourceConfig::ENV_PREPROBE);
        std::env::remove_var(FdiSourceConfig::ENV_INFORMATION);
        std::env::remove_var(FdiSourceConfig::ENV_POLICY);
        let cfg = FdiSourceConfig::from_env();
        assert_eq!(cfg, FdiSourceConfig::default());
    }

    #[test]
    fn test_env_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(FdiSourceConfig::ENV_PREPROBE, "/tmp/preprobe");
        let cfg = FdiSourceConfig::from_env();
        assert_eq!(cfg.preprobe_dir, PathBuf::from("/tmp/preprobe"));
        std::env::remove_var(FdiSourceConfig::ENV_PREPROBE);
    }

    #[test]
    fn test_cache_config_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(CacheConfig::ENV_CACHE_NAME, "/tmp/hald.cache");
        let cfg = CacheConfig::from_env();
        assert_eq!(cfg.cache_path, PathBuf::from("/tmp/hald.cache"));
        std::env::remove_var(CacheConfig::ENV_CACHE_NAME);
    }
}
