// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Keeps the compiled rule cache fresh against its FDI source trees.
//!
//! Replaces the original's `SIGIO`-driven "dirty" flag (spec.md §9
//! "Signal-driven cache invalidation") with a `notify` file watcher
//! feeding a channel the event loop drains on each turn, and its
//! mtime-stamp comparison with the same idea expressed over
//! `std::fs::Metadata::modified()`. Regeneration itself reuses the
//! `retry` crate the way `core::dm::DM::ioctl` retries a flaky ioctl.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::mpsc::{channel, Receiver, TryRecvError},
    time::SystemTime,
};

use memmap2::Mmap;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use retry::{delay::Fixed, retry_with_index, Error as RetryError, OperationResult};

use crate::{
    cache::{compiler, reader::RuleCache},
    result::{CoreError, ErrorKind, HalError, HalResult},
};

const REGEN_RETRIES: usize = 3;
const REGEN_RETRY_DELAY_MS: u64 = 50;

/// Owns the three FDI source directories, the compiled cache's path,
/// its current memory map, and a recursive file watcher over the
/// source trees (spec.md §4.7).
pub struct CacheController {
    preprobe_dir: PathBuf,
    information_dir: PathBuf,
    policy_dir: PathBuf,
    cache_path: PathBuf,
    mmap: Option<Mmap>,
    regenerating: bool,
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<NotifyEvent>>,
}

impl CacheController {
    /// Builds a controller watching the three source trees and performs
    /// an initial `ensure_fresh` so the cache is ready to read.
    pub fn new(
        preprobe_dir: PathBuf,
        information_dir: PathBuf,
        policy_dir: PathBuf,
        cache_path: PathBuf,
    ) -> HalResult<CacheController> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(watch_err)?;
        for dir in [&preprobe_dir, &information_dir, &policy_dir] {
            if dir.is_dir() {
                watcher.watch(dir, RecursiveMode::Recursive).map_err(watch_err)?;
            }
        }

        let mut controller = CacheController {
            preprobe_dir,
            information_dir,
            policy_dir,
            cache_path,
            mmap: None,
            regenerating: false,
            _watcher: watcher,
            events: rx,
        };
        controller.ensure_fresh()?;
        Ok(controller)
    }

    /// Drains pending watch events. Returns `true` if any arrived —
    /// the caller (daemon event loop) should follow up with
    /// `ensure_fresh` (spec.md §4.7); errors from the watcher itself
    /// also count as dirty, matching the original's fail-safe-stale
    /// posture on a `SIGIO` it can't decode.
    pub fn poll_watch_events(&mut self) -> bool {
        let mut dirty = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(_)) => dirty = true,
                Ok(Err(err)) => {
                    log::warn!("FDI source watch error: {}", err);
                    dirty = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        dirty
    }

    /// True if the compiled cache is missing, or older than the newest
    /// `.fdi` file across the three source trees (spec.md §4.7).
    pub fn is_stale(&self) -> HalResult<bool> {
        let cache_mtime = match fs::metadata(&self.cache_path) {
            Ok(meta) => meta.modified()?,
            Err(_) => return Ok(true),
        };
        match self.newest_source_mtime()? {
            Some(newest) => Ok(newest > cache_mtime),
            None => Ok(false),
        }
    }

    fn newest_source_mtime(&self) -> HalResult<Option<SystemTime>> {
        let mut newest = None;
        for dir in [&self.preprobe_dir, &self.information_dir, &self.policy_dir] {
            scan_mtimes(dir, &mut newest)?;
        }
        Ok(newest)
    }

    /// Regenerates the cache if stale and reopens the map; a no-op if
    /// already fresh. A regeneration already in flight is not
    /// re-entered (spec.md §4.7 "at most one regeneration in flight").
    pub fn ensure_fresh(&mut self) -> HalResult<()> {
        if !self.is_stale()? {
            if self.mmap.is_none() {
                self.reopen()?;
            }
            return Ok(());
        }
        if self.regenerating {
            return Ok(());
        }
        self.regenerating = true;
        let result = self.regenerate();
        self.regenerating = false;
        result
    }

    fn regenerate(&mut self) -> HalResult<()> {
        let preprobe = self.preprobe_dir.clone();
        let information = self.information_dir.clone();
        let policy = self.policy_dir.clone();
        let cache_path = self.cache_path.clone();

        let outcome = retry_with_index(Fixed::from_millis(REGEN_RETRY_DELAY_MS).take(REGEN_RETRIES), |i| {
            log::trace!("compiling rule cache, attempt {} of {}", i, REGEN_RETRIES + 1);
            match compiler::compile_to_path(&preprobe, &information, &policy, &cache_path) {
                Ok(result) => OperationResult::Ok(result),
                Err(err) => OperationResult::Retry(err),
            }
        });

        let compiled = match outcome {
            Ok(compiled) => compiled,
            Err(RetryError::Operation { error, .. }) => return Err(error),
            Err(RetryError::Internal(msg)) => return Err(HalError::Core(CoreError::Timeout(msg))),
        };
        if !compiled.skipped_files.is_empty() {
            log::error!(
                "rule cache regenerated with {} malformed FDI file(s) skipped",
                compiled.skipped_files.len()
            );
        }
        self.reopen()
    }

    fn reopen(&mut self) -> HalResult<()> {
        let file = fs::File::open(&self.cache_path)?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(CoreError::Io)?;
        // Validate eagerly so a corrupt cache is caught here, not on
        // the first record read during evaluation.
        RuleCache::from_bytes(&mmap)?;
        self.mmap = Some(mmap);
        Ok(())
    }

    /// Borrows the current compiled cache. Fails with `CacheStale` if
    /// no successful compilation has ever completed (shouldn't happen
    /// in practice: the constructor always runs one).
    pub fn cache(&self) -> HalResult<RuleCache<'_>> {
        let bytes = self
            .mmap
            .as_deref()
            .ok_or_else(|| HalError::Hal(ErrorKind::CacheStale, "no rule cache compiled yet".to_string()))?;
        RuleCache::from_bytes(bytes)
    }
}

fn scan_mtimes(dir: &Path, newest: &mut Option<SystemTime>) -> HalResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            scan_mtimes(&path, newest)?;
        } else if path.extension().map(|ext| ext == "fdi").unwrap_or(false) {
            let mtime = entry.metadata()?.modified()?;
            if newest.map_or(true, |n| mtime > n) {
                *newest = Some(mtime);
            }
        }
    }
    Ok(())
}

fn watch_err(err: notify::Error) -> HalError {
    HalError::Core(CoreError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fdi(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    // S5. Coherency regenerates a missing/invalidated cache.
    #[test]
    fn test_s5_missing_cache_triggers_regeneration() {
        let tmp = tempfile::tempdir().unwrap();
        let preprobe = tmp.path().join("preprobe");
        let information = tmp.path().join("information");
        let policy = tmp.path().join("policy");
        write_fdi(
            &information,
            "10-vendor.fdi",
            r#"<deviceinfo version="0.2"><device><merge key="info.vendor" type="string">ACME</merge></device></deviceinfo>"#,
        );
        fs::create_dir_all(&preprobe).unwrap();
        fs::create_dir_all(&policy).unwrap();
        let cache_path = tmp.path().join("hald.cache");

        let mut controller = CacheController::new(preprobe, information, policy, cache_path.clone()).unwrap();
        assert!(cache_path.exists());
        assert!(!controller.is_stale().unwrap());

        // Simulate invalidation (e.g. a corrupted/cleaned cache file)
        // without waiting on filesystem mtime resolution.
        fs::remove_file(&cache_path).unwrap();
        assert!(controller.is_stale().unwrap());
        controller.ensure_fresh().unwrap();
        assert!(cache_path.exists());
        assert!(!controller.is_stale().unwrap());

        let cache = controller.cache().unwrap();
        assert!(cache.bytes().len() > 20);
    }

    #[test]
    fn test_regeneration_guard_is_not_reentered() {
        let tmp = tempfile::tempdir().unwrap();
        let preprobe = tmp.path().join("preprobe");
        let information = tmp.path().join("information");
        let policy = tmp.path().join("policy");
        fs::create_dir_all(&preprobe).unwrap();
        fs::create_dir_all(&information).unwrap();
        fs::create_dir_all(&policy).unwrap();
        let cache_path = tmp.path().join("hald.cache");

        let mut controller = CacheController::new(preprobe, information, policy, cache_path.clone()).unwrap();
        fs::remove_file(&cache_path).unwrap();
        controller.regenerating = true;
        // ensure_fresh must no-op rather than recompile while a
        // regeneration is (simulated as) already in flight.
        controller.ensure_fresh().unwrap();
        assert!(!cache_path.exists());
    }
}
