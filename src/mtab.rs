// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reader/writer for the mount-state file helper sub-processes maintain
//! (spec.md §4.8, §6 "Mount-state file"): a tab-separated record of
//! `(device, uid, session, fstype, options, mount_point)`, guarded by an
//! advisory exclusive lock on a sibling lock file.
//!
//! Replaces `core::dm_udev_sync`'s SysV-semaphore mutual exclusion
//! (`notify_sem_create`/`_wait`/`_destroy`) with `nix::fcntl::flock` on
//! a plain file: the mount-state file isn't an event counter, just
//! shared mutable state two processes must not edit concurrently.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::fcntl::{flock, FlockArg};

use crate::result::{CoreError, HalResult};

/// One line of the mount-state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub uid: String,
    pub session: String,
    pub fstype: String,
    pub options: String,
    pub mount_point: String,
}

impl MountEntry {
    fn parse(line: &str) -> HalResult<MountEntry> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(CoreError::MalformedCache(format!(
                "mount-state line has {} fields, expected 6: {:?}",
                fields.len(),
                line
            ))
            .into());
        }
        Ok(MountEntry {
            device: fields[0].to_string(),
            uid: fields[1].to_string(),
            session: fields[2].to_string(),
            fstype: fields[3].to_string(),
            options: fields[4].to_string(),
            mount_point: fields[5].to_string(),
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.device, self.uid, self.session, self.fstype, self.options, self.mount_point
        )
    }
}

/// Holds an advisory exclusive lock on `lock_path` for the lifetime of
/// the guard; used to bracket a read-modify-write of the mount-state
/// file (spec.md §4.8: helper sub-processes "hold an exclusive flock on
/// a well-known lock file while editing").
struct LockGuard {
    file: File,
}

impl LockGuard {
    fn acquire(lock_path: &Path) -> HalResult<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)
            .map_err(CoreError::Io)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|errno| {
            CoreError::Io(io::Error::from_raw_os_error(errno as i32))
        })?;
        Ok(LockGuard { file })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

/// A mount-state file at a fixed path, with a sibling lock file.
pub struct MountTable {
    path: PathBuf,
    lock_path: PathBuf,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> MountTable {
        let path = path.into();
        let mut lock_path = path.clone();
        lock_path.set_extension("lock");
        MountTable { path, lock_path }
    }

    /// Reads every entry, skipping blank lines and `#`-comment lines
    /// (spec.md §4.8). Returns an empty list if the file doesn't exist
    /// yet — no mounts recorded is not malformed.
    pub fn read(&self) -> HalResult<Vec<MountEntry>> {
        let _guard = LockGuard::acquire(&self.lock_path)?;
        self.read_locked()
    }

    fn read_locked(&self) -> HalResult<Vec<MountEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CoreError::Io(err).into()),
        };
        contents
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(MountEntry::parse)
            .collect()
    }

    /// Appends `entry`, under the exclusive lock, rewriting the file
    /// atomically via a `~`-sibling rename (spec.md §4.8).
    pub fn add(&self, entry: MountEntry) -> HalResult<()> {
        let _guard = LockGuard::acquire(&self.lock_path)?;
        let mut entries = self.read_locked()?;
        entries.push(entry);
        self.write_locked(&entries)
    }

    /// Removes every entry whose device is `device`, rewriting the file
    /// atomically.
    pub fn remove_by_device(&self, device: &str) -> HalResult<()> {
        let _guard = LockGuard::acquire(&self.lock_path)?;
        let entries = self.read_locked()?;
        let kept: Vec<MountEntry> = entries.into_iter().filter(|e| e.device != device).collect();
        self.write_locked(&kept)
    }

    fn write_locked(&self, entries: &[MountEntry]) -> HalResult<()> {
        let mut tmp_path = self.path.as_os_str().to_owned();
        tmp_path.push("~");
        let tmp_path = PathBuf::from(tmp_path);
        let mut file = File::create(&tmp_path).map_err(CoreError::Io)?;
        for entry in entries {
            writeln!(file, "{}", entry.to_line()).map_err(CoreError::Io)?;
        }
        file.sync_all().map_err(CoreError::Io)?;
        fs::rename(&tmp_path, &self.path).map_err(CoreError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(device: &str) -> MountEntry {
        MountEntry {
            device: device.to_string(),
            uid: "1000".to_string(),
            session: "c1".to_string(),
            fstype: "vfat".to_string(),
            options: "uid=1000".to_string(),
            mount_point: "/media/usb".to_string(),
        }
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let table = MountTable::new(tmp.path().join("mtab"));
        assert_eq!(table.read().unwrap(), Vec::new());
    }

    #[test]
    fn test_add_then_remove_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let table = MountTable::new(tmp.path().join("mtab"));
        table.add(entry("/dev/sdb1")).unwrap();
        table.add(entry("/dev/sdc1")).unwrap();
        assert_eq!(table.read().unwrap().len(), 2);

        table.remove_by_device("/dev/sdb1").unwrap();
        let remaining = table.read().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device, "/dev/sdc1");
    }

    #[test]
    fn test_comment_and_blank_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mtab");
        fs::write(&path, "# comment\n\n/dev/sda1\t0\tc0\text4\trw\t/\n").unwrap();
        let table = MountTable::new(path);
        let entries = table.read().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "/dev/sda1");
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mtab");
        fs::write(&path, "/dev/sda1\tnot\tenough\tfields\n").unwrap();
        let table = MountTable::new(path);
        assert!(table.read().is_err());
    }
}
