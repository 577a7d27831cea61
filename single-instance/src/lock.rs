use crate::Error;
use chrono::DateTime;
use chrono::Utc;
use fs2::FileExt;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

const MAX_ATTEMPTS: usize = 4;
const RECORD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unacquired,
    Held,
    Released,
}

/// Who holds the lock, written into the lock file by the holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub pid: u32,
    /// Process start time in clock ticks since boot, tells a reused PID apart
    /// from the original owner
    pub start_tag: Option<u64>,
    pub acquired_at: DateTime<Utc>,
}

impl OwnerRecord {
    pub fn current() -> Self {
        let pid = std::process::id();
        OwnerRecord {
            pid,
            start_tag: process_start_tag(pid),
            acquired_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // kill(0) would address our own process group
        let raw_pid = match i32::try_from(self.pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        };
        match kill(Pid::from_raw(raw_pid), None) {
            // EPERM means the process exists but belongs to someone else
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return false,
        }

        match (self.start_tag, process_start_tag(self.pid)) {
            (Some(recorded), Some(actual)) => recorded == actual,
            _ => true,
        }
    }

    fn read_from(file: &mut File) -> Option<OwnerRecord> {
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0)).ok()?;
        file.read_to_string(&mut contents).ok()?;
        serde_json::from_str(contents.trim()).ok()
    }
}

/// Result of [`LockHandle::try_acquire`]
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockHandle),
    /// Another live process holds the lock, with its record if it could be
    /// read
    AlreadyHeld(Option<OwnerRecord>),
}

/// Exclusive lock on a file, held for as long as the handle lives.
///
/// The lock is an advisory `flock`, so the kernel drops it when the holder
/// dies for any reason. Dropping the handle releases the lock and removes the
/// lock file.
#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
    state: LockState,
}

impl LockHandle {
    /// Try to become the holder of the lock at `path` without blocking on the
    /// lock itself.
    ///
    /// When the lock is held but the recorded owner is dead (the descriptor
    /// leaked into a surviving child, or the PID was reused), the record is
    /// watched for `grace`. If no live owner shows up in that time the lock
    /// file is unlinked and acquisition retried.
    pub fn try_acquire(path: &Path, grace: Duration) -> Result<LockAttempt, Error> {
        for _ in 0..MAX_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(Error::LockIo)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // Someone may have unlinked the file after we opened it,
                    // a lock on a detached inode proves nothing
                    if !is_same_file(&file, path).map_err(Error::LockIo)? {
                        log::debug!("Lock file {:?} was replaced while locking, retrying", path);
                        continue;
                    }
                    write_record(&mut file, &OwnerRecord::current()).map_err(Error::LockIo)?;
                    if !is_same_file(&file, path).map_err(Error::LockIo)? {
                        log::debug!("Lock file {:?} was reclaimed while locking, retrying", path);
                        continue;
                    }
                    log::debug!("Acquired lock {:?}", path);
                    return Ok(LockAttempt::Acquired(LockHandle {
                        file: Some(file),
                        path: path.to_path_buf(),
                        state: LockState::Held,
                    }));
                }
                Err(e) if is_contended(&e) => match watch_owner(&mut file, grace) {
                    Some(owner) => return Ok(LockAttempt::AlreadyHeld(Some(owner))),
                    None => {
                        if !remove_stale(&file, path).map_err(Error::LockIo)? {
                            continue;
                        }
                        log::warn!("Lock {:?} was held by a dead process, reclaimed", path);
                    }
                },
                Err(e) => return Err(Error::LockIo(e)),
            }
        }

        Err(Error::LockIo(io::Error::other(format!(
            "lock file {:?} kept changing during {} attempts",
            path, MAX_ATTEMPTS
        ))))
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the lock file, calling this again is a
    /// no-op
    pub fn release(&mut self) -> Result<(), Error> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        self.state = LockState::Released;

        // Remove while still locked, so nobody can lock this inode and then
        // see it vanish. Only our own inode is removed, a reclaimer may have
        // put a new file in its place.
        let result = match is_same_file(&file, &self.path) {
            Ok(true) => fs::remove_file(&self.path),
            Ok(false) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        let unlocked = FileExt::unlock(&file);
        drop(file);

        log::debug!("Released lock {:?}", self.path);
        result.and(unlocked).map_err(Error::LockIo)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

/// Poll the owner record until it names a live process or `grace` passes.
///
/// A fresh holder writes its record right after locking, so a missing or dead
/// record is only trusted once it stays that way for the whole grace period.
fn watch_owner(file: &mut File, grace: Duration) -> Option<OwnerRecord> {
    let deadline = Instant::now() + grace;
    loop {
        let record = OwnerRecord::read_from(file);
        if let Some(record) = record.as_ref().filter(|r| r.is_alive()) {
            return Some(record.clone());
        }
        if Instant::now() >= deadline {
            log::debug!("Lock owner {:?} is not alive", record);
            return None;
        }
        std::thread::sleep(RECORD_POLL_INTERVAL);
    }
}

/// Unlink the lock file if `path` still names the stale inode `file`.
///
/// Reclaimers serialise on a separate lock, so that no two of them can both
/// pass the inode check and one unlink a file the other just created. The
/// reclaim file is never removed for the same reason.
fn remove_stale(file: &File, path: &Path) -> io::Result<bool> {
    let reclaim = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(reclaim_path(path))?;
    reclaim.lock_exclusive()?;

    let removed = if is_same_file(file, path)? {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        }
    } else {
        false
    };

    FileExt::unlock(&reclaim)?;
    Ok(removed)
}

fn reclaim_path(path: &Path) -> PathBuf {
    path.with_extension("reclaim")
}

fn write_record(file: &mut File, record: &OwnerRecord) -> io::Result<()> {
    let contents = serde_json::to_string(record)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", contents)?;
    file.sync_data()
}

fn is_same_file(file: &File, path: &Path) -> io::Result<bool> {
    let opened = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(opened.dev() == current.dev() && opened.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Start time of a process (field 22 of `/proc/<pid>/stat`)
#[cfg(target_os = "linux")]
fn process_start_tag(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses, fields after it
    // start at the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_start_tag(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn acquire(path: &Path) -> LockHandle {
        match LockHandle::try_acquire(path, Duration::from_millis(50)).unwrap() {
            LockAttempt::Acquired(handle) => handle,
            LockAttempt::AlreadyHeld(owner) => panic!("lock held by {:?}", owner),
        }
    }

    #[test]
    fn second_acquire_sees_current_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let handle = acquire(&path);
        assert_eq!(handle.state(), LockState::Held);

        match LockHandle::try_acquire(&path, Duration::from_millis(50)).unwrap() {
            LockAttempt::AlreadyHeld(Some(owner)) => assert_eq!(owner.pid, std::process::id()),
            other => panic!("expected AlreadyHeld, got {:?}", other),
        }
    }

    #[test]
    fn release_is_idempotent_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let mut handle = acquire(&path);
        assert!(path.exists());

        handle.release().unwrap();
        handle.release().unwrap();
        assert_eq!(handle.state(), LockState::Released);
        assert!(!path.exists());

        let _again = acquire(&path);
    }

    #[test]
    fn leftover_file_from_dead_owner_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let stale = OwnerRecord {
            pid: dead_pid(),
            start_tag: None,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let handle = acquire(&path);
        let record: OwnerRecord =
            serde_json::from_str(fs::read_to_string(handle.path()).unwrap().trim()).unwrap();
        assert_eq!(record.pid, std::process::id());
    }

    #[test]
    fn held_lock_with_dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        // Simulates a descriptor inherited by a child that outlived the owner
        let mut leaked = acquire(&path);
        let stale = OwnerRecord {
            pid: dead_pid(),
            start_tag: None,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let reclaimed = acquire(&path);
        assert!(path.exists());

        // The old handle must not remove the reclaimed file
        leaked.release().unwrap();
        assert!(path.exists());
        drop(reclaimed);
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_reclaims_elect_one_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let _leaked = acquire(&path);
        let stale = OwnerRecord {
            pid: dead_pid(),
            start_tag: None,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    LockHandle::try_acquire(&path, Duration::from_millis(50)).unwrap()
                })
            })
            .collect();
        // Keep every handle alive until all threads are done
        let attempts: Vec<LockAttempt> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let holders = attempts
            .iter()
            .filter(|a| matches!(a, LockAttempt::Acquired(_)))
            .count();
        assert_eq!(holders, 1, "attempts: {:?}", attempts);
        assert!(reclaim_path(&path).exists());
    }

    #[test]
    fn current_process_is_alive() {
        assert!(OwnerRecord::current().is_alive());
    }

    #[test]
    fn dead_process_is_not_alive() {
        let record = OwnerRecord {
            pid: dead_pid(),
            start_tag: None,
            acquired_at: Utc::now(),
        };
        assert!(!record.is_alive());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_is_not_alive() {
        let mut record = OwnerRecord::current();
        record.start_tag = record.start_tag.map(|tag| tag + 1);
        assert!(!record.is_alive());
    }
}
