use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::error::MendError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive advisory lock scoped to one log file, held via a sibling
/// `<log>.lock` file on the same filesystem. Creation is the atomic claim
/// (`create_new`); acquisition polls with a bounded timeout. A lock whose
/// holder stopped refreshing *and* is no longer alive is broken as stale.
#[derive(Debug)]
pub struct LockFile {
    lock_path: PathBuf,
    held: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: u64,
    refreshed_at: u64,
}

impl LockFile {
    pub fn acquire(
        target: &Path,
        timeout: Duration,
        stale_age: Duration,
    ) -> Result<Self, MendError> {
        let lock_path = sibling(target, "lock");
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let info = LockInfo::now();
                    let payload = serde_json::to_string(&info)
                        .map_err(|e| MendError::io("serializing lock info", &lock_path, e.into()))?;
                    file.write_all(payload.as_bytes())
                        .map_err(|e| MendError::io("writing lock file", &lock_path, e))?;
                    debug!(path = %lock_path.display(), pid = info.pid, "lock acquired");
                    return Ok(Self {
                        lock_path,
                        held: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if try_break_stale(&lock_path, stale_age) {
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(MendError::LockTimeout {
                            path: target.to_path_buf(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(MendError::io("creating lock file", &lock_path, e)),
            }
        }
    }

    /// Re-stamp `refreshed_at` so long-running holders stay fresh.
    pub fn refresh(&self) -> Result<(), MendError> {
        let info = LockInfo::now();
        let payload = serde_json::to_string(&info)
            .map_err(|e| MendError::io("serializing lock info", &self.lock_path, e.into()))?;
        fs::write(&self.lock_path, payload)
            .map_err(|e| MendError::io("refreshing lock file", &self.lock_path, e))
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.held {
            self.held = false;
            if let Err(e) = fs::remove_file(&self.lock_path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.lock_path.display(), error = %e, "failed to remove lock file");
                }
            } else {
                debug!(path = %self.lock_path.display(), "lock released");
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl LockInfo {
    fn now() -> Self {
        let now = unix_now();
        Self {
            pid: std::process::id(),
            acquired_at: now,
            refreshed_at: now,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Break a lock only when it is old enough *and* its holder is verifiably
/// gone. A lock with unreadable contents falls back to the file's mtime for
/// the age check, since there is no pid left to probe.
fn try_break_stale(lock_path: &Path, stale_age: Duration) -> bool {
    let stale = match read_info(lock_path) {
        Some(info) => {
            unix_now().saturating_sub(info.refreshed_at) >= stale_age.as_secs()
                && !pid_alive(info.pid)
        }
        None => mtime_older_than(lock_path, stale_age),
    };
    if stale {
        warn!(path = %lock_path.display(), "breaking stale lock");
        match fs::remove_file(lock_path) {
            Ok(()) => true,
            Err(e) => e.kind() == ErrorKind::NotFound,
        }
    } else {
        false
    }
}

fn read_info(lock_path: &Path) -> Option<LockInfo> {
    let payload = fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&payload).ok()
}

fn mtime_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes liveness without delivering anything; EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap probe available; never treat the holder as dead.
    true
}

/// `<path>.<suffix>` next to the target, e.g. `session.jsonl.lock`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
