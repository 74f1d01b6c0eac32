use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RepairConfig;
use crate::error::MendError;
use crate::lock::LockFile;
use crate::lock::sibling;

/// Transaction lifecycle. Every state except `Idle` must resolve to
/// `Committed` or `RolledBack` before the process exits; `Drop` covers any
/// abnormal path the process can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Locked,
    BackedUp,
    Committed,
    RolledBack,
}

/// Crash-safe mutation window for one log file.
///
/// `begin` takes the lock, then snapshots the log to `<log>.backup` and
/// `<log>.working`; only the working path is ever mutated. `commit` renames
/// the working file over the original (atomic, same directory). `rollback`
/// renames the backup over the original, restoring it and clearing the
/// backup in one step.
#[derive(Debug)]
pub struct Transaction {
    target: PathBuf,
    backup: PathBuf,
    working: PathBuf,
    lock: Option<LockFile>,
    state: TxnState,
}

impl Transaction {
    pub fn begin(target: &Path, config: &RepairConfig) -> Result<Self, MendError> {
        let lock = LockFile::acquire(target, config.lock_timeout, config.lock_stale_age)?;
        let mut txn = Self {
            target: target.to_path_buf(),
            backup: sibling(target, "backup"),
            working: sibling(target, "working"),
            lock: Some(lock),
            state: TxnState::Locked,
        };
        debug!(path = %txn.target.display(), "transaction locked");

        if let Err(e) = txn.snapshot() {
            let cause = e.to_string();
            return match txn.rollback() {
                Ok(()) => Err(e),
                Err(MendError::Io { source, .. } | MendError::Transaction { source, .. }) => {
                    Err(MendError::RollbackFailed {
                        path: txn.target.clone(),
                        cause,
                        source,
                    })
                }
                Err(other) => Err(other),
            };
        }
        txn.state = TxnState::BackedUp;
        debug!(path = %txn.target.display(), "transaction backed up");
        Ok(txn)
    }

    fn snapshot(&self) -> Result<(), MendError> {
        fs::copy(&self.target, &self.backup)
            .map_err(|e| MendError::transaction("copying backup", &self.target, e))?;
        fs::copy(&self.target, &self.working)
            .map_err(|e| MendError::transaction("copying working file", &self.target, e))?;
        Ok(())
    }

    /// The only path a caller may write between `begin` and `commit`.
    pub fn working_path(&self) -> &Path {
        &self.working
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Atomically replace the log with the working file, then clear the
    /// backup and release the lock.
    pub fn commit(mut self) -> Result<(), MendError> {
        debug_assert_eq!(self.state, TxnState::BackedUp);
        if let Err(e) = fs::rename(&self.working, &self.target) {
            let commit_err = MendError::transaction("committing working file", &self.target, e);
            let cause = commit_err.to_string();
            return match self.rollback() {
                Ok(()) => Err(commit_err),
                Err(MendError::Io { source, .. } | MendError::Transaction { source, .. }) => {
                    Err(MendError::RollbackFailed {
                        path: self.target.clone(),
                        cause,
                        source,
                    })
                }
                Err(other) => Err(other),
            };
        }
        if let Err(e) = fs::remove_file(&self.backup)
            && e.kind() != ErrorKind::NotFound
        {
            // The commit itself landed; the leftover backup is what the
            // retention sweep exists for.
            warn!(path = %self.backup.display(), error = %e, "failed to remove backup after commit");
        }
        self.release_lock();
        self.state = TxnState::Committed;
        info!(path = %self.target.display(), "transaction committed");
        Ok(())
    }

    /// Restore the original from backup and clean up. Idempotent; calling it
    /// with no transaction open is a no-op.
    pub fn rollback(&mut self) -> Result<(), MendError> {
        match self.state {
            TxnState::Idle | TxnState::Committed | TxnState::RolledBack => Ok(()),
            TxnState::Locked => {
                self.remove_residue();
                self.release_lock();
                self.state = TxnState::RolledBack;
                Ok(())
            }
            TxnState::BackedUp => {
                // rename both restores the original and clears the backup.
                fs::rename(&self.backup, &self.target)
                    .map_err(|e| MendError::transaction("restoring backup", &self.target, e))?;
                self.remove_residue();
                self.release_lock();
                self.state = TxnState::RolledBack;
                info!(path = %self.target.display(), "transaction rolled back");
                Ok(())
            }
        }
    }

    fn remove_residue(&self) {
        for path in [&self.working, &self.backup] {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "failed to remove transaction file");
            }
        }
    }

    fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::Locked | TxnState::BackedUp)
            && let Err(e) = self.rollback()
        {
            warn!(path = %self.target.display(), error = %e, "rollback on drop failed");
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
}

/// Delete `*.backup` files older than `max_age` anywhere under `root`.
/// Separate from the transaction by design; typically run via `mendlog
/// sweep`.
pub fn sweep_backups(root: &Path, max_age: Duration) -> Result<SweepReport, MendError> {
    let mut report = SweepReport::default();
    sweep_dir(root, max_age, &mut report)?;
    info!(root = %root.display(), examined = report.examined, deleted = report.deleted, "backup sweep finished");
    Ok(report)
}

fn sweep_dir(dir: &Path, max_age: Duration, report: &mut SweepReport) -> Result<(), MendError> {
    let entries = fs::read_dir(dir).map_err(|e| MendError::io("reading directory", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| MendError::io("reading directory entry", dir, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| MendError::io("inspecting directory entry", &path, e))?;
        if file_type.is_dir() {
            sweep_dir(&path, max_age, report)?;
            continue;
        }
        if !file_type.is_file()
            || path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_none_or(|ext| ext != "backup")
        {
            continue;
        }
        report.examined += 1;
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age >= max_age);
        if old_enough {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted aged backup");
                    report.deleted += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(MendError::io("deleting aged backup", &path, e)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> RepairConfig {
        RepairConfig::default()
    }

    #[test]
    fn commit_replaces_target_and_clears_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("s.jsonl");
        fs::write(&target, "before\n").unwrap();

        let txn = Transaction::begin(&target, &config()).unwrap();
        assert_eq!(txn.state(), TxnState::BackedUp);
        fs::write(txn.working_path(), "after\n").unwrap();
        txn.commit().unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "after\n");
        assert!(!dir.path().join("s.jsonl.backup").exists());
        assert!(!dir.path().join("s.jsonl.working").exists());
        assert!(!dir.path().join("s.jsonl.lock").exists());
    }

    #[test]
    fn rollback_restores_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("s.jsonl");
        fs::write(&target, "original\n").unwrap();

        let mut txn = Transaction::begin(&target, &config()).unwrap();
        fs::write(txn.working_path(), "mutated\n").unwrap();
        // Simulated failure after BackedUp, before commit.
        txn.rollback().unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "original\n");
        assert!(!dir.path().join("s.jsonl.backup").exists());
        assert!(!dir.path().join("s.jsonl.working").exists());
        assert!(!dir.path().join("s.jsonl.lock").exists());
    }

    #[test]
    fn rollback_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("s.jsonl");
        fs::write(&target, "x\n").unwrap();

        let mut txn = Transaction::begin(&target, &config()).unwrap();
        txn.rollback().unwrap();
        txn.rollback().unwrap();
        assert_eq!(txn.state(), TxnState::RolledBack);
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("s.jsonl");
        fs::write(&target, "keep me\n").unwrap();

        {
            let txn = Transaction::begin(&target, &config()).unwrap();
            fs::write(txn.working_path(), "half-written\n").unwrap();
            // txn dropped here without commit.
        }

        assert_eq!(fs::read_to_string(&target).unwrap(), "keep me\n");
        assert!(!dir.path().join("s.jsonl.lock").exists());
    }

    #[test]
    fn begin_on_missing_file_fails_clean() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absent.jsonl");
        let err = Transaction::begin(&target, &config()).unwrap_err();
        assert!(matches!(err, MendError::Transaction { .. }));
        assert!(!dir.path().join("absent.jsonl.lock").exists());
    }

    #[test]
    fn sweep_deletes_only_aged_backups() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2025").join("01");
        fs::create_dir_all(&nested).unwrap();
        let aged = nested.join("a.jsonl.backup");
        let fresh = dir.path().join("b.jsonl.backup");
        let unrelated = dir.path().join("c.jsonl");
        fs::write(&aged, "old").unwrap();
        fs::write(&fresh, "new").unwrap();
        fs::write(&unrelated, "log").unwrap();

        let report = sweep_backups(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.deleted, 2);
        assert!(unrelated.exists());

        // With a generous retention nothing else goes.
        fs::write(&fresh, "new").unwrap();
        let report = sweep_backups(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.deleted, 0);
        assert!(fresh.exists());
    }
}
