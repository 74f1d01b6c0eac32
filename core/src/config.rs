use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCK_STALE_AGE: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKUP_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Injected policy for one scan/repair run. The engine bakes in no
/// process-wide deny-list; callers supply everything here.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Tool-result identifiers known to be rejected downstream. Records and
    /// text mentioning them are dropped, stripped, or redacted (§ planner).
    pub poisoned_ids: BTreeSet<String>,
    /// How long lock acquisition may poll before giving up.
    pub lock_timeout: Duration,
    /// Age after which an unrefreshed lock becomes stale-eligible.
    pub lock_stale_age: Duration,
    /// Backups older than this are eligible for the sweep.
    pub backup_retention: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            poisoned_ids: BTreeSet::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_stale_age: DEFAULT_LOCK_STALE_AGE,
            backup_retention: DEFAULT_BACKUP_RETENTION,
        }
    }
}
