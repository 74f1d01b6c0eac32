//! Session-log repair engine.
//!
//! Parses a JSONL conversation rollout, finds violations of the
//! tool-invocation/tool-result adjacency invariant, and rewrites the file to
//! restore it. Mutation always happens inside a lock + backup + rollback
//! transaction; scanning alone never takes the lock.

mod config;
mod error;
mod list;
mod lock;
mod plan;
mod reader;
mod repair;
mod scan;
mod txn;

pub use config::DEFAULT_BACKUP_RETENTION;
pub use config::DEFAULT_LOCK_STALE_AGE;
pub use config::DEFAULT_LOCK_TIMEOUT;
pub use config::RepairConfig;
pub use error::MendError;
pub use list::SessionLogRef;
pub use list::find_session_logs;
pub use lock::LockFile;
pub use plan::REDACTION_PLACEHOLDER;
pub use plan::RepairAction;
pub use plan::RepairPlan;
pub use plan::plan_repairs;
pub use plan::rewrite;
pub use reader::LogLine;
pub use reader::load_log;
pub use reader::read_log;
pub use repair::RepairMode;
pub use repair::RepairOutcome;
pub use repair::RepairReport;
pub use repair::RepairUi;
pub use repair::repair;
pub use repair::repair_chain;
pub use repair::scan;
pub use scan::Findings;
pub use scan::GapKind;
pub use scan::IrreparableEntry;
pub use scan::IrreparableReason;
pub use scan::PoisonHit;
pub use scan::PoisonSite;
pub use scan::ToolPairing;
pub use scan::scan_records;
pub use txn::SweepReport;
pub use txn::Transaction;
pub use txn::TxnState;
pub use txn::sweep_backups;
