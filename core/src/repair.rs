use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::config::RepairConfig;
use crate::error::MendError;
use crate::list::find_session_logs;
use crate::plan::RepairPlan;
use crate::plan::plan_repairs;
use crate::plan::rewrite;
use crate::reader::LogLine;
use crate::reader::load_log;
use crate::scan::Findings;
use crate::scan::GapKind;
use crate::scan::scan_records;
use crate::txn::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Report, then wait for confirmation before mutating.
    Interactive,
    /// Report, then apply without asking.
    Auto,
}

/// Output seam for repair runs. The engine never prints or prompts itself;
/// the caller decides how findings reach a human (or a JSON stream).
pub trait RepairUi {
    fn report_findings(&self, _path: &Path, _findings: &Findings) {}
    fn report_plan(&self, _path: &Path, _plan: &RepairPlan) {}
    /// Asked only in interactive mode, after the report.
    fn confirm(&self, _path: &Path, _plan: &RepairPlan) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Nothing to do; the file was left untouched.
    Clean,
    /// The plan was applied and committed.
    Repaired,
    /// The caller declined the plan; the file was left untouched.
    Declined,
}

/// What one repair run found and did to one log.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub path: PathBuf,
    pub records: usize,
    pub opaque_lines: usize,
    pub non_adjacent: usize,
    pub missing: usize,
    pub irreparable: usize,
    pub poisoned_hits: usize,
    pub actions_planned: usize,
    pub actions_applied: usize,
    pub outcome: RepairOutcome,
}

impl RepairReport {
    fn new(
        path: &Path,
        findings: &Findings,
        plan: &RepairPlan,
        actions_applied: usize,
        outcome: RepairOutcome,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            records: findings.records,
            opaque_lines: findings.opaque_lines,
            non_adjacent: findings
                .pairings
                .iter()
                .filter(|p| p.gap == GapKind::NonAdjacent)
                .count(),
            missing: findings
                .pairings
                .iter()
                .filter(|p| p.gap == GapKind::Missing)
                .count(),
            irreparable: findings.irreparable.len(),
            poisoned_hits: findings.poisoned.len(),
            actions_planned: plan.len(),
            actions_applied,
            outcome,
        }
    }
}

/// Diagnostic structural scan. Takes no lock: scans are advisory and must
/// tolerate reading a file mid-transaction; a repair always re-acquires the
/// lock and re-reads before mutating.
pub fn scan(path: &Path, config: &RepairConfig) -> Result<Findings, MendError> {
    let lines = load_log(path)?;
    ensure_recoverable(path, &lines)?;
    Ok(scan_records(&lines, &config.poisoned_ids))
}

/// Scan and, if anything is wrong, rewrite `path` inside a lock + backup +
/// rollback transaction. The on-disk file is untouched unless the run
/// reaches commit.
pub fn repair(
    path: &Path,
    config: &RepairConfig,
    mode: RepairMode,
    ui: &dyn RepairUi,
) -> Result<RepairReport, MendError> {
    let mut txn = Transaction::begin(path, config)?;

    let lines = match load_log(txn.working_path()) {
        Ok(lines) => lines,
        Err(e) => return fail(&mut txn, e),
    };
    if let Err(e) = ensure_recoverable(path, &lines) {
        return fail(&mut txn, e);
    }

    let findings = scan_records(&lines, &config.poisoned_ids);
    let plan = plan_repairs(&lines, &findings, &config.poisoned_ids);
    ui.report_findings(path, &findings);
    ui.report_plan(path, &plan);

    if plan.is_empty() {
        txn.rollback()?;
        return Ok(RepairReport::new(
            path,
            &findings,
            &plan,
            0,
            RepairOutcome::Clean,
        ));
    }

    if mode == RepairMode::Interactive && !ui.confirm(path, &plan) {
        txn.rollback()?;
        return Ok(RepairReport::new(
            path,
            &findings,
            &plan,
            0,
            RepairOutcome::Declined,
        ));
    }

    let applied = plan.len();
    let repaired = rewrite(lines, &plan);
    if let Err(e) = write_log(txn.working_path(), &repaired) {
        return fail(&mut txn, e);
    }
    txn.commit()?;
    info!(path = %path.display(), actions = applied, "log repaired");
    Ok(RepairReport::new(
        path,
        &findings,
        &plan,
        applied,
        RepairOutcome::Repaired,
    ))
}

/// Repair every log under `dir`, newest first. Logs are independent; within
/// each one the usual transaction applies.
pub fn repair_chain(
    dir: &Path,
    config: &RepairConfig,
    mode: RepairMode,
    ui: &dyn RepairUi,
) -> Result<Vec<RepairReport>, MendError> {
    let logs = find_session_logs(dir)?;
    let mut reports = Vec::with_capacity(logs.len());
    for log in logs {
        reports.push(repair(&log.path, config, mode, ui)?);
    }
    Ok(reports)
}

/// A file where no line parses has nothing to anchor a repair on.
fn ensure_recoverable(path: &Path, lines: &[LogLine]) -> Result<(), MendError> {
    if !lines.is_empty()
        && lines
            .iter()
            .all(|line| matches!(line, LogLine::Opaque { .. }))
    {
        return Err(MendError::UnparseableLog {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn write_log(path: &Path, lines: &[LogLine]) -> Result<(), MendError> {
    let mut out = String::new();
    for line in lines {
        let rendered = line.to_line().map_err(|e| MendError::Serialize {
            path: path.to_path_buf(),
            source: e,
        })?;
        out.push_str(&rendered);
        out.push('\n');
    }
    fs::write(path, out).map_err(|e| MendError::io("writing repaired log", path, e))
}

/// Roll back after a mid-transaction failure, preserving the original error;
/// a rollback failure on top of it is fatal and carries both.
fn fail(txn: &mut Transaction, err: MendError) -> Result<RepairReport, MendError> {
    match txn.rollback() {
        Ok(()) => Err(err),
        Err(MendError::Transaction { path, source, .. })
        | Err(MendError::Io { path, source, .. }) => Err(MendError::RollbackFailed {
            path,
            cause: err.to_string(),
            source,
        }),
        Err(other) => Err(other),
    }
}
