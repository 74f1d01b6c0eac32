//! `mendlog` — scan and repair coding-agent session logs.
//!
//! Subcommands map 1:1 onto the engine entry points: `scan` is a lock-free
//! diagnostic read, `repair` rewrites a log (or a whole directory with
//! `--chain`) inside a lock + backup transaction, `sweep` clears aged backup
//! files left behind by interrupted repairs.

use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use mendlog_core::Findings;
use mendlog_core::GapKind;
use mendlog_core::RepairConfig;
use mendlog_core::RepairMode;
use mendlog_core::RepairOutcome;
use mendlog_core::RepairPlan;
use mendlog_core::RepairReport;
use mendlog_core::RepairUi;
use mendlog_core::repair;
use mendlog_core::repair_chain;
use mendlog_core::scan;
use mendlog_core::sweep_backups;
use tracing_subscriber::EnvFilter;

/// Session log repair tool.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct MendlogCli {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Scan a log and report findings without touching it.
    Scan(ScanCommand),

    /// Restore the invocation/result adjacency invariant in a log.
    Repair(RepairCommand),

    /// Delete aged `.backup` files left behind by interrupted repairs.
    Sweep(SweepCommand),
}

#[derive(Debug, Parser)]
struct ScanCommand {
    /// Path to the session log.
    path: PathBuf,

    /// Emit findings as JSON instead of a human-readable summary.
    #[clap(long)]
    json: bool,

    #[clap(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Parser)]
struct RepairCommand {
    /// Path to one session log (omit when using --chain).
    #[clap(required_unless_present = "chain")]
    path: Option<PathBuf>,

    /// Repair every log found under this directory, newest first.
    #[clap(long, value_name = "DIR", conflicts_with = "path")]
    chain: Option<PathBuf>,

    /// Apply the planned repairs without asking for confirmation.
    #[clap(long)]
    auto: bool,

    /// Emit the repair report(s) as JSON.
    #[clap(long)]
    json: bool,

    #[clap(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Parser)]
struct SweepCommand {
    /// Directory to sweep for aged backups.
    dir: PathBuf,

    /// Days backups are kept before they become eligible for deletion.
    #[clap(long, value_name = "DAYS")]
    backup_retention_days: Option<u64>,
}

/// Injected engine policy; everything has a sensible default.
#[derive(Debug, clap::Args)]
struct PolicyArgs {
    /// Tool identifier known to be rejected downstream; repeatable.
    #[clap(long = "poisoned-id", value_name = "ID")]
    poisoned_ids: Vec<String>,

    /// Seconds to wait for the log's lock before giving up.
    #[clap(long, value_name = "SECS")]
    lock_timeout_secs: Option<u64>,

    /// Seconds after which an unrefreshed lock from a dead process may be
    /// broken.
    #[clap(long, value_name = "SECS")]
    stale_lock_secs: Option<u64>,

    /// Days backups are kept before `sweep` deletes them.
    #[clap(long, value_name = "DAYS")]
    backup_retention_days: Option<u64>,
}

impl PolicyArgs {
    fn into_config(self) -> RepairConfig {
        let mut config = RepairConfig {
            poisoned_ids: self.poisoned_ids.into_iter().collect(),
            ..RepairConfig::default()
        };
        if let Some(secs) = self.lock_timeout_secs {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.stale_lock_secs {
            config.lock_stale_age = Duration::from_secs(secs);
        }
        if let Some(days) = self.backup_retention_days {
            config.backup_retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = MendlogCli::parse();
    match cli.subcommand {
        Subcommand::Scan(cmd) => run_scan(cmd),
        Subcommand::Repair(cmd) => run_repair(cmd),
        Subcommand::Sweep(cmd) => run_sweep(cmd),
    }
}

fn init_tracing() {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .try_init();
}

fn run_scan(cmd: ScanCommand) -> anyhow::Result<()> {
    let config = cmd.policy.into_config();
    let findings = scan(&cmd.path, &config)
        .with_context(|| format!("scanning {}", cmd.path.display()))?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
    } else {
        print_findings(&cmd.path, &findings);
        if findings.is_clean() {
            println!("{}: clean", cmd.path.display());
        }
    }
    Ok(())
}

fn run_repair(cmd: RepairCommand) -> anyhow::Result<()> {
    let config = cmd.policy.into_config();
    let mode = if cmd.auto {
        RepairMode::Auto
    } else {
        RepairMode::Interactive
    };
    let ui = ConsoleUi { quiet: cmd.json };

    if let Some(dir) = cmd.chain {
        let reports = repair_chain(&dir, &config, mode, &ui)
            .with_context(|| format!("repairing chain under {}", dir.display()))?;
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            for report in &reports {
                print_outcome(report);
            }
            println!("{} log(s) processed", reports.len());
        }
        return Ok(());
    }

    let Some(path) = cmd.path else {
        bail!("either a log path or --chain <dir> is required");
    };
    let report = repair(&path, &config, mode, &ui)
        .with_context(|| format!("repairing {}", path.display()))?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_outcome(&report);
    }
    Ok(())
}

fn run_sweep(cmd: SweepCommand) -> anyhow::Result<()> {
    let retention = cmd
        .backup_retention_days
        .map_or(mendlog_core::DEFAULT_BACKUP_RETENTION, |days| {
            Duration::from_secs(days * 24 * 60 * 60)
        });
    let report = sweep_backups(&cmd.dir, retention)
        .with_context(|| format!("sweeping {}", cmd.dir.display()))?;
    println!(
        "examined {} backup(s), deleted {}",
        report.examined, report.deleted
    );
    Ok(())
}

/// Human-readable findings/plan reporting plus the confirmation prompt.
/// `quiet` suppresses the running commentary (JSON mode), never the prompt.
struct ConsoleUi {
    quiet: bool,
}

impl RepairUi for ConsoleUi {
    fn report_findings(&self, path: &Path, findings: &Findings) {
        if !self.quiet {
            print_findings(path, findings);
        }
    }

    fn report_plan(&self, path: &Path, plan: &RepairPlan) {
        if self.quiet {
            return;
        }
        if plan.is_empty() {
            println!("{}: nothing to repair", path.display());
        } else {
            println!("planned repairs:");
            for action in &plan.actions {
                println!("  - {}", action.describe());
            }
        }
    }

    fn confirm(&self, path: &Path, plan: &RepairPlan) -> bool {
        print!(
            "Apply {} repair(s) to {}? [y/N] ",
            plan.len(),
            path.display()
        );
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

fn print_findings(path: &Path, findings: &Findings) {
    println!(
        "{}: {} record(s), {} unparseable line(s), {} adjacency gap(s), {} poisoned hit(s), {} irreparable entr{}",
        path.display(),
        findings.records,
        findings.opaque_lines,
        findings.gap_count(),
        findings.poisoned.len(),
        findings.irreparable.len(),
        if findings.irreparable.len() == 1 { "y" } else { "ies" },
    );
    for pairing in &findings.pairings {
        match pairing.gap {
            GapKind::None => {}
            GapKind::NonAdjacent => println!(
                "  {}: result at line {} is not adjacent to its invocation at line {}",
                pairing.tool_id,
                pairing.result_pos.map_or(0, |p| p + 1),
                pairing.invocation_pos + 1,
            ),
            GapKind::Missing => println!(
                "  {}: no result anywhere for invocation at line {}",
                pairing.tool_id,
                pairing.invocation_pos + 1,
            ),
        }
    }
    for hit in &findings.poisoned {
        println!(
            "  poisoned {} at line {} ({:?})",
            hit.tool_id,
            hit.pos + 1,
            hit.site
        );
    }
    for entry in &findings.irreparable {
        println!(
            "  irreparable {} at line {} ({:?})",
            entry.tool_id,
            entry.pos + 1,
            entry.reason
        );
    }
}

fn print_outcome(report: &RepairReport) {
    match report.outcome {
        RepairOutcome::Clean => println!("{}: clean, nothing applied", report.path.display()),
        RepairOutcome::Repaired => println!(
            "{}: applied {} repair(s)",
            report.path.display(),
            report.actions_applied
        ),
        RepairOutcome::Declined => {
            println!("{}: declined, left untouched", report.path.display());
        }
    }
}
