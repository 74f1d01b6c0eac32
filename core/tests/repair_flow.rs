#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use mendlog_core::GapKind;
use mendlog_core::MendError;
use mendlog_core::RepairConfig;
use mendlog_core::RepairMode;
use mendlog_core::RepairOutcome;
use mendlog_core::RepairPlan;
use mendlog_core::RepairUi;
use mendlog_core::load_log;
use mendlog_core::repair;
use mendlog_core::repair_chain;
use mendlog_core::scan;
use mendlog_core::scan_records;
use mendlog_protocol::ContentBlock;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Quiet;
impl RepairUi for Quiet {}

struct Decline;
impl RepairUi for Decline {
    fn confirm(&self, _path: &Path, _plan: &RepairPlan) -> bool {
        false
    }
}

fn assistant_tool_use(id: &str) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"{id}","name":"bash","input":{{}}}}]}}}}"#
    )
}

fn user_tool_result(id: &str) -> String {
    format!(
        r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{id}","is_error":false,"content":"ok"}}]}}}}"#
    )
}

fn user_text(text: &str) -> String {
    format!(
        r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"text","text":"{text}"}}]}}}}"#
    )
}

fn write_log(path: &Path, lines: &[String]) {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path, content).unwrap();
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// The adjacency postcondition: every invocation's results start at the
/// very next record.
fn assert_adjacency(path: &Path) {
    let lines = load_log(path).unwrap();
    let findings = scan_records(&lines, &BTreeSet::new());
    for pairing in &findings.pairings {
        assert_eq!(
            pairing.gap,
            GapKind::None,
            "pairing {pairing:?} still has a gap"
        );
    }
}

#[test]
fn scenario_a_moves_result_up_on_disk() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    let raw = vec![
        user_text("start"),
        user_text("more"),
        assistant_tool_use("t1"),
        user_text("interloper"),
        user_tool_result("t1"),
    ];
    write_log(&log, &raw);

    let report = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(report.outcome, RepairOutcome::Repaired);
    assert_eq!(report.non_adjacent, 1);
    assert_eq!(report.actions_applied, 1);

    let after = read_lines(&log);
    assert_eq!(
        after,
        vec![
            raw[0].clone(),
            raw[1].clone(),
            raw[2].clone(),
            raw[4].clone(),
            raw[3].clone(),
        ]
    );
    assert_adjacency(&log);
    assert!(scan(&log, &RepairConfig::default()).unwrap().is_clean());
    // Siblings are cleared after commit.
    assert!(!dir.path().join("session.jsonl.backup").exists());
    assert!(!dir.path().join("session.jsonl.working").exists());
    assert!(!dir.path().join("session.jsonl.lock").exists());
}

#[test]
fn scenario_b_synthesizes_missing_result() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    let raw = vec![assistant_tool_use("t2"), user_text("moved on")];
    write_log(&log, &raw);

    let report = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(report.outcome, RepairOutcome::Repaired);

    let lines = load_log(&log).unwrap();
    assert_eq!(lines.len(), 3);
    match lines[1].record().unwrap().blocks() {
        [ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            ..
        }] => {
            assert_eq!(tool_use_id, "t2");
            assert!(*is_error);
        }
        blocks => panic!("expected synthetic result, got {blocks:?}"),
    }
    assert_adjacency(&log);
}

#[test]
fn repair_is_idempotent_on_disk() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    write_log(
        &log,
        &[
            assistant_tool_use("t1"),
            user_text("interloper"),
            user_tool_result("t1"),
            assistant_tool_use("t2"),
        ],
    );

    let first = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(first.outcome, RepairOutcome::Repaired);
    let after_first = fs::read_to_string(&log).unwrap();

    let second = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(second.outcome, RepairOutcome::Clean);
    assert_eq!(second.actions_applied, 0);
    assert_eq!(fs::read_to_string(&log).unwrap(), after_first);
}

#[test]
fn untouched_lines_survive_byte_identical() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    // Oddly-spaced JSON and an unparseable line: both must ride through the
    // repair untouched.
    let weird = r#"{"type":"user",  "message": {"role":"user","content":"kept as-is"}}"#;
    let opaque = "not json, still kept";
    let raw = vec![
        weird.to_string(),
        opaque.to_string(),
        assistant_tool_use("t9"),
    ];
    write_log(&log, &raw);

    repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    let after = read_lines(&log);
    assert_eq!(after[0], weird);
    assert_eq!(after[1], opaque);
}

#[test]
fn declined_confirmation_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    let raw = vec![assistant_tool_use("t1")];
    write_log(&log, &raw);
    let before = fs::read_to_string(&log).unwrap();

    let report = repair(
        &log,
        &RepairConfig::default(),
        RepairMode::Interactive,
        &Decline,
    )
    .unwrap();
    assert_eq!(report.outcome, RepairOutcome::Declined);
    assert_eq!(report.actions_planned, 1);
    assert_eq!(report.actions_applied, 0);
    assert_eq!(fs::read_to_string(&log).unwrap(), before);
    assert!(!dir.path().join("session.jsonl.backup").exists());
}

#[test]
fn held_lock_times_out_with_no_mutation() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    write_log(&log, &[assistant_tool_use("t1")]);
    let before = fs::read_to_string(&log).unwrap();

    // A fresh lock held by a live process (us).
    let payload = format!(
        r#"{{"pid":{},"acquired_at":{now},"refreshed_at":{now}}}"#,
        std::process::id(),
        now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    );
    fs::write(dir.path().join("session.jsonl.lock"), payload).unwrap();

    let config = RepairConfig {
        lock_timeout: Duration::from_millis(250),
        ..RepairConfig::default()
    };
    let err = repair(&log, &config, RepairMode::Auto, &Quiet).unwrap_err();
    assert!(matches!(err, MendError::LockTimeout { .. }), "{err}");
    assert_eq!(fs::read_to_string(&log).unwrap(), before);
    assert!(!dir.path().join("session.jsonl.backup").exists());
    assert!(!dir.path().join("session.jsonl.working").exists());
}

#[test]
fn fully_unparseable_log_is_an_error() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    fs::write(&log, "garbage one\ngarbage two\n").unwrap();
    let before = fs::read_to_string(&log).unwrap();

    let err = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap_err();
    assert!(matches!(err, MendError::UnparseableLog { .. }), "{err}");
    assert_eq!(fs::read_to_string(&log).unwrap(), before);
    assert!(!dir.path().join("session.jsonl.lock").exists());
}

#[test]
fn poisoned_chain_repair_covers_every_log() {
    let dir = TempDir::new().unwrap();
    let day = dir.path().join("2025").join("03").join("01");
    fs::create_dir_all(&day).unwrap();
    let log_a = day.join("rollout-2025-03-01T10-00-00-67e55044-10b1-426f-9247-bb680e5fe0c8.jsonl");
    let log_b = day.join("rollout-2025-03-01T11-00-00-91f64ab1-5a3c-4b0c-9d6e-1f2a3b4c5d6e.jsonl");
    write_log(&log_a, &[assistant_tool_use("t1")]);
    write_log(
        &log_b,
        &[assistant_tool_use("toolu_X"), user_tool_result("toolu_X")],
    );

    let config = RepairConfig {
        poisoned_ids: ["toolu_X".to_string()].into(),
        ..RepairConfig::default()
    };
    let reports = repair_chain(dir.path(), &config, RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(reports.len(), 2);
    // Newest first: log_b is first.
    assert_eq!(reports[0].path, log_b);
    assert_eq!(reports[0].poisoned_hits, 2);
    assert_eq!(reports[1].path, log_a);
    assert_eq!(reports[1].missing, 1);

    assert_eq!(read_lines(&log_b), Vec::<String>::new());
    assert_adjacency(&log_a);
}

#[test]
fn repair_never_introduces_forward_references() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    write_log(
        &log,
        &[
            assistant_tool_use("t1"),
            user_text("a"),
            user_tool_result("t1"),
            assistant_tool_use("t2"),
            user_text("b"),
        ],
    );

    repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();

    // Walk the repaired file: every result id must already have appeared as
    // an invocation.
    let lines = load_log(&log).unwrap();
    let mut seen = BTreeSet::new();
    for line in &lines {
        let Some(record) = line.record() else { continue };
        for block in record.blocks() {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    seen.insert(id.clone());
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    assert!(seen.contains(tool_use_id), "dangling result {tool_use_id}");
                }
                ContentBlock::Text { .. } => {}
            }
        }
    }
}

#[test]
fn empty_log_is_a_clean_no_op() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("session.jsonl");
    fs::write(&log, "").unwrap();

    let report = repair(&log, &RepairConfig::default(), RepairMode::Auto, &Quiet).unwrap();
    assert_eq!(report.outcome, RepairOutcome::Clean);
    assert_eq!(fs::read_to_string(&log).unwrap(), "");
}
