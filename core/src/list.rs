use std::cmp::Reverse;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::debug;
use uuid::Uuid;

use crate::error::MendError;

/// One discovered session log.
///
/// Logs are named `rollout-YYYY-MM-DDThh-mm-ss-<uuid>.jsonl`; when the name
/// does not follow that shape the file's mtime stands in for ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLogRef {
    pub path: PathBuf,
    pub timestamp: OffsetDateTime,
    pub id: Option<Uuid>,
}

/// Walk `root` recursively and return every session log, newest first
/// (timestamp desc, then uuid desc for files created in the same second).
/// Transaction siblings (`.backup`, `.working`, `.lock`) are not logs.
pub fn find_session_logs(root: &Path) -> Result<Vec<SessionLogRef>, MendError> {
    let mut logs = Vec::new();
    collect_logs(root, &mut logs)?;
    logs.sort_by_key(|log| (Reverse(log.timestamp), Reverse(log.id)));
    debug!(root = %root.display(), count = logs.len(), "discovered session logs");
    Ok(logs)
}

fn collect_logs(dir: &Path, logs: &mut Vec<SessionLogRef>) -> Result<(), MendError> {
    let entries = fs::read_dir(dir).map_err(|e| MendError::io("reading directory", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| MendError::io("reading directory entry", dir, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| MendError::io("inspecting directory entry", &path, e))?;
        if file_type.is_dir() {
            collect_logs(&path, logs)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") {
            continue;
        }
        let (timestamp, id) = match parse_timestamp_uuid_from_filename(name) {
            Some((ts, id)) => (ts, Some(id)),
            None => (mtime_timestamp(&entry), None),
        };
        logs.push(SessionLogRef {
            path,
            timestamp,
            id,
        });
    }
    Ok(())
}

fn mtime_timestamp(entry: &fs::DirEntry) -> OffsetDateTime {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map_or(OffsetDateTime::UNIX_EPOCH, |d| {
            OffsetDateTime::UNIX_EPOCH + d
        })
}

fn parse_timestamp_uuid_from_filename(name: &str) -> Option<(OffsetDateTime, Uuid)> {
    let core = name.strip_prefix("rollout-")?.strip_suffix(".jsonl")?;

    let (sep_idx, uuid) = core
        .match_indices('-')
        .rev()
        .find_map(|(i, _)| Uuid::parse_str(&core[i + 1..]).ok().map(|u| (i, u)))?;

    let ts_str = &core[..sep_idx];
    let format: &[FormatItem] =
        format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]");
    let ts = PrimitiveDateTime::parse(ts_str, format).ok()?.assume_utc();
    Some((ts, uuid))
}
