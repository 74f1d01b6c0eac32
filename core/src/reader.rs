use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Lines;
use std::path::Path;

use mendlog_protocol::ParseError;
use mendlog_protocol::Record;
use tracing::debug;

use crate::error::MendError;

/// One line of a loaded log: either a typed record or a line kept verbatim
/// because it would not parse. Opaque lines are a data-quality fact, not a
/// transient failure; they ride through every later stage unchanged.
#[derive(Debug)]
pub enum LogLine {
    Record(Record),
    Opaque { raw: String, error: ParseError },
}

impl LogLine {
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            Self::Opaque { .. } => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Self::Record(record) => Some(record),
            Self::Opaque { .. } => None,
        }
    }

    /// Serialize back to one log line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Record(record) => record.to_line(),
            Self::Opaque { raw, .. } => Ok(raw.clone()),
        }
    }

    /// Text-level containment check against the record's current
    /// serialization (original bytes for untouched records).
    pub fn text_contains(&self, needle: &str) -> bool {
        match self {
            Self::Record(record) => record
                .to_line()
                .is_ok_and(|line| line.contains(needle)),
            Self::Opaque { raw, .. } => raw.contains(needle),
        }
    }
}

/// Lazy, single-pass reader over a log file. Yields `(line_number, line)`
/// with 1-based line numbers; blank lines are skipped.
pub struct LogLines {
    lines: Lines<BufReader<File>>,
    line_number: usize,
}

impl Iterator for LogLines {
    type Item = std::io::Result<(usize, LogLine)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.lines.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };
            self.line_number += 1;
            if raw.trim().is_empty() {
                continue;
            }
            let line = match Record::parse(&raw) {
                Ok(record) => LogLine::Record(record),
                Err(error) => {
                    debug!(line = self.line_number, %error, "keeping unparseable line verbatim");
                    LogLine::Opaque { raw, error }
                }
            };
            return Some(Ok((self.line_number, line)));
        }
    }
}

/// Open `path` for a lazy scan. The log is treated as immutable for the
/// duration of one pass.
pub fn read_log(path: &Path) -> std::io::Result<LogLines> {
    let file = File::open(path)?;
    Ok(LogLines {
        lines: BufReader::new(file).lines(),
        line_number: 0,
    })
}

/// Collect the whole log into memory for the scanner and planner.
pub fn load_log(path: &Path) -> Result<Vec<LogLine>, MendError> {
    let mut lines = Vec::new();
    for item in read_log(path).map_err(|e| MendError::io("opening log", path, e))? {
        let (_, line) = item.map_err(|e| MendError::io("reading log", path, e))?;
        lines.push(line);
    }
    Ok(lines)
}
