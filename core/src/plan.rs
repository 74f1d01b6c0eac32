use std::collections::BTreeMap;
use std::collections::BTreeSet;

use mendlog_protocol::ContentBlock;
use mendlog_protocol::Record;
use mendlog_protocol::RecordKind;
use serde::Serialize;
use tracing::debug;

use crate::reader::LogLine;
use crate::scan::Findings;
use crate::scan::GapKind;
use crate::scan::PoisonSite;

/// Substituted for a poisoned id mentioned in ordinary (non-error) prose, so
/// the message keeps its meaning without carrying the identifier.
pub const REDACTION_PLACEHOLDER: &str = "[redacted-tool-id]";

/// One planned edit, positions always relative to the original sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    /// Move the record carrying the matching result to immediately follow
    /// the invocation record; everything in between shifts by one.
    MoveResult {
        tool_id: String,
        result_pos: usize,
        invocation_pos: usize,
    },
    /// No result exists anywhere: insert a synthetic error result right
    /// after the invocation record.
    InsertSyntheticResult {
        tool_id: String,
        invocation_pos: usize,
    },
    /// A poisoned id sits in a structured block: the whole record goes.
    DropPoisonedRecord { tool_id: String, pos: usize },
    /// A poisoned id sits in error text: the offending lines go, the block
    /// goes if emptied, the record goes if left contentless.
    StripPoisonedText { tool_id: String, pos: usize },
    /// A poisoned id is merely mentioned in prose: redact in place.
    RedactPoisonedMention { tool_id: String, pos: usize },
}

impl RepairAction {
    /// Human-readable form, 1-based line numbers.
    pub fn describe(&self) -> String {
        match self {
            Self::MoveResult {
                tool_id,
                result_pos,
                invocation_pos,
            } => format!(
                "move result for {tool_id} from line {} up to follow its invocation at line {}",
                result_pos + 1,
                invocation_pos + 1
            ),
            Self::InsertSyntheticResult {
                tool_id,
                invocation_pos,
            } => format!(
                "insert synthetic error result for {tool_id} after line {}",
                invocation_pos + 1
            ),
            Self::DropPoisonedRecord { tool_id, pos } => {
                format!("drop record at line {} (poisoned id {tool_id})", pos + 1)
            }
            Self::StripPoisonedText { tool_id, pos } => format!(
                "strip error text mentioning {tool_id} at line {}",
                pos + 1
            ),
            Self::RedactPoisonedMention { tool_id, pos } => {
                format!("redact mention of {tool_id} at line {}", pos + 1)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairPlan {
    pub actions: Vec<RepairAction>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Turn findings into the narrowest set of edits that restores the adjacency
/// invariant and clears poisoned identifiers. All positions reference the
/// immutable original sequence; the rewrite interprets them in one pass.
pub fn plan_repairs(
    lines: &[LogLine],
    findings: &Findings,
    poisoned_ids: &BTreeSet<String>,
) -> RepairPlan {
    let mut actions = Vec::new();
    let irreparable = findings.irreparable_ids();

    // Poison handling first: a drop beats any text edit on the same record.
    let mut drops: BTreeSet<usize> = BTreeSet::new();
    let mut text_hits: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
    for hit in &findings.poisoned {
        match hit.site {
            PoisonSite::ToolUseBlock | PoisonSite::ToolResultBlock => {
                drops.insert(hit.pos);
            }
            PoisonSite::TextBlock | PoisonSite::SummaryText => {
                text_hits.entry(hit.pos).or_default().push(hit.tool_id.as_str());
            }
            // Nothing safe to edit; reported by the scanner, passed through.
            PoisonSite::Unstructured => {}
        }
    }

    for pos in &drops {
        let tool_id = findings
            .poisoned
            .iter()
            .find(|hit| {
                hit.pos == *pos
                    && matches!(
                        hit.site,
                        PoisonSite::ToolUseBlock | PoisonSite::ToolResultBlock
                    )
            })
            .map(|hit| hit.tool_id.clone())
            .unwrap_or_default();
        actions.push(RepairAction::DropPoisonedRecord { tool_id, pos: *pos });
    }

    for (pos, ids) in &text_hits {
        if drops.contains(pos) {
            continue;
        }
        let Some(record) = lines[*pos].record() else {
            continue;
        };
        for &tool_id in ids {
            let (strip, redact) = classify_text_edit(record, tool_id);
            if strip {
                actions.push(RepairAction::StripPoisonedText {
                    tool_id: tool_id.to_string(),
                    pos: *pos,
                });
            }
            if redact {
                actions.push(RepairAction::RedactPoisonedMention {
                    tool_id: tool_id.to_string(),
                    pos: *pos,
                });
            }
        }
    }

    // Adjacency repairs in ascending invocation order, so earlier shifts
    // never invalidate later position references.
    for pairing in &findings.pairings {
        if poisoned_ids.contains(&pairing.tool_id)
            || irreparable.contains(pairing.tool_id.as_str())
            || drops.contains(&pairing.invocation_pos)
        {
            continue;
        }
        match pairing.gap {
            GapKind::None => {}
            GapKind::NonAdjacent => {
                if let Some(result_pos) = pairing.result_pos
                    && !drops.contains(&result_pos)
                {
                    actions.push(RepairAction::MoveResult {
                        tool_id: pairing.tool_id.clone(),
                        result_pos,
                        invocation_pos: pairing.invocation_pos,
                    });
                }
            }
            GapKind::Missing => {
                actions.push(RepairAction::InsertSyntheticResult {
                    tool_id: pairing.tool_id.clone(),
                    invocation_pos: pairing.invocation_pos,
                });
            }
        }
    }

    RepairPlan { actions }
}

/// Execute a plan against the original sequence, producing a brand-new one.
/// Records no action touches pass through untouched (and serialize
/// byte-identical).
pub fn rewrite(lines: Vec<LogLine>, plan: &RepairPlan) -> Vec<LogLine> {
    let len = lines.len();
    let mut slots: Vec<Option<LogLine>> = lines.into_iter().map(Some).collect();
    let mut dropped = vec![false; len];
    // Records scheduled to land right after original index i, tagged with the
    // block index of the invocation they answer so sibling results keep the
    // invocation's block order.
    let mut arrivals: Vec<Vec<(usize, LogLine)>> = (0..len).map(|_| Vec::new()).collect();

    for action in &plan.actions {
        if let RepairAction::DropPoisonedRecord { pos, .. } = action {
            dropped[*pos] = true;
        }
    }

    for action in &plan.actions {
        match action {
            RepairAction::StripPoisonedText { tool_id, pos } if !dropped[*pos] => {
                if let Some(record) = slots[*pos].as_mut().and_then(LogLine::record_mut) {
                    strip_poisoned_text(record, tool_id);
                    if record_is_empty(record) {
                        debug!(pos, tool_id, "record left contentless after strip; dropping");
                        dropped[*pos] = true;
                    }
                }
            }
            RepairAction::RedactPoisonedMention { tool_id, pos } if !dropped[*pos] => {
                if let Some(record) = slots[*pos].as_mut().and_then(LogLine::record_mut) {
                    redact_mentions(record, tool_id);
                }
            }
            _ => {}
        }
    }

    for action in &plan.actions {
        match action {
            RepairAction::MoveResult {
                tool_id,
                result_pos,
                invocation_pos,
            } => {
                if dropped[*invocation_pos] || dropped[*result_pos] {
                    continue;
                }
                let block_index = invocation_block_index(&slots, *invocation_pos, tool_id);
                // A record answering several invocations moves once, for the
                // earliest of them.
                if let Some(line) = slots[*result_pos].take() {
                    arrivals[*invocation_pos].push((block_index, line));
                }
            }
            RepairAction::InsertSyntheticResult {
                tool_id,
                invocation_pos,
            } => {
                if dropped[*invocation_pos] || slots[*invocation_pos].is_none() {
                    continue;
                }
                let block_index = invocation_block_index(&slots, *invocation_pos, tool_id);
                arrivals[*invocation_pos].push((
                    block_index,
                    LogLine::Record(Record::synthetic_tool_result(tool_id)),
                ));
            }
            _ => {}
        }
    }

    let mut out = Vec::with_capacity(len);
    for pos in 0..len {
        if !dropped[pos]
            && let Some(line) = slots[pos].take()
        {
            out.push(line);
        }
        let mut landing = std::mem::take(&mut arrivals[pos]);
        landing.sort_by_key(|(block_index, _)| *block_index);
        out.extend(landing.into_iter().map(|(_, line)| line));
    }
    out
}

/// A block reads as an error message about the tool when it mentions
/// "error" or the wire tokens for the paired block kinds.
fn is_error_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("error") || lower.contains("tool_use") || lower.contains("tool_result")
}

/// Which text edits apply to `record` for `tool_id`: (strip, redact).
fn classify_text_edit(record: &Record, tool_id: &str) -> (bool, bool) {
    let mut strip = false;
    let mut redact = false;
    for block in record.blocks() {
        if let ContentBlock::Text { text } = block
            && text.contains(tool_id)
        {
            if is_error_text(text) {
                strip = true;
            } else {
                redact = true;
            }
        }
    }
    if let Some(summary) = record.summary_text()
        && summary.contains(tool_id)
    {
        if is_error_text(summary) {
            strip = true;
        } else {
            redact = true;
        }
    }
    (strip, redact)
}

fn strip_lines_mentioning(text: &str, tool_id: &str) -> String {
    text.lines()
        .filter(|line| !line.contains(tool_id))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_poisoned_text(record: &mut Record, tool_id: &str) {
    let mut edits: Vec<(usize, Option<String>)> = Vec::new();
    for (index, block) in record.blocks().iter().enumerate() {
        if let ContentBlock::Text { text } = block
            && text.contains(tool_id)
            && is_error_text(text)
        {
            let stripped = strip_lines_mentioning(text, tool_id);
            if stripped.trim().is_empty() {
                edits.push((index, None));
            } else {
                edits.push((index, Some(stripped)));
            }
        }
    }
    for (index, edit) in edits.iter().rev() {
        match edit {
            Some(text) => record.set_text(*index, text.clone()),
            None => record.remove_block(*index),
        }
    }

    if let Some(summary) = record.summary_text()
        && summary.contains(tool_id)
        && is_error_text(summary)
    {
        let stripped = strip_lines_mentioning(summary, tool_id);
        record.set_summary_text(stripped);
    }
}

fn redact_mentions(record: &mut Record, tool_id: &str) {
    let mut edits: Vec<(usize, String)> = Vec::new();
    for (index, block) in record.blocks().iter().enumerate() {
        if let ContentBlock::Text { text } = block
            && text.contains(tool_id)
            && !is_error_text(text)
        {
            edits.push((index, text.replace(tool_id, REDACTION_PLACEHOLDER)));
        }
    }
    for (index, text) in edits {
        record.set_text(index, text);
    }

    if let Some(summary) = record.summary_text()
        && summary.contains(tool_id)
        && !is_error_text(summary)
    {
        record.set_summary_text(summary.replace(tool_id, REDACTION_PLACEHOLDER));
    }
}

fn record_is_empty(record: &Record) -> bool {
    if record.is_contentless() {
        return true;
    }
    record.kind() == RecordKind::Summary
        && record.summary_text().is_some_and(|s| s.trim().is_empty())
}

fn invocation_block_index(slots: &[Option<LogLine>], invocation_pos: usize, tool_id: &str) -> usize {
    slots[invocation_pos]
        .as_ref()
        .and_then(LogLine::record)
        .and_then(|record| {
            record.blocks().iter().position(|block| {
                matches!(block, ContentBlock::ToolUse { id, .. } if id == tool_id)
            })
        })
        .unwrap_or(usize::MAX)
}
