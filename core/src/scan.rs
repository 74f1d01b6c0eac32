use std::collections::BTreeSet;
use std::collections::HashMap;

use mendlog_protocol::ContentBlock;
use serde::Serialize;

use crate::reader::LogLine;

/// How a tool invocation's result relates to it positionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// The result immediately follows (or only sibling results of the same
    /// invocation record intervene).
    None,
    /// A result exists but a record of another kind intervenes.
    NonAdjacent,
    /// No result exists anywhere in the log.
    Missing,
}

/// One invocation/result position pairing, in invocation order.
#[derive(Debug, Clone, Serialize)]
pub struct ToolPairing {
    pub tool_id: String,
    pub invocation_pos: usize,
    pub result_pos: Option<usize>,
    pub gap: GapKind,
}

/// Structural damage the planner will not touch. The rest of the file is
/// still repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrreparableReason {
    /// A result whose id never appears as an invocation anywhere.
    DanglingResult,
    /// A result that appears before its invocation.
    ForwardResult,
    /// A second invocation reusing an id.
    DuplicateInvocation,
    /// A second result answering an already-resolved id.
    DuplicateResult,
    /// A result in the same record as its own invocation.
    ResultAlongsideInvocation,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrreparableEntry {
    pub tool_id: String,
    pub pos: usize,
    pub reason: IrreparableReason,
}

/// Where a deny-listed identifier was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonSite {
    ToolUseBlock,
    ToolResultBlock,
    TextBlock,
    SummaryText,
    /// Opaque line, or embedded somewhere the planner has no safe edit for;
    /// reported, passed through.
    Unstructured,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoisonHit {
    pub tool_id: String,
    pub pos: usize,
    pub site: PoisonSite,
}

/// Everything one scan pass learned about a log.
#[derive(Debug, Clone, Serialize)]
pub struct Findings {
    pub pairings: Vec<ToolPairing>,
    pub irreparable: Vec<IrreparableEntry>,
    pub poisoned: Vec<PoisonHit>,
    pub records: usize,
    pub opaque_lines: usize,
}

impl Findings {
    pub fn gap_count(&self) -> usize {
        self.pairings
            .iter()
            .filter(|p| p.gap != GapKind::None)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.gap_count() == 0 && self.poisoned.is_empty() && self.irreparable.is_empty()
    }

    /// Ids repair must leave alone because their structure is damaged.
    pub fn irreparable_ids(&self) -> BTreeSet<&str> {
        self.irreparable
            .iter()
            .map(|entry| entry.tool_id.as_str())
            .collect()
    }
}

struct Pending {
    invocation_pos: usize,
    result_pos: Option<usize>,
}

/// Single linear pass over `lines`, building the pending-invocation table and
/// classifying every pairing, plus the secondary text-level deny-list scan.
/// Positions are indices into `lines` (opaque lines included).
pub fn scan_records(lines: &[LogLine], poisoned_ids: &BTreeSet<String>) -> Findings {
    let mut table: HashMap<&str, Pending> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    let mut irreparable: Vec<IrreparableEntry> = Vec::new();
    let mut unmatched_results: Vec<(&str, usize)> = Vec::new();
    let mut records = 0usize;
    let mut opaque_lines = 0usize;

    for (pos, line) in lines.iter().enumerate() {
        let Some(record) = line.record() else {
            opaque_lines += 1;
            continue;
        };
        records += 1;
        for block in record.blocks() {
            match block {
                ContentBlock::Text { .. } => {}
                ContentBlock::ToolUse { id, .. } => {
                    if table.contains_key(id.as_str()) {
                        irreparable.push(IrreparableEntry {
                            tool_id: id.clone(),
                            pos,
                            reason: IrreparableReason::DuplicateInvocation,
                        });
                    } else {
                        table.insert(
                            id.as_str(),
                            Pending {
                                invocation_pos: pos,
                                result_pos: None,
                            },
                        );
                        order.push(id.as_str());
                    }
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    match table.get_mut(tool_use_id.as_str()) {
                        Some(pending) if pending.result_pos.is_none() => {
                            pending.result_pos = Some(pos);
                        }
                        Some(_) => irreparable.push(IrreparableEntry {
                            tool_id: tool_use_id.clone(),
                            pos,
                            reason: IrreparableReason::DuplicateResult,
                        }),
                        None => unmatched_results.push((tool_use_id.as_str(), pos)),
                    }
                }
            }
        }
    }

    // A result with no earlier invocation is either dangling outright or a
    // forward reference to an invocation later in the file.
    for (tool_id, pos) in unmatched_results {
        let reason = if table.contains_key(tool_id) {
            IrreparableReason::ForwardResult
        } else {
            IrreparableReason::DanglingResult
        };
        irreparable.push(IrreparableEntry {
            tool_id: tool_id.to_string(),
            pos,
            reason,
        });
    }

    let mut pairings = Vec::with_capacity(order.len());
    for tool_id in order {
        let Some(pending) = table.get(tool_id) else {
            continue;
        };
        let gap = match pending.result_pos {
            Option::None => GapKind::Missing,
            Some(result_pos) if result_pos == pending.invocation_pos => {
                irreparable.push(IrreparableEntry {
                    tool_id: tool_id.to_string(),
                    pos: result_pos,
                    reason: IrreparableReason::ResultAlongsideInvocation,
                });
                GapKind::None
            }
            Some(result_pos) if is_adjacent(lines, pending.invocation_pos, result_pos) => {
                GapKind::None
            }
            Some(_) => GapKind::NonAdjacent,
        };
        pairings.push(ToolPairing {
            tool_id: tool_id.to_string(),
            invocation_pos: pending.invocation_pos,
            result_pos: pending.result_pos,
            gap,
        });
    }

    let poisoned = scan_poisoned(lines, poisoned_ids);

    Findings {
        pairings,
        irreparable,
        poisoned,
        records,
        opaque_lines,
    }
}

/// Adjacency in the strict sense is `result_pos == invocation_pos + 1`. When
/// one record carries several invocations their results land in consecutive
/// records; sibling results of the same invocation record are not "a record
/// of another kind", so a run of them still counts as adjacent.
fn is_adjacent(lines: &[LogLine], invocation_pos: usize, result_pos: usize) -> bool {
    if result_pos == invocation_pos + 1 {
        return true;
    }
    if result_pos <= invocation_pos {
        return false;
    }
    let Some(anchor) = lines[invocation_pos].record() else {
        return false;
    };
    let anchor_ids: BTreeSet<&str> = anchor
        .blocks()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => Option::None,
        })
        .collect();

    (invocation_pos + 1..result_pos).all(|pos| {
        lines[pos].record().is_some_and(|record| {
            !record.blocks().is_empty()
                && record.blocks().iter().all(|block| {
                    matches!(
                        block,
                        ContentBlock::ToolResult { tool_use_id, .. }
                            if anchor_ids.contains(tool_use_id.as_str())
                    )
                })
        })
    })
}

/// Text-level pass, independent of structure: every line whose original
/// serialization mentions a deny-listed id is reported, classified by the
/// most specific site the id occupies.
fn scan_poisoned(lines: &[LogLine], poisoned_ids: &BTreeSet<String>) -> Vec<PoisonHit> {
    let mut hits = Vec::new();
    for tool_id in poisoned_ids {
        for (pos, line) in lines.iter().enumerate() {
            if !line.text_contains(tool_id) {
                continue;
            }
            hits.push(PoisonHit {
                tool_id: tool_id.clone(),
                pos,
                site: classify_poison_site(line, tool_id),
            });
        }
    }
    hits
}

fn classify_poison_site(line: &LogLine, tool_id: &str) -> PoisonSite {
    let Some(record) = line.record() else {
        return PoisonSite::Unstructured;
    };
    let mut text_mention = false;
    for block in record.blocks() {
        match block {
            ContentBlock::ToolUse { id, .. } if id == tool_id => {
                return PoisonSite::ToolUseBlock;
            }
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == tool_id => {
                return PoisonSite::ToolResultBlock;
            }
            ContentBlock::Text { text } if text.contains(tool_id) => {
                text_mention = true;
            }
            _ => {}
        }
    }
    if text_mention {
        PoisonSite::TextBlock
    } else if record.summary_text().is_some_and(|s| s.contains(tool_id)) {
        PoisonSite::SummaryText
    } else {
        PoisonSite::Unstructured
    }
}
