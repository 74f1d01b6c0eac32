use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use uuid::Uuid;

use crate::error::ParseError;

/// Payload of the tool result synthesized when a log never recorded one.
pub const SYNTHETIC_RESULT_TEXT: &str =
    "No result was recorded for this tool invocation; an error result was inserted during log repair.";

/// Which of the line shapes a record was parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    UserMessage,
    AssistantMessage,
    Summary,
    Other,
}

/// One typed sub-unit of a message record's `message.content` list.
///
/// The variant set is closed on purpose: the scanner and planner match on it
/// exhaustively, so a new block kind is a compile-time extension point. Lines
/// carrying a block outside this set stay opaque (see [`Record::parse`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
}

/// One parsed line of a session rollout.
///
/// The original serialization is retained verbatim; a record that no repair
/// touches serializes back byte-identical. Mutations flip the dirty flag and
/// re-render from the backing value, so fields this model does not interpret
/// (uuid, timestamp, provider extras) survive a rewrite.
#[derive(Debug, Clone)]
pub struct Record {
    kind: RecordKind,
    blocks: Vec<ContentBlock>,
    value: Value,
    raw: Option<String>,
    dirty: bool,
}

impl Record {
    /// Parse one log line. Message records get their content blocks decoded
    /// strictly; any other well-formed JSON object with a `type` field is an
    /// `Other` record carried opaquely.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(line).map_err(ParseError::Json)?;
        let record_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingType)?;

        let (kind, expected_role) = match record_type {
            "user" => (RecordKind::UserMessage, Some("user")),
            "assistant" => (RecordKind::AssistantMessage, Some("assistant")),
            "summary" => (RecordKind::Summary, None),
            _ => (RecordKind::Other, None),
        };

        let blocks = match expected_role {
            Some(role) => parse_message_blocks(&value, role)?,
            None => Vec::new(),
        };

        Ok(Self {
            kind,
            blocks,
            value,
            raw: Some(line.to_string()),
            dirty: false,
        })
    }

    /// Build the record inserted in place of a missing tool result: a user
    /// message whose single block is an `is_error` result for `tool_id`.
    pub fn synthetic_tool_result(tool_id: &str) -> Self {
        let block = ContentBlock::ToolResult {
            tool_use_id: tool_id.to_string(),
            is_error: true,
            content: Value::String(SYNTHETIC_RESULT_TEXT.to_string()),
        };
        let value = json!({
            "type": "user",
            "uuid": Uuid::new_v4().to_string(),
            "timestamp": timestamp_now(),
            "message": {
                "role": "user",
                "content": [],
            },
        });
        Self {
            kind: RecordKind::UserMessage,
            blocks: vec![block],
            value,
            raw: None,
            dirty: true,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn is_message(&self) -> bool {
        matches!(
            self.kind,
            RecordKind::UserMessage | RecordKind::AssistantMessage
        )
    }

    /// The original line, when this record came from disk.
    pub fn raw_line(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn summary_text(&self) -> Option<&str> {
        if self.kind == RecordKind::Summary {
            self.value.get("summary").and_then(Value::as_str)
        } else {
            None
        }
    }

    pub fn set_summary_text(&mut self, text: String) {
        self.value["summary"] = Value::String(text);
        self.dirty = true;
    }

    /// Replace the payload of the `Text` block at `index`. Blocks of any
    /// other variant are left alone.
    pub fn set_text(&mut self, index: usize, new_text: String) {
        if let Some(ContentBlock::Text { text }) = self.blocks.get_mut(index) {
            *text = new_text;
            self.dirty = true;
        }
    }

    pub fn remove_block(&mut self, index: usize) {
        if index < self.blocks.len() {
            self.blocks.remove(index);
            self.dirty = true;
        }
    }

    /// A message record with no blocks left carries no content worth keeping.
    pub fn is_contentless(&self) -> bool {
        self.is_message() && self.blocks.is_empty()
    }

    /// Serialize back to one log line (no trailing newline). Untouched
    /// records reproduce their original bytes.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        if !self.dirty
            && let Some(raw) = &self.raw
        {
            return Ok(raw.clone());
        }
        let mut value = self.value.clone();
        if self.is_message() {
            value["message"]["content"] = serde_json::to_value(&self.blocks)?;
        }
        serde_json::to_string(&value)
    }
}

fn parse_message_blocks(value: &Value, expected_role: &'static str) -> Result<Vec<ContentBlock>, ParseError> {
    let message = value.get("message").ok_or(ParseError::MissingMessage)?;

    if let Some(role) = message.get("role").and_then(Value::as_str)
        && role != expected_role
    {
        return Err(ParseError::RoleMismatch {
            expected: expected_role,
            found: role.to_string(),
        });
    }

    let content = message.get("content").ok_or(ParseError::MissingContent)?;
    match content {
        // Bare-string shorthand for a single text block.
        Value::String(text) => Ok(vec![ContentBlock::Text { text: text.clone() }]),
        Value::Array(items) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(ParseError::Block))
            .collect(),
        _ => Err(ParseError::InvalidContent),
    }
}

fn timestamp_now() -> String {
    let format: &[FormatItem] = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    );
    OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|e| format!("format error: {e}"))
}
