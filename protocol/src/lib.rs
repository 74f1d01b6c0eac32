//! Typed model for one line of a session rollout file.
//!
//! A rollout is UTF-8 JSONL: one self-describing JSON object per line,
//! newline-terminated. The `type` field discriminates user messages,
//! assistant messages, summaries, and everything else; message records carry
//! an ordered list of content blocks under `message.content`.

mod error;
mod records;

pub use error::ParseError;
pub use records::ContentBlock;
pub use records::Record;
pub use records::RecordKind;
pub use records::SYNTHETIC_RESULT_TEXT;
