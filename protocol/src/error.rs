use thiserror::Error;

/// Why one log line could not be parsed into a typed [`crate::Record`].
///
/// A `ParseError` never aborts a scan; the reader keeps the offending line
/// verbatim so later stages can pass it through unchanged.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("record has no string `type` field")]
    MissingType,

    #[error("message record has no `message` object")]
    MissingMessage,

    #[error("message record has no `content` field")]
    MissingContent,

    #[error("`content` must be a string or an array of content blocks")]
    InvalidContent,

    #[error("unsupported content block: {0}")]
    Block(#[source] serde_json::Error),

    #[error("record type expects role `{expected}` but message role is `{found}`")]
    RoleMismatch {
        expected: &'static str,
        found: String,
    },
}
