//! Extraction of script source from raw model replies.
//!
//! Two stages: take the first fenced code block if there is one, otherwise
//! fall back to the reply verbatim. Neither stage can fail.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// First fenced block with an optional python language tag.
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```(?:[ \t]*(?i:python3|python|py)\b)?[ \t]*\r?\n?(.*?)\s*```").unwrap();
}

/// Script source recovered from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedCode {
    pub source: String,

    /// Whether the source came from a fenced block
    pub fenced: bool,
}

/// Contents of the first fenced code block, if any.
pub fn extract_fenced(raw: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Fenced contents, or the raw reply when nothing is fenced.
pub fn extract_code(raw: &str) -> ExtractedCode {
    match extract_fenced(raw) {
        Some(body) => ExtractedCode {
            source: body.to_string(),
            fenced: true,
        },
        None => ExtractedCode {
            source: raw.to_string(),
            fenced: false,
        },
    }
}
