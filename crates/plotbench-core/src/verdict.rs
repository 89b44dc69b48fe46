//! Categorical judge verdicts.
//!
//! Judges answer in free text. Parsing is total: anything that does not carry
//! a recognisable label becomes [`JudgeVerdict::Unknown`].

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

lazy_static! {
    /// Leftmost whole-word label in free text.
    static ref LABEL_WORD: Regex =
        Regex::new(r"(?i)\b(very[\s_-]+good|very[\s_-]+poor|excellent|average|poor)\b").unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"[\s_-]+").unwrap();
}

/// Ordinal quality label returned by a judge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum JudgeVerdict {
    Excellent,
    #[serde(rename = "Very Good")]
    VeryGood,
    Average,
    Poor,
    #[serde(rename = "Very Poor")]
    VeryPoor,
    /// The judge reply carried no recognisable label, or the judge was unreachable
    #[default]
    Unknown,
}

impl JudgeVerdict {
    /// The known labels, best first.
    pub const SCALE: [JudgeVerdict; 5] = [
        JudgeVerdict::Excellent,
        JudgeVerdict::VeryGood,
        JudgeVerdict::Average,
        JudgeVerdict::Poor,
        JudgeVerdict::VeryPoor,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            JudgeVerdict::Excellent => "Excellent",
            JudgeVerdict::VeryGood => "Very Good",
            JudgeVerdict::Average => "Average",
            JudgeVerdict::Poor => "Poor",
            JudgeVerdict::VeryPoor => "Very Poor",
            JudgeVerdict::Unknown => "Unknown",
        }
    }

    /// Ordinal score, 5 for Excellent down to 1 for Very Poor.
    pub fn score(&self) -> Option<u8> {
        match self {
            JudgeVerdict::Excellent => Some(5),
            JudgeVerdict::VeryGood => Some(4),
            JudgeVerdict::Average => Some(3),
            JudgeVerdict::Poor => Some(2),
            JudgeVerdict::VeryPoor => Some(1),
            JudgeVerdict::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, JudgeVerdict::Unknown)
    }

    /// Parse a judge reply. Never fails.
    ///
    /// Tries, in order: the reply as a bare label, a JSON object with a
    /// single string value, and the leftmost label word in free text.
    pub fn parse(text: &str) -> Self {
        if let Some(verdict) = Self::from_label(text) {
            return verdict;
        }

        if let Some(verdict) = Self::from_json(text) {
            return verdict;
        }

        LABEL_WORD
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| Self::from_label(m.as_str()))
            .unwrap_or(JudgeVerdict::Unknown)
    }

    /// Match a bare label, ignoring case, quotes and trailing punctuation.
    fn from_label(text: &str) -> Option<Self> {
        let trimmed = text.trim_matches(|c: char| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '*' | '.' | '!' | ':' | ';' | ',')
        });
        let normalized = WHITESPACE.replace_all(trimmed, " ").to_lowercase();

        match normalized.as_str() {
            "excellent" => Some(JudgeVerdict::Excellent),
            "very good" => Some(JudgeVerdict::VeryGood),
            "average" => Some(JudgeVerdict::Average),
            "poor" => Some(JudgeVerdict::Poor),
            "very poor" => Some(JudgeVerdict::VeryPoor),
            _ => None,
        }
    }

    fn from_json(text: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(json_slice(text)?).ok()? {
            Value::String(s) => Self::from_label(&s),
            Value::Object(map) if map.len() == 1 => map
                .values()
                .next()
                .and_then(Value::as_str)
                .and_then(Self::from_label),
            _ => None,
        }
    }
}

impl fmt::Display for JudgeVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outermost `{...}` span, or the whole trimmed text when it is a JSON string.
fn json_slice(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.starts_with('"') {
        return Some(trimmed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// Both axes from a single-call judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CombinedVerdict {
    pub correctness: JudgeVerdict,
    pub aesthetics: JudgeVerdict,
}

impl CombinedVerdict {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Parse a JSON reply such as `{"accuracy": "Very Good", "aesthetics": "Poor"}`.
    ///
    /// The object may be wrapped in a code fence or prose. Each axis that is
    /// missing or unrecognised is `Unknown` on its own.
    pub fn parse(text: &str) -> Self {
        let map = match json_slice(text).and_then(|s| serde_json::from_str::<Value>(s).ok()) {
            Some(Value::Object(map)) => map,
            _ => return Self::unknown(),
        };

        let axis = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| map.get(*k))
                .and_then(Value::as_str)
                .map(JudgeVerdict::parse)
                .unwrap_or(JudgeVerdict::Unknown)
        };

        Self {
            correctness: axis(&["accuracy", "correctness"]),
            aesthetics: axis(&["aesthetics", "aesthetic_quality"]),
        }
    }
}
