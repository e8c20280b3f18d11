//! Completion-marker parsing for free-form agent answers.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Instruction appended to every prompt so the answer ends with a marker line.
pub const MARKER_INSTRUCTION: &str =
    "At the end of your answer add one line, exactly:\nSTATUS: SUCCESS\nor\nSTATUS: ERROR\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub text: String,
    pub completion: Completion,
}

/// How a run whose answer carries no marker is routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMarker {
    #[default]
    Error,
    Success,
}

impl MissingMarker {
    pub fn resolve(self, completion: Completion) -> bool {
        match completion {
            Completion::Success => true,
            Completion::Error => false,
            Completion::Unknown => self == MissingMarker::Success,
        }
    }
}

/// `STATUS:` followed by the completion word, any case.
static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)STATUS:\s*(SUCCESS|ERROR)").expect("Invalid status marker regex")
});

/// A newline, optional whitespace, another newline.
static BLANK_RUN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("Invalid blank line regex"));

/// Finds the last `STATUS: SUCCESS|ERROR` (any case, any whitespace after the
/// colon), removes it and collapses the blank lines left behind.
pub fn interpret(response: &str) -> Interpretation {
    let last = MARKER_REGEX
        .captures_iter(response)
        .last()
        .and_then(|caps| Some((caps.get(0)?, caps.get(1)?)));
    let Some((whole, word)) = last else {
        return Interpretation {
            text: response.to_string(),
            completion: Completion::Unknown,
        };
    };

    let completion = if word.as_str().eq_ignore_ascii_case("success") {
        Completion::Success
    } else {
        Completion::Error
    };
    let cleaned = format!("{}{}", &response[..whole.start()], &response[whole.end()..]);
    let text = BLANK_RUN_REGEX
        .replace_all(cleaned.trim(), "\n")
        .trim()
        .to_string();

    Interpretation { text, completion }
}
