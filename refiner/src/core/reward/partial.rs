//! Partial credit for failures whose actual value was close to the expected one.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::TestOutcome;

static EXPECTED_ACTUAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Expected[:\s]+(.+?)[\s|]+(?:but got|Actual:)\s+(.+?)(?:\n|$)").unwrap()
});
static ASSERT_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"assert\s+(.+?)\s*==\s*(.+?)(?:\n|$)").unwrap());
static NUMERIC_NE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*!=\s*(\d+(?:\.\d+)?)").unwrap());

/// Values shown in the breakdown are clipped to this many characters.
const SAMPLE_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub expected: String,
    pub actual: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialScore {
    pub reward: f64,
    pub average_similarity: f64,
    pub similarities: Vec<Similarity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PartialScore {
    fn empty(note: &str) -> Self {
        Self {
            note: Some(note.to_string()),
            ..Self::default()
        }
    }
}

pub fn score(outcome: &TestOutcome, max: f64) -> PartialScore {
    if outcome.failed == 0 {
        return PartialScore::empty("All tests passed");
    }

    let similarities: Vec<Similarity> = outcome
        .failures
        .iter()
        .filter_map(|failure| extract_pair(&failure.message))
        .filter_map(|(expected, actual)| {
            let similarity = similarity(&expected, &actual);
            (similarity > 0.0).then(|| Similarity {
                expected: crate::core::outcome_parser::truncate_chars(&expected, SAMPLE_CHARS),
                actual: crate::core::outcome_parser::truncate_chars(&actual, SAMPLE_CHARS),
                similarity,
            })
        })
        .collect();

    if similarities.is_empty() {
        return PartialScore::empty("No parseable expected/actual values");
    }

    let average = similarities.iter().map(|s| s.similarity).sum::<f64>() / similarities.len() as f64;
    debug!(average, count = similarities.len(), "partial correctness");
    PartialScore {
        reward: average * max,
        average_similarity: average,
        similarities,
        note: None,
    }
}

/// `(expected, actual)` from a failure message, if one of the known shapes appears.
pub fn extract_pair(message: &str) -> Option<(String, String)> {
    if let Some(caps) = EXPECTED_ACTUAL_RE.captures(message) {
        return Some((caps[1].trim().to_string(), caps[2].trim().to_string()));
    }
    if let Some(caps) = ASSERT_EQ_RE.captures(message) {
        return Some((caps[2].trim().to_string(), caps[1].trim().to_string()));
    }
    NUMERIC_NE_RE
        .captures(message)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

/// Similarity in `[0, 1]`: relative error for numbers, normalized edit distance otherwise.
pub fn similarity(expected: &str, actual: &str) -> f64 {
    if let (Ok(expected), Ok(actual)) = (expected.parse::<f64>(), actual.parse::<f64>()) {
        if expected == 0.0 {
            return if actual == 0.0 { 1.0 } else { 0.0 };
        }
        let relative_error = (expected - actual).abs() / expected.abs();
        return (1.0 - relative_error).max(0.0);
    }

    let expected = expected.to_lowercase();
    let actual = actual.to_lowercase();
    match (expected.is_empty(), actual.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => strsim::normalized_levenshtein(&expected, &actual).max(0.0),
    }
}
