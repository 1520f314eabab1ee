//! Convert raw pytest output into a [`TestOutcome`].
//!
//! Parsing is total: unrecognized text yields zero counts, never an error.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{FailureRecord, MAX_TEST_COUNT, RawExecution, TestCounts, TestOutcome};

/// Characters scanned after a failure marker when looking for error lines.
const FAILURE_WINDOW_CHARS: usize = 1000;
/// Error lines joined into one failure message.
const MAX_MESSAGE_LINES: usize = 3;
/// Failure messages are clipped to this many characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

const ERROR_KEYWORDS: [&str; 5] = ["AssertionError", "Error:", "Expected", "assert", "FAILED"];

static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+) passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+) failed").unwrap());
static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+) errors?\b").unwrap());
static SKIPPED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+) skipped").unwrap());

/// `FAILED` followed by a path/dotted test id on the same line; captures the last segment.
static FAILURE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FAILED[ \t]+(?:[\w./\[\]-]+::)*(test_\w+)").unwrap()
});

/// Parse one execution into a structured outcome.
pub fn parse(raw: &RawExecution) -> TestOutcome {
    let mut output = String::with_capacity(raw.stdout.len() + raw.stderr.len());
    output.push_str(&raw.stdout);
    output.push_str(&raw.stderr);

    let (mut counts, saw_passed_clause) = parse_summary(&output);
    let failures = parse_failures(&output);

    if raw.exit_code == 0 && counts.total() == 0 && !saw_passed_clause {
        let markers = count_passed_markers(&output);
        if markers > 0 {
            counts.passed = markers;
        }
    }

    TestOutcome::new(counts, failures, raw)
}

/// Counts from the last line that carries at least one summary clause.
///
/// Returns the counts and whether an explicit `<n> passed` clause was seen.
fn parse_summary(output: &str) -> (TestCounts, bool) {
    let Some(line) = output.lines().rev().find(|line| is_summary_line(line)) else {
        return (TestCounts::default(), false);
    };

    let passed = capture_count(&PASSED_RE, line);
    let counts = TestCounts {
        passed: passed.unwrap_or(0),
        failed: capture_count(&FAILED_RE, line).unwrap_or(0),
        errored: capture_count(&ERROR_RE, line).unwrap_or(0),
        skipped: capture_count(&SKIPPED_RE, line).unwrap_or(0),
    };
    (counts, passed.is_some())
}

fn is_summary_line(line: &str) -> bool {
    [&PASSED_RE, &FAILED_RE, &ERROR_RE, &SKIPPED_RE]
        .iter()
        .any(|re| re.is_match(line))
}

/// The clause's count, capped at [`MAX_TEST_COUNT`]; digit runs too long for `u32` hit the cap.
fn capture_count(re: &Regex, line: &str) -> Option<u32> {
    let digits = re.captures(line)?.get(1)?.as_str();
    Some(
        digits
            .parse::<u32>()
            .map_or(MAX_TEST_COUNT, |n| n.min(MAX_TEST_COUNT)),
    )
}

fn parse_failures(output: &str) -> Vec<FailureRecord> {
    let markers: Vec<(usize, usize, &str)> = FAILURE_MARKER_RE
        .captures_iter(output)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?;
            Some((whole.start(), whole.end(), name.as_str()))
        })
        .collect();

    markers
        .iter()
        .enumerate()
        .map(|(i, &(_, end, name))| {
            let stop = markers.get(i + 1).map_or(output.len(), |next| next.0);
            FailureRecord {
                test_name: name.to_string(),
                message: failure_message(window(&output[end..stop])),
            }
        })
        .collect()
}

/// At most [`FAILURE_WINDOW_CHARS`] characters of the text following a marker.
///
/// The caller already cut the text at the next marker, so one failure's
/// message never borrows lines from the next.
fn window(rest: &str) -> &str {
    match rest.char_indices().nth(FAILURE_WINDOW_CHARS) {
        Some((end, _)) => &rest[..end],
        None => rest,
    }
}

fn failure_message(window: &str) -> String {
    let lines: Vec<&str> = window
        .lines()
        .filter(|line| ERROR_KEYWORDS.iter().any(|kw| line.contains(kw)))
        .map(str::trim)
        .take(MAX_MESSAGE_LINES)
        .collect();
    if lines.is_empty() {
        return "Test failed".to_string();
    }
    truncate_chars(&lines.join(" "), MAX_MESSAGE_CHARS)
}

fn count_passed_markers(output: &str) -> u32 {
    u32::try_from(output.matches("PASSED").count())
        .map_or(MAX_TEST_COUNT, |n| n.min(MAX_TEST_COUNT))
}

/// Clip `text` to at most `limit` characters without splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
