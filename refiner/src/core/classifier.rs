//! Map a [`TestOutcome`] to a root-cause [`FailureAnalysis`] and render feedback.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::core::types::{ErrorKind, FailureAnalysis, TestOutcome};

const DID_NOT_RAISE: &str = "DID NOT RAISE";
const MAX_ERROR_MESSAGES: usize = 10;
const MAX_FEEDBACK_TESTS: usize = 10;

/// Exception-name table, checked in order after the timeout and did-not-raise rules.
static ERROR_TABLE: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    [
        (ErrorKind::Assertion, "AssertionError"),
        (ErrorKind::Type, "TypeError"),
        (ErrorKind::Value, "ValueError"),
        (ErrorKind::Attribute, "AttributeError"),
        (ErrorKind::Index, "IndexError"),
        (ErrorKind::Key, "KeyError"),
        (ErrorKind::ZeroDivision, "ZeroDivisionError"),
        (ErrorKind::Name, "NameError"),
        (ErrorKind::Syntax, "SyntaxError"),
        (ErrorKind::ImportMissing, "ImportError|ModuleNotFoundError"),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap();
        (kind, re)
    })
    .collect()
});

static WHILE_TRUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*while\s+(True|1)\s*:").unwrap());
static INPUT_CALL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\binput\s*\(").unwrap());

/// Classify one outcome. `source` enables candidate-aware hints.
pub fn classify(outcome: &TestOutcome, source: Option<&str>) -> FailureAnalysis {
    let output = outcome.combined_output();
    let did_not_raise = output.contains(DID_NOT_RAISE);
    let error_kind = classify_kind(outcome, &output, did_not_raise);

    let failing_tests: Vec<String> = outcome
        .failures
        .iter()
        .map(|failure| failure.test_name.clone())
        .collect();

    FailureAnalysis {
        error_kind,
        error_messages: error_messages(outcome),
        root_cause: root_cause(error_kind).to_string(),
        suggested_fixes: suggested_fixes(error_kind, &failing_tests, did_not_raise, source),
        failing_tests,
    }
}

fn classify_kind(outcome: &TestOutcome, output: &str, did_not_raise: bool) -> ErrorKind {
    if outcome.timed_out {
        return ErrorKind::Timeout;
    }
    if did_not_raise {
        return ErrorKind::PartialFailure;
    }
    if let Some((kind, _)) = ERROR_TABLE.iter().find(|(_, re)| re.is_match(output)) {
        return *kind;
    }
    if outcome.failed > 0 && outcome.passed == 0 {
        return ErrorKind::LogicError;
    }
    if outcome.failed > 0 {
        return ErrorKind::PartialFailure;
    }
    ErrorKind::Unknown
}

/// One-line explanation for each kind.
pub fn root_cause(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Timeout => "Function runs too long or contains infinite loop",
        ErrorKind::Assertion => "Function returns incorrect values",
        ErrorKind::Type => "Function called with wrong type or returns wrong type",
        ErrorKind::Value => "Function receives or produces invalid values",
        ErrorKind::Attribute => "Accessing non-existent attribute or method",
        ErrorKind::Index => "List/array index out of bounds",
        ErrorKind::Key => "Dictionary key not found",
        ErrorKind::ZeroDivision => "Division by zero in calculation",
        ErrorKind::Name => "Variable or function not defined",
        ErrorKind::Syntax => "Code has syntax errors",
        ErrorKind::ImportMissing => "Missing or incorrect imports",
        ErrorKind::LogicError => "Core logic is incorrect",
        ErrorKind::PartialFailure => "Some edge cases not handled correctly",
        ErrorKind::Unknown => "Unknown error in implementation",
    }
}

/// Most informative first: missing-validation lines, failure messages, then stderr.
fn error_messages(outcome: &TestOutcome) -> Vec<String> {
    let mut messages = Vec::new();

    for line in outcome.stdout.lines().filter(|l| l.contains(DID_NOT_RAISE)) {
        messages.push(format!(
            "MISSING VALIDATION: {}",
            clip(line.trim(), 300)
        ));
    }

    for failure in &outcome.failures {
        if let Some(first) = failure.message.lines().next()
            && !first.is_empty()
        {
            messages.push(clip(first, 200));
        }
    }

    let stderr = outcome.stderr.as_str();
    if stderr.contains("SyntaxError") {
        messages.extend(
            stderr
                .lines()
                .filter(|l| l.contains("SyntaxError") || l.contains('^') || l.contains("File"))
                .map(|l| clip(l.trim(), 300)),
        );
    } else if stderr.contains("ImportError") || stderr.contains("ModuleNotFoundError") {
        messages.extend(
            stderr
                .lines()
                .filter(|l| {
                    l.contains("ImportError")
                        || l.contains("ModuleNotFoundError")
                        || l.contains("cannot import")
                        || l.contains("from impl import")
                })
                .map(|l| clip(l.trim(), 300)),
        );
    } else {
        messages.extend(
            stderr
                .lines()
                .filter(|l| ["Error", "ERROR", "Exception"].iter().any(|kw| l.contains(kw)))
                .map(|l| clip(l.trim(), 200)),
        );
    }

    let mut unique: Vec<String> = Vec::with_capacity(MAX_ERROR_MESSAGES);
    for message in messages {
        if message.is_empty() || unique.contains(&message) {
            continue;
        }
        unique.push(message);
        if unique.len() == MAX_ERROR_MESSAGES {
            break;
        }
    }
    unique
}

fn kind_fixes(kind: ErrorKind) -> &'static [&'static str] {
    match kind {
        ErrorKind::Timeout => &[
            "Add base case to recursive functions",
            "Replace infinite loops with bounded iterations",
            "Optimize algorithm complexity",
            "Check for infinite recursion",
        ],
        ErrorKind::Assertion => &[
            "Review function logic and return values",
            "Check calculations and formulas",
            "Verify edge case handling",
            "Test with example inputs manually",
        ],
        ErrorKind::Type => &[
            "Add type validation for inputs",
            "Ensure return type matches specification",
            "Check type conversions (int, str, list, etc.)",
            "Add type hints to function signature",
        ],
        ErrorKind::Value => &[
            "Validate input ranges before using them",
            "Check conversions such as int() on untrusted strings",
        ],
        ErrorKind::Attribute => &[
            "Check the object type before calling methods on it",
            "Verify attribute and method names for typos",
        ],
        ErrorKind::Index => &[
            "Add bounds checking before list access",
            "Verify list is not empty before indexing",
            "Use slicing or length checks for safe access",
            "Check loop ranges and indices",
        ],
        ErrorKind::Key => &[
            "Use dict.get() with default value",
            "Check if key exists before access",
            "Verify dictionary structure",
            "Handle missing keys gracefully",
        ],
        ErrorKind::ZeroDivision => &[
            "Add check for zero before division",
            "Handle edge case where divisor is zero",
            "Return special value for undefined division",
        ],
        ErrorKind::Name => &[
            "Define all variables before use",
            "Check variable names for typos",
            "Import required modules",
            "Verify function and variable scope",
        ],
        ErrorKind::Syntax => &[
            "Fix syntax errors (colons, parentheses, indentation)",
            "Check for unclosed brackets or quotes",
            "Verify proper indentation",
            "Ensure valid Python syntax",
        ],
        ErrorKind::ImportMissing => &[
            "Ensure the function name matches exactly what's imported in tests",
            "Check the function is defined in impl.py",
            "Verify no typos in function name",
            "Make sure the function name matches the specification",
        ],
        ErrorKind::LogicError | ErrorKind::PartialFailure | ErrorKind::Unknown => &[],
    }
}

const VALIDATION_HINTS: [&str; 3] = [
    "CRITICAL: Add input validation - tests expect exceptions to be raised for invalid inputs",
    "Use isinstance() to check types and raise TypeError for invalid types",
    "Check input constraints (length, values) and raise ValueError when violated",
];

const NAME_HINTS: [(&str, &str); 6] = [
    (
        "raises",
        "Add input validation and raise appropriate exceptions (ValueError, TypeError)",
    ),
    ("empty", "Handle empty input case"),
    ("zero", "Handle zero value case"),
    ("negative", "Handle negative numbers"),
    ("single", "Handle single element case"),
    ("large", "Handle large input values"),
];

const GENERIC_FIXES: [&str; 2] = [
    "Review implementation against specification",
    "Test with failing test inputs manually",
];

fn suggested_fixes(
    kind: ErrorKind,
    failing_tests: &[String],
    did_not_raise: bool,
    source: Option<&str>,
) -> Vec<String> {
    let mut fixes: Vec<String> = Vec::new();

    if did_not_raise {
        for hint in VALIDATION_HINTS {
            push_unique(&mut fixes, hint);
        }
    }
    for fix in kind_fixes(kind) {
        push_unique(&mut fixes, fix);
    }

    let lowered: Vec<String> = failing_tests.iter().map(|t| t.to_lowercase()).collect();
    for (needle, hint) in NAME_HINTS {
        if lowered.iter().any(|name| name.contains(needle)) {
            push_unique(&mut fixes, hint);
        }
    }

    if let Some(source) = source {
        if kind == ErrorKind::Timeout && WHILE_TRUE_RE.is_match(source) {
            push_unique(
                &mut fixes,
                "Ensure every `while True` loop reaches a break or return",
            );
        }
        if INPUT_CALL_RE.is_match(source) {
            push_unique(
                &mut fixes,
                "Remove interactive input() calls; read values from function arguments",
            );
        }
    }

    if fixes.is_empty() {
        for fix in GENERIC_FIXES {
            push_unique(&mut fixes, fix);
        }
    }
    fixes
}

fn push_unique(fixes: &mut Vec<String>, fix: &str) {
    if !fixes.iter().any(|f| f == fix) {
        fixes.push(fix.to_string());
    }
}

/// Render the feedback block handed to the candidate generator.
pub fn render_feedback(analysis: &FailureAnalysis) -> String {
    let mut parts = vec![
        format!("Error Type: {}", analysis.error_kind),
        format!("\nRoot Cause: {}", analysis.root_cause),
    ];

    if !analysis.failing_tests.is_empty() {
        parts.push(format!(
            "\nFailing Tests ({}):",
            analysis.failing_tests.len()
        ));
        parts.extend(
            analysis
                .failing_tests
                .iter()
                .take(MAX_FEEDBACK_TESTS)
                .map(|test| format!("  - {test}")),
        );
    }

    if !analysis.error_messages.is_empty() {
        parts.push("\nError Messages:".to_string());
        parts.extend(
            analysis
                .error_messages
                .iter()
                .take(MAX_ERROR_MESSAGES)
                .map(|msg| format!("  {msg}")),
        );
    }

    if !analysis.suggested_fixes.is_empty() {
        parts.push("\nSuggested Fixes:".to_string());
        parts.extend(
            analysis
                .suggested_fixes
                .iter()
                .map(|fix| format!("  - {fix}")),
        );
    }

    parts.join("\n")
}

fn clip(text: &str, limit: usize) -> String {
    crate::core::outcome_parser::truncate_chars(text, limit)
}
