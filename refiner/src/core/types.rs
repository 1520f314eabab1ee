//! Shared deterministic types for the refinement core.
//!
//! These types define stable contracts between the parser, classifier, reward
//! calculator and controller. They do not depend on external state or I/O.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::reward::RewardBreakdown;

/// Exit code reported when the sandbox had to kill a candidate on timeout.
///
/// Matches the `timeout(1)` convention so it can never be confused with a
/// pytest exit status (0-5).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Unstructured result of one sandbox execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Wall-clock time spent inside the sandbox call.
    pub duration: Duration,
}

impl RawExecution {
    /// Execution that never reached the harness (workspace or spawn trouble).
    pub fn failed_to_run(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
            timed_out: false,
            duration,
        }
    }
}

/// One failing test and the most relevant lines of its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub test_name: String,
    /// At most 500 characters.
    pub message: String,
}

/// Structured outcome of a single oracle run.
///
/// `total` always equals `passed + failed + errored + skipped`; construct via
/// [`TestOutcome::new`] to keep that true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    pub skipped: u32,
    pub total: u32,
    pub duration_secs: f64,
    pub failures: Vec<FailureRecord>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Ceiling for a single count, low enough that four of them still sum within `u32`.
pub const MAX_TEST_COUNT: u32 = u32::MAX / 4;

/// Per-outcome test counts, in harness order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    pub skipped: u32,
}

impl TestCounts {
    /// Every count capped at [`MAX_TEST_COUNT`].
    pub fn clamped(self) -> Self {
        Self {
            passed: self.passed.min(MAX_TEST_COUNT),
            failed: self.failed.min(MAX_TEST_COUNT),
            errored: self.errored.min(MAX_TEST_COUNT),
            skipped: self.skipped.min(MAX_TEST_COUNT),
        }
    }

    pub fn total(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.errored)
            .saturating_add(self.skipped)
    }
}

impl TestOutcome {
    /// Counts above [`MAX_TEST_COUNT`] are clamped so `total` cannot overflow.
    pub fn new(counts: TestCounts, failures: Vec<FailureRecord>, raw: &RawExecution) -> Self {
        let counts = counts.clamped();
        Self {
            passed: counts.passed,
            failed: counts.failed,
            errored: counts.errored,
            skipped: counts.skipped,
            total: counts.total(),
            duration_secs: raw.duration.as_secs_f64(),
            failures,
            stdout: raw.stdout.clone(),
            stderr: raw.stderr.clone(),
            exit_code: raw.exit_code,
            timed_out: raw.timed_out,
        }
    }

    /// Fraction of executed tests that passed; `0.0` when nothing ran.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.passed) / f64::from(self.total)
    }

    /// All checks passed and at least one ran.
    pub fn is_converged(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.passed > 0
    }

    /// stdout followed by stderr, the text the classifier scans.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Root-cause taxonomy for a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Assertion,
    Type,
    Value,
    Attribute,
    Index,
    Key,
    ZeroDivision,
    Name,
    Syntax,
    ImportMissing,
    Timeout,
    LogicError,
    PartialFailure,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assertion => "assertion",
            Self::Type => "type",
            Self::Value => "value",
            Self::Attribute => "attribute",
            Self::Index => "index",
            Self::Key => "key",
            Self::ZeroDivision => "zeroDivision",
            Self::Name => "name",
            Self::Syntax => "syntax",
            Self::ImportMissing => "importMissing",
            Self::Timeout => "timeout",
            Self::LogicError => "logicError",
            Self::PartialFailure => "partialFailure",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier verdict for exactly one [`TestOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub error_kind: ErrorKind,
    pub failing_tests: Vec<String>,
    pub error_messages: Vec<String>,
    pub root_cause: String,
    pub suggested_fixes: Vec<String>,
}

/// Estimated asymptotic complexity, best first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplexityClass {
    #[serde(rename = "O(1)")]
    Constant,
    #[serde(rename = "O(log n)")]
    Logarithmic,
    #[serde(rename = "O(n)")]
    Linear,
    #[serde(rename = "O(n log n)")]
    Linearithmic,
    #[serde(rename = "O(n^2)")]
    Quadratic,
    #[serde(rename = "O(n^3)")]
    Cubic,
    #[serde(rename = "O(2^n)")]
    Exponential,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl ComplexityClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "O(1)",
            Self::Logarithmic => "O(log n)",
            Self::Linear => "O(n)",
            Self::Linearithmic => "O(n log n)",
            Self::Quadratic => "O(n^2)",
            Self::Cubic => "O(n^3)",
            Self::Exponential => "O(2^n)",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idiomatic constructs that earn a quality bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Construct {
    ListComprehension,
    DictComprehension,
    ContextManager,
    GeneratorExpression,
    FString,
}

/// Code smells that cost quality credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Smell {
    BareExcept,
    GlobalStatement,
    LongFunction { name: String, lines: usize },
    MagicNumbers,
}

/// Structural signals extracted from candidate source.
///
/// Analyzers that cannot inspect structure leave this at its default, which
/// the reward calculator treats as "nothing known".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    /// Cyclomatic complexity of each function, in source order.
    pub function_complexities: Vec<u32>,
    pub constructs: Vec<Construct>,
    pub smells: Vec<Smell>,
    /// Functions and classes carrying a docstring longer than 10 characters.
    pub documented_items: u32,
    pub max_loop_depth: u32,
    pub has_recursion: bool,
    pub complexity_class: ComplexityClass,
}

/// Static-analysis metrics for one candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub complexity: u32,
    pub lint_error_count: u32,
    pub security_issue_count: u32,
    pub has_syntax_error: bool,
    pub line_count: u32,
    #[serde(default)]
    pub profile: SourceProfile,
}

/// Terminal state of a refinement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopKind {
    Converged,
    Stagnated,
    BudgetExhausted,
    Failed,
    Cancelled,
}

impl StopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Stagnated => "stagnated",
            Self::BudgetExhausted => "budgetExhausted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped, with a human-readable detail for audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReason {
    pub kind: StopKind,
    pub detail: String,
}

/// Immutable log entry for one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-indexed iteration number.
    pub index: u32,
    pub candidate_hash: String,
    #[serde(skip)]
    pub candidate: String,
    pub outcome: TestOutcome,
    pub analysis: FailureAnalysis,
    pub reward: RewardBreakdown,
    pub duration_secs: f64,
}

impl IterationRecord {
    pub fn pass_rate(&self) -> f64 {
        self.outcome.pass_rate()
    }
}
