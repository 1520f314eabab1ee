//! Loop-level tests for full refinement runs.
//!
//! These tests drive `Refiner::run` with a scripted isolation backend and
//! generator to verify end-to-end behavior: parsing and classification of
//! harness output, best-candidate tracking, stop rules, generator failures,
//! syntax pre-checks and cancellation.

use std::time::Duration;

use refiner::analysis::PythonAnalyzer;
use refiner::cancel::CancelToken;
use refiner::core::classifier::classify;
use refiner::core::outcome_parser::parse;
use refiner::core::reward::RewardWeights;
use refiner::core::types::{ErrorKind, RawExecution, StopKind};
use refiner::io::generator::GenerationError;
use refiner::refine::{RefineConfig, RefineError, RefineOutcome, RefineTask, Refiner};
use refiner::test_support::{
    ScriptedAnalyzer, ScriptedBackend, ScriptedGenerator, raw_output, raw_timeout, summary,
};

const SPEC: &str = "Write add(a, b) that returns the sum of two integers.";
const ORACLE: &str = "from impl import add\n\ndef test_add_basic():\n    assert add(2, 2) == 4\n";

const ONE_ASSERTION_FAILURE: &str = "\
test_impl.py::test_add_zero PASSED                                       [ 25%]
test_impl.py::test_add_negative PASSED                                   [ 50%]
test_impl.py::test_add_large PASSED                                      [ 75%]
test_impl.py::test_add_basic FAILED                                      [100%]

=================================== FAILURES ===================================
________________________________ test_add_basic ________________________________

    def test_add_basic():
>       assert add(2, 2) == 5
E       AssertionError: assert 4 == 5

test_impl.py:4: AssertionError
=========================== short test summary info ============================
FAILED test_impl.py::test_add_basic - AssertionError: assert 4 == 5
========================= 3 passed, 1 failed in 0.42s ==========================
";

const MISSING_VALIDATION: &str = "\
test_impl.py::test_rejects_strings FAILED                                [100%]

=================================== FAILURES ===================================
_____________________________ test_rejects_strings _____________________________

    def test_rejects_strings():
>       with pytest.raises(TypeError):
E       Failed: DID NOT RAISE <class 'TypeError'>

test_impl.py:9: Failed
=========================== short test summary info ============================
FAILED test_impl.py::test_rejects_strings - Failed: DID NOT RAISE <class 'TypeError'>
========================= 2 passed, 1 failed in 0.05s ==========================
";

/// `passed` of `passed + failed` checks, each failure an assertion on `add`.
fn pytest_run(passed: u32, failed: u32) -> RawExecution {
    let mut stdout = String::new();
    for i in 0..failed {
        stdout.push_str(&format!(
            "FAILED test_impl.py::test_case_{i} - AssertionError: assert {} == {}\n",
            i + 1,
            i + 2
        ));
    }
    stdout.push_str(&summary(passed, failed));
    stdout.push('\n');
    raw_output(&stdout, i32::from(failed > 0))
}

fn config(max_iterations: u32, patience: u32) -> RefineConfig {
    RefineConfig {
        max_iterations,
        patience,
        ..RefineConfig::default()
    }
}

fn run(
    backend: &ScriptedBackend,
    generator: &ScriptedGenerator,
    config: &RefineConfig,
    initial: Option<&str>,
    cancel: &CancelToken,
) -> Result<RefineOutcome, RefineError> {
    let sandbox = backend.sandbox();
    let analyzer = ScriptedAnalyzer::default();
    let weights = RewardWeights::default();
    let refiner = Refiner {
        sandbox: &sandbox,
        generator,
        analyzer: &analyzer,
        config,
        weights: &weights,
    };
    let task = RefineTask {
        specification: SPEC,
        oracle: ORACLE,
        initial_candidate: initial,
    };
    refiner.run(&task, cancel, |_| {})
}

#[test]
fn summary_counts_and_assertion_failure_are_extracted() {
    let outcome = parse(&raw_output(ONE_ASSERTION_FAILURE, 1));
    assert_eq!(
        (outcome.passed, outcome.failed, outcome.errored, outcome.skipped, outcome.total),
        (3, 1, 0, 0, 4)
    );
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].test_name, "test_add_basic");

    let analysis = classify(&outcome, None);
    assert_eq!(analysis.error_kind, ErrorKind::Assertion);
    assert_eq!(analysis.failing_tests, vec!["test_add_basic".to_string()]);
}

#[test]
fn did_not_raise_is_partial_failure_with_validation_hints() {
    let outcome = parse(&raw_output(MISSING_VALIDATION, 1));
    let analysis = classify(&outcome, None);
    assert_eq!(analysis.error_kind, ErrorKind::PartialFailure);
    assert!(
        analysis.suggested_fixes[0].contains("input validation"),
        "{:?}",
        analysis.suggested_fixes
    );
}

#[test]
fn timeout_beats_embedded_exception_names() {
    let outcome = parse(&raw_timeout(
        "test_impl.py::test_loop\nE   ZeroDivisionError: division by zero\nTypeError",
    ));
    assert!(outcome.timed_out);
    assert_eq!(classify(&outcome, None).error_kind, ErrorKind::Timeout);
}

/// initial candidate fails one assertion -> generator sees the rendered
/// feedback and the failing source -> fixed candidate passes -> Converged.
#[test]
fn converges_on_first_fully_passing_candidate() {
    let backend = ScriptedBackend::new([raw_output(ONE_ASSERTION_FAILURE, 1), pytest_run(4, 0)]);
    let generator = ScriptedGenerator::with_candidates(["def add(a, b):\n    return a + b\n"]);

    let outcome = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        Some("def add(a, b):\n    return a + b + 1\n"),
        &CancelToken::new(),
    )
    .expect("run");

    let stop = outcome.state.stop.clone().expect("stop");
    assert_eq!(stop.kind, StopKind::Converged);
    assert!(outcome.state.converged);
    assert_eq!(outcome.best_code, "def add(a, b):\n    return a + b\n");
    assert_eq!(outcome.state.best_index, Some(1));
    assert_eq!(backend.runs(), 2);

    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    let feedback = requests[0].feedback.as_deref().expect("feedback");
    assert!(feedback.starts_with("Error Type: assertion"), "{feedback}");
    assert!(feedback.contains("test_add_basic"));
    assert_eq!(
        requests[0].previous_candidate.as_deref(),
        Some("def add(a, b):\n    return a + b + 1\n")
    );
}

/// initial candidate passes 4 of 5 -> regenerated candidate passes 3 and
/// skips 1 -> Converged with the regenerated candidate, even though its pass
/// rate (0.75) is below the earlier best (0.8).
#[test]
fn converged_run_returns_the_converging_candidate() {
    let backend = ScriptedBackend::new([
        pytest_run(4, 1),
        raw_output("3 passed, 1 skipped in 0.10s\n", 0),
    ]);
    let generator = ScriptedGenerator::with_candidates(["def add(a, b):\n    return a + b\n"]);

    let outcome = run(
        &backend,
        &generator,
        &config(5, 3),
        Some("def add(a, b):\n    return a - b\n"),
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(
        outcome.state.stop.as_ref().map(|s| s.kind),
        Some(StopKind::Converged)
    );
    assert!(outcome.state.converged);
    assert_eq!(outcome.best_code, "def add(a, b):\n    return a + b\n");
    assert_eq!(outcome.state.best_index, Some(1));
    assert_eq!(outcome.state.best_pass_rate, 0.75);
    assert!(outcome.state.best().is_some_and(|r| r.outcome.is_converged()));
}

/// 0.5 -> 0.8 -> 0.8: the third iteration does not beat the second and moves
/// the pass rate by less than `min_improvement`, so the run stagnates.
#[test]
fn flat_pass_rate_stagnates_and_keeps_earlier_best() {
    let backend = ScriptedBackend::new([pytest_run(5, 5), pytest_run(8, 2), pytest_run(8, 2)]);
    let generator = ScriptedGenerator::with_candidates(["second", "third", "fourth"]);

    let outcome = run(
        &backend,
        &generator,
        &config(10, 2),
        Some("first"),
        &CancelToken::new(),
    )
    .expect("run");

    let state = &outcome.state;
    assert_eq!(state.stop.as_ref().map(|s| s.kind), Some(StopKind::Stagnated));
    assert_eq!(state.iterations.len(), 3);
    assert_eq!(state.no_improvement_streak, 1);
    // Iteration 2 also earned the improvement bonus, so it keeps the tie.
    assert!(state.iterations[1].reward.total > state.iterations[2].reward.total);
    assert_eq!(outcome.best_code, "second");
    assert_eq!(state.best_pass_rate, 0.8);
    assert_eq!(generator.calls(), 2);
}

/// Same counts twice, but the second run is slow: lower efficiency keeps the
/// first candidate as best until the budget runs out.
#[test]
fn equal_pass_rate_with_lower_reward_keeps_first() {
    let slow = RawExecution {
        duration: Duration::from_secs(12),
        ..pytest_run(7, 3)
    };
    let backend = ScriptedBackend::new([pytest_run(7, 3), slow]);
    let generator = ScriptedGenerator::with_candidates(["second"]);

    let outcome = run(
        &backend,
        &generator,
        &config(2, 5),
        Some("first"),
        &CancelToken::new(),
    )
    .expect("run");

    let state = &outcome.state;
    assert_eq!(
        state.stop.as_ref().map(|s| s.kind),
        Some(StopKind::BudgetExhausted)
    );
    assert!(state.iterations[0].reward.total > state.iterations[1].reward.total);
    assert_eq!(state.best_index, Some(0));
    assert_eq!(outcome.best_code, "first");
    assert_eq!(state.no_improvement_streak, 1);
}

#[test]
fn best_pass_rate_never_decreases_and_executions_are_bounded() {
    let backend = ScriptedBackend::new([
        pytest_run(2, 8),
        pytest_run(6, 4),
        pytest_run(4, 6),
        pytest_run(9, 1),
        pytest_run(1, 9),
        pytest_run(10, 0),
    ]);
    let generator = ScriptedGenerator::with_candidates(["c2", "c3", "c4", "c5", "c6"]);

    let mut seen = Vec::new();
    let sandbox = backend.sandbox();
    let analyzer = ScriptedAnalyzer::default();
    let weights = RewardWeights::default();
    let cfg = config(5, 5);
    let refiner = Refiner {
        sandbox: &sandbox,
        generator: &generator,
        analyzer: &analyzer,
        config: &cfg,
        weights: &weights,
    };
    let task = RefineTask {
        specification: SPEC,
        oracle: ORACLE,
        initial_candidate: Some("c1"),
    };
    let outcome = refiner
        .run(&task, &CancelToken::new(), |record| {
            seen.push(record.pass_rate());
        })
        .expect("run");

    assert_eq!(backend.runs(), 5);
    assert_eq!(seen.len(), 5);
    let mut running_max: f64 = 0.0;
    for rate in &seen {
        running_max = running_max.max(*rate);
    }
    assert_eq!(outcome.state.best_pass_rate, running_max);
    assert_eq!(outcome.best_code, "c4");
    // No generation after the last permitted iteration.
    assert_eq!(generator.calls(), 4);
}

#[test]
fn generator_failure_returns_best_so_far() {
    let backend = ScriptedBackend::new([pytest_run(3, 1)]);
    let generator =
        ScriptedGenerator::new([Err(GenerationError::Backend("connection refused".to_string()))]);

    let outcome = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        Some("first"),
        &CancelToken::new(),
    )
    .expect("run");

    let stop = outcome.state.stop.clone().expect("stop");
    assert_eq!(stop.kind, StopKind::Failed);
    assert!(stop.detail.contains("connection refused"));
    assert_eq!(outcome.best_code, "first");
    assert_eq!(outcome.state.iterations.len(), 1);
}

#[test]
fn generator_failure_without_any_execution_is_an_error() {
    let backend = ScriptedBackend::new(Vec::new());
    let generator = ScriptedGenerator::new([Err(GenerationError::Empty)]);

    let err = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        None,
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, RefineError::Generation(GenerationError::Empty)));
    assert_eq!(backend.runs(), 0);
}

/// executed candidate -> unparseable reply -> one regeneration with the
/// syntax error in the feedback -> still unparseable -> Failed with the
/// executed candidate as best.
#[test]
fn syntax_failures_are_regenerated_then_fail_the_run() {
    let backend = ScriptedBackend::new([pytest_run(1, 3)]);
    let generator = ScriptedGenerator::with_candidates(["BROKEN one", "BROKEN two", "unused"]);
    let sandbox = backend.sandbox();
    let analyzer = ScriptedAnalyzer::rejecting(&["BROKEN"]);
    let weights = RewardWeights::default();
    let cfg = RefineConfig::default();
    let refiner = Refiner {
        sandbox: &sandbox,
        generator: &generator,
        analyzer: &analyzer,
        config: &cfg,
        weights: &weights,
    };
    let task = RefineTask {
        specification: SPEC,
        oracle: ORACLE,
        initial_candidate: Some("first"),
    };

    let outcome = refiner
        .run(&task, &CancelToken::new(), |_| {})
        .expect("run");

    assert_eq!(
        outcome.state.stop.as_ref().map(|s| s.kind),
        Some(StopKind::Failed)
    );
    assert_eq!(outcome.best_code, "first");
    assert_eq!(backend.runs(), 1);

    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    let retry_feedback = requests[1].feedback.as_deref().expect("feedback");
    assert!(retry_feedback.contains("not valid Python"), "{retry_feedback}");
}

#[test]
fn generated_candidate_missing_colons_is_repaired_before_execution() {
    let backend = ScriptedBackend::new([pytest_run(0, 1), pytest_run(1, 0)]);
    let generator = ScriptedGenerator::with_candidates(["def add(a, b)\n    return a + b\n"]);
    let sandbox = backend.sandbox();
    let analyzer = PythonAnalyzer::default();
    let weights = RewardWeights::default();
    let cfg = RefineConfig::default();
    let refiner = Refiner {
        sandbox: &sandbox,
        generator: &generator,
        analyzer: &analyzer,
        config: &cfg,
        weights: &weights,
    };
    let task = RefineTask {
        specification: SPEC,
        oracle: ORACLE,
        initial_candidate: Some("def add(a, b):\n    return a - b\n"),
    };

    let outcome = refiner
        .run(&task, &CancelToken::new(), |_| {})
        .expect("run");

    assert!(outcome.state.converged);
    assert_eq!(backend.executed()[1], "def add(a, b):\n    return a + b\n");
    assert_eq!(generator.calls(), 1);
}

/// The token fires while the second candidate runs; its result is dropped.
#[test]
fn cancellation_during_execution_abandons_the_iteration() {
    let cancel = CancelToken::new();
    let backend = ScriptedBackend::new([pytest_run(2, 2), pytest_run(4, 0)]);
    backend.cancel_during(2, cancel.clone());
    let generator = ScriptedGenerator::with_candidates(["second"]);

    let outcome = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        Some("first"),
        &cancel,
    )
    .expect("run");

    assert_eq!(
        outcome.state.stop.as_ref().map(|s| s.kind),
        Some(StopKind::Cancelled)
    );
    assert_eq!(outcome.state.iterations.len(), 1);
    assert_eq!(outcome.best_code, "first");
    assert!(!outcome.state.converged);
}

#[test]
fn cancellation_before_any_execution_is_an_error() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let backend = ScriptedBackend::new([pytest_run(1, 0)]);
    let generator = ScriptedGenerator::default();

    let err = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        Some("first"),
        &cancel,
    )
    .unwrap_err();
    assert!(matches!(err, RefineError::Cancelled));
    assert_eq!(backend.runs(), 0);
}

#[test]
fn report_serializes_iterations_and_stop_reason() {
    let backend = ScriptedBackend::new([pytest_run(3, 1), pytest_run(4, 0)]);
    let generator = ScriptedGenerator::with_candidates(["fixed"]);

    let outcome = run(
        &backend,
        &generator,
        &RefineConfig::default(),
        Some("first"),
        &CancelToken::new(),
    )
    .expect("run");

    let json: serde_json::Value =
        serde_json::to_value(&outcome.state).expect("serialize state");
    assert_eq!(json["stop"]["kind"], "converged");
    assert_eq!(json["best_code"], "fixed");
    let iterations = json["iterations"].as_array().expect("iterations");
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[0]["candidate_hash"].as_str().map(str::len), Some(64));
    assert!(iterations[0]["reward"]["dimensions"]["test_passing"]["reward"].is_number());
}
