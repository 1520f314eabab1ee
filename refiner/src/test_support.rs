//! Test-only builders and scripted collaborators.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::rc::Rc;
use std::time::Duration;

use crate::analysis::QualityAnalyzer;
use crate::cancel::CancelToken;
use crate::core::classifier::classify;
use crate::core::outcome_parser::parse;
use crate::core::reward::{RewardWeights, score};
use crate::core::types::{IterationRecord, QualityMetrics, RawExecution, TIMEOUT_EXIT_CODE};
use crate::io::generator::{CandidateGenerator, GenerationError, GenerationRequest};
use crate::io::sandbox::{
    CANDIDATE_FILE, IsolationBackend, RunRequest, Sandbox, SandboxConfig, SandboxError,
};

/// Harness output that ran to completion.
pub fn raw_output(stdout: &str, exit_code: i32) -> RawExecution {
    RawExecution {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
        timed_out: false,
        duration: Duration::from_millis(100),
    }
}

/// Harness output cut off by the sandbox timeout.
pub fn raw_timeout(stdout: &str) -> RawExecution {
    RawExecution {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: TIMEOUT_EXIT_CODE,
        timed_out: true,
        duration: Duration::from_secs(30),
    }
}

/// pytest summary line for the given counts.
pub fn summary(passed: u32, failed: u32) -> String {
    match (passed, failed) {
        (0, 0) => "no tests ran in 0.01s".to_string(),
        (p, 0) => format!("{p} passed in 0.10s"),
        (0, f) => format!("{f} failed in 0.10s"),
        (p, f) => format!("{p} passed, {f} failed in 0.10s"),
    }
}

/// Completed iteration with `passed` of `total` checks passing and the given reward total.
///
/// The candidate source is `"candidate {index}"`.
pub fn iteration(index: u32, passed: u32, total: u32, reward: f64) -> IterationRecord {
    let failed = total.saturating_sub(passed);
    let exit_code = i32::from(failed > 0);
    let outcome = parse(&raw_output(&summary(passed, failed), exit_code));
    let analysis = classify(&outcome, None);
    let mut breakdown = score(
        &outcome,
        &QualityMetrics::default(),
        Duration::from_millis(100),
        None,
        &RewardWeights::default(),
    );
    breakdown.total = reward;
    let candidate = format!("candidate {index}");
    IterationRecord {
        index,
        candidate_hash: crate::refine::candidate_hash(&candidate),
        candidate,
        outcome,
        analysis,
        reward: breakdown,
        duration_secs: 0.1,
    }
}

#[derive(Default)]
struct BackendScript {
    responses: VecDeque<RawExecution>,
    executed: Vec<String>,
    /// Cancel this token while executing the n-th run (1-based).
    cancel_during: Option<(usize, CancelToken)>,
}

/// [`IsolationBackend`] replaying canned executions.
///
/// Clones share the script, so a test can keep one handle while the sandbox owns another.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Rc<RefCell<BackendScript>>,
}

impl ScriptedBackend {
    pub fn new(responses: impl IntoIterator<Item = RawExecution>) -> Self {
        let backend = Self::default();
        backend.script.borrow_mut().responses = responses.into_iter().collect();
        backend
    }

    /// Cancel `token` while the `run`-th execution is in flight.
    pub fn cancel_during(&self, run: usize, token: CancelToken) {
        self.script.borrow_mut().cancel_during = Some((run, token));
    }

    /// Candidate sources seen by the backend, in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.script.borrow().executed.clone()
    }

    pub fn runs(&self) -> usize {
        self.script.borrow().executed.len()
    }

    /// Sandbox owning a clone of this backend.
    pub fn sandbox(&self) -> Sandbox {
        match Sandbox::new(Box::new(self.clone()), &SandboxConfig::default()) {
            Ok(sandbox) => sandbox,
            Err(err) => panic!("scripted backend never fails to start: {err}"),
        }
    }
}

impl IsolationBackend for ScriptedBackend {
    fn ping(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    fn run(
        &self,
        request: &RunRequest<'_>,
        _cancel: &CancelToken,
    ) -> Result<RawExecution, SandboxError> {
        let candidate =
            fs::read_to_string(request.workspace.join(CANDIDATE_FILE)).unwrap_or_default();
        let mut script = self.script.borrow_mut();
        script.executed.push(candidate);
        let run = script.executed.len();
        if let Some((at, token)) = &script.cancel_during
            && *at == run
        {
            token.cancel();
        }
        Ok(script
            .responses
            .pop_front()
            .unwrap_or_else(|| raw_output("no scripted response left", 2)))
    }

    fn collect_garbage(&self) -> Result<usize, SandboxError> {
        Ok(0)
    }
}

/// What a [`ScriptedGenerator`] was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub feedback: Option<String>,
    pub previous_candidate: Option<String>,
}

/// [`CandidateGenerator`] replaying canned replies.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: RefCell<VecDeque<Result<String, GenerationError>>>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl ScriptedGenerator {
    pub fn new(replies: impl IntoIterator<Item = Result<String, GenerationError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            requests: RefCell::default(),
        }
    }

    /// Generator that always succeeds with the given candidates, in order.
    pub fn with_candidates<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(candidates.into_iter().map(|c| Ok(c.to_string())))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl CandidateGenerator for ScriptedGenerator {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        _cancel: &CancelToken,
    ) -> Result<String, GenerationError> {
        self.requests.borrow_mut().push(RecordedRequest {
            feedback: request.feedback.map(str::to_string),
            previous_candidate: request.previous_candidate.map(str::to_string),
        });
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::Backend("script exhausted".to_string())))
    }
}

/// [`QualityAnalyzer`] returning fixed metrics.
///
/// Sources containing any of `reject` report a syntax error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAnalyzer {
    pub metrics: QualityMetrics,
    pub reject: Vec<String>,
}

impl ScriptedAnalyzer {
    pub fn rejecting(markers: &[&str]) -> Self {
        Self {
            metrics: QualityMetrics::default(),
            reject: markers.iter().map(ToString::to_string).collect(),
        }
    }
}

impl QualityAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, source: &str) -> QualityMetrics {
        QualityMetrics {
            has_syntax_error: self.syntax_error(source).is_some(),
            ..self.metrics.clone()
        }
    }

    fn syntax_error(&self, source: &str) -> Option<String> {
        self.reject
            .iter()
            .find(|marker| source.contains(marker.as_str()))
            .map(|marker| format!("line 1, column 1: unexpected `{marker}`"))
    }
}
