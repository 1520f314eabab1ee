//! Refinement controller.
//!
//! Drives the per-iteration pipeline (obtain candidate, execute, parse,
//! classify, score, record) and owns the only cross-iteration state. Stop
//! rules live in [`crate::core::policy`]; this module adds generation,
//! syntax pre-checks and cancellation around them.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::analysis::QualityAnalyzer;
use crate::cancel::CancelToken;
use crate::core::classifier::{classify, render_feedback};
use crate::core::outcome_parser;
use crate::core::policy::{RefinementState, StopPolicy, evaluate};
use crate::core::repair::repair_missing_colons;
use crate::core::reward::{self, RewardWeights};
use crate::core::types::{IterationRecord, StopKind};
use crate::io::generator::{CandidateGenerator, GenerationError, GenerationRequest};
use crate::io::sandbox::{Sandbox, SandboxError};

#[derive(Debug, Error)]
pub enum RefineError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("no candidate was executed: {0}")]
    Generation(#[source] GenerationError),
    #[error("no candidate was executed: generated code kept failing the syntax check ({0})")]
    InvalidCandidate(String),
    #[error("run cancelled before any candidate was executed")]
    Cancelled,
}

/// `[refine]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefineConfig {
    pub max_iterations: u32,
    pub patience: u32,
    pub min_improvement: f64,
    /// Regenerations allowed when a generated candidate fails the syntax check.
    pub syntax_retries: u32,
    /// Wall-clock budget for the whole run; unlimited when unset.
    pub run_timeout_secs: Option<u64>,
}

impl Default for RefineConfig {
    fn default() -> Self {
        let policy = StopPolicy::default();
        Self {
            max_iterations: policy.max_iterations,
            patience: policy.patience,
            min_improvement: policy.min_improvement,
            syntax_retries: 1,
            run_timeout_secs: None,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("refine.max_iterations must be > 0".to_string());
        }
        if self.patience == 0 {
            return Err("refine.patience must be > 0".to_string());
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err("refine.min_improvement must be a finite value >= 0".to_string());
        }
        if self.run_timeout_secs == Some(0) {
            return Err("refine.run_timeout_secs must be > 0 when set".to_string());
        }
        Ok(())
    }

    pub fn policy(&self) -> StopPolicy {
        StopPolicy {
            max_iterations: self.max_iterations,
            patience: self.patience,
            min_improvement: self.min_improvement,
        }
    }
}

/// The problem being solved.
#[derive(Debug, Clone, Copy)]
pub struct RefineTask<'a> {
    /// Natural-language description handed to the generator.
    pub specification: &'a str,
    /// Test file run against every candidate.
    pub oracle: &'a str,
    /// Caller-supplied first candidate; generated when `None`.
    pub initial_candidate: Option<&'a str>,
}

/// Best candidate plus the full run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutcome {
    pub best_code: String,
    pub state: RefinementState,
}

/// Refinement controller over injected collaborators.
pub struct Refiner<'a> {
    pub sandbox: &'a Sandbox,
    pub generator: &'a dyn CandidateGenerator,
    pub analyzer: &'a dyn QualityAnalyzer,
    pub config: &'a RefineConfig,
    pub weights: &'a RewardWeights,
}

/// Why no candidate could be obtained for the next iteration.
enum Halt {
    Cancelled,
    Generation(GenerationError),
    Syntax(String),
}

impl Refiner<'_> {
    /// Run the loop until a stop rule fires, calling `on_iteration` after each
    /// recorded iteration.
    ///
    /// Infrastructure failures are errors. Generator trouble and cancellation
    /// end the run early with the best candidate so far, and are errors only
    /// when nothing was executed yet.
    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations))]
    pub fn run<F: FnMut(&IterationRecord)>(
        &self,
        task: &RefineTask<'_>,
        cancel: &CancelToken,
        mut on_iteration: F,
    ) -> Result<RefineOutcome, RefineError> {
        let cancel = match self.config.run_timeout_secs {
            Some(secs) => cancel.limit(Duration::from_secs(secs)),
            None => cancel.clone(),
        };
        let policy = self.config.policy();
        let mut state = RefinementState::new();
        let mut feedback: Option<String> = None;

        for index in 1..=policy.max_iterations {
            let candidate = match (index, task.initial_candidate) {
                (1, Some(initial)) => initial.to_string(),
                _ => match self.next_candidate(task, &state, feedback.as_deref(), &cancel) {
                    Ok(code) => code,
                    Err(reason) => return halt(state, reason),
                },
            };
            if cancel.is_cancelled() {
                return halt(state, Halt::Cancelled);
            }

            let started = Instant::now();
            let timeout = cancel.clamp(self.sandbox.default_timeout());
            let raw = self.sandbox.execute(&candidate, task.oracle, timeout, &cancel)?;
            if cancel.is_cancelled() {
                // The in-flight result is abandoned, not recorded.
                return halt(state, Halt::Cancelled);
            }

            let outcome = outcome_parser::parse(&raw);
            let analysis = classify(&outcome, Some(&candidate));
            let metrics = self.analyzer.analyze(&candidate);
            let reward = reward::score(
                &outcome,
                &metrics,
                raw.duration,
                state.previous_pass_rate(),
                self.weights,
            );
            info!(
                iteration = index,
                passed = outcome.passed,
                total = outcome.total,
                error_kind = %analysis.error_kind,
                reward = reward.total,
                "iteration finished"
            );

            feedback = Some(render_feedback(&analysis));
            state.record(IterationRecord {
                index,
                candidate_hash: candidate_hash(&candidate),
                candidate,
                outcome,
                analysis,
                reward,
                duration_secs: started.elapsed().as_secs_f64(),
            });
            if let Some(record) = state.last() {
                on_iteration(record);
            }

            if let Some(stop) = evaluate(&state, &policy) {
                info!(kind = %stop.kind, detail = %stop.detail, "refinement stopped");
                state.finish(stop.kind, stop.detail);
                break;
            }
        }

        if state.stop.is_none() {
            state.finish(
                StopKind::BudgetExhausted,
                format!("reached max_iterations = {}", policy.max_iterations),
            );
        }
        Ok(RefineOutcome {
            best_code: state.best_code.clone(),
            state,
        })
    }

    /// Ask the generator for the next candidate and make sure it parses.
    ///
    /// Unparseable code gets one colon-repair pass, then up to
    /// `syntax_retries` regenerations with the syntax error appended to the feedback.
    fn next_candidate(
        &self,
        task: &RefineTask<'_>,
        state: &RefinementState,
        feedback: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<String, Halt> {
        let previous = state.last().map(|r| r.candidate.as_str());
        let mut feedback = feedback.map(str::to_string);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let request = GenerationRequest {
                specification: task.specification,
                oracle: task.oracle,
                feedback: feedback.as_deref(),
                previous_candidate: previous,
            };
            let code = match self.generator.generate(&request, cancel) {
                Ok(code) => code,
                Err(GenerationError::Cancelled) => return Err(Halt::Cancelled),
                Err(err) => {
                    warn!(err = %err, "candidate generation failed");
                    return Err(Halt::Generation(err));
                }
            };

            let error = match self.analyzer.syntax_error(&code) {
                None => return Ok(code),
                Some(error) => error,
            };
            if let Some(repaired) = repair_missing_colons(&code)
                && self.analyzer.syntax_error(&repaired).is_none()
            {
                debug!("repaired missing colons in generated candidate");
                return Ok(repaired);
            }

            attempt += 1;
            if attempt > self.config.syntax_retries {
                return Err(Halt::Syntax(error));
            }
            warn!(attempt, error = %error, "generated candidate has a syntax error, regenerating");
            let note = format!("The previous reply was not valid Python: {error}");
            feedback = Some(match feedback {
                Some(text) => format!("{text}\n\n{note}"),
                None => note,
            });
        }
    }
}

fn halt(mut state: RefinementState, reason: Halt) -> Result<RefineOutcome, RefineError> {
    let (kind, detail) = match &reason {
        Halt::Cancelled => (StopKind::Cancelled, "run cancelled".to_string()),
        Halt::Generation(err) => (StopKind::Failed, format!("generator failed: {err}")),
        Halt::Syntax(error) => (
            StopKind::Failed,
            format!("generated candidate failed the syntax check: {error}"),
        ),
    };
    if state.iterations.is_empty() {
        return Err(match reason {
            Halt::Cancelled => RefineError::Cancelled,
            Halt::Generation(err) => RefineError::Generation(err),
            Halt::Syntax(error) => RefineError::InvalidCandidate(error),
        });
    }
    info!(kind = %kind, detail = %detail, "refinement halted early");
    state.finish(kind, detail);
    Ok(RefineOutcome {
        best_code: state.best_code.clone(),
        state,
    })
}

/// Hex SHA-256 of the candidate source.
pub fn candidate_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}
