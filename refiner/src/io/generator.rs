//! Candidate generator abstraction.
//!
//! The controller only sees [`CandidateGenerator`]. [`PromptedGenerator`]
//! renders prompts and extracts code around any [`TextBackend`]; the only
//! shipped backend is [`CommandBackend`], which pipes the prompt into an
//! external CLI model runner. Tests use scripted generators instead.

use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::repair::extract_code;
use crate::io::process::run_command;
use crate::io::prompt::{PromptBuilder, PromptInputs};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend failed: {0}")]
    Backend(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation cancelled")]
    Cancelled,
    #[error("generator reply contained no code")]
    Empty,
    #[error("failed to build prompt: {0}")]
    Prompt(String),
}

/// `[generator]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and prints the reply (e.g. `["ollama","run","codellama:7b"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Upper bound on rendered prompt size; droppable sections go first.
    pub prompt_budget_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "ollama".to_string(),
                "run".to_string(),
                "codellama:7b".to_string(),
            ],
            timeout_secs: 120,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 24_000,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err("generator.command must be a non-empty array".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("generator.timeout_secs must be > 0".to_string());
        }
        if self.output_limit_bytes == 0 {
            return Err("generator.output_limit_bytes must be > 0".to_string());
        }
        if self.prompt_budget_bytes == 0 {
            return Err("generator.prompt_budget_bytes must be > 0".to_string());
        }
        Ok(())
    }
}

/// What the generator is asked to produce.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub specification: &'a str,
    pub oracle: &'a str,
    /// Rendered feedback from the previous iteration; `None` for a first attempt.
    pub feedback: Option<&'a str>,
    pub previous_candidate: Option<&'a str>,
}

/// Produces candidate source for a specification and oracle.
pub trait CandidateGenerator {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GenerationError>;
}

/// Raw text-completion capability.
pub trait TextBackend {
    fn complete(&self, prompt: &str, cancel: &CancelToken) -> Result<String, GenerationError>;
}

/// Backend that runs an external command with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl TextBackend for CommandBackend {
    #[instrument(skip_all, fields(program = self.command.first().map(String::as_str).unwrap_or_default(), prompt_bytes = prompt.len()))]
    fn complete(&self, prompt: &str, cancel: &CancelToken) -> Result<String, GenerationError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GenerationError::Backend("empty generator command".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);

        let timeout = cancel.clamp(self.timeout);
        let output = run_command(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.output_limit_bytes,
            cancel,
        )
        .map_err(|err| GenerationError::Backend(format!("{err:#}")))?;

        if output.cancelled {
            return Err(GenerationError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "generator timed out");
            return Err(GenerationError::Timeout(timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator command failed");
            return Err(GenerationError::Backend(format!(
                "exit status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            )));
        }
        debug!(reply_bytes = output.stdout.bytes.len(), "generator replied");
        Ok(output.stdout_lossy())
    }
}

/// [`CandidateGenerator`] that renders prompts and extracts code from the reply.
pub struct PromptedGenerator<B> {
    backend: B,
    prompts: PromptBuilder,
}

impl<B: TextBackend> PromptedGenerator<B> {
    pub fn new(backend: B, prompt_budget_bytes: usize) -> Self {
        Self {
            backend,
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }
}

impl<B: TextBackend> CandidateGenerator for PromptedGenerator<B> {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<String, GenerationError> {
        let prompt = self
            .prompts
            .build(&PromptInputs {
                specification: request.specification,
                oracle: request.oracle,
                feedback: request.feedback,
                previous_candidate: request.previous_candidate,
            })
            .map_err(|err| GenerationError::Prompt(format!("{err:#}")))?;

        info!(
            refinement = request.feedback.is_some(),
            prompt_bytes = prompt.len(),
            "requesting candidate"
        );
        let reply = self.backend.complete(&prompt, cancel)?;
        let code = extract_code(&reply);
        if code.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(code)
    }
}
