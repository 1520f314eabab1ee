//! Static analysis of candidate source.
//!
//! The controller only depends on [`QualityAnalyzer`]; [`PythonAnalyzer`]
//! is the tree-sitter backed implementation used by the CLI.

mod python;

use serde::{Deserialize, Serialize};

use crate::core::types::QualityMetrics;

pub use python::PythonAnalyzer;

/// Static-analysis collaborator for the reward calculator and syntax pre-check.
pub trait QualityAnalyzer {
    /// Metrics for one candidate. Never fails; unparseable source sets `has_syntax_error`.
    fn analyze(&self, source: &str) -> QualityMetrics;

    /// Location and description of the first syntax error, if any.
    fn syntax_error(&self, source: &str) -> Option<String>;
}

/// `[analysis]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Modules whose import counts as a security issue.
    pub blocked_imports: Vec<String>,
    /// Calls that count as a security issue.
    pub dangerous_calls: Vec<String>,
    /// Lines longer than this count as lint errors.
    pub max_line_length: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            blocked_imports: ["os", "subprocess", "importlib", "sys", "socket", "shutil"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            dangerous_calls: ["eval", "exec", "compile", "__import__", "open", "input"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_line_length: 100,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_line_length == 0 {
            return Err("analysis.max_line_length must be > 0".to_string());
        }
        if self.blocked_imports.iter().any(|m| m.trim().is_empty()) {
            return Err("analysis.blocked_imports must not contain empty names".to_string());
        }
        Ok(())
    }
}
