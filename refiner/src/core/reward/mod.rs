//! Composite, explainable reward for one iteration.
//!
//! [`score`] is a pure function of its arguments: the current outcome, the
//! candidate's static metrics, the measured execution time and the previous
//! iteration's pass rate. Every intermediate value is kept in the returned
//! [`RewardBreakdown`] so runs can be audited after the fact.

pub mod efficiency;
pub mod partial;
pub mod quality;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{QualityMetrics, TestOutcome};

pub use efficiency::EfficiencyScore;
pub use partial::PartialScore;
pub use quality::QualityScore;

pub const TEST_PASSING: &str = "test_passing";
pub const PARTIAL_CORRECTNESS: &str = "partial_correctness";
pub const CODE_QUALITY: &str = "code_quality";
pub const EFFICIENCY: &str = "efficiency";
pub const IMPROVEMENT: &str = "improvement";
pub const CONVERGENCE: &str = "convergence";

/// Maximum weights and penalties (`[reward]` in the config file).
///
/// Penalties are stored as non-positive numbers and added to the total as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub test_passing: f64,
    pub partial_correctness: f64,
    pub code_quality: f64,
    pub efficiency: f64,
    /// Multiplier applied to a positive pass-rate delta.
    pub improvement: f64,
    pub convergence: f64,
    pub timeout_penalty: f64,
    /// Charged once per errored test.
    pub runtime_error_penalty: f64,
    pub syntax_error_penalty: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            test_passing: 50.0,
            partial_correctness: 15.0,
            code_quality: 10.0,
            efficiency: 10.0,
            improvement: 10.0,
            convergence: 5.0,
            timeout_penalty: -8.0,
            runtime_error_penalty: -3.0,
            syntax_error_penalty: -5.0,
        }
    }
}

impl RewardWeights {
    /// Reject negative maxima and positive penalties.
    pub fn validate(&self) -> Result<(), String> {
        let maxima = [
            (TEST_PASSING, self.test_passing),
            (PARTIAL_CORRECTNESS, self.partial_correctness),
            (CODE_QUALITY, self.code_quality),
            (EFFICIENCY, self.efficiency),
            (IMPROVEMENT, self.improvement),
            (CONVERGENCE, self.convergence),
        ];
        for (name, value) in maxima {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("reward.{name} must be a finite value >= 0"));
            }
        }
        let penalties = [
            ("timeout_penalty", self.timeout_penalty),
            ("runtime_error_penalty", self.runtime_error_penalty),
            ("syntax_error_penalty", self.syntax_error_penalty),
        ];
        for (name, value) in penalties {
            if !value.is_finite() || value > 0.0 {
                return Err(format!("reward.{name} must be a finite value <= 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPassingScore {
    pub reward: f64,
    pub pass_rate: f64,
    pub passed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementScore {
    pub reward: f64,
    pub previous_pass_rate: Option<f64>,
    /// Signed delta; zero when there is no previous iteration.
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceScore {
    pub reward: f64,
    pub all_passed: bool,
}

/// The six fixed reward dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub test_passing: TestPassingScore,
    pub partial_correctness: PartialScore,
    pub code_quality: QualityScore,
    pub efficiency: EfficiencyScore,
    pub improvement: ImprovementScore,
    pub convergence: ConvergenceScore,
}

impl Dimensions {
    /// `(name, reward)` pairs in their fixed order.
    pub fn rewards(&self) -> [(&'static str, f64); 6] {
        [
            (TEST_PASSING, self.test_passing.reward),
            (PARTIAL_CORRECTNESS, self.partial_correctness.reward),
            (CODE_QUALITY, self.code_quality.reward),
            (EFFICIENCY, self.efficiency.reward),
            (IMPROVEMENT, self.improvement.reward),
            (CONVERGENCE, self.convergence.reward),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.rewards().iter().map(|(_, reward)| reward).sum()
    }
}

/// Individual penalty contributions; each is `<= 0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PenaltyBreakdown {
    pub timeout: f64,
    pub runtime_errors: f64,
    pub syntax_error: f64,
}

impl PenaltyBreakdown {
    pub fn sum(&self) -> f64 {
        self.timeout + self.runtime_errors + self.syntax_error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub dimensions: Dimensions,
    pub penalty_breakdown: PenaltyBreakdown,
    /// Sum of `penalty_breakdown`, never positive.
    pub penalties: f64,
    pub total: f64,
}

/// Score one iteration.
pub fn score(
    outcome: &TestOutcome,
    metrics: &QualityMetrics,
    execution_time: Duration,
    previous_pass_rate: Option<f64>,
    weights: &RewardWeights,
) -> RewardBreakdown {
    let pass_rate = outcome.pass_rate();

    let test_passing = TestPassingScore {
        reward: pass_rate * weights.test_passing,
        pass_rate,
        passed: outcome.passed,
        total: outcome.total,
    };

    let improvement = match previous_pass_rate {
        Some(previous) => {
            let delta = pass_rate - previous;
            ImprovementScore {
                reward: delta.max(0.0) * weights.improvement,
                previous_pass_rate: Some(previous),
                delta,
            }
        }
        None => ImprovementScore {
            reward: 0.0,
            previous_pass_rate: None,
            delta: 0.0,
        },
    };

    let all_passed = outcome.total > 0 && outcome.passed == outcome.total;
    let convergence = ConvergenceScore {
        reward: if all_passed { weights.convergence } else { 0.0 },
        all_passed,
    };

    let dimensions = Dimensions {
        test_passing,
        partial_correctness: partial::score(outcome, weights.partial_correctness),
        code_quality: quality::score(metrics, weights.code_quality),
        efficiency: efficiency::score(
            execution_time,
            metrics.profile.complexity_class,
            weights.efficiency,
        ),
        improvement,
        convergence,
    };

    let penalty_breakdown = PenaltyBreakdown {
        timeout: if outcome.timed_out {
            weights.timeout_penalty
        } else {
            0.0
        },
        runtime_errors: f64::from(outcome.errored) * weights.runtime_error_penalty,
        syntax_error: if metrics.has_syntax_error {
            weights.syntax_error_penalty
        } else {
            0.0
        },
    };
    let penalties = penalty_breakdown.sum();

    RewardBreakdown {
        total: dimensions.sum() + penalties,
        dimensions,
        penalty_breakdown,
        penalties,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outcome_parser::parse;
    use crate::core::types::{ComplexityClass, SourceProfile};
    use crate::test_support::{raw_output, raw_timeout};

    fn clean_metrics() -> QualityMetrics {
        QualityMetrics {
            complexity: 2,
            line_count: 6,
            profile: SourceProfile {
                function_complexities: vec![2],
                complexity_class: ComplexityClass::Linear,
                ..SourceProfile::default()
            },
            ..QualityMetrics::default()
        }
    }

    #[test]
    fn converged_outcome_earns_full_test_and_convergence_rewards() {
        let outcome = parse(&raw_output("4 passed in 0.12s\n", 0));
        let reward = score(
            &outcome,
            &clean_metrics(),
            Duration::from_millis(200),
            None,
            &RewardWeights::default(),
        );
        let d = &reward.dimensions;
        assert_eq!(d.test_passing.reward, 50.0);
        assert_eq!(d.convergence.reward, 5.0);
        assert_eq!(d.improvement.reward, 0.0);
        assert_eq!(d.partial_correctness.reward, 0.0);
        assert_eq!(reward.penalties, 0.0);
        assert!((reward.total - d.sum()).abs() < 1e-9);
    }

    #[test]
    fn improvement_only_counts_gains() {
        let weights = RewardWeights::default();
        let outcome = parse(&raw_output("3 passed, 1 failed in 0.1s\n", 1));
        let up = score(&outcome, &clean_metrics(), Duration::ZERO, Some(0.5), &weights);
        assert!((up.dimensions.improvement.reward - 2.5).abs() < 1e-9);

        let down = score(&outcome, &clean_metrics(), Duration::ZERO, Some(1.0), &weights);
        assert_eq!(down.dimensions.improvement.reward, 0.0);
        assert!((down.dimensions.improvement.delta + 0.25).abs() < 1e-9);
    }

    #[test]
    fn penalties_accumulate_and_stay_non_positive() {
        let mut raw = raw_timeout("1 passed, 2 errors in 5.0s\n");
        raw.stderr.clear();
        let outcome = parse(&raw);
        let metrics = QualityMetrics {
            has_syntax_error: true,
            ..QualityMetrics::default()
        };
        let reward = score(
            &outcome,
            &metrics,
            Duration::from_secs(5),
            None,
            &RewardWeights::default(),
        );
        assert_eq!(reward.penalty_breakdown.timeout, -8.0);
        assert_eq!(reward.penalty_breakdown.runtime_errors, -6.0);
        assert_eq!(reward.penalty_breakdown.syntax_error, -5.0);
        assert_eq!(reward.penalties, -19.0);
        assert!(reward.penalties <= 0.0);
        assert!((reward.total - (reward.dimensions.sum() - 19.0)).abs() < 1e-9);
    }

    #[test]
    fn dimensions_never_exceed_their_maxima() {
        let weights = RewardWeights::default();
        let outcome = parse(&raw_output(
            "FAILED test_impl.py::test_a - AssertionError: assert 10 == 10.0\n9 passed, 1 failed in 0.01s\n",
            1,
        ));
        let reward = score(&outcome, &clean_metrics(), Duration::ZERO, Some(0.0), &weights);
        let maxima = [
            weights.test_passing,
            weights.partial_correctness,
            weights.code_quality,
            weights.efficiency,
            weights.improvement,
            weights.convergence,
        ];
        for ((name, value), max) in reward.dimensions.rewards().iter().zip(maxima) {
            assert!(*value <= max + 1e-9, "{name} = {value} exceeds {max}");
            assert!(*value >= 0.0, "{name} is negative");
        }
    }

    #[test]
    fn validate_rejects_positive_penalties() {
        let weights = RewardWeights {
            timeout_penalty: 1.0,
            ..RewardWeights::default()
        };
        assert!(weights.validate().is_err());
        assert!(RewardWeights::default().validate().is_ok());
    }
}
