//! Cross-iteration memory of a refinement run and the rules that end it.
//!
//! Everything here is pure: the controller feeds completed
//! [`IterationRecord`]s in and asks whether to continue.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{IterationRecord, StopKind, StopReason};

/// Thresholds that decide when a run stops early.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPolicy {
    pub max_iterations: u32,
    /// Consecutive iterations without a best-candidate update tolerated.
    pub patience: u32,
    /// Pass-rate deltas below this count as no progress.
    pub min_improvement: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            patience: 2,
            min_improvement: 0.1,
        }
    }
}

/// State of one refinement run, owned by the controller and handed back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinementState {
    pub iterations: Vec<IterationRecord>,
    /// Position of the best record in `iterations`.
    pub best_index: Option<usize>,
    pub best_code: String,
    pub best_pass_rate: f64,
    pub best_reward: f64,
    pub no_improvement_streak: u32,
    pub converged: bool,
    pub stop: Option<StopReason>,
}

impl RefinementState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed iteration and apply the best-candidate rule.
    ///
    /// Returns `true` when the record became the new best.
    pub fn record(&mut self, record: IterationRecord) -> bool {
        let pass_rate = record.pass_rate();
        let reward = record.reward.total;
        let improved = match self.best_index {
            None => true,
            Some(_) => {
                pass_rate > self.best_pass_rate
                    || (pass_rate == self.best_pass_rate && reward > self.best_reward)
            }
        };

        if improved {
            info!(
                iteration = record.index,
                pass_rate,
                reward,
                "new best candidate"
            );
            self.best_index = Some(self.iterations.len());
            self.best_code = record.candidate.clone();
            self.best_pass_rate = pass_rate;
            self.best_reward = reward;
            self.no_improvement_streak = 0;
        } else {
            self.no_improvement_streak += 1;
        }
        self.iterations.push(record);
        improved
    }

    fn promote_last(&mut self) {
        let Some(index) = self.iterations.len().checked_sub(1) else {
            return;
        };
        if self.best_index == Some(index) {
            return;
        }
        let last = &self.iterations[index];
        info!(
            iteration = last.index,
            pass_rate = last.pass_rate(),
            "converging candidate replaces best"
        );
        self.best_index = Some(index);
        self.best_code = last.candidate.clone();
        self.best_pass_rate = last.pass_rate();
        self.best_reward = last.reward.total;
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    pub fn best(&self) -> Option<&IterationRecord> {
        self.best_index.and_then(|i| self.iterations.get(i))
    }

    /// Pass rate of the most recent iteration, the baseline for the next one.
    pub fn previous_pass_rate(&self) -> Option<f64> {
        self.last().map(IterationRecord::pass_rate)
    }

    pub fn iteration_count(&self) -> u32 {
        u32::try_from(self.iterations.len()).unwrap_or(u32::MAX)
    }

    /// Record why the run ended.
    ///
    /// A converged run always hands back the converging candidate, even when
    /// skipped checks left an earlier failing candidate with a higher pass rate.
    pub fn finish(&mut self, kind: StopKind, detail: impl Into<String>) {
        self.converged = kind == StopKind::Converged;
        if self.converged {
            self.promote_last();
        }
        self.stop = Some(StopReason {
            kind,
            detail: detail.into(),
        });
    }
}

/// Decide whether the run ends after its latest iteration.
///
/// Checked in order: convergence, patience, minimal progress, iteration budget.
pub fn evaluate(state: &RefinementState, policy: &StopPolicy) -> Option<StopReason> {
    let last = state.last()?;
    let count = state.iteration_count();

    if last.outcome.is_converged() {
        return Some(StopReason {
            kind: StopKind::Converged,
            detail: format!(
                "all {} checks passed at iteration {}",
                last.outcome.passed, last.index
            ),
        });
    }

    if state.no_improvement_streak >= policy.patience {
        return Some(StopReason {
            kind: StopKind::Stagnated,
            detail: format!(
                "no best-candidate update for {} iterations",
                state.no_improvement_streak
            ),
        });
    }

    if count > 2 && state.no_improvement_streak >= 1 {
        let previous = state.iterations[state.iterations.len() - 2].pass_rate();
        let delta = last.pass_rate() - previous;
        if delta.abs() < policy.min_improvement {
            return Some(StopReason {
                kind: StopKind::Stagnated,
                detail: format!(
                    "pass rate moved {delta:+.3} (< {}) at iteration {}",
                    policy.min_improvement, last.index
                ),
            });
        }
    }

    if count >= policy.max_iterations {
        return Some(StopReason {
            kind: StopKind::BudgetExhausted,
            detail: format!("reached max_iterations = {}", policy.max_iterations),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::iteration;

    #[test]
    fn equal_pass_rate_needs_strictly_higher_reward() {
        let mut state = RefinementState::new();
        assert!(state.record(iteration(1, 7, 10, 60.0)));
        assert!(!state.record(iteration(2, 7, 10, 55.0)));
        assert_eq!(state.best_index, Some(0));
        assert_eq!(state.best_reward, 60.0);
        assert_eq!(state.best_code, "candidate 1");
        assert_eq!(state.no_improvement_streak, 1);

        assert!(!state.record(iteration(3, 7, 10, 60.0)));
        assert_eq!(state.best_index, Some(0));
    }

    #[test]
    fn higher_pass_rate_wins_despite_lower_reward() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 5, 10, 80.0));
        assert!(state.record(iteration(2, 6, 10, 20.0)));
        assert_eq!(state.best_index, Some(1));
        assert_eq!(state.no_improvement_streak, 0);
    }

    #[test]
    fn lower_pass_rate_never_replaces_best() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 8, 10, 10.0));
        assert!(!state.record(iteration(2, 7, 10, 99.0)));
        assert_eq!(state.best_pass_rate, 0.8);
    }

    #[test]
    fn converged_iteration_stops_immediately() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 4, 4, 55.0));
        let stop = evaluate(&state, &StopPolicy::default()).expect("stop");
        assert_eq!(stop.kind, StopKind::Converged);
    }

    #[test]
    fn patience_triggers_stagnation() {
        let policy = StopPolicy {
            max_iterations: 10,
            patience: 2,
            min_improvement: 0.0,
        };
        let mut state = RefinementState::new();
        state.record(iteration(1, 5, 10, 30.0));
        assert_eq!(evaluate(&state, &policy), None);
        state.record(iteration(2, 4, 10, 20.0));
        assert_eq!(evaluate(&state, &policy), None);
        state.record(iteration(3, 3, 10, 10.0));
        assert_eq!(
            evaluate(&state, &policy).map(|s| s.kind),
            Some(StopKind::Stagnated)
        );
    }

    #[test]
    fn flat_pass_rate_after_second_iteration_stagnates() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 5, 10, 30.0));
        state.record(iteration(2, 8, 10, 60.0));
        assert_eq!(evaluate(&state, &StopPolicy::default()), None);
        state.record(iteration(3, 8, 10, 55.0));
        let stop = evaluate(&state, &StopPolicy::default()).expect("stop");
        assert_eq!(stop.kind, StopKind::Stagnated);
        assert_eq!(state.best().map(|r| r.index), Some(2));
    }

    #[test]
    fn small_delta_without_streak_keeps_going() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 10, 100, 10.0));
        state.record(iteration(2, 20, 100, 20.0));
        state.record(iteration(3, 25, 100, 25.0));
        assert_eq!(evaluate(&state, &StopPolicy::default()), None);
    }

    #[test]
    fn budget_is_the_last_rule() {
        let policy = StopPolicy {
            max_iterations: 2,
            ..StopPolicy::default()
        };
        let mut state = RefinementState::new();
        state.record(iteration(1, 1, 10, 5.0));
        assert_eq!(evaluate(&state, &policy), None);
        state.record(iteration(2, 5, 10, 25.0));
        assert_eq!(
            evaluate(&state, &policy).map(|s| s.kind),
            Some(StopKind::BudgetExhausted)
        );
    }

    #[test]
    fn finish_marks_convergence() {
        let mut state = RefinementState::new();
        state.finish(StopKind::Converged, "done");
        assert!(state.converged);
        state.finish(StopKind::Cancelled, "interrupted");
        assert!(!state.converged);
        assert_eq!(state.stop.map(|s| s.kind), Some(StopKind::Cancelled));
    }

    #[test]
    fn converging_candidate_becomes_best_despite_lower_pass_rate() {
        let mut state = RefinementState::new();
        state.record(iteration(1, 4, 5, 60.0));
        let mut skipped_one = iteration(2, 3, 3, 40.0);
        skipped_one.outcome.skipped = 1;
        skipped_one.outcome.total = 4;
        assert!(!state.record(skipped_one));
        assert_eq!(state.best_index, Some(0));

        let stop = evaluate(&state, &StopPolicy::default()).expect("stop");
        assert_eq!(stop.kind, StopKind::Converged);
        state.finish(stop.kind, stop.detail);
        assert_eq!(state.best_index, Some(1));
        assert_eq!(state.best_code, "candidate 2");
        assert_eq!(state.best_pass_rate, 0.75);
        assert_eq!(state.best_reward, 40.0);
        assert!(state.best().is_some_and(|r| r.outcome.is_converged()));
    }
}
