//! Efficiency dimension: wall-clock time plus the estimated complexity class.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::ComplexityClass;

const TIME_WEIGHT: f64 = 0.7;
const CLASS_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyScore {
    pub reward: f64,
    pub execution_time_secs: f64,
    pub time_score: f64,
    pub complexity_class: ComplexityClass,
    pub class_score: f64,
}

pub fn score(execution_time: Duration, class: ComplexityClass, max: f64) -> EfficiencyScore {
    let secs = execution_time.as_secs_f64();
    let time_score = time_score(secs);
    let class_score = class_score(class);
    EfficiencyScore {
        reward: (TIME_WEIGHT * time_score + CLASS_WEIGHT * class_score) * max,
        execution_time_secs: secs,
        time_score,
        complexity_class: class,
        class_score,
    }
}

/// Step function over wall-clock seconds, saturating at both ends.
pub fn time_score(secs: f64) -> f64 {
    match secs {
        s if s < 0.5 => 1.0,
        s if s < 1.0 => 0.8,
        s if s < 2.0 => 0.6,
        s if s < 5.0 => 0.4,
        s if s < 10.0 => 0.2,
        _ => 0.1,
    }
}

pub fn class_score(class: ComplexityClass) -> f64 {
    match class {
        ComplexityClass::Constant => 1.0,
        ComplexityClass::Logarithmic => 0.9,
        ComplexityClass::Linear => 0.8,
        ComplexityClass::Linearithmic => 0.6,
        ComplexityClass::Quadratic => 0.4,
        ComplexityClass::Cubic => 0.2,
        ComplexityClass::Exponential => 0.1,
        ComplexityClass::Unknown => 0.5,
    }
}
