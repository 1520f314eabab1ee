//! Code-quality dimension: complexity, idioms, smells and documentation.

use serde::{Deserialize, Serialize};

use crate::core::types::{Construct, QualityMetrics, Smell};

const COMPLEXITY_WEIGHT: f64 = 0.4;
const IDIOM_WEIGHT: f64 = 0.3;
const SMELL_WEIGHT: f64 = 0.2;
const DOC_WEIGHT: f64 = 0.1;

/// Full credit at or below this average cyclomatic complexity.
const LOW_COMPLEXITY: f64 = 5.0;
/// No credit at or above this one.
const HIGH_COMPLEXITY: f64 = 15.0;
const NEUTRAL_COMPLEXITY_SCORE: f64 = 0.5;
const DOC_BONUS_PER_ITEM: f64 = 0.3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub reward: f64,
    pub complexity_score: f64,
    pub idiom_score: f64,
    /// In `[-1, 0]`.
    pub smell_score: f64,
    pub doc_score: f64,
    pub constructs: Vec<Construct>,
    pub smells: Vec<Smell>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub fn score(metrics: &QualityMetrics, max: f64) -> QualityScore {
    if metrics.has_syntax_error {
        return QualityScore {
            note: Some("Syntax error in code".to_string()),
            ..QualityScore::default()
        };
    }

    let profile = &metrics.profile;
    let complexity_score = complexity_score(metrics);
    let idiom_score = idiom_score(&profile.constructs);
    let smell_score = smell_score(&profile.smells);
    let doc_score = (f64::from(profile.documented_items) * DOC_BONUS_PER_ITEM).min(1.0);

    let weighted = COMPLEXITY_WEIGHT * complexity_score
        + IDIOM_WEIGHT * idiom_score
        + SMELL_WEIGHT * smell_score
        + DOC_WEIGHT * doc_score;

    QualityScore {
        reward: (weighted * max).max(0.0),
        complexity_score,
        idiom_score,
        smell_score,
        doc_score,
        constructs: profile.constructs.clone(),
        smells: profile.smells.clone(),
        note: None,
    }
}

fn complexity_score(metrics: &QualityMetrics) -> f64 {
    let per_function = &metrics.profile.function_complexities;
    let average = if per_function.is_empty() {
        if metrics.complexity == 0 {
            return NEUTRAL_COMPLEXITY_SCORE;
        }
        f64::from(metrics.complexity)
    } else {
        per_function.iter().map(|&c| f64::from(c)).sum::<f64>() / per_function.len() as f64
    };
    complexity_curve(average)
}

/// 1.0 at or below the low threshold, 0.0 at or above the high one, linear between.
pub fn complexity_curve(average: f64) -> f64 {
    if average <= LOW_COMPLEXITY {
        1.0
    } else if average >= HIGH_COMPLEXITY {
        0.0
    } else {
        1.0 - (average - LOW_COMPLEXITY) / (HIGH_COMPLEXITY - LOW_COMPLEXITY)
    }
}

fn idiom_score(constructs: &[Construct]) -> f64 {
    let total: f64 = constructs
        .iter()
        .map(|construct| match construct {
            Construct::ListComprehension
            | Construct::DictComprehension
            | Construct::GeneratorExpression => 0.1,
            Construct::ContextManager => 0.15,
            Construct::FString => 0.05,
        })
        .sum();
    total.min(1.0)
}

fn smell_score(smells: &[Smell]) -> f64 {
    let total: f64 = smells
        .iter()
        .map(|smell| match smell {
            Smell::BareExcept => -0.2,
            Smell::GlobalStatement => -0.15,
            Smell::LongFunction { .. } => -0.1,
            Smell::MagicNumbers => -0.05,
        })
        .sum();
    total.max(-1.0)
}
