use crate::models::{
    EngagementFeatures, FeatureContribution, ModelProvenance, FEATURE_COUNT, FEATURE_NAMES,
};

use super::{ModelOutput, RiskModel};

/// How a raw signal is turned into an adverse factor in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    /// `max(0, 1 - x / scale)`: low values are adverse.
    Shortfall { scale: f64 },
    /// `min(1, x / scale)`: high values are adverse.
    Excess { scale: f64 },
}

impl Transform {
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            Transform::Shortfall { scale } => (1.0 - value / scale).max(0.0),
            Transform::Excess { scale } => (value / scale).min(1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureWeight {
    pub transform: Transform,
    pub weight: f64,
}

/// Weighted sum of adverse factors. Weights sum to 1, so the score is
/// already bounded by `[0, 1]`.
#[derive(Debug, Clone)]
pub struct HeuristicModel {
    weights: [FeatureWeight; FEATURE_COUNT],
}

impl Default for HeuristicModel {
    fn default() -> Self {
        use Transform::{Excess, Shortfall};
        let w = |transform, weight| FeatureWeight { transform, weight };
        Self {
            weights: [
                w(Shortfall { scale: 1.0 }, 0.15),
                w(Shortfall { scale: 10.0 }, 0.10),
                w(Excess { scale: 14.0 }, 0.20),
                w(Shortfall { scale: 5.0 }, 0.10),
                w(Excess { scale: 10_000.0 }, 0.05),
                w(Shortfall { scale: 1.0 }, 0.15),
                w(Shortfall { scale: 1.0 }, 0.15),
                w(Shortfall { scale: 10.0 }, 0.10),
            ],
        }
    }
}

impl HeuristicModel {
    pub fn terms(&self, features: &EngagementFeatures) -> [f64; FEATURE_COUNT] {
        let values = features.to_array();
        let mut terms = [0.0; FEATURE_COUNT];
        for ((term, value), weight) in terms.iter_mut().zip(values).zip(&self.weights) {
            *term = weight.transform.apply(value) * weight.weight;
        }
        terms
    }

    pub fn score(&self, features: &EngagementFeatures) -> f64 {
        self.terms(features).iter().sum::<f64>().clamp(0.0, 1.0)
    }
}

impl RiskModel for HeuristicModel {
    fn evaluate(&self, features: &EngagementFeatures) -> ModelOutput {
        let terms = self.terms(features);
        ModelOutput {
            score: terms.iter().sum::<f64>().clamp(0.0, 1.0),
            baseline: 0.0,
            contributions: FEATURE_NAMES
                .iter()
                .zip(terms)
                .map(|(name, value)| FeatureContribution {
                    feature: name.to_string(),
                    value,
                })
                .collect(),
        }
    }

    fn provenance(&self) -> ModelProvenance {
        ModelProvenance::Heuristic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests::engaged;

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = HeuristicModel::default().weights.iter().map(|w| w.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn inactive_student_scores_maximum() {
        let idle = EngagementFeatures::from_array([0.0, 0.0, 30.0, 0.0, 20_000.0, 0.0, 0.0, 0.0]);
        let score = HeuristicModel::default().score(&idle);
        assert!((score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn engaged_student_scores_low() {
        // messages 0.2 * 0.10, latency 0.15 * 0.05, mastery 0.15 * 0.15,
        // correct rate 0.1 * 0.15; every other signal is saturated.
        let score = HeuristicModel::default().score(&engaged());
        let expected = 0.02 + 0.0075 + 0.0225 + 0.015;
        assert!((score - expected).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn contributions_are_the_weighted_terms() {
        let model = HeuristicModel::default();
        let features =
            EngagementFeatures::from_array([0.5, 5.0, 7.0, 2.5, 5000.0, 0.5, 0.5, 5.0]);
        let output = model.evaluate(&features);

        assert_eq!(output.contributions.len(), FEATURE_COUNT);
        assert_eq!(output.contributions[2].feature, "days_since_last_active");
        assert!((output.contributions[2].value - 0.10).abs() < 1e-12);

        let total: f64 = output.contributions.iter().map(|c| c.value).sum();
        assert!((total - output.score).abs() < 1e-12);
        assert!((output.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let model = HeuristicModel::default();
        let features = engaged();
        assert_eq!(model.evaluate(&features), model.evaluate(&features));
    }
}
