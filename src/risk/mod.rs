pub mod dataset;
pub mod forest;
pub mod heuristic;
pub mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::models::{EngagementFeatures, FeatureContribution, ModelProvenance, RiskLevel};

use self::dataset::Dataset;
use self::forest::{ForestConfig, ForestModel};
use self::heuristic::HeuristicModel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskBands {
    pub low_max: f64,
    pub medium_max: f64,
}

impl Default for RiskBands {
    fn default() -> Self {
        Self {
            low_max: 0.3,
            medium_max: 0.7,
        }
    }
}

impl RiskBands {
    pub fn new(low_max: f64, medium_max: f64) -> CoreResult<Self> {
        if !(low_max > 0.0 && low_max < medium_max && medium_max <= 1.0) {
            return Err(CoreError::validation(format!(
                "risk bands need 0 < low_max < medium_max <= 1, got {low_max} / {medium_max}"
            )));
        }
        Ok(Self {
            low_max,
            medium_max,
        })
    }

    /// A score sitting exactly on a threshold belongs to the higher band.
    pub fn classify(&self, score: f64) -> RiskLevel {
        if score < self.low_max {
            RiskLevel::Low
        } else if score < self.medium_max {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub score: f64,
    pub baseline: f64,
    /// In `FEATURE_NAMES` order.
    pub contributions: Vec<FeatureContribution>,
}

/// A scoring strategy. Implementations must be deterministic: the same
/// features always produce the same output.
pub trait RiskModel: Send + Sync {
    fn evaluate(&self, features: &EngagementFeatures) -> ModelOutput;

    fn provenance(&self) -> ModelProvenance;

    fn feature_importance(&self) -> Option<Vec<FeatureContribution>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapPolicy {
    Lazy,
    Disabled,
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub accuracy: f64,
    pub n_train: usize,
    pub n_test: usize,
    pub provenance: ModelProvenance,
}

/// Owns the active model. Readers take a cheap `Arc` clone, so a swap is seen
/// either entirely or not at all.
#[derive(Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<dyn RiskModel>>>,
    training: Mutex<()>,
}

impl ModelHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn RiskModel>) -> Self {
        let handle = Self::default();
        handle.install(model);
        handle
    }

    pub fn current(&self) -> Option<Arc<dyn RiskModel>> {
        self.current.read().clone()
    }

    pub fn install(&self, model: Arc<dyn RiskModel>) {
        *self.current.write() = Some(model);
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub baseline: f64,
    pub contributions: Vec<FeatureContribution>,
    pub model: ModelProvenance,
}

pub struct RiskScorer {
    bands: RiskBands,
    handle: ModelHandle,
    bootstrap: BootstrapPolicy,
    forest: ForestConfig,
}

impl RiskScorer {
    pub fn heuristic(bands: RiskBands) -> Self {
        Self {
            bands,
            handle: ModelHandle::with_model(Arc::new(HeuristicModel::default())),
            bootstrap: BootstrapPolicy::Disabled,
            forest: ForestConfig::default(),
        }
    }

    pub fn forest(bands: RiskBands, forest: ForestConfig, bootstrap: BootstrapPolicy) -> Self {
        Self {
            bands,
            handle: ModelHandle::empty(),
            bootstrap,
            forest,
        }
    }

    pub fn with_model(bands: RiskBands, model: Arc<dyn RiskModel>) -> Self {
        Self {
            bands,
            handle: ModelHandle::with_model(model),
            bootstrap: BootstrapPolicy::Disabled,
            forest: ForestConfig::default(),
        }
    }

    pub fn bands(&self) -> &RiskBands {
        &self.bands
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_loaded()
    }

    pub fn predict(&self, features: &EngagementFeatures) -> CoreResult<RiskAssessment> {
        features.validate()?;
        let model = self.ready_model()?;
        let output = model.evaluate(features);
        let finite = output.score.is_finite()
            && output.baseline.is_finite()
            && output.contributions.iter().all(|c| c.value.is_finite());
        if !finite {
            return Err(CoreError::NotReady(format!(
                "{} produced a non-finite score",
                model.provenance()
            )));
        }
        let score = output.score.clamp(0.0, 1.0);
        Ok(RiskAssessment {
            score,
            level: self.bands.classify(score),
            baseline: output.baseline,
            contributions: output.contributions,
            model: model.provenance(),
        })
    }

    pub fn feature_importance(&self) -> CoreResult<Vec<FeatureContribution>> {
        let model = self.ready_model()?;
        model.feature_importance().ok_or_else(|| {
            CoreError::NotReady(format!("{} has no model-wide importance", model.provenance()))
        })
    }

    /// Fits a forest on `dataset` and installs it. Only one run may be in
    /// flight; a concurrent call fails fast.
    pub fn train(
        &self,
        dataset: &Dataset,
        cancel: &CancelFlag,
    ) -> CoreResult<(Arc<ForestModel>, TrainingReport)> {
        let _guard = self
            .handle
            .training
            .try_lock()
            .ok_or(CoreError::TrainingInProgress)?;
        self.fit_and_install(dataset, cancel)
    }

    fn fit_and_install(
        &self,
        dataset: &Dataset,
        cancel: &CancelFlag,
    ) -> CoreResult<(Arc<ForestModel>, TrainingReport)> {
        let (model, report) = ForestModel::fit_with_holdout(dataset, &self.forest, cancel)?;
        let model = Arc::new(model);
        self.handle.install(model.clone());
        info!(
            accuracy = report.accuracy,
            n_train = report.n_train,
            n_test = report.n_test,
            provenance = %report.provenance,
            "risk model installed"
        );
        Ok((model, report))
    }

    fn ready_model(&self) -> CoreResult<Arc<dyn RiskModel>> {
        if let Some(model) = self.handle.current() {
            return Ok(model);
        }
        match self.bootstrap {
            BootstrapPolicy::Disabled => Err(CoreError::NotReady(
                "no risk model has been trained or loaded".to_string(),
            )),
            BootstrapPolicy::Lazy => {
                // Wait out any run already in flight rather than failing.
                let _guard = self.handle.training.lock();
                if let Some(model) = self.handle.current() {
                    return Ok(model);
                }
                info!(
                    samples = self.forest.bootstrap_samples,
                    seed = self.forest.seed,
                    "no risk model loaded; bootstrapping from synthetic data"
                );
                let dataset = Dataset::synthetic(self.forest.bootstrap_samples, self.forest.seed)?;
                self.fit_and_install(&dataset, &CancelFlag::new())?;
                self.handle.current().ok_or_else(|| {
                    CoreError::NotReady("bootstrap finished without a model".to_string())
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::FEATURE_NAMES;

    /// Scores every vector with a fixed value and credits it all to the first
    /// feature.
    pub(crate) struct FixedModel(pub f64);

    impl RiskModel for FixedModel {
        fn evaluate(&self, _features: &EngagementFeatures) -> ModelOutput {
            ModelOutput {
                score: self.0,
                baseline: 0.0,
                contributions: FEATURE_NAMES
                    .iter()
                    .enumerate()
                    .map(|(i, name)| FeatureContribution {
                        feature: name.to_string(),
                        value: if i == 0 { self.0 } else { 0.0 },
                    })
                    .collect(),
            }
        }

        fn provenance(&self) -> ModelProvenance {
            ModelProvenance::Injected {
                name: format!("fixed-{}", self.0),
            }
        }
    }

    pub(crate) fn engaged() -> EngagementFeatures {
        EngagementFeatures::from_array([1.0, 8.0, 0.0, 6.0, 1500.0, 0.85, 0.9, 14.0])
    }

    #[test]
    fn boundaries_fall_into_higher_band() {
        let bands = RiskBands::default();
        assert_eq!(bands.classify(0.0), RiskLevel::Low);
        assert_eq!(bands.classify(0.2999), RiskLevel::Low);
        assert_eq!(bands.classify(0.3), RiskLevel::Medium);
        assert_eq!(bands.classify(0.6999), RiskLevel::Medium);
        assert_eq!(bands.classify(0.7), RiskLevel::High);
        assert_eq!(bands.classify(1.0), RiskLevel::High);
    }

    #[test]
    fn band_thresholds_are_validated() {
        assert!(RiskBands::new(0.7, 0.3).is_err());
        assert!(RiskBands::new(0.0, 0.5).is_err());
        assert!(RiskBands::new(0.3, 1.5).is_err());
        assert!(RiskBands::new(0.4, 0.8).is_ok());
    }

    #[test]
    fn injected_model_drives_the_level() {
        for (score, level) in [(0.3, RiskLevel::Medium), (0.7, RiskLevel::High), (0.1, RiskLevel::Low)] {
            let scorer = RiskScorer::with_model(RiskBands::default(), Arc::new(FixedModel(score)));
            let assessment = scorer.predict(&engaged()).unwrap();
            assert_eq!(assessment.level, level);
            assert_eq!(assessment.score, score);
        }
    }

    #[test]
    fn out_of_range_model_output_is_clamped() {
        let scorer = RiskScorer::with_model(RiskBands::default(), Arc::new(FixedModel(1.4)));
        let assessment = scorer.predict(&engaged()).unwrap();
        assert_eq!(assessment.score, 1.0);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn non_finite_model_output_is_rejected() {
        for score in [f64::NAN, f64::INFINITY] {
            let scorer = RiskScorer::with_model(RiskBands::default(), Arc::new(FixedModel(score)));
            assert!(matches!(scorer.predict(&engaged()), Err(CoreError::NotReady(_))));
        }
    }

    #[test]
    fn invalid_features_rejected_before_scoring() {
        let scorer = RiskScorer::heuristic(RiskBands::default());
        let mut features = engaged();
        features.active_days = -2.0;
        assert!(matches!(scorer.predict(&features), Err(CoreError::Validation(_))));
    }

    #[test]
    fn empty_handle_without_bootstrap_is_not_ready() {
        let scorer = RiskScorer::forest(
            RiskBands::default(),
            ForestConfig::default(),
            BootstrapPolicy::Disabled,
        );
        assert!(!scorer.is_ready());
        assert!(matches!(scorer.predict(&engaged()), Err(CoreError::NotReady(_))));
    }

    #[test]
    fn lazy_bootstrap_trains_once() {
        let config = ForestConfig {
            n_trees: 10,
            bootstrap_samples: 200,
            ..ForestConfig::default()
        };
        let scorer = RiskScorer::forest(RiskBands::default(), config, BootstrapPolicy::Lazy);
        let first = scorer.predict(&engaged()).unwrap();
        assert!(scorer.is_ready());
        assert_eq!(
            first.model,
            ModelProvenance::Synthetic {
                seed: 42,
                samples: 200
            }
        );
        let model = scorer.handle().current().unwrap();
        scorer.predict(&engaged()).unwrap();
        assert!(Arc::ptr_eq(&model, &scorer.handle().current().unwrap()));
    }

    #[test]
    fn concurrent_training_is_refused() {
        let scorer = RiskScorer::forest(
            RiskBands::default(),
            ForestConfig::default(),
            BootstrapPolicy::Disabled,
        );
        let dataset = Dataset::synthetic(100, 1).unwrap();
        let _held = scorer.handle().training.lock();
        assert!(matches!(
            scorer.train(&dataset, &CancelFlag::new()),
            Err(CoreError::TrainingInProgress)
        ));
    }

    #[test]
    fn cancelled_training_installs_nothing() {
        let scorer = RiskScorer::forest(
            RiskBands::default(),
            ForestConfig::default(),
            BootstrapPolicy::Disabled,
        );
        let cancel = CancelFlag::new();
        cancel.cancel();
        let dataset = Dataset::synthetic(100, 1).unwrap();
        assert!(matches!(scorer.train(&dataset, &cancel), Err(CoreError::Cancelled)));
        assert!(!scorer.is_ready());
    }

    #[test]
    fn heuristic_has_no_model_wide_importance() {
        let scorer = RiskScorer::heuristic(RiskBands::default());
        assert!(matches!(scorer.feature_importance(), Err(CoreError::NotReady(_))));
    }
}
