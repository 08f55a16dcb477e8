use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{EngagementFeatures, FeatureContribution, ModelProvenance, RiskPrediction};
use crate::store::{RetryPolicy, Store};

use super::dataset::Dataset;
use super::forest::ForestModel;
use super::{CancelFlag, RiskAssessment, RiskModel, RiskScorer, TrainingReport};

/// A forest fit running on the blocking pool.
pub struct TrainingJob {
    cancel: CancelFlag,
    handle: JoinHandle<CoreResult<(Arc<ForestModel>, TrainingReport)>>,
}

impl TrainingJob {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The installed model and its holdout report.
    pub async fn wait(self) -> CoreResult<(Arc<ForestModel>, TrainingReport)> {
        self.handle
            .await
            .map_err(|err| CoreError::NotReady(format!("training task failed: {err}")))?
    }
}

pub struct RiskService<S: Store> {
    scorer: Arc<RiskScorer>,
    store: Arc<S>,
    retry: RetryPolicy,
    cache_max_age: Duration,
}

impl<S: Store> RiskService<S> {
    pub fn new(scorer: Arc<RiskScorer>, store: Arc<S>) -> Self {
        Self {
            scorer,
            store,
            retry: RetryPolicy::default(),
            cache_max_age: Duration::hours(24),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    pub fn scorer(&self) -> &Arc<RiskScorer> {
        &self.scorer
    }

    async fn assess(&self, features: EngagementFeatures) -> CoreResult<RiskAssessment> {
        if self.scorer.is_ready() {
            return self.scorer.predict(&features);
        }
        // First prediction may bootstrap a forest; keep it off the executor.
        let scorer = Arc::clone(&self.scorer);
        tokio::task::spawn_blocking(move || scorer.predict(&features))
            .await
            .map_err(|err| CoreError::NotReady(format!("bootstrap task failed: {err}")))?
    }

    /// Scores `features` and appends the result to the student's history.
    /// Nothing is written when validation fails.
    pub async fn predict_risk(
        &self,
        student_id: i64,
        features: EngagementFeatures,
    ) -> CoreResult<RiskPrediction> {
        let assessment = self.assess(features).await?;
        let prediction = RiskPrediction {
            id: Uuid::new_v4(),
            student_id,
            risk_score: assessment.score,
            risk_level: assessment.level,
            features,
            contributions: assessment.contributions,
            model: assessment.model,
            predicted_at: Utc::now(),
        };

        // Same id on every attempt, so a replayed append is a no-op in Postgres.
        let record = &prediction;
        self.retry
            .run("append_prediction", move || self.store.append_prediction(record))
            .await?;

        info!(
            student_id,
            risk_score = prediction.risk_score,
            risk_level = %prediction.risk_level,
            model = %prediction.model,
            "risk predicted"
        );
        Ok(prediction)
    }

    /// Returns the latest prediction while it is younger than the cache
    /// window, otherwise predicts again.
    pub async fn current_risk(
        &self,
        student_id: i64,
        features: EngagementFeatures,
        force_refresh: bool,
    ) -> CoreResult<RiskPrediction> {
        if !force_refresh {
            let latest = self
                .retry
                .run("latest_prediction", move || self.store.latest_prediction(student_id))
                .await?;
            if let Some(prediction) = latest {
                if Utc::now() - prediction.predicted_at < self.cache_max_age {
                    return Ok(prediction);
                }
            }
        }
        self.predict_risk(student_id, features).await
    }

    pub async fn get_risk_history(
        &self,
        student_id: i64,
        limit: usize,
    ) -> CoreResult<Vec<RiskPrediction>> {
        self.retry
            .run("prediction_history", move || {
                self.store.prediction_history(student_id, limit)
            })
            .await
    }

    /// Each student's latest prediction scoring at least `min_risk`, highest
    /// first.
    pub async fn roster(&self, min_risk: f64, limit: usize) -> CoreResult<Vec<RiskPrediction>> {
        if !(0.0..=1.0).contains(&min_risk) {
            return Err(CoreError::validation(format!(
                "min_risk must lie in [0, 1], got {min_risk}"
            )));
        }
        let latest = self
            .retry
            .run("latest_predictions", move || self.store.latest_predictions(limit))
            .await?;
        Ok(latest
            .into_iter()
            .filter(|prediction| prediction.risk_score >= min_risk)
            .collect())
    }

    pub fn feature_importance(&self) -> CoreResult<Vec<FeatureContribution>> {
        self.scorer.feature_importance()
    }

    /// Starts a fit on the blocking pool. The returned job can be cancelled;
    /// a cancelled fit leaves the current model in place.
    pub fn spawn_training(&self, dataset: Dataset) -> TrainingJob {
        let cancel = CancelFlag::new();
        let scorer = Arc::clone(&self.scorer);
        let flag = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = scorer.train(&dataset, &flag);
            if let Err(err) = &result {
                warn!(error = %err, "risk model training did not complete");
            }
            result
        });
        TrainingJob { cancel, handle }
    }

    pub async fn train_synthetic(&self, samples: usize, seed: u64) -> CoreResult<TrainingReport> {
        let dataset = Dataset::synthetic(samples, seed)?;
        self.train_and_save(dataset).await
    }

    pub async fn train_historical(&self, dataset: Dataset) -> CoreResult<TrainingReport> {
        self.train_and_save(dataset).await
    }

    async fn train_and_save(&self, dataset: Dataset) -> CoreResult<TrainingReport> {
        let (forest, report) = self.spawn_training(dataset).wait().await?;
        let model: &ForestModel = &forest;
        self.retry
            .run("save_model", move || self.store.save_model(model))
            .await?;
        info!(provenance = %report.provenance, "risk model saved");
        Ok(report)
    }

    /// Installs the most recently saved forest, if there is one.
    pub async fn restore_model(&self) -> CoreResult<Option<ModelProvenance>> {
        let stored = self
            .retry
            .run("load_model", move || self.store.load_model())
            .await?;
        let Some(model) = stored else {
            return Ok(None);
        };
        model.validate()?;
        let provenance = model.provenance();
        self.scorer.handle().install(Arc::new(model));
        info!(provenance = %provenance, "risk model restored");
        Ok(Some(provenance))
    }
}
