use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::models::{RiskPrediction, SkillMastery};
use crate::risk::forest::ForestModel;

/// Persistence boundary for mastery records and prediction history.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_mastery(&self, student_id: i64, skill_id: &str) -> CoreResult<Option<SkillMastery>>;

    /// Writes `record` only if the stored version still equals
    /// `expected_version` (0 when the record does not exist yet). Returns the
    /// record as stored, with its version bumped.
    async fn put_mastery(&self, record: &SkillMastery, expected_version: i64)
        -> CoreResult<SkillMastery>;

    async fn list_masteries(&self, student_id: i64) -> CoreResult<Vec<SkillMastery>>;

    async fn append_prediction(&self, prediction: &RiskPrediction) -> CoreResult<()>;

    /// Most recent first.
    async fn prediction_history(&self, student_id: i64, limit: usize)
        -> CoreResult<Vec<RiskPrediction>>;

    async fn latest_prediction(&self, student_id: i64) -> CoreResult<Option<RiskPrediction>> {
        Ok(self.prediction_history(student_id, 1).await?.into_iter().next())
    }

    /// Each student's latest prediction, highest risk first.
    async fn latest_predictions(&self, limit: usize) -> CoreResult<Vec<RiskPrediction>>;

    async fn save_model(&self, model: &ForestModel) -> CoreResult<()>;

    /// The most recently saved forest, if any.
    async fn load_model(&self) -> CoreResult<Option<ForestModel>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` must re-read whatever state it depends on.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(operation = label, attempt, error = %err, "retrying after storage error");
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    masteries: HashMap<(i64, String), SkillMastery>,
    predictions: HashMap<i64, Vec<RiskPrediction>>,
    models: Vec<serde_json::Value>,
}

/// In-process store. Writes can be made to fail on demand to exercise the
/// retry path.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes fail with a transient error and store nothing.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn model_count(&self) -> usize {
        self.inner.lock().models.len()
    }

    pub fn prediction_count(&self, student_id: i64) -> usize {
        self.inner
            .lock()
            .predictions
            .get(&student_id)
            .map_or(0, Vec::len)
    }

    fn take_failure(counter: &AtomicUsize, what: &str) -> CoreResult<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(CoreError::storage(format!("simulated {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_mastery(&self, student_id: i64, skill_id: &str) -> CoreResult<Option<SkillMastery>> {
        Self::take_failure(&self.failing_reads, "read")?;
        Ok(self
            .inner
            .lock()
            .masteries
            .get(&(student_id, skill_id.to_string()))
            .cloned())
    }

    async fn put_mastery(
        &self,
        record: &SkillMastery,
        expected_version: i64,
    ) -> CoreResult<SkillMastery> {
        Self::take_failure(&self.failing_writes, "write")?;
        let mut inner = self.inner.lock();
        let key = (record.student_id, record.skill_id.clone());
        let current = inner.masteries.get(&key).map_or(0, |stored| stored.version);
        if current != expected_version {
            return Err(CoreError::storage(format!(
                "concurrent update of ({}, {}): expected version {expected_version}, found {current}",
                record.student_id, record.skill_id
            )));
        }
        let mut stored = record.clone();
        stored.version = current + 1;
        inner.masteries.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list_masteries(&self, student_id: i64) -> CoreResult<Vec<SkillMastery>> {
        Self::take_failure(&self.failing_reads, "read")?;
        let mut records: Vec<SkillMastery> = self
            .inner
            .lock()
            .masteries
            .values()
            .filter(|record| record.student_id == student_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        Ok(records)
    }

    async fn append_prediction(&self, prediction: &RiskPrediction) -> CoreResult<()> {
        Self::take_failure(&self.failing_writes, "write")?;
        self.inner
            .lock()
            .predictions
            .entry(prediction.student_id)
            .or_default()
            .push(prediction.clone());
        Ok(())
    }

    async fn prediction_history(
        &self,
        student_id: i64,
        limit: usize,
    ) -> CoreResult<Vec<RiskPrediction>> {
        Self::take_failure(&self.failing_reads, "read")?;
        let mut history = self
            .inner
            .lock()
            .predictions
            .get(&student_id)
            .cloned()
            .unwrap_or_default();
        history.sort_by(|a, b| b.predicted_at.cmp(&a.predicted_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn latest_predictions(&self, limit: usize) -> CoreResult<Vec<RiskPrediction>> {
        Self::take_failure(&self.failing_reads, "read")?;
        let mut latest: Vec<RiskPrediction> = self
            .inner
            .lock()
            .predictions
            .values()
            .filter_map(|history| history.iter().max_by_key(|p| p.predicted_at).cloned())
            .collect();
        latest.sort_by(|a, b| {
            b.risk_score
                .total_cmp(&a.risk_score)
                .then(a.student_id.cmp(&b.student_id))
        });
        latest.truncate(limit);
        Ok(latest)
    }

    // Kept as JSON so a load goes through the same decoding as Postgres JSONB.
    async fn save_model(&self, model: &ForestModel) -> CoreResult<()> {
        Self::take_failure(&self.failing_writes, "write")?;
        let value = serde_json::to_value(model)?;
        self.inner.lock().models.push(value);
        Ok(())
    }

    async fn load_model(&self) -> CoreResult<Option<ForestModel>> {
        Self::take_failure(&self.failing_reads, "read")?;
        let latest = self.inner.lock().models.last().cloned();
        latest
            .map(|value| {
                serde_json::from_value(value).map_err(|err| {
                    CoreError::validation(format!("stored risk model is unreadable: {err}"))
                })
            })
            .transpose()
    }
}
