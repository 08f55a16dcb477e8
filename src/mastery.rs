use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::models::{MasteryUpdate, MasteryView, SkillMastery};
use crate::store::{RetryPolicy, Store};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktParams {
    pub p_init: f64,
    pub p_transition: f64,
    pub p_guess: f64,
    pub p_slip: f64,
    pub mastery_threshold: f64,
}

impl Default for BktParams {
    fn default() -> Self {
        Self {
            p_init: 0.5,
            p_transition: 0.3,
            p_guess: 0.2,
            p_slip: 0.1,
            mastery_threshold: 0.95,
        }
    }
}

impl BktParams {
    pub fn validate(&self) -> CoreResult<()> {
        for (name, value) in [
            ("p_init", self.p_init),
            ("p_transition", self.p_transition),
            ("p_guess", self.p_guess),
            ("p_slip", self.p_slip),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(CoreError::validation(format!(
                    "{name} must lie strictly inside (0, 1), got {value}"
                )));
            }
        }
        if !(self.mastery_threshold > 0.0 && self.mastery_threshold <= 1.0) {
            return Err(CoreError::validation(format!(
                "mastery_threshold must lie in (0, 1], got {}",
                self.mastery_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MasteryTracker {
    params: BktParams,
}

impl MasteryTracker {
    pub fn new(params: BktParams) -> CoreResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn update(&self, prior: f64, is_correct: bool) -> CoreResult<f64> {
        if !prior.is_finite() || !(0.0..=1.0).contains(&prior) {
            return Err(CoreError::validation(format!(
                "prior mastery must lie in [0, 1], got {prior}"
            )));
        }

        let BktParams {
            p_transition,
            p_guess,
            p_slip,
            ..
        } = self.params;

        let (known, unknown) = if is_correct {
            (prior * (1.0 - p_slip), (1.0 - prior) * p_guess)
        } else {
            (prior * p_slip, (1.0 - prior) * (1.0 - p_guess))
        };
        let denominator = known + unknown;
        let posterior = if denominator > 0.0 {
            known / denominator
        } else {
            prior
        };

        let next = posterior + (1.0 - posterior) * p_transition;
        Ok(next.clamp(0.0, 1.0))
    }

    pub fn is_mastered(&self, mastery: f64) -> bool {
        mastery >= self.params.mastery_threshold
    }

    /// Folds a sequence of outcomes starting from `prior`.
    pub fn replay(&self, prior: f64, outcomes: &[bool]) -> CoreResult<f64> {
        outcomes
            .iter()
            .try_fold(prior, |mastery, &correct| self.update(mastery, correct))
    }

    pub fn fresh_record(&self, student_id: i64, skill_id: &str, now: DateTime<Utc>) -> SkillMastery {
        SkillMastery::fresh(student_id, skill_id, self.params.p_init, now)
    }

    /// Applies one observation to a whole record. The version is left as read
    /// so the store can detect a concurrent writer.
    pub fn observe(
        &self,
        record: &SkillMastery,
        is_correct: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<SkillMastery> {
        let mut next = record.clone();
        next.mastery = self.update(record.mastery, is_correct)?;
        if is_correct {
            next.num_correct += 1;
        } else {
            next.num_incorrect += 1;
        }
        next.updated_at = now;
        Ok(next)
    }
}

pub struct MasteryService<S: Store> {
    tracker: MasteryTracker,
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S: Store> MasteryService<S> {
    pub fn new(tracker: MasteryTracker, store: Arc<S>) -> Self {
        Self {
            tracker,
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tracker(&self) -> &MasteryTracker {
        &self.tracker
    }

    pub async fn update_mastery(
        &self,
        student_id: i64,
        skill_id: &str,
        is_correct: bool,
    ) -> CoreResult<MasteryUpdate> {
        if skill_id.trim().is_empty() {
            return Err(CoreError::validation("skill id must not be empty"));
        }

        let stored = self
            .retry
            .run("update_mastery", move || self.apply_once(student_id, skill_id, is_correct))
            .await?;

        info!(
            student_id,
            skill_id,
            is_correct,
            mastery = stored.mastery,
            version = stored.version,
            "mastery updated"
        );

        Ok(MasteryUpdate {
            mastery: stored.mastery,
            num_correct: stored.num_correct,
            num_incorrect: stored.num_incorrect,
            is_mastered: self.tracker.is_mastered(stored.mastery),
        })
    }

    // One read-compute-write cycle. Always starts from the stored counters, so
    // replaying it after a failed write cannot double count.
    async fn apply_once(
        &self,
        student_id: i64,
        skill_id: &str,
        is_correct: bool,
    ) -> CoreResult<SkillMastery> {
        let now = Utc::now();
        let current = match self.store.get_mastery(student_id, skill_id).await? {
            Some(record) => record,
            None => self.tracker.fresh_record(student_id, skill_id, now),
        };
        let next = self.tracker.observe(&current, is_correct, now)?;
        debug!(
            student_id,
            skill_id,
            prior = current.mastery,
            posterior = next.mastery,
            "bkt step"
        );
        self.store.put_mastery(&next, current.version).await
    }

    /// Reads a record, creating the default one when the student has never
    /// been observed on the skill.
    pub async fn get_mastery(&self, student_id: i64, skill_id: &str) -> CoreResult<MasteryView> {
        let record = self
            .retry
            .run("get_mastery", move || async move {
                if let Some(record) = self.store.get_mastery(student_id, skill_id).await? {
                    return Ok(record);
                }
                let fresh = self.tracker.fresh_record(student_id, skill_id, Utc::now());
                match self.store.put_mastery(&fresh, 0).await {
                    Ok(stored) => Ok(stored),
                    // Another caller created it first; theirs wins.
                    Err(err) if err.is_retryable() => {
                        match self.store.get_mastery(student_id, skill_id).await? {
                            Some(record) => Ok(record),
                            None => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(MasteryView::from(&record))
    }

    pub async fn student_skills(&self, student_id: i64) -> CoreResult<Vec<SkillMastery>> {
        self.retry
            .run("student_skills", move || self.store.list_masteries(student_id))
            .await
    }
}
