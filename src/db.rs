use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::mastery::MasteryService;
use crate::models::{
    EngagementFeatures, FeatureContribution, ModelProvenance, RiskPrediction, SkillMastery,
};
use crate::risk::forest::ForestModel;
use crate::risk::RiskModel;
use crate::risk::service::RiskService;
use crate::store::Store;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn mastery_from_row(row: &PgRow) -> CoreResult<SkillMastery> {
    Ok(SkillMastery {
        student_id: row.try_get("student_id")?,
        skill_id: row.try_get("skill_id")?,
        mastery: row.try_get("mastery")?,
        num_correct: row.try_get("num_correct")?,
        num_incorrect: row.try_get("num_incorrect")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

fn prediction_from_row(row: &PgRow) -> CoreResult<RiskPrediction> {
    let level: String = row.try_get("risk_level")?;
    let Json(features): Json<EngagementFeatures> = row.try_get("features")?;
    let Json(contributions): Json<Vec<FeatureContribution>> = row.try_get("contributions")?;
    let Json(model): Json<ModelProvenance> = row.try_get("model")?;
    Ok(RiskPrediction {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        risk_score: row.try_get("risk_score")?,
        risk_level: level
            .parse()
            .map_err(|_| CoreError::storage(format!("stored risk level `{level}` is unknown")))?,
        features,
        contributions,
        model,
        predicted_at: row.try_get("predicted_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn get_mastery(&self, student_id: i64, skill_id: &str) -> CoreResult<Option<SkillMastery>> {
        let row = sqlx::query(
            r#"
            SELECT student_id, skill_id, mastery, num_correct, num_incorrect, updated_at, version
            FROM learning_signal.skill_mastery
            WHERE student_id = $1 AND skill_id = $2
            "#,
        )
        .bind(student_id)
        .bind(skill_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mastery_from_row).transpose()
    }

    async fn put_mastery(
        &self,
        record: &SkillMastery,
        expected_version: i64,
    ) -> CoreResult<SkillMastery> {
        let version: Option<i64> = if expected_version == 0 {
            sqlx::query_scalar(
                r#"
                INSERT INTO learning_signal.skill_mastery
                (student_id, skill_id, mastery, num_correct, num_incorrect, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, 1)
                ON CONFLICT (student_id, skill_id) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(record.student_id)
            .bind(&record.skill_id)
            .bind(record.mastery)
            .bind(record.num_correct)
            .bind(record.num_incorrect)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                UPDATE learning_signal.skill_mastery
                SET mastery = $3, num_correct = $4, num_incorrect = $5, updated_at = $6,
                    version = version + 1
                WHERE student_id = $1 AND skill_id = $2 AND version = $7
                RETURNING version
                "#,
            )
            .bind(record.student_id)
            .bind(&record.skill_id)
            .bind(record.mastery)
            .bind(record.num_correct)
            .bind(record.num_incorrect)
            .bind(record.updated_at)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?
        };

        let version = version.ok_or_else(|| {
            CoreError::storage(format!(
                "concurrent update of ({}, {}): version {expected_version} is stale",
                record.student_id, record.skill_id
            ))
        })?;

        let mut stored = record.clone();
        stored.version = version;
        Ok(stored)
    }

    async fn list_masteries(&self, student_id: i64) -> CoreResult<Vec<SkillMastery>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, skill_id, mastery, num_correct, num_incorrect, updated_at, version
            FROM learning_signal.skill_mastery
            WHERE student_id = $1
            ORDER BY skill_id
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mastery_from_row).collect()
    }

    async fn append_prediction(&self, prediction: &RiskPrediction) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_signal.risk_predictions
            (id, student_id, risk_score, risk_level, features, contributions, model, predicted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(prediction.id)
        .bind(prediction.student_id)
        .bind(prediction.risk_score)
        .bind(prediction.risk_level.as_str())
        .bind(Json(&prediction.features))
        .bind(Json(&prediction.contributions))
        .bind(Json(&prediction.model))
        .bind(prediction.predicted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prediction_history(
        &self,
        student_id: i64,
        limit: usize,
    ) -> CoreResult<Vec<RiskPrediction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, student_id, risk_score, risk_level, features, contributions, model, predicted_at
            FROM learning_signal.risk_predictions
            WHERE student_id = $1
            ORDER BY predicted_at DESC
            LIMIT $2
            "#,
        )
        .bind(student_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn latest_predictions(&self, limit: usize) -> CoreResult<Vec<RiskPrediction>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (student_id)
                    id, student_id, risk_score, risk_level, features, contributions, model,
                    predicted_at
                FROM learning_signal.risk_predictions
                ORDER BY student_id, predicted_at DESC
            ) latest
            ORDER BY risk_score DESC, student_id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(prediction_from_row).collect()
    }

    async fn save_model(&self, model: &ForestModel) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_signal.risk_models (provenance, model)
            VALUES ($1, $2)
            "#,
        )
        .bind(Json(model.provenance()))
        .bind(Json(model))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_model(&self) -> CoreResult<Option<ForestModel>> {
        let row = sqlx::query(
            r#"
            SELECT model
            FROM learning_signal.risk_models
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(value): Json<serde_json::Value> = row.try_get("model")?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| CoreError::validation(format!("stored risk model is unreadable: {err}")))
    }
}

/// Demo learners: a steady one, a struggling one and one who has gone quiet.
pub async fn seed<S: Store>(
    mastery: &MasteryService<S>,
    risk: &RiskService<S>,
) -> anyhow::Result<()> {
    let learners: Vec<(i64, Vec<(&str, Vec<bool>)>, [f64; 8])> = vec![
        (
            1001,
            vec![
                ("algebra", vec![true, true, true, false, true]),
                ("fractions", vec![true, true]),
            ],
            [0.9, 7.0, 1.0, 6.0, 2200.0, 0.8, 0.85, 14.0],
        ),
        (
            1002,
            vec![
                ("algebra", vec![false, true, false, false]),
                ("geometry", vec![false, false, true]),
            ],
            [0.4, 3.0, 4.0, 3.0, 6500.0, 0.35, 0.4, 6.0],
        ),
        (
            1003,
            vec![("reading", vec![true, false])],
            [0.05, 1.0, 18.0, 1.0, 11000.0, 0.2, 0.3, 1.0],
        ),
    ];

    for (student_id, skills, signals) in learners {
        if !mastery.student_skills(student_id).await?.is_empty() {
            info!(student_id, "seed data already present; skipping");
            continue;
        }
        for (skill_id, outcomes) in skills {
            for correct in outcomes {
                mastery.update_mastery(student_id, skill_id, correct).await?;
            }
        }
        let features = EngagementFeatures::from_slice(&signals)?;
        risk.predict_risk(student_id, features).await?;
    }

    Ok(())
}

/// Replays answered questions (`student_id,skill_id,correct`) in file order.
pub async fn import_csv<S: Store>(
    mastery: &MasteryService<S>,
    csv_path: &Path,
) -> anyhow::Result<usize> {
    #[derive(Deserialize)]
    struct CsvRow {
        student_id: i64,
        skill_id: String,
        correct: bool,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut applied = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed response on line {}", index + 2))?;
        mastery
            .update_mastery(row.student_id, &row.skill_id, row.correct)
            .await
            .with_context(|| format!("failed to apply response on line {}", index + 2))?;
        applied += 1;
    }

    Ok(applied)
}
