use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const FEATURE_COUNT: usize = 8;

/// Signal names in vector order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "session_frequency",
    "avg_messages_per_session",
    "days_since_last_active",
    "avg_session_length",
    "avg_latency_ms",
    "avg_mastery",
    "correct_rate",
    "active_days",
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Domain {
    NonNegative,
    UnitInterval,
}

const FEATURE_DOMAINS: [Domain; FEATURE_COUNT] = [
    Domain::NonNegative,
    Domain::NonNegative,
    Domain::NonNegative,
    Domain::NonNegative,
    Domain::NonNegative,
    Domain::UnitInterval,
    Domain::UnitInterval,
    Domain::NonNegative,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMastery {
    pub student_id: i64,
    pub skill_id: String,
    pub mastery: f64,
    pub num_correct: i64,
    pub num_incorrect: i64,
    pub updated_at: DateTime<Utc>,
    /// Number of successful writes; 0 means never persisted.
    pub version: i64,
}

impl SkillMastery {
    pub fn fresh(student_id: i64, skill_id: &str, p_init: f64, now: DateTime<Utc>) -> Self {
        Self {
            student_id,
            skill_id: skill_id.to_string(),
            mastery: p_init,
            num_correct: 0,
            num_incorrect: 0,
            updated_at: now,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasteryUpdate {
    pub mastery: f64,
    pub num_correct: i64,
    pub num_incorrect: i64,
    pub is_mastered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasteryView {
    pub mastery: f64,
    pub num_correct: i64,
    pub num_incorrect: i64,
}

impl From<&SkillMastery> for MasteryView {
    fn from(record: &SkillMastery) -> Self {
        Self {
            mastery: record.mastery,
            num_correct: record.num_correct,
            num_incorrect: record.num_incorrect,
        }
    }
}

/// The eight engagement signals a risk model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EngagementFeatures {
    pub session_frequency: f64,
    pub avg_messages_per_session: f64,
    pub days_since_last_active: f64,
    pub avg_session_length: f64,
    pub avg_latency_ms: f64,
    pub avg_mastery: f64,
    pub correct_rate: f64,
    pub active_days: f64,
}

impl EngagementFeatures {
    /// Builds a vector from positional values and validates it.
    pub fn from_slice(values: &[f64]) -> CoreResult<Self> {
        if values.len() != FEATURE_COUNT {
            return Err(CoreError::validation(format!(
                "expected {FEATURE_COUNT} feature values, got {}",
                values.len()
            )));
        }
        let mut array = [0.0; FEATURE_COUNT];
        array.copy_from_slice(values);
        let features = Self::from_array(array);
        features.validate()?;
        Ok(features)
    }

    /// Builds a vector from named values. Every signal must be present and
    /// no unknown names are accepted.
    pub fn from_map(values: &HashMap<String, f64>) -> CoreResult<Self> {
        if let Some(unknown) = values
            .keys()
            .find(|name| !FEATURE_NAMES.contains(&name.as_str()))
        {
            return Err(CoreError::validation(format!("unknown feature `{unknown}`")));
        }

        let mut array = [0.0; FEATURE_COUNT];
        for (slot, name) in array.iter_mut().zip(FEATURE_NAMES) {
            *slot = *values
                .get(name)
                .ok_or_else(|| CoreError::validation(format!("missing feature `{name}`")))?;
        }
        let features = Self::from_array(array);
        features.validate()?;
        Ok(features)
    }

    pub fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        Self {
            session_frequency: values[0],
            avg_messages_per_session: values[1],
            days_since_last_active: values[2],
            avg_session_length: values[3],
            avg_latency_ms: values[4],
            avg_mastery: values[5],
            correct_rate: values[6],
            active_days: values[7],
        }
    }

    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.session_frequency,
            self.avg_messages_per_session,
            self.days_since_last_active,
            self.avg_session_length,
            self.avg_latency_ms,
            self.avg_mastery,
            self.correct_rate,
            self.active_days,
        ]
    }

    pub fn validate(&self) -> CoreResult<()> {
        for ((value, name), domain) in self
            .to_array()
            .into_iter()
            .zip(FEATURE_NAMES)
            .zip(FEATURE_DOMAINS)
        {
            if !value.is_finite() {
                return Err(CoreError::validation(format!(
                    "feature `{name}` must be finite, got {value}"
                )));
            }
            let in_domain = match domain {
                Domain::NonNegative => value >= 0.0,
                Domain::UnitInterval => (0.0..=1.0).contains(&value),
            };
            if !in_domain {
                let expected = match domain {
                    Domain::NonNegative => ">= 0",
                    Domain::UnitInterval => "within [0, 1]",
                };
                return Err(CoreError::validation(format!(
                    "feature `{name}` must be {expected}, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(CoreError::validation(format!("unknown risk level `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
}

/// Where a risk model's parameters came from. Synthetic models carry no
/// accuracy guarantee about real students. `samples` counts the whole source
/// dataset, held-out rows included; `TrainingReport` has the split sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelProvenance {
    Heuristic,
    Synthetic { seed: u64, samples: usize },
    Historical { samples: usize },
    Injected { name: String },
}

impl fmt::Display for ModelProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelProvenance::Heuristic => write!(f, "heuristic"),
            ModelProvenance::Synthetic { seed, samples } => {
                write!(f, "forest (synthetic bootstrap, seed {seed}, {samples} samples)")
            }
            ModelProvenance::Historical { samples } => {
                write!(f, "forest (historical labels, {samples} samples)")
            }
            ModelProvenance::Injected { name } => write!(f, "injected ({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    pub id: Uuid,
    pub student_id: i64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub features: EngagementFeatures,
    pub contributions: Vec<FeatureContribution>,
    pub model: ModelProvenance,
    pub predicted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> [f64; FEATURE_COUNT] {
        [0.8, 6.0, 1.0, 5.0, 2500.0, 0.7, 0.8, 12.0]
    }

    #[test]
    fn accepts_eight_in_domain_values() {
        let features = EngagementFeatures::from_slice(&healthy()).unwrap();
        assert_eq!(features.to_array(), healthy());
        assert_eq!(features.active_days, 12.0);
    }

    #[test]
    fn rejects_wrong_cardinality() {
        let err = EngagementFeatures::from_slice(&healthy()[..7]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(err.to_string().contains("got 7"));
    }

    #[test]
    fn rejects_negative_count() {
        let mut values = healthy();
        values[7] = -1.0;
        let err = EngagementFeatures::from_slice(&values).unwrap_err();
        assert!(err.to_string().contains("active_days"));
    }

    #[test]
    fn rejects_rate_above_one_and_nan() {
        let mut values = healthy();
        values[6] = 1.2;
        assert!(EngagementFeatures::from_slice(&values).is_err());

        let mut values = healthy();
        values[0] = f64::NAN;
        assert!(EngagementFeatures::from_slice(&values).is_err());
    }

    #[test]
    fn map_construction_requires_every_name() {
        let mut map: HashMap<String, f64> = FEATURE_NAMES
            .iter()
            .zip(healthy())
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        assert!(EngagementFeatures::from_map(&map).is_ok());

        map.remove("avg_latency_ms");
        let err = EngagementFeatures::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("avg_latency_ms"));

        map.insert("avg_latency_ms".to_string(), 10.0);
        map.insert("logins_7d".to_string(), 3.0);
        let err = EngagementFeatures::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("logins_7d"));
    }

    #[test]
    fn risk_level_parses_its_own_labels() {
        for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            assert_eq!(level.as_str().parse::<RiskLevel>().unwrap(), level);
        }
        assert!("critical".parse::<RiskLevel>().is_err());
    }
}
