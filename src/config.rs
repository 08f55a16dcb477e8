use std::str::FromStr;

use chrono::Duration;

use crate::error::{CoreError, CoreResult};
use crate::mastery::BktParams;
use crate::risk::forest::ForestConfig;
use crate::risk::{BootstrapPolicy, RiskBands, RiskScorer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskStrategy {
    Heuristic,
    Forest,
}

impl FromStr for RiskStrategy {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "heuristic" => Ok(RiskStrategy::Heuristic),
            "forest" => Ok(RiskStrategy::Forest),
            other => Err(CoreError::validation(format!(
                "RISK_STRATEGY must be `heuristic` or `forest`, got `{other}`"
            ))),
        }
    }
}

impl FromStr for BootstrapPolicy {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "lazy" => Ok(BootstrapPolicy::Lazy),
            "disabled" | "off" => Ok(BootstrapPolicy::Disabled),
            other => Err(CoreError::validation(format!(
                "RISK_BOOTSTRAP must be `lazy` or `disabled`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub bands: RiskBands,
    pub strategy: RiskStrategy,
    pub bootstrap: BootstrapPolicy,
    pub forest: ForestConfig,
    pub cache_max_age: Duration,
}

impl RiskSettings {
    pub fn build_scorer(&self) -> RiskScorer {
        match self.strategy {
            RiskStrategy::Heuristic => RiskScorer::heuristic(self.bands),
            RiskStrategy::Forest => RiskScorer::forest(self.bands, self.forest, self.bootstrap),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub log_level: String,
    pub bkt: BktParams,
    pub risk: RiskSettings,
}

impl AppConfig {
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys take their
    /// defaults, malformed ones are rejected.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BktParams::default();
        let bkt = BktParams {
            p_init: parse_or(&lookup, "BKT_P_INIT", defaults.p_init)?,
            p_transition: parse_or(&lookup, "BKT_P_TRANSITION", defaults.p_transition)?,
            p_guess: parse_or(&lookup, "BKT_P_GUESS", defaults.p_guess)?,
            p_slip: parse_or(&lookup, "BKT_P_SLIP", defaults.p_slip)?,
            mastery_threshold: parse_or(
                &lookup,
                "BKT_MASTERY_THRESHOLD",
                defaults.mastery_threshold,
            )?,
        };
        bkt.validate()?;

        let band_defaults = RiskBands::default();
        let bands = RiskBands::new(
            parse_or(&lookup, "RISK_LOW_MAX", band_defaults.low_max)?,
            parse_or(&lookup, "RISK_MEDIUM_MAX", band_defaults.medium_max)?,
        )?;

        let forest_defaults = ForestConfig::default();
        let forest = ForestConfig {
            n_trees: parse_or(&lookup, "RISK_FOREST_TREES", forest_defaults.n_trees)?,
            seed: parse_or(&lookup, "RISK_FOREST_SEED", forest_defaults.seed)?,
            bootstrap_samples: parse_or(
                &lookup,
                "RISK_BOOTSTRAP_SAMPLES",
                forest_defaults.bootstrap_samples,
            )?,
            ..forest_defaults
        };
        forest.validate()?;

        let cache_hours: i64 = parse_or(&lookup, "RISK_CACHE_HOURS", 24)?;
        if cache_hours < 0 {
            return Err(CoreError::validation(format!(
                "RISK_CACHE_HOURS must not be negative, got {cache_hours}"
            )));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            bkt,
            risk: RiskSettings {
                bands,
                strategy: parse_or(&lookup, "RISK_STRATEGY", RiskStrategy::Heuristic)?,
                bootstrap: parse_or(&lookup, "RISK_BOOTSTRAP", BootstrapPolicy::Lazy)?,
                forest,
                cache_max_age: Duration::hours(cache_hours),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> CoreResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| CoreError::validation(format!("{key}={raw:?} is invalid: {err}"))),
    }
}
