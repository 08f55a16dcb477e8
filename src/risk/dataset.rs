use std::io::Read;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::models::{EngagementFeatures, ModelProvenance, FEATURE_COUNT};

use super::heuristic::HeuristicModel;

// Synthetic rows are labeled at-risk when the heuristic scores them at or above this.
pub const SYNTHETIC_LABEL_CUTOFF: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct Dataset {
    pub rows: Vec<[f64; FEATURE_COUNT]>,
    pub labels: Vec<bool>,
    pub provenance: ModelProvenance,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|label| **label).count()
    }

    pub fn synthetic(samples: usize, seed: u64) -> CoreResult<Self> {
        if samples == 0 {
            return Err(CoreError::validation("synthetic sample count must be positive"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let labeler = HeuristicModel::default();
        let mut rows = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);

        for _ in 0..samples {
            let row = [
                poisson(&mut rng, 12.0) / 30.0,
                poisson(&mut rng, 6.0),
                exponential(&mut rng, 5.0).floor(),
                poisson(&mut rng, 5.0),
                normal(&mut rng, 4000.0, 2000.0).max(0.0),
                rng.gen::<f64>(),
                normal(&mut rng, 0.65, 0.2).clamp(0.0, 1.0),
                poisson(&mut rng, 8.0).min(30.0),
            ];
            let score = labeler.score(&EngagementFeatures::from_array(row));
            rows.push(row);
            labels.push(score >= SYNTHETIC_LABEL_CUTOFF);
        }

        Ok(Self {
            rows,
            labels,
            provenance: ModelProvenance::Synthetic { seed, samples },
        })
    }

    /// Reads labeled history: one column per signal name plus `label`
    /// (`0`/`1`). Every row is validated like a live feature vector.
    pub fn from_csv<R: Read>(reader: R) -> CoreResult<Self> {
        #[derive(Deserialize)]
        struct CsvRow {
            session_frequency: f64,
            avg_messages_per_session: f64,
            days_since_last_active: f64,
            avg_session_length: f64,
            avg_latency_ms: f64,
            avg_mastery: f64,
            correct_rate: f64,
            active_days: f64,
            label: u8,
        }

        impl CsvRow {
            fn features(&self) -> EngagementFeatures {
                EngagementFeatures {
                    session_frequency: self.session_frequency,
                    avg_messages_per_session: self.avg_messages_per_session,
                    days_since_last_active: self.days_since_last_active,
                    avg_session_length: self.avg_session_length,
                    avg_latency_ms: self.avg_latency_ms,
                    avg_mastery: self.avg_mastery,
                    correct_rate: self.correct_rate,
                    active_days: self.active_days,
                }
            }
        }

        let mut reader = csv::Reader::from_reader(reader);
        let mut rows = Vec::new();
        let mut labels = Vec::new();

        for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
            let line = index + 2;
            let row = result
                .map_err(|err| CoreError::validation(format!("line {line}: {err}")))?;
            let features = row.features();
            features
                .validate()
                .map_err(|err| CoreError::validation(format!("line {line}: {err}")))?;
            let label = match row.label {
                0 => false,
                1 => true,
                other => {
                    return Err(CoreError::validation(format!(
                        "line {line}: label must be 0 or 1, got {other}"
                    )))
                }
            };
            rows.push(features.to_array());
            labels.push(label);
        }

        if rows.is_empty() {
            return Err(CoreError::validation("labeled history is empty"));
        }
        let samples = rows.len();
        Ok(Self {
            rows,
            labels,
            provenance: ModelProvenance::Historical { samples },
        })
    }

    pub fn from_csv_path(path: &Path) -> CoreResult<Self> {
        let file = std::fs::File::open(path).map_err(|err| {
            CoreError::validation(format!("cannot open {}: {err}", path.display()))
        })?;
        Self::from_csv(file)
    }

    /// Shuffles deterministically and holds out `test_fraction` of the rows.
    pub fn split(&self, test_fraction: f64, seed: u64) -> (Dataset, Dataset) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let n_test = ((self.len() as f64) * test_fraction).round() as usize;
        let n_test = n_test.min(self.len().saturating_sub(1));
        let (test, train) = order.split_at(n_test);
        (self.subset(train), self.subset(test))
    }

    fn subset(&self, indices: &[usize]) -> Dataset {
        Dataset {
            rows: indices.iter().map(|&i| self.rows[i]).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            provenance: self.provenance.clone(),
        }
    }
}

fn poisson<R: Rng>(rng: &mut R, lambda: f64) -> f64 {
    // Knuth: count uniforms until their product drops below e^-lambda.
    let limit = (-lambda).exp();
    let mut product = rng.gen::<f64>();
    let mut count = 0u32;
    while product > limit {
        count += 1;
        product *= rng.gen::<f64>();
    }
    count as f64
}

fn exponential<R: Rng>(rng: &mut R, mean: f64) -> f64 {
    let u: f64 = rng.gen();
    -mean * (1.0 - u).ln()
}

/// Box-Muller transform.
fn normal<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + std_dev * z
}
