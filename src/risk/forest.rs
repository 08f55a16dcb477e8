use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::models::{
    EngagementFeatures, FeatureContribution, ModelProvenance, FEATURE_COUNT, FEATURE_NAMES,
};

use super::dataset::Dataset;
use super::{CancelFlag, ModelOutput, RiskModel, TrainingReport};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Features considered at each split.
    pub max_features: usize,
    pub seed: u64,
    pub bootstrap_samples: usize,
    pub test_fraction: f64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            max_features: 3,
            seed: 42,
            bootstrap_samples: 500,
            test_fraction: 0.2,
        }
    }
}

impl ForestConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.n_trees == 0 {
            return Err(CoreError::validation("forest needs at least one tree"));
        }
        if self.max_features == 0 || self.max_features > FEATURE_COUNT {
            return Err(CoreError::validation(format!(
                "max_features must be within 1..={FEATURE_COUNT}, got {}",
                self.max_features
            )));
        }
        if self.min_samples_split < 2 {
            return Err(CoreError::validation("min_samples_split must be at least 2"));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(CoreError::validation(format!(
                "test_fraction must lie in [0, 1), got {}",
                self.test_fraction
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        value: f64,
    },
}

impl Node {
    fn value(&self) -> f64 {
        match self {
            Node::Leaf { value } | Node::Split { value, .. } => *value,
        }
    }
}

/// One CART tree. Node values are the positive-class fraction of the
/// training rows that reached the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
    importance: [f64; FEATURE_COUNT],
}

struct TreeBuilder<'a> {
    rows: &'a [[f64; FEATURE_COUNT]],
    labels: &'a [bool],
    config: &'a ForestConfig,
    nodes: Vec<Node>,
    importance: [f64; FEATURE_COUNT],
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

fn gini(positives: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = positives as f64 / total as f64;
    2.0 * p * (1.0 - p)
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, indices: &mut [usize], rng: &mut ChaCha8Rng) -> Tree {
        self.grow(indices, 0, rng);
        Tree {
            nodes: self.nodes,
            importance: self.importance,
        }
    }

    fn grow(&mut self, indices: &mut [usize], depth: usize, rng: &mut ChaCha8Rng) -> usize {
        let total = indices.len();
        let positives = indices.iter().filter(|&&i| self.labels[i]).count();
        let value = if total == 0 {
            0.0
        } else {
            positives as f64 / total as f64
        };

        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        let pure = positives == 0 || positives == total;
        if pure || depth >= self.config.max_depth || total < self.config.min_samples_split {
            return id;
        }

        let Some(best) = self.best_split(indices, positives, rng) else {
            return id;
        };
        self.importance[best.feature] += best.decrease;

        let (left_part, right_part) = partition(indices, |i| {
            self.rows[i][best.feature] <= best.threshold
        });
        let left = self.grow(left_part, depth + 1, rng);
        let right = self.grow(right_part, depth + 1, rng);
        self.nodes[id] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
            value,
        };
        id
    }

    fn best_split(
        &self,
        indices: &mut [usize],
        positives: usize,
        rng: &mut ChaCha8Rng,
    ) -> Option<BestSplit> {
        let total = indices.len();
        let parent = total as f64 * gini(positives, total);
        let mut best: Option<BestSplit> = None;

        let mut candidates = sample(rng, FEATURE_COUNT, self.config.max_features).into_vec();
        candidates.sort_unstable();

        for feature in candidates {
            indices.sort_by(|&a, &b| self.rows[a][feature].total_cmp(&self.rows[b][feature]));

            let mut left_positives = 0;
            for cut in 1..total {
                if self.labels[indices[cut - 1]] {
                    left_positives += 1;
                }
                let lo = self.rows[indices[cut - 1]][feature];
                let hi = self.rows[indices[cut]][feature];
                if lo == hi {
                    continue;
                }
                let right_positives = positives - left_positives;
                let child = cut as f64 * gini(left_positives, cut)
                    + (total - cut) as f64 * gini(right_positives, total - cut);
                let decrease = parent - child;
                if decrease > 1e-12 && best.as_ref().map_or(true, |b| decrease > b.decrease) {
                    best = Some(BestSplit {
                        feature,
                        threshold: lo + (hi - lo) / 2.0,
                        decrease,
                    });
                }
            }
        }
        best
    }
}

/// Stable in-place partition; returns (matching, rest).
fn partition<F: Fn(usize) -> bool>(indices: &mut [usize], goes_left: F) -> (&mut [usize], &mut [usize]) {
    let (mut left, mut right): (Vec<usize>, Vec<usize>) =
        indices.iter().partition(|&&i| goes_left(i));
    let split = left.len();
    left.append(&mut right);
    indices.copy_from_slice(&left);
    indices.split_at_mut(split)
}

impl Tree {
    fn root_value(&self) -> f64 {
        self.nodes[0].value()
    }

    /// Leaf value plus, per feature, the change in node value credited to
    /// the splits taken on the way down.
    fn explain(&self, x: &[f64; FEATURE_COUNT], credit: &mut [f64; FEATURE_COUNT]) -> f64 {
        let mut node = &self.nodes[0];
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    value,
                } => {
                    let next = if x[*feature] <= *threshold {
                        &self.nodes[*left]
                    } else {
                        &self.nodes[*right]
                    };
                    credit[*feature] += next.value() - value;
                    node = next;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    trees: Vec<Tree>,
    importance: [f64; FEATURE_COUNT],
    provenance: ModelProvenance,
}

impl ForestModel {
    pub fn fit(dataset: &Dataset, config: &ForestConfig, cancel: &CancelFlag) -> CoreResult<Self> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(CoreError::validation("cannot fit a forest on an empty dataset"));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let n = dataset.len();
        let mut trees = Vec::with_capacity(config.n_trees);

        for tree_index in 0..config.n_trees {
            if cancel.is_cancelled() {
                debug!(tree_index, "forest fit cancelled");
                return Err(CoreError::Cancelled);
            }
            let mut indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let builder = TreeBuilder {
                rows: &dataset.rows,
                labels: &dataset.labels,
                config,
                nodes: Vec::new(),
                importance: [0.0; FEATURE_COUNT],
            };
            trees.push(builder.build(&mut indices, &mut rng));
        }

        let mut importance = [0.0; FEATURE_COUNT];
        for tree in &trees {
            let total: f64 = tree.importance.iter().sum();
            if total > 0.0 {
                for (acc, value) in importance.iter_mut().zip(tree.importance) {
                    *acc += value / total;
                }
            }
        }
        let total: f64 = importance.iter().sum();
        if total > 0.0 {
            importance.iter_mut().for_each(|value| *value /= total);
        }

        Ok(Self {
            trees,
            importance,
            provenance: dataset.provenance.clone(),
        })
    }

    /// Fits on a seeded train split and reports accuracy on the held-out rows.
    pub fn fit_with_holdout(
        dataset: &Dataset,
        config: &ForestConfig,
        cancel: &CancelFlag,
    ) -> CoreResult<(Self, TrainingReport)> {
        config.validate()?;
        if dataset.len() < 2 {
            return Err(CoreError::validation(format!(
                "need at least 2 labeled rows to train, got {}",
                dataset.len()
            )));
        }
        let (train, test) = dataset.split(config.test_fraction, config.seed);
        let model = Self::fit(&train, config, cancel)?;
        let accuracy = model.accuracy(&test);
        let report = TrainingReport {
            accuracy,
            n_train: train.len(),
            n_test: test.len(),
            provenance: dataset.provenance.clone(),
        };
        Ok((model, report))
    }

    pub fn probability(&self, x: &[f64; FEATURE_COUNT]) -> f64 {
        let mut scratch = [0.0; FEATURE_COUNT];
        let total: f64 = self.trees.iter().map(|tree| tree.explain(x, &mut scratch)).sum();
        total / self.trees.len() as f64
    }

    pub fn accuracy(&self, dataset: &Dataset) -> f64 {
        if dataset.is_empty() {
            return 0.0;
        }
        let hits = dataset
            .rows
            .iter()
            .zip(&dataset.labels)
            .filter(|(row, label)| (self.probability(row) >= 0.5) == **label)
            .count();
        hits as f64 / dataset.len() as f64
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Structural checks for a model read back from storage. Children always
    /// sit after their parent, so a walk from the root terminates.
    pub fn validate(&self) -> CoreResult<()> {
        if self.trees.is_empty() {
            return Err(CoreError::validation("stored forest has no trees"));
        }
        for (index, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(CoreError::validation(format!("stored tree {index} is empty")));
            }
            for (id, node) in tree.nodes.iter().enumerate() {
                if !(0.0..=1.0).contains(&node.value()) {
                    return Err(CoreError::validation(format!(
                        "tree {index} node {id} has value {} outside [0, 1]",
                        node.value()
                    )));
                }
                if let Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } = node
                {
                    let linked = *left > id
                        && *right > id
                        && *left < tree.nodes.len()
                        && *right < tree.nodes.len();
                    if *feature >= FEATURE_COUNT || !threshold.is_finite() || !linked {
                        return Err(CoreError::validation(format!(
                            "tree {index} node {id} is malformed"
                        )));
                    }
                }
            }
        }
        if self.importance.iter().any(|value| !value.is_finite()) {
            return Err(CoreError::validation("stored feature importance is not finite"));
        }
        Ok(())
    }
}

impl RiskModel for ForestModel {
    fn evaluate(&self, features: &EngagementFeatures) -> ModelOutput {
        let x = features.to_array();
        let mut credit = [0.0; FEATURE_COUNT];
        let mut score = 0.0;
        let mut baseline = 0.0;
        for tree in &self.trees {
            score += tree.explain(&x, &mut credit);
            baseline += tree.root_value();
        }
        let n = self.trees.len() as f64;
        ModelOutput {
            score: score / n,
            baseline: baseline / n,
            contributions: FEATURE_NAMES
                .iter()
                .zip(credit)
                .map(|(name, value)| FeatureContribution {
                    feature: name.to_string(),
                    value: value / n,
                })
                .collect(),
        }
    }

    fn provenance(&self) -> ModelProvenance {
        self.provenance.clone()
    }

    fn feature_importance(&self) -> Option<Vec<FeatureContribution>> {
        Some(
            FEATURE_NAMES
                .iter()
                .zip(self.importance)
                .map(|(name, value)| FeatureContribution {
                    feature: name.to_string(),
                    value,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests::engaged;

    fn small() -> ForestConfig {
        ForestConfig {
            n_trees: 20,
            ..ForestConfig::default()
        }
    }

    fn fitted() -> ForestModel {
        let dataset = Dataset::synthetic(400, 42).unwrap();
        ForestModel::fit(&dataset, &small(), &CancelFlag::new()).unwrap()
    }

    fn idle() -> EngagementFeatures {
        EngagementFeatures::from_array([0.0, 0.0, 25.0, 0.0, 12_000.0, 0.05, 0.1, 0.0])
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let model = fitted();
        for features in [engaged(), idle()] {
            let output = model.evaluate(&features);
            assert!((0.0..=1.0).contains(&output.score));
        }
    }

    #[test]
    fn separates_idle_from_engaged() {
        let model = fitted();
        let idle = model.evaluate(&idle()).score;
        let engaged = model.evaluate(&engaged()).score;
        assert!(idle > engaged, "idle {idle} vs engaged {engaged}");
    }

    #[test]
    fn contributions_sum_to_score_minus_baseline() {
        let model = fitted();
        let output = model.evaluate(&idle());
        let total: f64 = output.contributions.iter().map(|c| c.value).sum();
        assert!((output.baseline + total - output.score).abs() < 1e-9);
    }

    #[test]
    fn same_seed_same_forest() {
        let a = fitted();
        let b = fitted();
        assert_eq!(a.evaluate(&idle()), b.evaluate(&idle()));
        assert_eq!(a.evaluate(&engaged()), b.evaluate(&engaged()));
    }

    #[test]
    fn importance_is_normalized() {
        let importance = fitted().feature_importance().unwrap();
        assert_eq!(importance.len(), FEATURE_COUNT);
        let total: f64 = importance.iter().map(|c| c.value).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(importance.iter().all(|c| c.value >= 0.0));
    }

    #[test]
    fn holdout_report_counts_rows() {
        let dataset = Dataset::synthetic(500, 42).unwrap();
        let (model, report) =
            ForestModel::fit_with_holdout(&dataset, &small(), &CancelFlag::new()).unwrap();
        assert_eq!(report.n_train, 400);
        assert_eq!(report.n_test, 100);
        assert!(report.accuracy > 0.5, "accuracy {}", report.accuracy);
        assert_eq!(model.tree_count(), 20);
    }

    #[test]
    fn single_class_data_yields_constant_model() {
        let dataset = Dataset {
            rows: vec![[1.0; FEATURE_COUNT]; 10],
            labels: vec![false; 10],
            provenance: ModelProvenance::Historical { samples: 10 },
        };
        let model = ForestModel::fit(&dataset, &small(), &CancelFlag::new()).unwrap();
        let output = model.evaluate(&engaged());
        assert_eq!(output.score, 0.0);
        assert!(model.feature_importance().unwrap().iter().all(|c| c.value == 0.0));
    }

    #[test]
    fn saved_forest_round_trips() {
        let model = fitted();
        let json = serde_json::to_string(&model).unwrap();
        let restored: ForestModel = serde_json::from_str(&json).unwrap();

        restored.validate().unwrap();
        assert_eq!(restored.provenance(), model.provenance());
        assert_eq!(restored.tree_count(), 20);
        for features in [idle(), engaged()] {
            let (a, b) = (restored.evaluate(&features), model.evaluate(&features));
            assert!((a.score - b.score).abs() < 1e-12);
            for (x, y) in a.contributions.iter().zip(&b.contributions) {
                assert_eq!(x.feature, y.feature);
                assert!((x.value - y.value).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn corrupted_forest_fails_validation() {
        let mut model = fitted();
        model.trees[0].nodes[0] = Node::Split {
            feature: 0,
            threshold: 0.5,
            left: 0,
            right: 10_000,
            value: 0.5,
        };
        assert!(matches!(model.validate(), Err(CoreError::Validation(_))));

        model.trees.clear();
        assert!(model.validate().is_err());
    }

    #[test]
    fn holdout_provenance_counts_the_source_rows() {
        let dataset = Dataset::synthetic(250, 9).unwrap();
        let (model, report) =
            ForestModel::fit_with_holdout(&dataset, &small(), &CancelFlag::new()).unwrap();
        assert_eq!(report.n_train, 200);
        assert_eq!(
            report.provenance,
            ModelProvenance::Synthetic {
                seed: 9,
                samples: 250
            }
        );
        assert_eq!(model.provenance(), report.provenance);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dataset = Dataset::synthetic(50, 1).unwrap();
        let config = ForestConfig {
            max_features: 9,
            ..ForestConfig::default()
        };
        assert!(matches!(
            ForestModel::fit(&dataset, &config, &CancelFlag::new()),
            Err(CoreError::Validation(_))
        ));
    }
}
