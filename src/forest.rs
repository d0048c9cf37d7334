//! Random forest of CART trees (Gini impurity) over dense `f64` features.
//!
//! Trees are grown on bootstrap samples with a random subset of features
//! considered at every split. Each tree gets its own `StdRng` seeded from the
//! base seed plus the tree index, so a forest is reproducible for a given seed.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::CutoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxFeatures {
    Sqrt,
    All,
    Fixed(usize),
}

impl MaxFeatures {
    fn resolve(self, n_features: usize) -> usize {
        let m = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().floor() as usize,
            MaxFeatures::All => n_features,
            MaxFeatures::Fixed(m) => m,
        };
        m.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub max_features: MaxFeatures,
    /// Weight classes inversely to their frequency.
    pub balanced: bool,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: None,
            min_samples_split: 2,
            max_features: MaxFeatures::Sqrt,
            balanced: true,
            bootstrap: true,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn distribution(&self, sample: &[f64]) -> &[f64] {
        match self {
            Node::Leaf { distribution } => distribution,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if sample[*feature] <= *threshold {
                    left.distribution(sample)
                } else {
                    right.distribution(sample)
                }
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<Node>,
    n_classes: usize,
    n_features: usize,
}

struct Grower<'a> {
    x: &'a [Vec<f64>],
    y: &'a [usize],
    weights: &'a [f64],
    n_classes: usize,
    params: &'a ForestParams,
    max_features: usize,
}

impl RandomForest {
    pub fn fit(
        x: &[Vec<f64>],
        y: &[usize],
        n_classes: usize,
        params: &ForestParams,
    ) -> Result<Self, CutoutError> {
        if x.is_empty() || x.len() != y.len() {
            return Err(CutoutError::TrainingData(format!(
                "{} samples with {} labels",
                x.len(),
                y.len()
            )));
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|row| row.len() != n_features) {
            return Err(CutoutError::TrainingData(
                "feature rows must be non-empty and equally long".to_string(),
            ));
        }
        if let Some(&label) = y.iter().find(|&&label| label >= n_classes) {
            return Err(CutoutError::TrainingData(format!(
                "label {label} out of range for {n_classes} classes"
            )));
        }
        if params.n_trees == 0 {
            return Err(CutoutError::TrainingData("forest needs at least one tree".to_string()));
        }

        let class_weights = class_weights(y, n_classes, params.balanced);
        let weights = y.iter().map(|&label| class_weights[label]).collect::<Vec<_>>();
        let grower = Grower {
            x,
            y,
            weights: &weights,
            n_classes,
            params,
            max_features: params.max_features.resolve(n_features),
        };

        let trees = (0..params.n_trees)
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(tree_idx as u64));
                let samples = if params.bootstrap {
                    (0..x.len()).map(|_| rng.random_range(0..x.len())).collect()
                } else {
                    (0..x.len()).collect::<Vec<_>>()
                };
                grower.grow(samples, 0, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            n_classes,
            n_features,
        })
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn max_depth(&self) -> usize {
        self.trees.iter().map(Node::depth).max().unwrap_or(0)
    }

    /// Mean of the per-tree leaf class distributions.
    pub fn predict_proba(&self, sample: &[f64]) -> Vec<f64> {
        let mut total = vec![0.0; self.n_classes];
        if sample.len() != self.n_features {
            return total;
        }
        for tree in &self.trees {
            for (acc, p) in total.iter_mut().zip(tree.distribution(sample)) {
                *acc += p;
            }
        }
        let n = self.trees.len() as f64;
        total.iter_mut().for_each(|p| *p /= n);
        total
    }

    pub fn predict(&self, sample: &[f64]) -> usize {
        argmax(&self.predict_proba(sample))
    }
}

impl Grower<'_> {
    fn grow(&self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> Node {
        let counts = self.weighted_counts(&samples);
        let depth_reached = self.params.max_depth.is_some_and(|max| depth >= max);
        let pure = counts.iter().filter(|&&c| c > 0.0).count() <= 1;
        if depth_reached || pure || samples.len() < self.params.min_samples_split {
            return leaf(counts);
        }

        let Some((feature, threshold)) = self.best_split(&samples, &counts, rng) else {
            return leaf(counts);
        };
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.x[i][feature] <= threshold);
        if left.is_empty() || right.is_empty() {
            return leaf(counts);
        }
        Node::Split {
            feature,
            threshold,
            left: Box::new(self.grow(left, depth + 1, rng)),
            right: Box::new(self.grow(right, depth + 1, rng)),
        }
    }

    fn weighted_counts(&self, samples: &[usize]) -> Vec<f64> {
        let mut counts = vec![0.0; self.n_classes];
        for &i in samples {
            counts[self.y[i]] += self.weights[i];
        }
        counts
    }

    fn best_split(
        &self,
        samples: &[usize],
        parent: &[f64],
        rng: &mut StdRng,
    ) -> Option<(usize, f64)> {
        let n_features = self.x[0].len();
        let mut features = (0..n_features).collect::<Vec<_>>();
        features.shuffle(rng);

        let parent_total: f64 = parent.iter().sum();
        let parent_score = parent_total * gini(parent, parent_total) - 1e-12;
        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = samples.to_vec();
        // keep drawing features past the budget until one of them splits
        for (visited, &feature) in features.iter().enumerate() {
            if visited >= self.max_features
                && best.is_some_and(|(_, _, best_score)| best_score < parent_score)
            {
                break;
            }
            sorted.sort_by(|&a, &b| self.x[a][feature].total_cmp(&self.x[b][feature]));
            let mut left = vec![0.0; self.n_classes];
            let mut left_total = 0.0;
            for pair in 0..sorted.len().saturating_sub(1) {
                let i = sorted[pair];
                left[self.y[i]] += self.weights[i];
                left_total += self.weights[i];
                let here = self.x[i][feature];
                let next = self.x[sorted[pair + 1]][feature];
                if here == next || here.is_nan() || next.is_nan() {
                    continue;
                }
                let right = parent
                    .iter()
                    .zip(&left)
                    .map(|(p, l)| p - l)
                    .collect::<Vec<_>>();
                let right_total = parent_total - left_total;
                let score =
                    left_total * gini(&left, left_total) + right_total * gini(&right, right_total);
                if best.is_none_or(|(_, _, best_score)| score < best_score) {
                    best = Some((feature, here + (next - here) / 2.0, score));
                }
            }
        }
        let (feature, threshold, score) = best?;
        // a split that does not lower impurity only adds depth
        if score >= parent_score {
            return None;
        }
        Some((feature, threshold))
    }
}

fn leaf(counts: Vec<f64>) -> Node {
    let total: f64 = counts.iter().sum();
    let distribution = if total > 0.0 {
        counts.iter().map(|c| c / total).collect()
    } else {
        counts
    };
    Node::Leaf { distribution }
}

fn gini(counts: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

/// `n_samples / (n_classes * count)` per class when balanced, else 1.
pub fn class_weights(y: &[usize], n_classes: usize, balanced: bool) -> Vec<f64> {
    if !balanced {
        return vec![1.0; n_classes];
    }
    let mut counts = vec![0usize; n_classes];
    for &label in y {
        counts[label] += 1;
    }
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                y.len() as f64 / (n_classes as f64 * count as f64)
            }
        })
        .collect()
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v { (i, v) } else { (best_i, best_v) }
        })
        .0
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn separable() -> (Vec<Vec<f64>>, Vec<usize>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..40 {
            let v = i as f64;
            x.push(vec![v, (i % 3) as f64]);
            y.push(usize::from(i >= 20));
        }
        (x, y)
    }

    #[test]
    fn learns_a_threshold() {
        let (x, y) = separable();
        let params = ForestParams {
            n_trees: 15,
            max_features: MaxFeatures::All,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, 2, &params).unwrap();
        assert_eq!(forest.predict(&[2.0, 0.0]), 0);
        assert_eq!(forest.predict(&[37.0, 1.0]), 1);
    }

    #[test]
    fn same_seed_same_forest() {
        let (x, y) = separable();
        let params = ForestParams {
            n_trees: 5,
            ..ForestParams::default()
        };
        let a = RandomForest::fit(&x, &y, 2, &params).unwrap();
        let b = RandomForest::fit(&x, &y, 2, &params).unwrap();
        for sample in &x {
            assert_eq!(a.predict_proba(sample), b.predict_proba(sample));
        }
    }

    #[test]
    fn balanced_weights_invert_frequency() {
        let weights = class_weights(&[0, 0, 0, 1], 2, true);
        assert!((weights[0] - 4.0 / 6.0).abs() < 1e-12);
        assert!((weights[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn depth_limit_is_respected() {
        let (x, y) = separable();
        let params = ForestParams {
            n_trees: 3,
            max_depth: Some(1),
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, 2, &params).unwrap();
        assert!(forest.max_depth() <= 1);
    }

    #[test]
    fn rejects_mismatched_labels() {
        let err =
            RandomForest::fit(&[vec![1.0]], &[0, 1], 2, &ForestParams::default()).unwrap_err();
        assert_matches!(err, CutoutError::TrainingData(_));
    }
}
