//! Spiral/elliptical classifier trained on precomputed image features.

use std::collections::BTreeMap;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;

use crate::catalog::Table;
use crate::domain::Morphology;
use crate::error::CutoutError;
use crate::forest::{ForestParams, RandomForest};

pub const FEATURE_PREFIX: &str = "PC";

#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<Morphology>,
}

impl FeatureSet {
    /// Every column starting with `PC` is a feature; labels come from the
    /// `spiral` and `elliptical` vote columns.
    pub fn from_table(table: &Table) -> Result<Self, CutoutError> {
        if table.is_empty() {
            return Err(CutoutError::TrainingData("features table has no rows".to_string()));
        }
        let feature_names = table
            .columns()
            .iter()
            .filter(|name| name.starts_with(FEATURE_PREFIX))
            .cloned()
            .collect::<Vec<_>>();
        if feature_names.is_empty() {
            return Err(CutoutError::TrainingData(format!(
                "no {FEATURE_PREFIX}* feature columns found"
            )));
        }

        let columns = feature_names
            .iter()
            .map(|name| table.numeric_column(name))
            .collect::<Result<Vec<_>, _>>()?;
        let features = (0..table.len())
            .map(|row| columns.iter().map(|column| column[row]).collect())
            .collect();

        let spiral = table.numeric_column("spiral")?;
        let elliptical = table.numeric_column("elliptical")?;
        let labels = spiral
            .iter()
            .zip(&elliptical)
            .map(|(&s, &e)| Morphology::from_votes(s, e))
            .collect();

        Ok(Self {
            feature_names,
            features,
            labels,
        })
    }

    pub fn read_csv(path: &Path) -> Result<Self, CutoutError> {
        Self::from_table(&Table::read_csv(path)?)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn class_counts(&self) -> BTreeMap<Morphology, usize> {
        let mut counts = BTreeMap::new();
        for label in &self.labels {
            *counts.entry(*label).or_insert(0) += 1;
        }
        counts
    }
}

/// Shuffles each class separately and moves `round(n * test_fraction)` of it
/// into the test indices, so both sides keep the class proportions.
pub fn stratified_split(
    labels: &[Morphology],
    test_fraction: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in Morphology::ALL {
        let mut members = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| **label == class)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        members.shuffle(&mut rng);
        let n_test = ((members.len() as f64) * test_fraction).round() as usize;
        let n_test = n_test.min(members.len());
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    pub test_fraction: f64,
    pub seed: u64,
    pub forest: ForestParams,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            forest: ForestParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub label: Morphology,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    pub classes: Vec<ClassMetrics>,
    pub train_size: usize,
    pub test_size: usize,
}

impl ClassificationReport {
    /// Per-class metrics over paired truth and prediction slices. Undefined
    /// ratios (no predictions, no support) are reported as 0.
    pub fn evaluate(truth: &[Morphology], predicted: &[Morphology]) -> Self {
        let correct = truth.iter().zip(predicted).filter(|(t, p)| t == p).count();
        let accuracy = if truth.is_empty() {
            0.0
        } else {
            correct as f64 / truth.len() as f64
        };
        let classes = Morphology::ALL
            .iter()
            .map(|&label| {
                let tp = truth
                    .iter()
                    .zip(predicted)
                    .filter(|(t, p)| **t == label && **p == label)
                    .count();
                let predicted_n = predicted.iter().filter(|p| **p == label).count();
                let support = truth.iter().filter(|t| **t == label).count();
                let precision = ratio(tp, predicted_n);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label,
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();
        Self {
            accuracy,
            classes,
            train_size: 0,
            test_size: truth.len(),
        }
    }

    pub fn class(&self, label: Morphology) -> Option<&ClassMetrics> {
        self.classes.iter().find(|metrics| metrics.label == label)
    }
}

impl std::fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:>12} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for metrics in &self.classes {
            writeln!(
                f,
                "{:>12} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                metrics.label.to_string(),
                metrics.precision,
                metrics.recall,
                metrics.f1,
                metrics.support
            )?;
        }
        write!(f, "{:>12} {:>29.2} {:>9}", "accuracy", self.accuracy, self.test_size)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub forest: RandomForest,
    pub feature_names: Vec<String>,
    pub report: ClassificationReport,
}

impl TrainedModel {
    pub fn predict(&self, sample: &[f64]) -> Morphology {
        Morphology::from_index(self.forest.predict(sample))
    }
}

pub fn train_and_evaluate(
    set: &FeatureSet,
    options: &TrainOptions,
) -> Result<TrainedModel, CutoutError> {
    let counts = set.class_counts();
    if counts.len() < 2 {
        return Err(CutoutError::TrainingData(
            "need examples of both spiral and elliptical galaxies".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&options.test_fraction) {
        return Err(CutoutError::TrainingData(format!(
            "test fraction {} outside [0, 1)",
            options.test_fraction
        )));
    }

    let (train, test) = stratified_split(&set.labels, options.test_fraction, options.seed);
    if train.is_empty() || test.is_empty() {
        return Err(CutoutError::TrainingData(format!(
            "{} rows are too few for a {:.0}% test split",
            set.len(),
            options.test_fraction * 100.0
        )));
    }

    let x_train = train.iter().map(|&i| set.features[i].clone()).collect::<Vec<_>>();
    let y_train = train.iter().map(|&i| set.labels[i].index()).collect::<Vec<_>>();
    info!(
        train = train.len(),
        test = test.len(),
        features = set.feature_names.len(),
        trees = options.forest.n_trees,
        "training random forest"
    );
    let forest = RandomForest::fit(&x_train, &y_train, Morphology::ALL.len(), &options.forest)?;

    let truth = test.iter().map(|&i| set.labels[i]).collect::<Vec<_>>();
    let predicted = test
        .iter()
        .map(|&i| Morphology::from_index(forest.predict(&set.features[i])))
        .collect::<Vec<_>>();
    let mut report = ClassificationReport::evaluate(&truth, &predicted);
    report.train_size = train.len();
    info!(accuracy = report.accuracy, "classifier evaluated");

    Ok(TrainedModel {
        forest,
        feature_names: set.feature_names.clone(),
        report,
    })
}
