//! Novelty scoring with a local outlier factor model over the reference
//! library's embeddings.
//!
//! The model follows scikit-learn's `LocalOutlierFactor(novelty=True,
//! metric="cosine")`: neighbourhoods of the fitted points exclude the point
//! itself, while neighbourhoods of scored points may contain exact duplicates
//! of it. Raw scores are the negated mean ratio of neighbour to query local
//! reachability density, so inliers sit near `-1` and outliers further below.
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::Embedding;
use crate::library::{serialize_or_unavailable, ReferenceLibrary};
use crate::similarity::cosine_ranking;
use crate::vector::{percentile, unit_cosine_distance};

pub const DEFAULT_NEIGHBORS: usize = 8;
pub const DEFAULT_NEAREST: usize = 5;

const LRD_EPSILON: f64 = 1e-10;
const SPREAD_EPSILON: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum NoveltyError {
    #[error("At least two reference embeddings are needed to fit, found {0}")]
    TooFewSamples(usize),
    #[error("The neighbourhood size must be positive")]
    NoNeighbors,
    #[error("Expected embeddings of dimension {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

#[derive(Debug, Clone)]
struct Neighborhood {
    indices: Vec<usize>,
    distances: Vec<f64>,
}

/// A fitted local outlier factor model.
#[derive(Debug, Clone)]
pub struct LocalOutlierModel {
    samples: Vec<Embedding>,
    n_neighbors: usize,
    k_distance: Vec<f64>,
    lrd: Vec<f64>,
}

impl LocalOutlierModel {
    /// Fit over `samples`. The neighbourhood size is clamped to one less than
    /// the number of samples.
    pub fn fit(samples: Vec<Embedding>, n_neighbors: usize) -> Result<Self, NoveltyError> {
        if n_neighbors == 0 {
            return Err(NoveltyError::NoNeighbors);
        }
        if samples.len() < 2 {
            return Err(NoveltyError::TooFewSamples(samples.len()));
        }
        let dim = samples[0].dim();
        if let Some(bad) = samples.iter().find(|s| s.dim() != dim) {
            return Err(NoveltyError::DimensionMismatch {
                expected: dim,
                found: bad.dim(),
            });
        }
        let n_neighbors = n_neighbors.min(samples.len() - 1);

        let mut this = Self {
            samples,
            n_neighbors,
            k_distance: Vec::new(),
            lrd: Vec::new(),
        };
        let neighborhoods: Vec<Neighborhood> = (0..this.samples.len())
            .into_par_iter()
            .map(|i| this.neighbors_of(&this.samples[i], Some(i)))
            .collect();
        this.k_distance = neighborhoods
            .iter()
            .map(|n| n.distances[n_neighbors - 1])
            .collect();
        this.lrd = neighborhoods
            .iter()
            .map(|n| this.reachability_density(n))
            .collect();
        debug!(
            "Fitted local outlier model over {} samples with k = {}",
            this.samples.len(),
            n_neighbors
        );
        Ok(this)
    }

    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The `n_neighbors` closest samples, by `(distance, index)`.
    fn neighbors_of(&self, query: &Embedding, exclude: Option<usize>) -> Neighborhood {
        let mut distances: Vec<(usize, f64)> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(j, _)| Some(*j) != exclude)
            .map(|(j, s)| (j, unit_cosine_distance(query, s)))
            .collect();
        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(self.n_neighbors);
        let (indices, distances) = distances.into_iter().unzip();
        Neighborhood { indices, distances }
    }

    fn reachability_density(&self, neighborhood: &Neighborhood) -> f64 {
        let reach: f64 = neighborhood
            .indices
            .iter()
            .zip(neighborhood.distances.iter())
            .map(|(j, d)| d.max(self.k_distance[*j]))
            .sum();
        1.0 / (reach / neighborhood.indices.len() as f64 + LRD_EPSILON)
    }

    /// The raw outlier score of a new point. Larger is more typical.
    pub fn score(&self, query: &Embedding) -> f64 {
        let neighborhood = self.neighbors_of(query, None);
        let lrd = self.reachability_density(&neighborhood);
        let ratio: f64 = neighborhood
            .indices
            .iter()
            .map(|j| self.lrd[*j] / lrd)
            .sum();
        -ratio / neighborhood.indices.len() as f64
    }

    /// Score every fitted sample as though it were a new point.
    pub fn score_samples(&self) -> Vec<f64> {
        self.samples.par_iter().map(|s| self.score(s)).collect()
    }
}

/// The 10th and 50th percentiles of the reference library's own raw scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoveltyCalibration {
    pub p10: f64,
    pub p50: f64,
}

impl NoveltyCalibration {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        Some(Self {
            p10: percentile(scores, 10.0)?,
            p50: percentile(scores, 50.0)?,
        })
    }

    /// Map a raw score onto `[0, 1]`, measuring how far below the median it
    /// falls in units of three times the p50 to p10 spread.
    pub fn normalize(&self, raw: f64) -> f64 {
        let spread = (self.p50 - self.p10).max(SPREAD_EPSILON);
        let value = (self.p50 - raw) / (3.0 * spread);
        if value.is_nan() {
            return 1.0;
        }
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoveltyLevel {
    Low,
    Medium,
    High,
}

impl NoveltyLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.25 {
            Self::Low
        } else if score < 0.60 {
            Self::Medium
        } else {
            Self::High
        }
    }

    pub fn interpretation(&self) -> &'static str {
        match self {
            Self::Low => "Structurally known class",
            Self::Medium => "Potentially novel structure",
            Self::High => "Unknown structure — manual review required",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearestReference {
    pub id: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoveltyReport {
    pub novelty_score: f64,
    #[serde(rename = "lof_raw")]
    pub raw_score: f64,
    pub max_similarity: f64,
    pub level: NoveltyLevel,
    pub interpretation: String,
    pub nearest: Vec<NearestReference>,
}

/// A fitted and calibrated novelty scorer.
#[derive(Debug, Clone)]
pub struct NoveltyScorer {
    model: LocalOutlierModel,
    calibration: NoveltyCalibration,
    nearest: usize,
}

impl NoveltyScorer {
    /// Fit the outlier model over the library embeddings and calibrate it
    /// against the library's own scores.
    pub fn fit(embeddings: Vec<Embedding>, n_neighbors: usize) -> Result<Self, NoveltyError> {
        let model = LocalOutlierModel::fit(embeddings, n_neighbors)?;
        let scores = model.score_samples();
        let calibration = NoveltyCalibration::from_scores(&scores)
            .ok_or(NoveltyError::TooFewSamples(scores.len()))?;
        debug!("Novelty calibration: {calibration:?}");
        Ok(Self {
            model,
            calibration,
            nearest: DEFAULT_NEAREST,
        })
    }

    pub fn with_nearest(mut self, nearest: usize) -> Self {
        self.nearest = nearest;
        self
    }

    pub fn calibration(&self) -> NoveltyCalibration {
        self.calibration
    }

    pub fn model(&self) -> &LocalOutlierModel {
        &self.model
    }

    /// Score `query` and describe its closest library entries.
    pub fn assess(&self, library: &ReferenceLibrary, query: &Embedding) -> NoveltyReport {
        let raw_score = self.model.score(query);
        let novelty_score = self.calibration.normalize(raw_score);
        let level = NoveltyLevel::from_score(novelty_score);

        let ranking = cosine_ranking(query, &self.model.samples);
        let max_similarity = ranking.first().map(|(_, s)| s.max(0.0)).unwrap_or(0.0);
        let nearest = ranking
            .iter()
            .take(self.nearest)
            .filter_map(|(i, s)| {
                library.entries().get(*i).map(|e| NearestReference {
                    id: e.id,
                    name: e.name.clone(),
                    formula: e.formula.clone(),
                    tox_score: e.tox_score.clone(),
                    similarity: s.max(0.0),
                })
            })
            .collect();

        NoveltyReport {
            novelty_score,
            raw_score,
            max_similarity,
            level,
            interpretation: level.interpretation().to_string(),
            nearest,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::embedding::EmbeddingGenerator;
    use crate::spectrum::Peak;
    use crate::testing::{chemical_records, fixture_space, reference_peaks, reference_spectra};
    use crate::vector::normalize_in_place;

    fn unit(values: &[f64]) -> Embedding {
        let mut v = values.to_vec();
        normalize_in_place(&mut v);
        Embedding::from(v)
    }

    fn cluster() -> Vec<Embedding> {
        (0..10)
            .map(|i| unit(&[1.0, 0.05 * i as f64, 0.02 * (i % 3) as f64]))
            .collect()
    }

    #[test]
    fn test_fit_errors() {
        assert_eq!(
            LocalOutlierModel::fit(vec![unit(&[1.0, 0.0])], 8).unwrap_err(),
            NoveltyError::TooFewSamples(1)
        );
        assert_eq!(
            LocalOutlierModel::fit(cluster(), 0).unwrap_err(),
            NoveltyError::NoNeighbors
        );
        let model = LocalOutlierModel::fit(cluster()[..4].to_vec(), 8).unwrap();
        assert_eq!(model.n_neighbors(), 3);
    }

    #[test]
    fn test_inlier_and_outlier() {
        let model = LocalOutlierModel::fit(cluster(), 3).unwrap();
        let inlier = model.score(&unit(&[1.0, 0.22, 0.02]));
        let outlier = model.score(&unit(&[0.0, 0.0, 1.0]));
        assert!(inlier > outlier, "{inlier} <= {outlier}");
        assert!(inlier < 0.0);
    }

    #[test]
    fn test_duplicates_do_not_blow_up() {
        let samples = vec![unit(&[1.0, 0.0]); 4];
        let model = LocalOutlierModel::fit(samples, 3).unwrap();
        let score = model.score(&unit(&[1.0, 0.0]));
        assert!(score.is_finite());
        assert!((score + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibration() {
        let cal = NoveltyCalibration::from_scores(&[-1.5, -1.0, -1.2, -1.1, -0.9]).unwrap();
        assert!((cal.p50 + 1.1).abs() < 1e-12);
        assert!((cal.p10 + 1.38).abs() < 1e-12);
        assert_eq!(cal.normalize(-0.5), 0.0);
        assert_eq!(cal.normalize(-1e9), 1.0);
        assert!((cal.normalize(-1.1 - 0.28 * 1.5) - 0.5).abs() < 1e-9);

        let flat = NoveltyCalibration { p10: -1.0, p50: -1.0 };
        assert_eq!(flat.normalize(-1.0), 0.0);
        assert_eq!(flat.normalize(f64::NEG_INFINITY), 1.0);
        assert!(NoveltyCalibration::from_scores(&[]).is_none());
    }

    #[test]
    fn test_levels() {
        assert_eq!(NoveltyLevel::from_score(0.0), NoveltyLevel::Low);
        assert_eq!(NoveltyLevel::from_score(0.25), NoveltyLevel::Medium);
        assert_eq!(NoveltyLevel::from_score(0.59), NoveltyLevel::Medium);
        assert_eq!(NoveltyLevel::from_score(0.60), NoveltyLevel::High);
        assert_eq!(NoveltyLevel::High.interpretation(), "Unknown structure — manual review required");
    }

    #[test_log::test]
    fn test_assess() {
        let library = ReferenceLibrary::build(reference_spectra(), chemical_records());
        let gen = EmbeddingGenerator::new(Arc::new(fixture_space()));
        let scorer = NoveltyScorer::fit(gen.embed_batch(&reference_spectra()), DEFAULT_NEIGHBORS).unwrap();
        assert_eq!(scorer.model().n_neighbors(), 8);

        let report = scorer.assess(&library, &gen.embed(&reference_peaks(4)));
        assert!((0.0..=1.0).contains(&report.novelty_score));
        assert_eq!(report.nearest.len(), 5);
        assert_eq!(report.nearest[0].id, 4);
        assert!((report.max_similarity - 1.0).abs() < 1e-9);
        assert_eq!(report.interpretation, report.level.interpretation());

        // Out of vocabulary peaks embed to zero, which is equidistant from
        // everything; the nearest list then follows library order.
        let report = scorer.assess(&library, &gen.embed(&[Peak::new(1.0, 1.0)]));
        assert!((0.0..=1.0).contains(&report.novelty_score));
        let ids: Vec<usize> = report.nearest.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.max_similarity, 0.0);
    }
}
