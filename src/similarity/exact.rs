use log::debug;
use mzpeaks::{PeakCollection, PeakSet, Tolerance};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use super::rank_descending;
use crate::library::{serialize_or_unavailable, ReferenceEntry, ReferenceLibrary};
use crate::spectrum::{Peak, Spectrum, PROTON};

pub const DEFAULT_TOLERANCE: f64 = 0.01;

/// Why a single query-reference alignment could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum AlignmentFailure {
    #[error("query precursor m/z {0} is not usable")]
    InvalidQueryPrecursor(f64),
    #[error("reference declares no usable precursor m/z")]
    MissingReferencePrecursor,
    #[error("alignment produced a non-finite score")]
    NonFinite,
}

/// The result of aligning one query against one reference spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreOutcome {
    Scored { score: f64, matches: usize },
    Failed(AlignmentFailure),
}

impl ScoreOutcome {
    /// A failed alignment counts as a zero score with no matched peaks. It
    /// stays in the ranking.
    pub fn or_zero(self) -> (f64, usize) {
        match self {
            Self::Scored { score, matches } => (score, matches),
            Self::Failed(_) => (0.0, 0),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<Result<(f64, usize), AlignmentFailure>> for ScoreOutcome {
    fn from(value: Result<(f64, usize), AlignmentFailure>) -> Self {
        match value {
            Ok((score, matches)) => Self::Scored { score, matches },
            Err(e) => Self::Failed(e),
        }
    }
}

fn usable_mz(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// The precursor m/z a reference spectrum is aligned with: its declared
/// precursor, falling back to `[M+H]+` computed from its exact mass.
pub fn reference_precursor(spectrum: &Spectrum) -> Option<f64> {
    spectrum
        .precursor_mz()
        .filter(|v| usable_mz(*v))
        .or_else(|| spectrum.exact_mass().map(|m| m + PROTON))
        .filter(|v| usable_mz(*v))
}

/// Modified cosine similarity between two base peak normalized peak sets.
///
/// Peaks pair up either directly, within `tolerance`, or after shifting the
/// reference by the precursor difference. Pairs are taken greedily by the
/// product of their intensities, each peak used at most once. Without a
/// query precursor only direct pairs are considered.
pub fn modified_cosine(
    query: &PeakSet,
    query_precursor: Option<f64>,
    reference: &PeakSet,
    reference_precursor: Option<f64>,
    tolerance: f64,
) -> Result<(f64, usize), AlignmentFailure> {
    let shift = match query_precursor {
        Some(q) if !usable_mz(q) => return Err(AlignmentFailure::InvalidQueryPrecursor(q)),
        Some(q) => Some(q - reference_precursor.ok_or(AlignmentFailure::MissingReferencePrecursor)?),
        None => None,
    };

    let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
    for (qi, qp) in query.iter().enumerate() {
        for rp in reference.all_peaks_for(qp.mz, Tolerance::Da(tolerance)) {
            pairs.push((qi, rp.index as usize, (qp.intensity * rp.intensity) as f64));
        }
        if let Some(shift) = shift.filter(|s| *s != 0.0) {
            for rp in reference.all_peaks_for(qp.mz - shift, Tolerance::Da(tolerance)) {
                pairs.push((qi, rp.index as usize, (qp.intensity * rp.intensity) as f64));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut used_query = vec![false; query.len()];
    let mut used_reference = vec![false; reference.len()];
    let mut total = 0.0;
    let mut matches = 0;
    for (qi, ri, score) in pairs {
        if used_query[qi] || used_reference[ri] {
            continue;
        }
        used_query[qi] = true;
        used_reference[ri] = true;
        total += score;
        matches += 1;
    }

    let norm = |peaks: &PeakSet| {
        peaks
            .iter()
            .map(|p| (p.intensity as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let score = total / (norm(query) * norm(reference));
    if !score.is_finite() {
        return Err(AlignmentFailure::NonFinite);
    }
    Ok((score.clamp(0.0, 1.0), matches))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExactMatch {
    pub id: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub cas: Option<String>,
    pub similarity: f64,
    pub n_matches: usize,
}

impl ExactMatch {
    fn new(entry: &ReferenceEntry, similarity: f64, n_matches: usize) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            formula: entry.formula.clone(),
            tox_score: entry.tox_score.clone(),
            cas: entry.cas.clone(),
            similarity,
            n_matches,
        }
    }
}

/// Ranks reference entries by modified cosine similarity to a query.
#[derive(Debug, Clone, Copy)]
pub struct ExactMatchScorer {
    pub tolerance: f64,
}

impl Default for ExactMatchScorer {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl ExactMatchScorer {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Align `query` against every reference entry that has peaks, then keep
    /// the `top_n` best. Equal scores keep library order.
    pub fn search(
        &self,
        library: &ReferenceLibrary,
        query: &[Peak],
        precursor_mz: Option<f64>,
        top_n: usize,
    ) -> Vec<ExactMatch> {
        if query.is_empty() {
            return Vec::new();
        }
        let query = Spectrum::new(query.to_vec()).normalized_peak_set();

        let mut results: Vec<ExactMatch> = library
            .entries()
            .par_iter()
            .filter(|entry| !entry.spectrum.is_empty())
            .map(|entry| {
                let outcome: ScoreOutcome = modified_cosine(
                    &query,
                    precursor_mz,
                    &entry.spectrum.normalized_peak_set(),
                    reference_precursor(&entry.spectrum),
                    self.tolerance,
                )
                .into();
                if let ScoreOutcome::Failed(reason) = outcome {
                    debug!("Scoring reference {} ({}) as zero: {reason}", entry.id, entry.name);
                }
                let (score, matches) = outcome.or_zero();
                ExactMatch::new(entry, score, matches)
            })
            .collect();

        rank_descending(&mut results, top_n, |m| m.similarity);
        results
    }
}
