use rayon::prelude::*;
use serde::Serialize;

use super::rank_descending;
use crate::embedding::Embedding;
use crate::library::{serialize_or_unavailable, ReferenceEntry, ReferenceLibrary};

/// Cosine similarity of `query` to each of `embeddings`, as `(position,
/// similarity)` pairs sorted by descending similarity. Ties keep input order.
pub fn cosine_ranking(query: &Embedding, embeddings: &[Embedding]) -> Vec<(usize, f64)> {
    let mut scored: Vec<(usize, f64)> = embeddings
        .par_iter()
        .enumerate()
        .map(|(i, e)| (i, query.cosine(e)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

/// A reference entry ranked by embedding similarity. `similarity` is clamped
/// at zero for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingMatch {
    pub id: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub cas: Option<String>,
    pub similarity: f64,
}

impl EmbeddingMatch {
    pub(crate) fn new(entry: &ReferenceEntry, similarity: f64) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            formula: entry.formula.clone(),
            tox_score: entry.tox_score.clone(),
            cas: entry.cas.clone(),
            similarity: similarity.max(0.0),
        }
    }
}

/// Rank the library by cosine similarity between `query` and each entry's
/// embedding, `embeddings` being co-indexed with the library.
pub fn embedding_search(
    library: &ReferenceLibrary,
    embeddings: &[Embedding],
    query: &Embedding,
    top_n: usize,
) -> Vec<EmbeddingMatch> {
    let mut scored = cosine_ranking(query, embeddings);
    rank_descending(&mut scored, top_n, |(_, s)| *s);
    scored
        .into_iter()
        .filter_map(|(i, s)| library.entries().get(i).map(|e| EmbeddingMatch::new(e, s)))
        .collect()
}
