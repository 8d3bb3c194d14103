//! Ranking a query against the reference library, by peak alignment or by
//! embedding similarity.
mod embedding;
mod exact;

pub use embedding::{cosine_ranking, embedding_search, EmbeddingMatch};
pub use exact::{
    modified_cosine, reference_precursor, AlignmentFailure, ExactMatch, ExactMatchScorer,
    ScoreOutcome, DEFAULT_TOLERANCE,
};

pub const DEFAULT_TOP_N: usize = 10;

/// Stable sort by descending `key`, then keep the first `top_n`.
pub(crate) fn rank_descending<T, F>(items: &mut Vec<T>, top_n: usize, key: F)
where
    F: Fn(&T) -> f64,
{
    items.sort_by(|a, b| key(b).total_cmp(&key(a)));
    items.truncate(top_n);
}
