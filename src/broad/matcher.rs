use std::collections::HashSet;

use serde::Serialize;

use super::store::BroadIndexData;
use crate::library::serialize_or_unavailable;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadMatch {
    pub id: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub inchikey: Option<String>,
    pub source: String,
    pub similarity: f64,
}

/// Rank the rows of `data` against a unit length `query`. Rows are visited
/// in order of descending similarity; negative similarities are dropped and
/// only the first row of each case-insensitive compound name is kept.
pub fn rank_broad(data: &BroadIndexData, query: &[f32], top_n: usize) -> Vec<BroadMatch> {
    let similarities = data.similarities(query);
    let mut order: Vec<usize> = (0..similarities.len()).collect();
    order.sort_by(|a, b| similarities[*b].total_cmp(&similarities[*a]));

    let mut seen = HashSet::new();
    let mut results = Vec::with_capacity(top_n.min(order.len()));
    for i in order {
        if results.len() >= top_n {
            break;
        }
        let similarity = similarities[i];
        if similarity < 0.0 {
            continue;
        }
        let entry = &data.entries()[i];
        if !seen.insert(entry.name.to_lowercase()) {
            continue;
        }
        results.push(BroadMatch {
            id: entry.id,
            name: entry.name.clone(),
            formula: entry.formula.clone(),
            inchikey: entry.inchikey.clone(),
            source: entry.source.clone(),
            similarity: similarity as f64,
        });
    }
    results
}
