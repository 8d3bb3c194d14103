use thiserror::Error;

use crate::broad::{BuildState, SourceError, StoreError};
use crate::embedding::SpaceError;
use crate::io::LibraryReadError;
use crate::novelty::NoveltyError;
use crate::projection::ProjectionError;

/// Conditions surfaced to callers of [`SpectralEngine`](crate::SpectralEngine)
/// and [`BroadIndex`](crate::broad::BroadIndex).
#[derive(Debug, Error)]
pub enum SpectralError {
    #[error("Reference entry {id} is out of range, the library holds {size} entries")]
    NotFound { id: usize, size: usize },
    #[error("The broad index is not ready (state: {0})")]
    IndexNotReady(BuildState),
    #[error("Failed to load the embedding space: {0}")]
    Space(#[from] SpaceError),
    #[error("Failed to read reference spectra: {0}")]
    Library(#[from] LibraryReadError),
    #[error("Failed to fit the projection: {0}")]
    Projection(#[from] ProjectionError),
    #[error("Failed to fit the novelty model: {0}")]
    Novelty(#[from] NoveltyError),
    #[error("Broad index storage failed: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to configure the corpus source: {0}")]
    Source(#[from] SourceError),
}
