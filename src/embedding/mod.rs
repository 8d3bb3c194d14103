//! Spec2Vec style spectrum embeddings built from a pretrained token space.
mod generator;
mod space;

pub use generator::{Embedding, EmbeddingGenerator, INTENSITY_POWER};
pub use space::{peak_token, EmbeddingSpace, SpaceError, EMBEDDING_DIM};
