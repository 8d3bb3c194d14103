//! Identify MS2 spectra against a curated reference library, place them in a
//! shared embedding space, judge their novelty, and search a large background
//! corpus through a disk persisted embedding index.
pub mod broad;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod io;
pub mod library;
pub mod novelty;
pub mod projection;
pub mod similarity;
pub mod spectrum;
pub mod vector;

#[cfg(test)]
mod testing;

pub use crate::broad::{BroadIndex, BroadMatch, BuildState, BuildStatus};
pub use crate::config::EngineConfig;
pub use crate::embedding::{Embedding, EmbeddingGenerator, EmbeddingSpace};
pub use crate::engine::SpectralEngine;
pub use crate::error::SpectralError;
pub use crate::library::{ChemicalRecord, ReferenceEntry, ReferenceLibrary};
pub use crate::spectrum::{Peak, Spectrum};

pub use crate::io::{read_library_path, MGFReader, MSPReader};
