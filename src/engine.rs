//! The service object tying the reference library, its derived models and
//! the broad index together.
//!
//! Everything derived from the reference library is computed on first use
//! and kept for the life of the engine. Concurrent first use converges on a
//! single stored value; a racing caller may fit a duplicate, which is
//! identical and discarded.
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::broad::{BroadIndex, BroadMatch, BuildStatus};
use crate::config::EngineConfig;
use crate::embedding::{Embedding, EmbeddingGenerator, EmbeddingSpace};
use crate::error::SpectralError;
use crate::io::read_library_path;
use crate::library::{serialize_or_unavailable, ChemicalRecord, ReferenceEntry, ReferenceLibrary};
use crate::novelty::{NoveltyReport, NoveltyScorer};
use crate::projection::{Point3, ProjectionModel, QueryPoint};
use crate::similarity::{embedding_search, EmbeddingMatch, ExactMatch, ExactMatchScorer};
use crate::spectrum::{Peak, Spectrum};

/// A reference entry's position in the projected frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryPoint {
    pub id: usize,
    pub name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    #[serde(flatten)]
    pub point: Point3,
}

/// A reference entry with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryEmbedding<'a> {
    pub id: usize,
    pub name: &'a str,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    pub embedding: &'a Embedding,
}

pub struct SpectralEngine {
    config: EngineConfig,
    generator: EmbeddingGenerator,
    reference_spectra: Vec<Spectrum>,
    records: Vec<ChemicalRecord>,
    library: OnceLock<ReferenceLibrary>,
    embeddings: OnceLock<Vec<Embedding>>,
    projection: OnceLock<ProjectionModel>,
    coordinates: OnceLock<Vec<LibraryPoint>>,
    novelty: OnceLock<NoveltyScorer>,
    broad: Arc<BroadIndex>,
    startup_load: Mutex<Option<JoinHandle<bool>>>,
}

/// Begin loading a previously saved broad index in the background.
fn begin_startup_load(broad: &Arc<BroadIndex>) -> Option<JoinHandle<bool>> {
    match broad.load_existing() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Could not start loading the existing broad index: {e}");
            None
        }
    }
}

impl SpectralEngine {
    /// Create an engine over already parsed reference spectra and chemical
    /// records. Nothing is merged or fitted until first needed. A broad index
    /// saved by an earlier run starts loading in the background right away.
    pub fn new(
        config: EngineConfig,
        space: Arc<EmbeddingSpace>,
        reference_spectra: Vec<Spectrum>,
        records: Vec<ChemicalRecord>,
    ) -> Result<Self, SpectralError> {
        let generator = EmbeddingGenerator::new(space);
        let broad = Arc::new(BroadIndex::from_config(generator.clone(), &config.broad)?);
        let startup_load = Mutex::new(begin_startup_load(&broad));
        Ok(Self {
            config,
            generator,
            reference_spectra,
            records,
            library: OnceLock::new(),
            embeddings: OnceLock::new(),
            projection: OnceLock::new(),
            coordinates: OnceLock::new(),
            novelty: OnceLock::new(),
            broad,
            startup_load,
        })
    }

    /// Load the embedding space and an MGF or MSP reference file from disk.
    pub fn from_paths<P: AsRef<Path>, Q: AsRef<Path>>(
        config: EngineConfig,
        space_path: P,
        reference_path: Q,
        records: Vec<ChemicalRecord>,
    ) -> Result<Self, SpectralError> {
        let space = EmbeddingSpace::from_path(space_path)?;
        let spectra = read_library_path(reference_path.as_ref())?;
        info!(
            "Read {} reference spectra from {}",
            spectra.len(),
            reference_path.as_ref().display()
        );
        Self::new(config, Arc::new(space), spectra, records)
    }

    /// Replace the broad index, e.g. with one using a different corpus source.
    pub fn with_broad_index(mut self, broad: BroadIndex) -> Self {
        self.await_startup_load();
        self.broad = Arc::new(broad);
        self.startup_load = Mutex::new(begin_startup_load(&self.broad));
        self
    }

    /// Block until the startup load of a saved broad index has finished and
    /// report whether it made the index ready.
    pub fn await_startup_load(&self) -> bool {
        let handle = self.startup_load.lock().take();
        match handle.map(JoinHandle::join) {
            Some(Ok(loaded)) => loaded,
            Some(Err(_)) => {
                warn!("The broad index loader panicked");
                false
            }
            None => false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn embed(&self, peaks: &[Peak]) -> Embedding {
        self.generator.embed(peaks)
    }

    pub fn library(&self) -> &ReferenceLibrary {
        self.library.get_or_init(|| {
            let library = ReferenceLibrary::build(self.reference_spectra.clone(), self.records.clone());
            info!("Built reference library with {} entries", library.len());
            library
        })
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        self.library().entries()
    }

    pub fn entry(&self, id: usize) -> Result<&ReferenceEntry, SpectralError> {
        self.library().entry(id)
    }

    pub fn spectrum(&self, id: usize) -> Result<&Spectrum, SpectralError> {
        self.library().spectrum(id)
    }

    /// The embeddings of every reference entry, co-indexed with the library.
    pub fn library_embeddings(&self) -> &[Embedding] {
        self.embeddings.get_or_init(|| {
            let spectra: Vec<Spectrum> = self.entries().iter().map(|e| e.spectrum.clone()).collect();
            self.generator.embed_batch(&spectra)
        })
    }

    pub fn embedding(&self, id: usize) -> Result<&Embedding, SpectralError> {
        let library = self.library();
        self.library_embeddings()
            .get(id)
            .ok_or(SpectralError::NotFound {
                id,
                size: library.len(),
            })
    }

    pub fn all_embeddings(&self) -> Vec<LibraryEmbedding<'_>> {
        self.entries()
            .iter()
            .zip(self.library_embeddings())
            .map(|(e, v)| LibraryEmbedding {
                id: e.id,
                name: &e.name,
                formula: e.formula.clone(),
                tox_score: e.tox_score.clone(),
                embedding: v,
            })
            .collect()
    }

    pub fn projection(&self) -> Result<&ProjectionModel, SpectralError> {
        if let Some(model) = self.projection.get() {
            return Ok(model);
        }
        let model = ProjectionModel::fit(self.library_embeddings())?;
        Ok(self.projection.get_or_init(|| model))
    }

    /// Every reference entry's projected coordinates, computed once.
    pub fn library_coordinates(&self) -> Result<&[LibraryPoint], SpectralError> {
        if let Some(points) = self.coordinates.get() {
            return Ok(points);
        }
        let model = self.projection()?;
        let points = self
            .entries()
            .iter()
            .zip(self.library_embeddings())
            .map(|(e, v)| -> Result<LibraryPoint, SpectralError> {
                Ok(LibraryPoint {
                    id: e.id,
                    name: e.name.clone(),
                    formula: e.formula.clone(),
                    tox_score: e.tox_score.clone(),
                    point: model.transform(v)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.coordinates.get_or_init(|| points))
    }

    /// Place a query spectrum in the same frame as the library.
    pub fn project_query(&self, peaks: &[Peak], label: &str) -> Result<QueryPoint, SpectralError> {
        let model = self.projection()?;
        let point = model.transform(&self.embed(peaks))?;
        Ok(QueryPoint {
            label: label.to_string(),
            point,
        })
    }

    /// Modified cosine search of the reference library. `tolerance` and
    /// `top_n` fall back to the configured values.
    pub fn exact_match(
        &self,
        peaks: &[Peak],
        precursor_mz: Option<f64>,
        tolerance: Option<f64>,
        top_n: Option<usize>,
    ) -> Vec<ExactMatch> {
        let params = &self.config.exact_match;
        ExactMatchScorer::new(tolerance.unwrap_or(params.tolerance)).search(
            self.library(),
            peaks,
            precursor_mz,
            top_n.unwrap_or(params.top_n),
        )
    }

    pub fn embedding_match(&self, peaks: &[Peak], top_n: Option<usize>) -> Vec<EmbeddingMatch> {
        if peaks.is_empty() {
            return Vec::new();
        }
        let query = self.embed(peaks);
        embedding_search(
            self.library(),
            self.library_embeddings(),
            &query,
            top_n.unwrap_or(self.config.top_n),
        )
    }

    pub fn novelty_scorer(&self) -> Result<&NoveltyScorer, SpectralError> {
        if let Some(scorer) = self.novelty.get() {
            return Ok(scorer);
        }
        let params = &self.config.novelty;
        let scorer = NoveltyScorer::fit(self.library_embeddings().to_vec(), params.n_neighbors)?
            .with_nearest(params.nearest);
        info!(
            "Fitted the novelty model over {} reference embeddings",
            scorer.model().len()
        );
        Ok(self.novelty.get_or_init(|| scorer))
    }

    /// Assess how novel a query is relative to the library. An empty query
    /// yields `None`.
    pub fn novelty(&self, peaks: &[Peak]) -> Result<Option<NoveltyReport>, SpectralError> {
        if peaks.is_empty() {
            return Ok(None);
        }
        let scorer = self.novelty_scorer()?;
        Ok(Some(scorer.assess(self.library(), &self.embed(peaks))))
    }

    pub fn broad_index(&self) -> &Arc<BroadIndex> {
        &self.broad
    }

    pub fn start_broad_build(&self) -> BuildStatus {
        self.broad.start_build()
    }

    pub fn broad_status(&self) -> BuildStatus {
        self.broad.status()
    }

    pub fn broad_match(&self, peaks: &[Peak], top_n: Option<usize>) -> Result<Vec<BroadMatch>, SpectralError> {
        self.broad.search(peaks, top_n.unwrap_or(self.config.top_n))
    }
}
