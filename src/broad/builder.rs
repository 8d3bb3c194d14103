use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, info, warn};
use thiserror::Error;

use super::source::{CorpusSource, SourceError};
use super::store::{BroadIndexData, BroadIndexEntry, IndexStore, StoreError};
use crate::embedding::EmbeddingGenerator;
use crate::io::{read_library_path, LibraryReadError};
use crate::spectrum::Spectrum;
use crate::vector::normalize_rows;

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const MIN_PEAKS: usize = 3;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to fetch the corpus: {0}")]
    Source(#[from] SourceError),
    #[error("Failed to parse the corpus: {0}")]
    Parse(#[from] LibraryReadError),
    #[error("No usable spectra found in the corpus ({0} parsed)")]
    NoUsableSpectra(usize),
    #[error("Failed to persist the index: {0}")]
    Store(#[from] StoreError),
    #[error("Encountered an IO error: {0}")]
    IOError(#[from] io::Error),
}

/// Whether a corpus spectrum belongs in the broad index: at least
/// [`MIN_PEAKS`] peaks, a compound name, and positive mode when an ion mode is
/// declared at all.
pub fn is_indexable(spectrum: &Spectrum) -> bool {
    if spectrum.len() < MIN_PEAKS {
        return false;
    }
    let positive = spectrum
        .ion_mode()
        .map(|mode| matches!(mode.trim().to_uppercase().as_str(), "POSITIVE" | "P" | "+"))
        .unwrap_or(true);
    positive && spectrum.compound_name().is_some()
}

fn index_entry(id: usize, spectrum: &Spectrum, source_tag: &str) -> BroadIndexEntry {
    BroadIndexEntry {
        id,
        name: spectrum.compound_name().unwrap_or("Unknown").to_string(),
        formula: spectrum.formula().map(str::to_string),
        inchikey: spectrum.inchikey().map(str::to_string),
        source: source_tag.to_string(),
    }
}

/// The stages of one broad index build, from corpus download to the
/// persisted index. Progress is reported through a callback taking a
/// percentage and a message.
pub struct BuildPipeline<'a> {
    pub source: &'a dyn CorpusSource,
    pub generator: &'a EmbeddingGenerator,
    pub store: &'a IndexStore,
    pub batch_size: usize,
    pub source_tag: &'a str,
}

impl BuildPipeline<'_> {
    /// Where the downloaded corpus is cached between stages.
    pub fn corpus_path(&self) -> PathBuf {
        self.store.dir().join(self.source.file_name())
    }

    /// Run every stage. On failure the cached corpus is deleted so that the
    /// next attempt fetches it afresh. A previously saved index is left alone.
    pub fn run(&self, report: &mut dyn FnMut(u8, String)) -> Result<BroadIndexData, BuildError> {
        let result = self.run_stages(report);
        if let Err(e) = &result {
            let corpus = self.corpus_path();
            if corpus.exists() {
                match fs::remove_file(&corpus) {
                    Ok(()) => debug!("Removed corpus {} after failure: {e}", corpus.display()),
                    Err(err) => warn!("Failed to remove corpus {}: {err}", corpus.display()),
                }
            }
        }
        result
    }

    fn run_stages(&self, report: &mut dyn FnMut(u8, String)) -> Result<BroadIndexData, BuildError> {
        fs::create_dir_all(self.store.dir())?;
        let corpus = self.corpus_path();

        if corpus.exists() {
            info!("Reusing cached corpus {}", corpus.display());
        } else {
            report(1, format!("Resolving {}…", self.source.describe()));
            report(2, format!("Downloading {}…", self.source.file_name()));
            let bytes = self.source.fetch(&corpus, &mut |done, total| {
                if let Some(total) = total.filter(|t| *t > 0) {
                    let pct = 2 + (8 * done.min(total) / total) as u8;
                    report(
                        pct,
                        format!(
                            "Downloading… {:.0} MB / {:.0} MB",
                            done as f64 / 1_048_576.0,
                            total as f64 / 1_048_576.0
                        ),
                    );
                }
            })?;
            info!("Fetched {bytes} bytes into {}", corpus.display());
        }

        report(10, "Parsing corpus…".to_string());
        let spectra = read_library_path(&corpus)?;
        let parsed = spectra.len();
        let retained: Vec<Spectrum> = spectra.into_iter().filter(is_indexable).collect();
        info!("Retained {} of {parsed} corpus spectra", retained.len());
        let n = retained.len();
        if n == 0 {
            return Err(BuildError::NoUsableSpectra(parsed));
        }

        report(15, format!("Embedding {n} spectra…"));
        let dim = self.generator.dim();
        let mut vectors: Vec<f32> = Vec::with_capacity(n * dim);
        let batch_size = self.batch_size.max(1);
        let mut done = 0;
        for batch in retained.chunks(batch_size) {
            for embedding in self.generator.embed_batch(batch) {
                vectors.extend(embedding.to_f32());
            }
            done += batch.len();
            report(
                15 + (80 * done / n) as u8,
                format!("Embedding {done}/{n} spectra…"),
            );
        }
        normalize_rows(&mut vectors, dim);

        let entries = retained
            .iter()
            .enumerate()
            .map(|(i, s)| index_entry(i, s, self.source_tag))
            .collect();
        let data = BroadIndexData::new(dim, vectors, entries)?;

        report(97, "Saving index to disk…".to_string());
        self.store.save(&data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::broad::source::{LocalFile, ProgressCallback};
    use crate::spectrum::Peak;
    use crate::testing::fixture_space;

    fn peaks(n: usize) -> Vec<Peak> {
        (0..n).map(|i| Peak::new(50.0 + 7.25 * i as f64, 10.0)).collect()
    }

    #[test]
    fn test_is_indexable() {
        let named = |s: Spectrum| s.with_metadata("Name", "Caffeine");
        assert!(is_indexable(&named(Spectrum::new(peaks(3)))));
        assert!(!is_indexable(&named(Spectrum::new(peaks(2)))));
        assert!(!is_indexable(&Spectrum::new(peaks(3))));
        assert!(is_indexable(&named(Spectrum::new(peaks(3))).with_metadata("Ion_mode", "P")));
        assert!(is_indexable(&named(Spectrum::new(peaks(3))).with_metadata("IONMODE", "positive")));
        assert!(!is_indexable(&named(Spectrum::new(peaks(3))).with_metadata("IONMODE", "Negative")));
        assert!(is_indexable(
            &Spectrum::new(peaks(4)).with_metadata("compound_name", "Theobromine")
        ));
    }

    struct Unreachable;

    impl CorpusSource for Unreachable {
        fn describe(&self) -> String {
            "nowhere".into()
        }

        fn file_name(&self) -> String {
            "corpus.msp".into()
        }

        fn fetch(&self, _dest: &Path, _progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
            Err(SourceError::MissingFile("nowhere".into()))
        }
    }

    #[test_log::test]
    fn test_pipeline() -> Result<(), BuildError> {
        let dir = tempfile::tempdir()?;
        let store = IndexStore::new(dir.path());
        let generator = EmbeddingGenerator::new(Arc::new(fixture_space()));
        let source = LocalFile::new("test/data/small_corpus.msp");
        let pipeline = BuildPipeline {
            source: &source,
            generator: &generator,
            store: &store,
            batch_size: 2,
            source_tag: "MassBank",
        };

        let mut progress = Vec::new();
        let data = pipeline.run(&mut |p, _| progress.push(p))?;
        assert_eq!(data.len(), 3);
        assert_eq!(data.dim(), 300);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.first(), Some(&1));
        assert_eq!(progress.last(), Some(&97));
        assert!(store.exists());
        assert!(pipeline.corpus_path().exists());
        for i in 0..data.len() {
            let norm: f32 = data.row(i).iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(norm == 0.0 || (norm - 1.0).abs() < 1e-5);
        }
        assert!(data.entries().iter().all(|e| e.source == "MassBank"));
        Ok(())
    }

    #[test]
    fn test_failed_fetch() -> Result<(), BuildError> {
        let dir = tempfile::tempdir()?;
        let store = IndexStore::new(dir.path().join("index"));
        let generator = EmbeddingGenerator::new(Arc::new(fixture_space()));
        let pipeline = BuildPipeline {
            source: &Unreachable,
            generator: &generator,
            store: &store,
            batch_size: DEFAULT_BATCH_SIZE,
            source_tag: "MassBank",
        };
        assert!(matches!(
            pipeline.run(&mut |_, _| {}),
            Err(BuildError::Source(SourceError::MissingFile(_)))
        ));
        assert!(!pipeline.corpus_path().exists());
        assert!(!store.exists());
        Ok(())
    }
}
