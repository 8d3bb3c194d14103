//! The broad index: a large, disk persisted embedding matrix built in the
//! background from an external spectral corpus.
//!
//! [`BroadIndex`] owns the build lifecycle. Its status and the handle to the
//! loaded index sit behind one lock, which is only held to read or update
//! them and never across I/O.
mod builder;
mod matcher;
pub mod source;
mod status;
mod store;

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;

pub use builder::{is_indexable, BuildError, BuildPipeline, DEFAULT_BATCH_SIZE, MIN_PEAKS};
pub use matcher::{rank_broad, BroadMatch};
pub use source::{CorpusSource, GitHubReleaseAsset, LocalFile, SourceError, UrlSource};
pub use status::{BuildState, BuildStatus};
pub use store::{BroadIndexData, BroadIndexEntry, IndexStore, StoreError, METADATA_FILE, VECTORS_FILE};

use crate::config::BroadIndexConfig;
use crate::embedding::EmbeddingGenerator;
use crate::error::SpectralError;
use crate::spectrum::Peak;
use crate::vector::normalize_in_place;

#[derive(Debug, Default)]
struct IndexState {
    status: BuildStatus,
    data: Option<Arc<BroadIndexData>>,
}

struct Shared {
    state: Mutex<IndexState>,
    store: IndexStore,
    generator: EmbeddingGenerator,
    source: Arc<dyn CorpusSource>,
    batch_size: usize,
    source_tag: String,
}

impl Shared {
    fn update<F: FnOnce(&mut BuildStatus)>(&self, f: F) {
        f(&mut self.state.lock().status)
    }

    fn install(&self, data: BroadIndexData) {
        let n = data.len();
        let mut state = self.state.lock();
        state.data = Some(Arc::new(data));
        state.status.ready(n);
        info!("Broad index ready with {n} spectra");
    }

    fn pipeline(&self) -> BuildPipeline<'_> {
        BuildPipeline {
            source: self.source.as_ref(),
            generator: &self.generator,
            store: &self.store,
            batch_size: self.batch_size,
            source_tag: &self.source_tag,
        }
    }

    fn load_store(&self) -> Result<BroadIndexData, StoreError> {
        self.store.load_for_dim(self.generator.dim())
    }

    /// Run a build, turning a panic anywhere in it into the `error` state so
    /// the status never stays `building` after the worker exits.
    fn run_build_guarded(&self) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.run_build())).is_ok() {
            return;
        }
        error!("The broad index worker panicked");
        let corpus = self.pipeline().corpus_path();
        if corpus.exists() {
            if let Err(e) = fs::remove_file(&corpus) {
                warn!("Failed to remove corpus {}: {e}", corpus.display());
            }
        }
        self.update(|status| status.failed("build worker panicked"));
    }

    fn run_build(&self) {
        if self.store.exists() {
            match self.load_store() {
                Ok(data) => {
                    info!("Loaded existing broad index from {}", self.store.dir().display());
                    self.install(data);
                    return;
                }
                Err(e) => warn!("Ignoring unreadable broad index, rebuilding: {e}"),
            }
        }

        let result = self.pipeline().run(&mut |progress, message| {
            self.update(|status| status.advance(progress, message))
        });
        match result {
            Ok(data) => self.install(data),
            Err(e) => {
                error!("Broad index build failed: {e}");
                self.update(|status| status.failed(&e));
            }
        }
    }
}

/// The broad index service: build state machine plus query entry point.
pub struct BroadIndex {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadIndex {
    pub fn new(
        generator: EmbeddingGenerator,
        source: Arc<dyn CorpusSource>,
        store: IndexStore,
        batch_size: usize,
        source_tag: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(IndexState::default()),
                store,
                generator,
                source,
                batch_size,
                source_tag: source_tag.into(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(generator: EmbeddingGenerator, config: &BroadIndexConfig) -> Result<Self, SourceError> {
        let source = config
            .source
            .open(&config.user_agent, Duration::from_secs(config.timeout_secs))?;
        Ok(Self::new(
            generator,
            source,
            IndexStore::new(&config.index_dir),
            config.batch_size,
            config.source_tag.clone(),
        ))
    }

    pub fn store(&self) -> &IndexStore {
        &self.shared.store
    }

    pub fn status(&self) -> BuildStatus {
        self.shared.state.lock().status.clone()
    }

    /// Start a build unless one is running or the index is already ready, and
    /// return the resulting status. The check and the transition to
    /// `building` happen under the status lock, so concurrent callers start
    /// at most one build.
    pub fn start_build(&self) -> BuildStatus {
        let snapshot = {
            let mut state = self.shared.state.lock();
            if !state.status.state.can_start() {
                return state.status.clone();
            }
            state.status.begin();
            state.status.clone()
        };

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("broad-index-build".into())
            .spawn(move || shared.run_build_guarded())
        {
            Ok(handle) => {
                if let Some(previous) = self.worker.lock().replace(handle) {
                    let _ = previous.join();
                }
                snapshot
            }
            Err(e) => {
                error!("Failed to spawn the broad index worker: {e}");
                self.shared.update(|status| status.failed(&e));
                self.status()
            }
        }
    }

    /// Block until the in-flight build, if any, finishes.
    pub fn wait(&self) -> BuildStatus {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("The broad index worker panicked");
                self.shared.update(|status| status.failed("build worker panicked"));
            }
        }
        self.status()
    }

    /// Load a previously saved index if there is one. The index only becomes
    /// ready if no build has been started meanwhile.
    pub fn try_load(&self) -> Result<bool, StoreError> {
        if !self.shared.store.exists() {
            return Ok(false);
        }
        let data = self.shared.load_store()?;
        let n = data.len();
        let mut state = self.shared.state.lock();
        if !state.status.state.can_start() {
            return Ok(false);
        }
        state.data = Some(Arc::new(data));
        state.status.ready(n);
        info!("Loaded existing broad index with {n} spectra");
        Ok(true)
    }

    /// Run [`BroadIndex::try_load`] on a background thread.
    pub fn load_existing(self: &Arc<Self>) -> std::io::Result<JoinHandle<bool>> {
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("broad-index-load".into())
            .spawn(move || match this.try_load() {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("Could not load the existing broad index: {e}");
                    false
                }
            })
    }

    /// The loaded index, if the index is ready.
    pub fn data(&self) -> Result<Arc<BroadIndexData>, SpectralError> {
        let state = self.shared.state.lock();
        match (&state.data, state.status.state) {
            (Some(data), BuildState::Ready) => Ok(Arc::clone(data)),
            (_, current) => Err(SpectralError::IndexNotReady(current)),
        }
    }

    /// Rank the broad index against `peaks`. Fails with
    /// [`SpectralError::IndexNotReady`] unless the index is ready; an empty
    /// query yields no matches.
    pub fn search(&self, peaks: &[Peak], top_n: usize) -> Result<Vec<BroadMatch>, SpectralError> {
        let data = self.data()?;
        if peaks.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = self.shared.generator.embed(peaks).to_f32();
        normalize_in_place(&mut query);
        Ok(rank_broad(&data, &query, top_n))
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::broad::source::ProgressCallback;
    use crate::embedding::EmbeddingSpace;
    use crate::testing::fixture_space;

    /// Serves an unparseable corpus on the first fetch and the real one after.
    struct FlakySource {
        calls: AtomicUsize,
    }

    impl CorpusSource for FlakySource {
        fn describe(&self) -> String {
            "a flaky mirror".into()
        }

        fn file_name(&self) -> String {
            "corpus.msp".into()
        }

        fn fetch(&self, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
            let bytes = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                b"Name: truncated\nNum Peaks: 2\n10.0 1\n11.0 ba".to_vec()
            } else {
                fs::read("test/data/small_corpus.msp")?
            };
            fs::write(dest, &bytes)?;
            progress(bytes.len() as u64, Some(bytes.len() as u64));
            Ok(bytes.len() as u64)
        }
    }

    /// Takes its time and counts how often it is asked for the corpus.
    struct SlowSource {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CorpusSource for SlowSource {
        fn describe(&self) -> String {
            "a slow mirror".into()
        }

        fn file_name(&self) -> String {
            "corpus.msp".into()
        }

        fn fetch(&self, dest: &Path, _progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(fs::copy("test/data/small_corpus.msp", dest)?)
        }
    }

    /// Writes part of the corpus and then panics.
    struct PanickingSource {
        calls: AtomicUsize,
    }

    impl CorpusSource for PanickingSource {
        fn describe(&self) -> String {
            "a broken mirror".into()
        }

        fn file_name(&self) -> String {
            "corpus.msp".into()
        }

        fn fetch(&self, dest: &Path, _progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                fs::write(dest, b"Name: partial\n")?;
                panic!("connection reset mid-stream");
            }
            Ok(fs::copy("test/data/small_corpus.msp", dest)?)
        }
    }

    fn index_with(dir: &Path, source: Arc<dyn CorpusSource>) -> BroadIndex {
        BroadIndex::new(
            EmbeddingGenerator::new(Arc::new(fixture_space())),
            source,
            IndexStore::new(dir),
            DEFAULT_BATCH_SIZE,
            "MassBank",
        )
    }

    fn caffeine() -> Vec<Peak> {
        vec![
            Peak::new(50.0, 120.0),
            Peak::new(57.25, 450.0),
            Peak::new(64.5, 999.0),
            Peak::new(79.0, 80.0),
            Peak::new(100.75, 300.0),
        ]
    }

    #[test_log::test]
    fn test_build_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_with(dir.path(), Arc::new(LocalFile::new("test/data/small_corpus.msp")));

        assert!(matches!(
            index.search(&caffeine(), 5),
            Err(SpectralError::IndexNotReady(BuildState::NotBuilt))
        ));
        assert!(matches!(
            index.search(&[], 5),
            Err(SpectralError::IndexNotReady(BuildState::NotBuilt))
        ));

        let started = index.start_build();
        assert_eq!(started.state, BuildState::Building);
        let status = index.wait();
        assert_eq!(status.state, BuildState::Ready, "{status:?}");
        assert_eq!(status.progress, 100);
        assert_eq!(status.spectra_count, 3);

        let again = index.start_build();
        assert_eq!(again.state, BuildState::Ready);
        assert_eq!(again.spectra_count, 3);
        assert!(index.worker.lock().is_none());

        let hits = index.search(&caffeine(), 10).unwrap();
        assert_eq!(hits[0].name.to_lowercase(), "caffeine");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        let caffeines = hits.iter().filter(|h| h.name.eq_ignore_ascii_case("caffeine")).count();
        assert_eq!(caffeines, 1);
        assert!(hits.len() <= 2);
        assert!(index.search(&[], 10).unwrap().is_empty());
    }

    #[test_log::test]
    fn test_failure_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
        });
        let index = index_with(dir.path(), source.clone());
        let corpus = dir.path().join("corpus.msp");

        index.start_build();
        let status = index.wait();
        assert_eq!(status.state, BuildState::Error);
        assert_eq!(status.progress, 0);
        assert!(status.error.is_some());
        assert!(status.message.starts_with("Build failed"));
        assert!(!corpus.exists());
        assert!(!index.store().exists());

        let restarted = index.start_build();
        assert_eq!(restarted.state, BuildState::Building);
        let status = index.wait();
        assert_eq!(status.state, BuildState::Ready, "{status:?}");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(corpus.exists());
    }

    #[test_log::test]
    fn test_load_existing() {
        let dir = tempfile::tempdir().unwrap();
        let first = index_with(dir.path(), Arc::new(LocalFile::new("test/data/small_corpus.msp")));
        first.start_build();
        assert_eq!(first.wait().state, BuildState::Ready);

        let second = Arc::new(index_with(
            dir.path(),
            Arc::new(LocalFile::new("does/not/exist.msp")),
        ));
        assert!(second.load_existing().unwrap().join().unwrap());
        let status = second.status();
        assert_eq!(status.state, BuildState::Ready);
        assert_eq!(status.spectra_count, 3);

        let empty = tempfile::tempdir().unwrap();
        let third = Arc::new(index_with(empty.path(), Arc::new(LocalFile::new("x.msp"))));
        assert!(!third.load_existing().unwrap().join().unwrap());
        assert_eq!(third.status().state, BuildState::NotBuilt);
    }

    #[test_log::test]
    fn test_concurrent_start_spawns_one_build() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let index = index_with(dir.path(), source.clone());

        let statuses: Vec<BuildStatus> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8).map(|_| scope.spawn(|| index.start_build())).collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(statuses.iter().all(|s| s.state == BuildState::Building));
        assert_eq!(index.start_build().state, BuildState::Building);

        let status = index.wait();
        assert_eq!(status.state, BuildState::Ready, "{status:?}");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_worker_panic_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(PanickingSource {
            calls: AtomicUsize::new(0),
        });
        let index = index_with(dir.path(), source.clone());
        let corpus = dir.path().join("corpus.msp");

        index.start_build();
        let handle = index.worker.lock().take().unwrap();
        assert!(handle.join().is_ok());
        let status = index.status();
        assert_eq!(status.state, BuildState::Error);
        assert_eq!(status.progress, 0);
        assert!(!corpus.exists());

        assert_eq!(index.start_build().state, BuildState::Building);
        assert_eq!(index.wait().state, BuildState::Ready);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test]
    fn test_rejects_index_of_another_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let first = index_with(dir.path(), Arc::new(LocalFile::new("test/data/small_corpus.msp")));
        first.start_build();
        assert_eq!(first.wait().state, BuildState::Ready);

        let mut space = EmbeddingSpace::new(4);
        space.insert("peak@50.00", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let other = BroadIndex::new(
            EmbeddingGenerator::new(Arc::new(space)),
            Arc::new(LocalFile::new("test/data/small_corpus.msp")),
            IndexStore::new(dir.path()),
            DEFAULT_BATCH_SIZE,
            "MassBank",
        );
        assert!(matches!(
            other.try_load(),
            Err(StoreError::DimensionMismatch { expected: 4, found: 300 })
        ));
        assert_eq!(other.status().state, BuildState::NotBuilt);
    }
}
