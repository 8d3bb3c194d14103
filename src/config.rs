//! Engine and broad index settings. Every field has a default, so a JSON
//! settings file only needs to name what it changes.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broad::source::{
    CorpusSource, GitHubReleaseAsset, LocalFile, SourceError, UrlSource, DEFAULT_TIMEOUT_SECS,
    DEFAULT_USER_AGENT, MASSBANK_ASSET_NAME, MASSBANK_RELEASE_API,
};
use crate::broad::DEFAULT_BATCH_SIZE;
use crate::novelty::{DEFAULT_NEAREST, DEFAULT_NEIGHBORS};
use crate::similarity::{DEFAULT_TOLERANCE, DEFAULT_TOP_N};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    IOError { path: PathBuf, source: io::Error },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExactMatchParams {
    pub tolerance: f64,
    pub top_n: usize,
}

impl Default for ExactMatchParams {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            top_n: DEFAULT_TOP_N,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoveltyParams {
    pub n_neighbors: usize,
    pub nearest: usize,
}

impl Default for NoveltyParams {
    fn default() -> Self {
        Self {
            n_neighbors: DEFAULT_NEIGHBORS,
            nearest: DEFAULT_NEAREST,
        }
    }
}

/// Where the broad index corpus is fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    GithubRelease { api_url: String, asset: String },
    Url { url: String, file_name: Option<String> },
    Local { path: PathBuf },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::GithubRelease {
            api_url: MASSBANK_RELEASE_API.to_string(),
            asset: MASSBANK_ASSET_NAME.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn open(&self, user_agent: &str, timeout: Duration) -> Result<Arc<dyn CorpusSource>, SourceError> {
        let source: Arc<dyn CorpusSource> = match self {
            Self::GithubRelease { api_url, asset } => Arc::new(GitHubReleaseAsset::new(
                api_url.as_str(),
                asset.as_str(),
                user_agent,
                timeout,
            )?),
            Self::Url { url, file_name } => Arc::new(UrlSource::new(
                url.as_str(),
                file_name.clone(),
                user_agent,
                timeout,
            )?),
            Self::Local { path } => Arc::new(LocalFile::new(path)),
        };
        Ok(source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadIndexConfig {
    pub index_dir: PathBuf,
    pub source: SourceConfig,
    pub source_tag: String,
    pub batch_size: usize,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for BroadIndexConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("datasets/broad_index"),
            source: SourceConfig::default(),
            source_tag: "MassBank".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl BroadIndexConfig {
    pub fn with_index_dir<P: Into<PathBuf>>(mut self, index_dir: P) -> Self {
        self.index_dir = index_dir.into();
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub exact_match: ExactMatchParams,
    /// Result cap for embedding searches, reference and broad.
    pub top_n: usize,
    pub novelty: NoveltyParams,
    pub broad: BroadIndexConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exact_match: ExactMatchParams::default(),
            top_n: DEFAULT_TOP_N,
            novelty: NoveltyParams::default(),
            broad: BroadIndexConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::IOError {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.exact_match.tolerance = tolerance;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self.exact_match.top_n = top_n;
        self
    }

    pub fn with_neighbors(mut self, n_neighbors: usize) -> Self {
        self.novelty.n_neighbors = n_neighbors;
        self
    }

    pub fn with_broad(mut self, broad: BroadIndexConfig) -> Self {
        self.broad = broad;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.top_n, 10);
        assert_eq!(config.exact_match.tolerance, 0.01);
        assert_eq!(config.novelty.n_neighbors, 8);
        assert_eq!(config.broad.batch_size, 200);
        assert!(matches!(config.broad.source, SourceConfig::GithubRelease { .. }));
    }

    #[test]
    fn test_from_path() -> Result<(), ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{"exact_match": {"tolerance": 0.02},
                "broad": {"index_dir": "/tmp/idx", "source": {"kind": "local", "path": "corpus.msp"}}}"#,
        )
        .unwrap();
        let config = EngineConfig::from_path(&path)?;
        assert_eq!(config.exact_match.tolerance, 0.02);
        assert_eq!(config.exact_match.top_n, 10);
        assert_eq!(config.top_n, 10);
        assert_eq!(config.broad.index_dir, PathBuf::from("/tmp/idx"));
        assert_eq!(
            config.broad.source,
            SourceConfig::Local {
                path: "corpus.msp".into()
            }
        );

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(EngineConfig::from_path(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            EngineConfig::from_path(dir.path().join("missing.json")),
            Err(ConfigError::IOError { .. })
        ));
        Ok(())
    }
}
