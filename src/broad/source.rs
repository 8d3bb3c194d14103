//! Where a broad index corpus comes from.
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;

pub const MASSBANK_RELEASE_API: &str =
    "https://api.github.com/repos/MassBank/MassBank-data/releases/latest";
pub const MASSBANK_ASSET_NAME: &str = "MassBank_NISTformat.msp";
pub const DEFAULT_USER_AGENT: &str = concat!("spectident/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const CHUNK_SIZE: usize = 1 << 17;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("Asset {asset} not found in release {release}")]
    AssetNotFound { asset: String, release: String },
    #[error("Corpus file {0} does not exist")]
    MissingFile(PathBuf),
    #[error("Encountered an IO error: {0}")]
    IOError(#[from] io::Error),
}

/// Called with the bytes written so far and, when known, the total size.
pub type ProgressCallback<'a> = dyn FnMut(u64, Option<u64>) + 'a;

/// A place a corpus file can be fetched from.
pub trait CorpusSource: Send + Sync {
    /// A short human readable description, used in status messages.
    fn describe(&self) -> String;

    /// The file name the corpus is cached under in the index directory. The
    /// extension is used to infer the corpus format.
    fn file_name(&self) -> String;

    /// Write the corpus to `dest`, reporting byte progress as it goes.
    fn fetch(&self, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError>;
}

fn copy_with_progress<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    total: Option<u64>,
    progress: &mut ProgressCallback<'_>,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        written += n as u64;
        progress(written, total);
    }
    writer.flush()?;
    Ok(written)
}

pub(crate) fn http_client(user_agent: &str, timeout: Duration) -> Result<Client, SourceError> {
    Ok(Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()?)
}

fn download(client: &Client, url: &str, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
    let response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let total = response.content_length();
    info!("Downloading {url} ({} bytes)", total.map(|t| t.to_string()).unwrap_or_else(|| "unknown".into()));
    let handle = io::BufWriter::new(fs::File::create(dest)?);
    Ok(copy_with_progress(response, handle, total, progress)?)
}

#[derive(Deserialize)]
struct Release {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// A named asset of the latest release of a GitHub repository.
#[derive(Debug, Clone)]
pub struct GitHubReleaseAsset {
    pub api_url: String,
    pub asset_name: String,
    client: Client,
}

impl GitHubReleaseAsset {
    pub fn new<S: Into<String>, T: Into<String>>(
        api_url: S,
        asset_name: T,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            api_url: api_url.into(),
            asset_name: asset_name.into(),
            client: http_client(user_agent, timeout)?,
        })
    }

    /// The latest MassBank release in NIST MSP format.
    pub fn massbank(user_agent: &str, timeout: Duration) -> Result<Self, SourceError> {
        Self::new(MASSBANK_RELEASE_API, MASSBANK_ASSET_NAME, user_agent, timeout)
    }

    pub fn resolve(&self) -> Result<String, SourceError> {
        let response = self
            .client
            .get(&self.api_url)
            .header("Accept", "application/vnd.github+json")
            .send()?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                url: self.api_url.clone(),
                status: response.status().as_u16(),
            });
        }
        let release: Release = response.json()?;
        let tag = release.tag_name.unwrap_or_else(|| "latest".to_string());
        debug!("Latest release is {tag} with {} assets", release.assets.len());
        release
            .assets
            .into_iter()
            .find(|a| a.name == self.asset_name)
            .map(|a| a.browser_download_url)
            .ok_or(SourceError::AssetNotFound {
                asset: self.asset_name.clone(),
                release: tag,
            })
    }
}

impl CorpusSource for GitHubReleaseAsset {
    fn describe(&self) -> String {
        format!("{} from the latest release at {}", self.asset_name, self.api_url)
    }

    fn file_name(&self) -> String {
        self.asset_name.clone()
    }

    fn fetch(&self, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
        let url = self.resolve()?;
        download(&self.client, &url, dest, progress)
    }
}

/// A corpus at a fixed URL.
#[derive(Debug, Clone)]
pub struct UrlSource {
    pub url: String,
    pub file_name: String,
    client: Client,
}

impl UrlSource {
    pub fn new<S: Into<String>>(url: S, file_name: Option<String>, user_agent: &str, timeout: Duration) -> Result<Self, SourceError> {
        let url = url.into();
        let file_name = file_name.unwrap_or_else(|| {
            url.rsplit('/')
                .next()
                .and_then(|s| s.split('?').next())
                .filter(|s| !s.is_empty())
                .unwrap_or("corpus.msp")
                .to_string()
        });
        Ok(Self {
            url,
            file_name,
            client: http_client(user_agent, timeout)?,
        })
    }
}

impl CorpusSource for UrlSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn file_name(&self) -> String {
        self.file_name.clone()
    }

    fn fetch(&self, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
        download(&self.client, &self.url, dest, progress)
    }
}

/// A corpus already on the local file system. It is copied into the index
/// directory, so failed builds never touch the source file.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
}

impl LocalFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl CorpusSource for LocalFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "corpus.msp".to_string())
    }

    fn fetch(&self, dest: &Path, progress: &mut ProgressCallback<'_>) -> Result<u64, SourceError> {
        if !self.path.is_file() {
            return Err(SourceError::MissingFile(self.path.clone()));
        }
        let total = fs::metadata(&self.path)?.len();
        let reader = fs::File::open(&self.path)?;
        let writer = io::BufWriter::new(fs::File::create(dest)?);
        Ok(copy_with_progress(reader, writer, Some(total), progress)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_local_file() -> Result<(), SourceError> {
        let dir = tempfile::tempdir()?;
        let source = LocalFile::new("test/data/small_corpus.msp");
        assert_eq!(source.file_name(), "small_corpus.msp");

        let dest = dir.path().join(source.file_name());
        let mut calls = Vec::new();
        let n = source.fetch(&dest, &mut |done, total| calls.push((done, total)))?;
        assert_eq!(n, fs::metadata(&dest)?.len());
        assert_eq!(calls.last(), Some(&(n, Some(n))));

        let missing = LocalFile::new(dir.path().join("nope.msp"));
        assert!(matches!(
            missing.fetch(&dir.path().join("out.msp"), &mut |_, _| {}),
            Err(SourceError::MissingFile(_))
        ));
        Ok(())
    }

    #[test]
    fn test_url_file_name() -> Result<(), SourceError> {
        let source = UrlSource::new(
            "https://example.org/data/corpus.mgf.gz?download=1",
            None,
            DEFAULT_USER_AGENT,
            Duration::from_secs(5),
        )?;
        assert_eq!(source.file_name(), "corpus.mgf.gz");
        let named = UrlSource::new("https://example.org/", Some("x.msp".into()), DEFAULT_USER_AGENT, Duration::from_secs(5))?;
        assert_eq!(named.file_name(), "x.msp");
        Ok(())
    }
}
