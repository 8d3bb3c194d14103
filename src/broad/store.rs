//! On-disk persistence of a built broad index.
//!
//! The index is two files in one directory. `broad_vectors.bin` holds a small
//! little endian header (magic `SPXV`, a `u32` format version, `u64` row and
//! column counts) followed by the row-major `f32` matrix. `broad_metadata.json`
//! holds the co-indexed [`BroadIndexEntry`] list. Each is written to a
//! temporary sibling and renamed into place.
use std::fs;
use std::io::{self, prelude::*, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::library::{deserialize_or_unavailable, serialize_or_unavailable};
use crate::vector::dot;

pub const VECTORS_FILE: &str = "broad_vectors.bin";
pub const METADATA_FILE: &str = "broad_metadata.json";

const MAGIC: &[u8; 4] = b"SPXV";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Index file {0} is missing")]
    Missing(PathBuf),
    #[error("Not a broad index vector file")]
    BadMagic,
    #[error("Unsupported index format version {0}")]
    UnsupportedVersion(u32),
    #[error("Vector file declares {expected} values but holds {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Index holds {rows} vectors but {entries} metadata entries")]
    Inconsistent { rows: usize, entries: usize },
    #[error("Vector file header declares an impossible shape of {rows} x {dim}")]
    BadShape { rows: u64, dim: u64 },
    #[error("Index vectors have dimension {found}, the embedding space has {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Failed to read index metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Encountered an IO error: {0}")]
    IOError(#[from] io::Error),
}

/// Descriptive metadata for one row of the broad index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadIndexEntry {
    pub id: usize,
    pub name: String,
    #[serde(
        serialize_with = "serialize_or_unavailable",
        deserialize_with = "deserialize_or_unavailable",
        default
    )]
    pub formula: Option<String>,
    #[serde(
        serialize_with = "serialize_or_unavailable",
        deserialize_with = "deserialize_or_unavailable",
        default
    )]
    pub inchikey: Option<String>,
    pub source: String,
}

/// A loaded broad index: an `N x dim` matrix of unit rows and the `N`
/// entries describing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadIndexData {
    dim: usize,
    vectors: Vec<f32>,
    entries: Vec<BroadIndexEntry>,
}

impl BroadIndexData {
    pub fn new(dim: usize, vectors: Vec<f32>, entries: Vec<BroadIndexEntry>) -> Result<Self, StoreError> {
        let rows = if dim == 0 { 0 } else { vectors.len() / dim };
        if dim == 0 || rows * dim != vectors.len() || rows != entries.len() {
            return Err(StoreError::Inconsistent {
                rows,
                entries: entries.len(),
            });
        }
        Ok(Self { dim, vectors, entries })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BroadIndexEntry] {
        &self.entries
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }

    /// The dot product of `query` with every row.
    pub fn similarities(&self, query: &[f32]) -> Vec<f32> {
        use rayon::prelude::*;
        self.vectors
            .par_chunks(self.dim)
            .map(|row| dot(row, query))
            .collect()
    }
}

/// The directory a broad index is persisted in.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl IndexStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Whether both index files are present.
    pub fn exists(&self) -> bool {
        self.vectors_path().is_file() && self.metadata_path().is_file()
    }

    /// Write both files to temporary siblings, then rename both into place,
    /// so a failed write never replaces half of an existing index.
    pub fn save(&self, data: &BroadIndexData) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let vectors_path = self.vectors_path();
        let metadata_path = self.metadata_path();
        let vectors_tmp = temporary_path(&vectors_path);
        let metadata_tmp = temporary_path(&metadata_path);

        let written =
            write_vectors(&vectors_tmp, data).and_then(|_| write_metadata(&metadata_tmp, data));
        if let Err(e) = written {
            for tmp in [&vectors_tmp, &metadata_tmp] {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }

        fs::rename(&vectors_tmp, &vectors_path)?;
        fs::rename(&metadata_tmp, &metadata_path)?;

        info!("Saved broad index with {} rows to {}", data.len(), self.dir.display());
        Ok(())
    }

    pub fn load(&self) -> Result<BroadIndexData, StoreError> {
        let vectors_path = self.vectors_path();
        let metadata_path = self.metadata_path();
        for path in [&vectors_path, &metadata_path] {
            if !path.is_file() {
                return Err(StoreError::Missing(path.clone()));
            }
        }

        let mut handle = BufReader::new(fs::File::open(&vectors_path)?);
        let mut header = [0u8; HEADER_LEN];
        handle.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(StoreError::BadMagic);
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&header[4..8]);
        let version = u32::from_le_bytes(word);
        if version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version));
        }
        let mut long = [0u8; 8];
        long.copy_from_slice(&header[8..16]);
        let declared_rows = u64::from_le_bytes(long);
        long.copy_from_slice(&header[16..24]);
        let declared_dim = u64::from_le_bytes(long);
        let bad_shape = StoreError::BadShape {
            rows: declared_rows,
            dim: declared_dim,
        };
        let (Ok(rows), Ok(dim)) = (usize::try_from(declared_rows), usize::try_from(declared_dim)) else {
            return Err(bad_shape);
        };
        let Some(expected) = rows.checked_mul(dim).filter(|_| dim > 0) else {
            return Err(bad_shape);
        };

        let mut buffer = Vec::new();
        handle.read_to_end(&mut buffer)?;
        let found = buffer.len() / std::mem::size_of::<f32>();
        if found != expected || buffer.len() % std::mem::size_of::<f32>() != 0 {
            return Err(StoreError::Truncated { expected, found });
        }
        let vectors: Vec<f32> = bytemuck::allocation::pod_collect_to_vec(&buffer);

        let entries: Vec<BroadIndexEntry> =
            serde_json::from_reader(BufReader::new(fs::File::open(&metadata_path)?))?;
        if entries.len() != rows {
            return Err(StoreError::Inconsistent {
                rows,
                entries: entries.len(),
            });
        }
        debug!("Loaded broad index with {rows} rows of dimension {dim}");
        BroadIndexData::new(dim, vectors, entries)
    }

    /// [`IndexStore::load`], rejecting an index whose rows were embedded in a
    /// space of a different dimension.
    pub fn load_for_dim(&self, expected: usize) -> Result<BroadIndexData, StoreError> {
        let data = self.load()?;
        if data.dim() != expected {
            return Err(StoreError::DimensionMismatch {
                expected,
                found: data.dim(),
            });
        }
        Ok(data)
    }
}

fn write_vectors(path: &Path, data: &BroadIndexData) -> Result<(), StoreError> {
    let mut handle = BufWriter::new(fs::File::create(path)?);
    handle.write_all(MAGIC)?;
    handle.write_all(&FORMAT_VERSION.to_le_bytes())?;
    handle.write_all(&(data.len() as u64).to_le_bytes())?;
    handle.write_all(&(data.dim as u64).to_le_bytes())?;
    handle.write_all(bytemuck::cast_slice(&data.vectors))?;
    handle.flush()?;
    Ok(())
}

fn write_metadata(path: &Path, data: &BroadIndexData) -> Result<(), StoreError> {
    let mut handle = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer(&mut handle, &data.entries)?;
    handle.flush()?;
    Ok(())
}
