//! Reading spectral library files.
//!
//! Parsing the curated reference files is the caller's business; these readers
//! exist for the broad index corpus and for the command line front-end, and
//! produce plain [`Spectrum`](crate::spectrum::Spectrum) records.
pub(crate) mod compression;
pub mod mgf;
pub mod msp;

use std::fmt::Display;
use std::io::{self, prelude::*};
use std::path;

use log::warn;
use thiserror::Error;

use crate::spectrum::Spectrum;

pub use compression::{is_gzipped, is_gzipped_extension, open_maybe_gzipped};
pub use mgf::{MGFError, MGFReader};
pub use msp::{MSPError, MSPReader};

/// The spectral library formats this crate can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryFormat {
    MGF,
    MSP,
    Unknown,
}

impl Display for LibraryFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error)]
pub enum LibraryReadError {
    #[error("Could not infer the library format")]
    UnknownFormat,
    #[error("Failed to read MGF library: {0}")]
    MGF(#[from] MGFError),
    #[error("Failed to read MSP library: {0}")]
    MSP(#[from] MSPError),
    #[error("Encountered an IO error: {0}")]
    IOError(#[from] io::Error),
}

/// Guess the format of a (decompressed) library from its leading bytes.
pub fn infer_from_buffer(buf: &[u8]) -> LibraryFormat {
    if mgf::is_mgf(buf) {
        return LibraryFormat::MGF;
    }
    let text = String::from_utf8_lossy(buf);
    let has_msp_name = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_once(':'))
        .map(|(key, _)| key.trim().eq_ignore_ascii_case("name"))
        .unwrap_or(false);
    if has_msp_name {
        LibraryFormat::MSP
    } else {
        LibraryFormat::Unknown
    }
}

/// Infer the format from the file extension, ignoring a trailing `.gz`.
pub fn infer_from_path<P: Into<path::PathBuf>>(path: P) -> LibraryFormat {
    let (_, path) = is_gzipped_extension(path.into());
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("mgf") => LibraryFormat::MGF,
        Some("msp") => LibraryFormat::MSP,
        _ => LibraryFormat::Unknown,
    }
}

/// Read every spectrum from a buffered stream, sniffing its format first.
pub fn read_library<R: BufRead>(mut handle: R) -> Result<Vec<Spectrum>, LibraryReadError> {
    let format = infer_from_buffer(handle.fill_buf()?);
    read_library_as(handle, format)
}

impl LibraryReadError {
    /// Whether the stream itself failed, as opposed to one record in it.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Self::IOError(_) | Self::MGF(MGFError::IOError(_)) | Self::MSP(MSPError::IOError(_))
        )
    }
}

/// Collect every well-formed record. Malformed records are logged and
/// skipped; an IO error aborts.
fn collect_records<I, E>(records: I, format: LibraryFormat) -> Result<Vec<Spectrum>, LibraryReadError>
where
    I: Iterator<Item = Result<Spectrum, E>>,
    E: Into<LibraryReadError>,
{
    let mut spectra = Vec::new();
    let mut skipped = 0usize;
    for record in records {
        match record.map_err(Into::into) {
            Ok(spectrum) => spectra.push(spectrum),
            Err(e) if e.is_io() => return Err(e),
            Err(e) => {
                skipped += 1;
                warn!("Skipping malformed {format} record: {e}");
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {skipped} malformed {format} records, kept {}", spectra.len());
    }
    Ok(spectra)
}

pub fn read_library_as<R: BufRead>(
    handle: R,
    format: LibraryFormat,
) -> Result<Vec<Spectrum>, LibraryReadError> {
    match format {
        LibraryFormat::MGF => collect_records(MGFReader::new(handle), format),
        LibraryFormat::MSP => collect_records(MSPReader::new(handle), format),
        LibraryFormat::Unknown => Err(LibraryReadError::UnknownFormat),
    }
}

/// Open and read a library file, which may be gzip-compressed. Content sniffing
/// wins over the file extension.
pub fn read_library_path<P: AsRef<path::Path>>(
    path: P,
) -> Result<Vec<Spectrum>, LibraryReadError> {
    let mut handle = open_maybe_gzipped(path.as_ref())?;
    let format = match infer_from_buffer(handle.fill_buf()?) {
        LibraryFormat::Unknown => infer_from_path(path.as_ref()),
        format => format,
    };
    read_library_as(handle, format)
}
