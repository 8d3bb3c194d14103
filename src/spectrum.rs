//! The peak list and spectrum data model consumed by every scorer.
//!
//! A [`Spectrum`] is deliberately lightweight: an ordered list of [`Peak`]s as
//! submitted plus free-form string metadata. Metadata keys are stored lower-cased
//! so that MGF (`PEPMASS`) and MSP (`PrecursorMZ`) sources can be read through
//! the same typed accessors.
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use mzpeaks::{CentroidPeak, PeakSet};
use serde::{Deserialize, Serialize};

/// The mass of a proton, used to turn an exact mass into an `[M+H]+` m/z.
pub const PROTON: f64 = 1.007276;

/// A single `(m/z, intensity)` pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
}

impl Peak {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self { mz, intensity }
    }
}

impl fmt::Display for Peak {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Peak({}, {})", self.mz, self.intensity)
    }
}

impl From<(f64, f64)> for Peak {
    fn from((mz, intensity): (f64, f64)) -> Self {
        Self { mz, intensity }
    }
}

/// The polarity a spectrum was acquired in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolarity {
    #[default]
    Unknown,
    Positive,
    Negative,
}

impl FromStr for ScanPolarity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let polarity = match s.trim().to_ascii_uppercase().as_str() {
            "" => Self::Unknown,
            "POSITIVE" | "P" | "+" | "POS" => Self::Positive,
            "NEGATIVE" | "N" | "-" | "NEG" => Self::Negative,
            _ => Self::Unknown,
        };
        Ok(polarity)
    }
}

/// A peak list with descriptive metadata.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub peaks: Vec<Peak>,
    pub metadata: IndexMap<String, String>,
}

const PRECURSOR_KEYS: &[&str] = &["pepmass", "precursormz", "precursor_mz"];
const ION_MODE_KEYS: &[&str] = &["ionmode", "ion_mode", "ion mode"];
const NAME_KEYS: &[&str] = &["compound_name", "name"];
const FORMULA_KEYS: &[&str] = &["formula", "molecular_formula"];
const INCHIKEY_KEYS: &[&str] = &["inchikey", "inchi_key"];

impl Spectrum {
    pub fn new(peaks: Vec<Peak>) -> Self {
        Self {
            peaks,
            metadata: IndexMap::new(),
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.metadata
            .insert(key.into().trim().to_lowercase(), value.into().trim().to_string());
    }

    /// Look up a metadata value by (case-insensitive) key. Blank values count
    /// as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(&key.to_lowercase())
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// The first non-blank value among `keys`.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// The declared precursor m/z, reading only the first whitespace separated
    /// token of an MGF style `PEPMASS=mz intensity charge` value.
    pub fn precursor_mz(&self) -> Option<f64> {
        self.get_any(PRECURSOR_KEYS)
            .and_then(|v| v.split_ascii_whitespace().next())
            .and_then(|v| v.parse().ok())
    }

    pub fn exact_mass(&self) -> Option<f64> {
        self.get_any(&["exactmass", "exact_mass"])
            .and_then(|v| v.parse().ok())
    }

    pub fn ion_mode(&self) -> Option<&str> {
        self.get_any(ION_MODE_KEYS)
    }

    pub fn polarity(&self) -> ScanPolarity {
        self.ion_mode()
            .map(|v| v.parse().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn compound_name(&self) -> Option<&str> {
        self.get_any(NAME_KEYS)
    }

    pub fn formula(&self) -> Option<&str> {
        self.get_any(FORMULA_KEYS)
    }

    pub fn inchikey(&self) -> Option<&str> {
        self.get_any(INCHIKEY_KEYS)
    }

    pub fn base_peak_intensity(&self) -> f64 {
        self.peaks.iter().map(|p| p.intensity).fold(0.0, f64::max)
    }

    /// Build an m/z-sorted [`PeakSet`] with intensities scaled so the base peak
    /// is 1.0. Each peak's `index` is its position in the sorted set.
    pub fn normalized_peak_set(&self) -> PeakSet {
        let base = self.base_peak_intensity();
        let scale = if base > 0.0 { base } else { 1.0 };
        let peaks: Vec<CentroidPeak> = self
            .peaks
            .iter()
            .map(|p| CentroidPeak {
                mz: p.mz,
                intensity: (p.intensity / scale) as f32,
                ..Default::default()
            })
            .collect();
        PeakSet::new(peaks)
    }
}

impl From<Vec<Peak>> for Spectrum {
    fn from(peaks: Vec<Peak>) -> Self {
        Self::new(peaks)
    }
}
