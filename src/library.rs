//! The curated Reference Library: reference spectra merged with chemical and
//! toxicological records.
use std::collections::HashMap;
use std::sync::OnceLock;

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SpectralError;
use crate::spectrum::Spectrum;

/// The text absent fields are rendered as on the wire.
pub const UNAVAILABLE: &str = "N/A";

pub(crate) fn serialize_or_unavailable<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value.as_deref().unwrap_or(UNAVAILABLE))
}

pub(crate) fn deserialize_or_unavailable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.and_then(|v| clean(&v)))
}

fn adduct_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\s*\[M[+\-][^\]]+\][+\-]?\s*$").expect("adduct pattern is valid")
    })
}

fn cas_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+-\d+-\d+").expect("CAS pattern is valid"))
}

/// Remove a trailing ion adduct such as `[M+H]+` or `[M-H]-` from a compound name.
pub fn strip_adduct(name: &str) -> String {
    adduct_pattern().replace(name, "").trim().to_string()
}

/// Recover a CAS registry number from a colon delimited notes field, where it
/// occupies the third slot.
pub fn cas_from_notes(notes: &str) -> Option<String> {
    let candidate = notes.split(':').nth(2)?.trim();
    cas_pattern()
        .is_match(candidate)
        .then(|| candidate.to_string())
}

fn clean(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == UNAVAILABLE {
        None
    } else {
        Some(value.to_string())
    }
}

/// Chemical and toxicological attributes of one compound, keyed by name.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ChemicalRecord {
    pub name: String,
    pub cas: Option<String>,
    pub formula: Option<String>,
    pub smiles: Option<String>,
    pub inchikey: Option<String>,
    pub pubchem: Option<String>,
    pub tox_score: Option<String>,
    pub tox_reliability: Option<String>,
    pub tox_endpoint: Option<String>,
    pub retention_time: Option<String>,
}

impl ChemicalRecord {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Map a raw metadata row, as produced by reading the curated metadata
    /// table, onto a record. Header names are matched after trimming, which
    /// also covers the endpoint column's stray trailing space.
    pub fn from_row(row: &IndexMap<String, String>) -> Self {
        let mut this = Self::default();
        for (key, value) in row.iter() {
            let value = clean(value);
            match key.trim() {
                "Name" => this.name = value.unwrap_or_default(),
                "CAS_RN" => this.cas = value,
                "Molecular Formula" => this.formula = value,
                "SMILES" => this.smiles = value,
                "StdInChIKey" => this.inchikey = value,
                "PubChem" => this.pubchem = value,
                "EFSA Tox Score" => this.tox_score = value,
                "Reliability of Tox Score" => this.tox_reliability = value,
                "Endpoint for basis of scoring" => {
                    if this.tox_endpoint.is_none() {
                        this.tox_endpoint = value
                    }
                }
                "Retention_time" => this.retention_time = value,
                _ => {}
            }
        }
        this
    }
}

/// One curated molecule. Identified by its position in the library.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceEntry {
    pub id: usize,
    pub name: String,
    #[serde(rename = "mgf_name")]
    pub source_name: String,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub formula: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub exact_mass: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub smiles: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub inchikey: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub cas: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub pubchem: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_score: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_reliability: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub tox_endpoint: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub retention_time: Option<String>,
    #[serde(rename = "ionmode", serialize_with = "serialize_or_unavailable")]
    pub ion_mode: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub instrument: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub activation: Option<String>,
    #[serde(serialize_with = "serialize_or_unavailable")]
    pub spectrum_quality: Option<String>,
    pub peak_count: usize,
    #[serde(skip)]
    pub spectrum: Spectrum,
}

impl ReferenceEntry {
    fn merge(id: usize, spectrum: Spectrum, record: Option<&ChemicalRecord>) -> Self {
        let owned = |v: Option<&str>| v.map(str::to_string);
        let from_record = |f: fn(&ChemicalRecord) -> &Option<String>| record.and_then(|r| f(r).clone());

        let source_name = spectrum
            .get("name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown_{id}"));
        let name = strip_adduct(&source_name);

        let cas = from_record(|r| &r.cas).or_else(|| spectrum.get("notes").and_then(cas_from_notes));

        Self {
            id,
            name,
            source_name,
            formula: from_record(|r| &r.formula).or_else(|| owned(spectrum.formula())),
            exact_mass: owned(spectrum.get_any(&["exactmass", "exact_mass"])),
            smiles: owned(spectrum.get("smiles")).or_else(|| from_record(|r| &r.smiles)),
            inchikey: owned(spectrum.get_any(&["inchi", "inchikey"]))
                .or_else(|| from_record(|r| &r.inchikey)),
            cas,
            pubchem: from_record(|r| &r.pubchem),
            tox_score: from_record(|r| &r.tox_score),
            tox_reliability: from_record(|r| &r.tox_reliability),
            tox_endpoint: from_record(|r| &r.tox_endpoint),
            retention_time: owned(spectrum.get("rtinseconds")),
            ion_mode: owned(spectrum.ion_mode()),
            instrument: owned(spectrum.get_any(&["source_instrument", "instrument"])),
            activation: owned(spectrum.get("activation")),
            spectrum_quality: owned(spectrum.get("libraryquality")),
            peak_count: spectrum.len(),
            spectrum,
        }
    }
}

/// The curated library, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ReferenceLibrary {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceLibrary {
    /// Merge parsed reference spectra with chemical records. Records are
    /// matched to spectra by case-insensitive name after the adduct suffix has
    /// been stripped from the spectrum's name.
    pub fn build<I>(spectra: Vec<Spectrum>, records: I) -> Self
    where
        I: IntoIterator<Item = ChemicalRecord>,
    {
        let records: HashMap<String, ChemicalRecord> = records
            .into_iter()
            .filter(|r| !r.name.trim().is_empty())
            .map(|r| (r.name.trim().to_lowercase(), r))
            .collect();

        let entries: Vec<ReferenceEntry> = spectra
            .into_iter()
            .enumerate()
            .map(|(i, spectrum)| {
                let key = spectrum
                    .get("name")
                    .map(|n| strip_adduct(n).to_lowercase())
                    .unwrap_or_default();
                let record = records.get(&key);
                if record.is_none() {
                    debug!("No chemical record for reference spectrum {i} ({key:?})");
                }
                ReferenceEntry::merge(i, spectrum, record)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReferenceEntry> {
        self.entries.iter()
    }

    pub fn entry(&self, id: usize) -> Result<&ReferenceEntry, SpectralError> {
        self.entries.get(id).ok_or(SpectralError::NotFound {
            id,
            size: self.entries.len(),
        })
    }

    pub fn spectrum(&self, id: usize) -> Result<&Spectrum, SpectralError> {
        self.entry(id).map(|e| &e.spectrum)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::Peak;
    use crate::testing::{chemical_records, reference_spectra};

    #[test]
    fn test_strip_adduct() {
        assert_eq!(strip_adduct("Caffeine [M+H]+"), "Caffeine");
        assert_eq!(strip_adduct("Bisphenol A [M-H]-"), "Bisphenol A");
        assert_eq!(strip_adduct("Thing [M+Na]"), "Thing");
        assert_eq!(strip_adduct("Plain name "), "Plain name");
        assert_eq!(strip_adduct("[M+H]+ prefix kept"), "[M+H]+ prefix kept");
    }

    #[test]
    fn test_cas_from_notes() {
        assert_eq!(cas_from_notes("ECRFS:12:1912-24-9"), Some("1912-24-9".into()));
        assert_eq!(cas_from_notes("ECRFS:12: 80-05-7 "), Some("80-05-7".into()));
        assert_eq!(cas_from_notes("ECRFS:12:unknown"), None);
        assert_eq!(cas_from_notes("only:two"), None);
    }

    #[test]
    fn test_merge() {
        let library = ReferenceLibrary::build(reference_spectra(), chemical_records());
        assert_eq!(library.len(), 12);

        let e0 = library.entry(0).unwrap();
        assert_eq!(e0.name, "Compound 0");
        assert_eq!(e0.source_name, "Compound 0 [M+H]+");
        assert_eq!(e0.formula.as_deref(), Some("C1H10"));
        assert_eq!(e0.tox_endpoint.as_deref(), Some("NOAEL"));
        assert_eq!(e0.cas.as_deref(), Some("50-00-0"));
        assert_eq!(e0.peak_count, 5);

        let e4 = library.entry(4).unwrap();
        assert_eq!(e4.cas.as_deref(), Some("58-08-2"));

        let e1 = library.entry(1).unwrap();
        assert_eq!(e1.formula, None);
        assert_eq!(e1.tox_score, None);
        assert_eq!(e1.cas.as_deref(), Some("50-00-1"));
    }

    #[test]
    fn test_unavailable_rendering() {
        let library = ReferenceLibrary::build(reference_spectra(), chemical_records());
        let value = serde_json::to_value(library.entry(1).unwrap()).unwrap();
        assert_eq!(value["formula"], "N/A");
        assert_eq!(value["tox_score"], "N/A");
        assert_eq!(value["mgf_name"], "Compound 1 [M+H]+");
        assert_eq!(value["ionmode"], "Positive");
        assert!(value.get("spectrum").is_none());
    }

    #[test]
    fn test_not_found() {
        let library = ReferenceLibrary::build(reference_spectra(), vec![]);
        match library.entry(99) {
            Err(SpectralError::NotFound { id: 99, size: 12 }) => {}
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_unnamed_spectrum() {
        let library = ReferenceLibrary::build(vec![Spectrum::new(vec![Peak::new(1.0, 1.0)])], vec![]);
        assert_eq!(library.entry(0).unwrap().name, "Unknown_0");
    }

    #[test]
    fn test_record_from_row() {
        let mut row = IndexMap::new();
        row.insert(" Name ".to_string(), "Atrazine".to_string());
        row.insert("EFSA Tox Score".to_string(), " N/A ".to_string());
        row.insert("Endpoint for basis of scoring ".to_string(), "ADI".to_string());
        row.insert("PubChem".to_string(), "2256".to_string());
        let record = ChemicalRecord::from_row(&row);
        assert_eq!(record.name, "Atrazine");
        assert_eq!(record.tox_score, None);
        assert_eq!(record.tox_endpoint.as_deref(), Some("ADI"));
        assert_eq!(record.pubchem.as_deref(), Some("2256"));
    }
}
