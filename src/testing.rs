//! Deterministic fixtures shared by the unit tests.
use indexmap::IndexMap;

use crate::embedding::{peak_token, EmbeddingSpace, EMBEDDING_DIM};
use crate::library::ChemicalRecord;
use crate::spectrum::{Peak, Spectrum};

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// A space of dimension [`EMBEDDING_DIM`] with one pseudo-random vector per
/// m/z value, seeded by position so repeated calls agree.
pub fn synthetic_space<I: IntoIterator<Item = f64>>(mzs: I) -> EmbeddingSpace {
    let mut space = EmbeddingSpace::new(EMBEDDING_DIM);
    for (i, mz) in mzs.into_iter().enumerate() {
        let mut state = (i as u64 + 1).wrapping_mul(0x2545F4914F6CDD1D);
        let vector = (0..EMBEDDING_DIM)
            .map(|_| ((splitmix64(&mut state) >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0)
            .collect();
        space.insert(peak_token(mz), vector).unwrap();
    }
    space
}

pub fn vocabulary_mz(j: usize) -> f64 {
    50.0 + 7.25 * j as f64
}

pub const VOCABULARY_SIZE: usize = 60;

pub fn fixture_space() -> EmbeddingSpace {
    synthetic_space((0..VOCABULARY_SIZE).map(vocabulary_mz))
}

pub const N_REFERENCE: usize = 12;

/// Peaks of reference spectrum `i`, all drawn from the fixture vocabulary.
pub fn reference_peaks(i: usize) -> Vec<Peak> {
    let slots = [i, i + 3, i + 7, i + 11, (i * 5 + 1) % VOCABULARY_SIZE];
    slots
        .iter()
        .enumerate()
        .map(|(k, j)| Peak::new(vocabulary_mz(*j % VOCABULARY_SIZE), 10.0 + (k * 17 + i * 3) as f64))
        .collect()
}

/// Twelve reference spectra. Entry 10 declares only an exact mass and entry
/// 11 declares no precursor information at all.
pub fn reference_spectra() -> Vec<Spectrum> {
    (0..N_REFERENCE)
        .map(|i| {
            let mut spec = Spectrum::new(reference_peaks(i))
                .with_metadata("NAME", format!("Compound {i} [M+H]+"))
                .with_metadata("IONMODE", "Positive")
                .with_metadata("NOTES", format!("ECRFS:{i}:50-00-{}", i % 10));
            match i {
                10 => spec.set("EXACTMASS", "399.0"),
                11 => {}
                _ => spec.set("PEPMASS", format!("{}", 300.0 + 10.0 * i as f64)),
            }
            spec
        })
        .collect()
}

pub fn chemical_records() -> Vec<ChemicalRecord> {
    (0..N_REFERENCE)
        .filter(|i| i % 2 == 0)
        .map(|i| {
            let mut row = IndexMap::new();
            row.insert("Name".to_string(), format!("compound {i}"));
            row.insert("Molecular Formula".to_string(), format!("C{}H10", i + 1));
            row.insert("EFSA Tox Score".to_string(), format!("{}", i % 4));
            row.insert("Endpoint for basis of scoring ".to_string(), "NOAEL".to_string());
            if i == 4 {
                row.insert("CAS_RN".to_string(), "58-08-2".to_string());
            }
            ChemicalRecord::from_row(&row)
        })
        .collect()
}
