use std::ops::Deref;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::space::{peak_token, EmbeddingSpace};
use crate::spectrum::{Peak, Spectrum};
use crate::vector::{dot, l2_norm, normalize_in_place};

/// The exponent applied to relative peak intensity when weighting token vectors.
pub const INTENSITY_POWER: f64 = 0.5;

/// A spectrum's position in the embedding space. Always either unit length or
/// exactly zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn zeros(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    pub fn norm(&self) -> f64 {
        l2_norm(&self.0)
    }

    /// Cosine similarity, valid because both sides are pre-normalized.
    pub fn cosine(&self, other: &Embedding) -> f64 {
        dot(&self.0, &other.0)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.0.iter().map(|v| *v as f32).collect()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl Deref for Embedding {
    type Target = [f64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<f64>> for Embedding {
    fn from(value: Vec<f64>) -> Self {
        Self(value)
    }
}

/// Turns peak lists into [`Embedding`]s using a pretrained [`EmbeddingSpace`].
///
/// Each peak becomes the token of its m/z rounded to two decimals. Tokens the
/// space does not know are skipped. The remaining token vectors are averaged,
/// weighted by `(intensity / base peak intensity) ^ intensity_power`, and the
/// average scaled to unit length.
#[derive(Debug, Clone)]
pub struct EmbeddingGenerator {
    space: Arc<EmbeddingSpace>,
    intensity_power: f64,
}

impl EmbeddingGenerator {
    pub fn new(space: Arc<EmbeddingSpace>) -> Self {
        Self {
            space,
            intensity_power: INTENSITY_POWER,
        }
    }

    pub fn with_intensity_power(mut self, intensity_power: f64) -> Self {
        self.intensity_power = intensity_power;
        self
    }

    pub fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    pub fn dim(&self) -> usize {
        self.space.dim()
    }

    pub fn embed(&self, peaks: &[Peak]) -> Embedding {
        let dim = self.space.dim();
        if peaks.is_empty() {
            return Embedding::zeros(dim);
        }
        let base = peaks.iter().map(|p| p.intensity).fold(0.0, f64::max);
        let base = if base > 0.0 { base } else { 1.0 };

        let mut acc = vec![0.0f64; dim];
        let mut total_weight = 0.0;
        for peak in peaks {
            let Some(vector) = self.space.get(&peak_token(peak.mz)) else {
                continue;
            };
            let weight = (peak.intensity / base).powf(self.intensity_power);
            acc.iter_mut()
                .zip(vector)
                .for_each(|(a, v)| *a += weight * (*v as f64));
            total_weight += weight;
        }

        if total_weight > 0.0 {
            acc.iter_mut().for_each(|a| *a /= total_weight);
        }
        normalize_in_place(&mut acc);
        Embedding(acc)
    }

    pub fn embed_spectrum(&self, spectrum: &Spectrum) -> Embedding {
        self.embed(&spectrum.peaks)
    }

    /// Embed many spectra on the rayon pool, preserving input order.
    pub fn embed_batch(&self, spectra: &[Spectrum]) -> Vec<Embedding> {
        spectra
            .par_iter()
            .map(|s| self.embed_spectrum(s))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::synthetic_space;

    fn generator() -> EmbeddingGenerator {
        EmbeddingGenerator::new(Arc::new(synthetic_space([100.0, 150.0, 200.0, 250.0])))
    }

    #[test]
    fn test_unit_norm() {
        let gen = generator();
        let emb = gen.embed(&[
            Peak::new(100.001, 10.0),
            Peak::new(150.0, 100.0),
            Peak::new(999.0, 50.0),
        ]);
        assert_eq!(emb.dim(), 300);
        assert!((emb.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vectors() {
        let gen = generator();
        assert!(gen.embed(&[]).is_zero());
        let oov = gen.embed(&[Peak::new(12.34, 5.0), Peak::new(56.78, 1.0)]);
        assert!(oov.is_zero());
        assert_eq!(oov.dim(), 300);
    }

    #[test]
    fn test_deterministic() {
        let gen = generator();
        let peaks = [Peak::new(100.0, 3.0), Peak::new(200.0, 7.0), Peak::new(250.0, 1.0)];
        let a = gen.embed(&peaks);
        let b = gen.embed(&peaks);
        let bits_a: Vec<u64> = a.iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u64> = b.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn test_single_peak_is_token_direction() {
        let gen = generator();
        let emb = gen.embed(&[Peak::new(200.0, 42.0)]);
        let mut token: Vec<f64> = gen
            .space()
            .get("peak@200.00")
            .unwrap()
            .iter()
            .map(|v| *v as f64)
            .collect();
        normalize_in_place(&mut token);
        let sim = dot(emb.as_slice(), &token);
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_intensity_peaks_contribute_nothing() {
        let gen = generator();
        let only_base = gen.embed(&[Peak::new(100.0, 10.0)]);
        let with_zero = gen.embed(&[Peak::new(100.0, 10.0), Peak::new(150.0, 0.0)]);
        assert!((only_base.cosine(&with_zero) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_batch_preserves_order() {
        let gen = generator();
        let spectra = vec![
            Spectrum::new(vec![Peak::new(100.0, 1.0)]),
            Spectrum::new(vec![]),
            Spectrum::new(vec![Peak::new(250.0, 1.0)]),
        ];
        let batch = gen.embed_batch(&spectra);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], gen.embed_spectrum(&spectra[0]));
        assert!(batch[1].is_zero());
        assert_eq!(batch[2], gen.embed_spectrum(&spectra[2]));
    }
}
