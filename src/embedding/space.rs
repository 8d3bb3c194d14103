use std::collections::HashMap;
use std::io::{self, prelude::*};
use std::path;

use log::{debug, info};
use thiserror::Error;

use crate::io::open_maybe_gzipped;

/// The dimension of the pretrained spectral word vectors.
pub const EMBEDDING_DIM: usize = 300;

/// The vocabulary token for a peak: its m/z rounded to two decimal places.
#[inline]
pub fn peak_token(mz: f64) -> String {
    format!("peak@{mz:.2}")
}

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Malformed embedding space header: {0:?}")]
    MalformedHeader(String),
    #[error("Token {token} has {found} components, expected {expected}")]
    DimensionMismatch {
        token: String,
        expected: usize,
        found: usize,
    },
    #[error("Malformed vector on line {0}")]
    MalformedVector(usize),
    #[error("Expected {expected} vectors, read {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Encountered an IO error: {0}")]
    IOError(#[from] io::Error),
}

/// A fixed, read-only mapping from peak tokens to dense vectors.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingSpace {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl EmbeddingSpace {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.vectors.contains_key(token)
    }

    pub fn get(&self, token: &str) -> Option<&[f32]> {
        self.vectors.get(token).map(|v| v.as_slice())
    }

    pub fn insert<S: Into<String>>(&mut self, token: S, vector: Vec<f32>) -> Result<(), SpaceError> {
        let token = token.into();
        if vector.len() != self.dim {
            return Err(SpaceError::DimensionMismatch {
                token,
                expected: self.dim,
                found: vector.len(),
            });
        }
        self.vectors.insert(token, vector);
        Ok(())
    }

    /// Read the word2vec text format: a `<count> <dim>` header followed by one
    /// `token v1 .. vdim` line per vector.
    pub fn read_word2vec_text<R: BufRead>(handle: R) -> Result<Self, SpaceError> {
        let mut lines = handle.lines();
        let header = lines
            .next()
            .ok_or_else(|| SpaceError::MalformedHeader(String::new()))??;
        let mut parts = header.split_ascii_whitespace().map(|p| p.parse::<usize>());
        let (count, dim) = match (parts.next(), parts.next()) {
            (Some(Ok(count)), Some(Ok(dim))) => (count, dim),
            _ => return Err(SpaceError::MalformedHeader(header)),
        };

        let mut this = Self::new(dim);
        this.vectors.reserve(count);
        for (i, line) in lines.enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_ascii_whitespace();
            let token = tokens.next().ok_or(SpaceError::MalformedVector(i + 2))?;
            let vector = tokens
                .map(|t| t.parse::<f32>())
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|_| SpaceError::MalformedVector(i + 2))?;
            this.insert(token, vector)?;
        }
        if this.len() < count {
            return Err(SpaceError::Truncated {
                expected: count,
                found: this.len(),
            });
        }
        debug!("Read {} vectors of dimension {}", this.len(), this.dim);
        Ok(this)
    }

    pub fn from_path<P: AsRef<path::Path>>(path: P) -> Result<Self, SpaceError> {
        let handle = open_maybe_gzipped(path.as_ref())?;
        let this = Self::read_word2vec_text(handle)?;
        info!(
            "Loaded embedding space with {} tokens from {}",
            this.len(),
            path.as_ref().display()
        );
        Ok(this)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_peak_token() {
        assert_eq!(peak_token(110.0713), "peak@110.07");
        assert_eq!(peak_token(42.0), "peak@42.00");
        assert_eq!(peak_token(195.0877), "peak@195.09");
    }

    #[test]
    fn test_read_text() {
        let text = "2 3\npeak@100.00 1 0 0\npeak@101.50 0 0.5 0.5\n";
        let space = EmbeddingSpace::read_word2vec_text(io::Cursor::new(text)).unwrap();
        assert_eq!(space.dim(), 3);
        assert_eq!(space.len(), 2);
        assert_eq!(space.get("peak@101.50"), Some(&[0.0f32, 0.5, 0.5][..]));
        assert!(!space.contains("peak@102.00"));
    }

    #[test]
    fn test_read_text_errors() {
        let bad_dim = "1 3\npeak@100.00 1 0\n";
        assert!(matches!(
            EmbeddingSpace::read_word2vec_text(io::Cursor::new(bad_dim)),
            Err(SpaceError::DimensionMismatch { expected: 3, found: 2, .. })
        ));
        let truncated = "2 1\npeak@100.00 1\n";
        assert!(matches!(
            EmbeddingSpace::read_word2vec_text(io::Cursor::new(truncated)),
            Err(SpaceError::Truncated { expected: 2, found: 1 })
        ));
        assert!(matches!(
            EmbeddingSpace::read_word2vec_text(io::Cursor::new("vectors\n")),
            Err(SpaceError::MalformedHeader(_))
        ));
    }
}
