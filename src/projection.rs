//! A three component principal component projection of embedding space,
//! fitted once over the reference library.
use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::Serialize;
use thiserror::Error;

use crate::embedding::Embedding;

pub const N_COMPONENTS: usize = 3;

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("Cannot fit a projection without any vectors")]
    Empty,
    #[error("Cannot fit {N_COMPONENTS} components in a {0} dimensional space")]
    TooFewDimensions(usize),
    #[error("Expected vectors of dimension {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// A point in the shared projected frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<[f64; 3]> for Point3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }
}

/// A projected query, carrying a caller supplied label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPoint {
    pub label: String,
    #[serde(flatten)]
    pub point: Point3,
}

#[derive(Debug, Clone)]
pub struct ProjectionModel {
    mean: DVector<f64>,
    /// One principal axis per row, ordered by decreasing explained variance.
    components: DMatrix<f64>,
    explained_variance: Vec<f64>,
}

impl ProjectionModel {
    /// Fit the principal axes of `vectors`.
    ///
    /// The covariance matrix of the centred data is decomposed with
    /// [`SymmetricEigen`]. Each axis' sign is fixed so its largest magnitude
    /// loading is positive, making repeated fits over the same data agree.
    pub fn fit(vectors: &[Embedding]) -> Result<Self, ProjectionError> {
        let n = vectors.len();
        let dim = vectors.first().ok_or(ProjectionError::Empty)?.dim();
        if dim < N_COMPONENTS {
            return Err(ProjectionError::TooFewDimensions(dim));
        }
        if let Some(bad) = vectors.iter().find(|v| v.dim() != dim) {
            return Err(ProjectionError::DimensionMismatch {
                expected: dim,
                found: bad.dim(),
            });
        }

        let data = DMatrix::from_fn(n, dim, |i, j| vectors[i][j]);
        let mean = DVector::from_fn(dim, |j, _| data.column(j).mean());
        let mean_row = mean.transpose();
        let mut centered = data;
        for mut row in centered.row_iter_mut() {
            row -= &mean_row;
        }
        let covariance = (centered.transpose() * &centered) / (n.saturating_sub(1).max(1) as f64);

        let eigen = SymmetricEigen::new(covariance);
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));

        let mut components = DMatrix::zeros(N_COMPONENTS, dim);
        let mut explained_variance = Vec::with_capacity(N_COMPONENTS);
        for (k, idx) in order.iter().take(N_COMPONENTS).enumerate() {
            let mut axis = eigen.eigenvectors.column(*idx).into_owned();
            let pivot = axis.iamax();
            if axis[pivot] < 0.0 {
                axis.neg_mut();
            }
            components.set_row(k, &axis.transpose());
            explained_variance.push(eigen.eigenvalues[*idx].max(0.0));
        }
        debug!("Fitted projection over {n} vectors, explained variance {explained_variance:?}");

        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn explained_variance(&self) -> &[f64] {
        &self.explained_variance
    }

    pub fn transform(&self, vector: &[f64]) -> Result<Point3, ProjectionError> {
        if vector.len() != self.dim() {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.dim(),
                found: vector.len(),
            });
        }
        let centered = DVector::from_column_slice(vector) - &self.mean;
        let coords = &self.components * centered;
        Ok(Point3::from([coords[0], coords[1], coords[2]]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn line_cloud() -> Vec<Embedding> {
        // Points spread mostly along (1, 1, 0, 0), a little along (0, 0, 1, 0).
        (0..10)
            .map(|i| {
                let t = i as f64 - 4.5;
                let wobble = if i % 2 == 0 { 0.1 } else { -0.1 };
                Embedding::from(vec![t, t, wobble, 0.0])
            })
            .collect()
    }

    #[test]
    fn test_fit_orders_axes() {
        let model = ProjectionModel::fit(&line_cloud()).unwrap();
        let var = model.explained_variance();
        assert_eq!(var.len(), 3);
        assert!(var[0] >= var[1] && var[1] >= var[2]);

        let p = model.transform(&[4.5, 4.5, 0.0, 0.0]).unwrap();
        assert!((p.x - 4.5 * 2f64.sqrt()).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = ProjectionModel::fit(&line_cloud()).unwrap();
        let mut reversed = line_cloud();
        reversed.reverse();
        let b = ProjectionModel::fit(&reversed).unwrap();
        let pa = a.transform(&[1.0, 2.0, 0.5, 0.0]).unwrap();
        let pb = b.transform(&[1.0, 2.0, 0.5, 0.0]).unwrap();
        assert!((pa.x - pb.x).abs() < 1e-9);
        assert!((pa.y - pb.y).abs() < 1e-9);
    }

    #[test]
    fn test_errors() {
        assert_eq!(ProjectionModel::fit(&[]).unwrap_err(), ProjectionError::Empty);
        assert_eq!(
            ProjectionModel::fit(&[Embedding::from(vec![1.0, 0.0])]).unwrap_err(),
            ProjectionError::TooFewDimensions(2)
        );
        let model = ProjectionModel::fit(&line_cloud()).unwrap();
        assert!(matches!(
            model.transform(&[1.0]),
            Err(ProjectionError::DimensionMismatch { expected: 4, found: 1 })
        ));
    }
}
