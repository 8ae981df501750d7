use nalgebra::Cholesky;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{ModalError, Result};
use crate::linalg::{scale_rows, CMatrix, CVector};
use crate::vectors::{InnerProduct, Vector};

/// A snapshot held as a dense complex column.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayVector(pub CVector);

impl ArrayVector {
    pub fn from_real(values: &[f64]) -> Self {
        Self(CVector::from_iterator(
            values.len(),
            values.iter().map(|v| Complex64::new(*v, 0.0)),
        ))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits the columns of `data` into one vector each.
    pub fn columns_of(data: &CMatrix) -> Vec<Self> {
        data.column_iter()
            .map(|column| Self(column.into_owned()))
            .collect()
    }
}

impl Vector for ArrayVector {
    const AXPY_IN_PLACE: bool = true;

    fn scale(&mut self, factor: Complex64) {
        self.0 *= factor;
    }

    fn add_assign(&mut self, other: &Self) {
        self.0 += &other.0;
    }

    fn axpy(&mut self, factor: Complex64, other: &Self) {
        self.0.axpy(factor, &other.0, Complex64::new(1.0, 0.0));
    }
}

/// The weight matrix `W` of `<a, b> = a^H W b`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum InnerProductWeights {
    #[default]
    Identity,
    /// Positive entries of a diagonal `W`.
    Diagonal(Vec<f64>),
    /// A Hermitian positive definite `W`, row-major `(re, im)` pairs.
    Full { dim: usize, entries: Vec<(f64, f64)> },
}

impl InnerProductWeights {
    pub fn full(weights: &CMatrix) -> Result<Self> {
        if weights.nrows() != weights.ncols() {
            return Err(ModalError::shape("full weight matrix must be square"));
        }
        let dim = weights.nrows();
        let entries = (0..dim)
            .flat_map(|i| (0..dim).map(move |j| (i, j)))
            .map(|(i, j)| (weights[(i, j)].re, weights[(i, j)].im))
            .collect();
        Ok(Self::Full { dim, entries })
    }

    /// Dense `W` for vectors of length `dim`.
    pub fn matrix(&self, dim: usize) -> Result<CMatrix> {
        match self {
            Self::Identity => Ok(CMatrix::identity(dim, dim)),
            Self::Diagonal(weights) => {
                self.check_dim(weights.len(), dim)?;
                let mut w = CMatrix::zeros(dim, dim);
                for (i, weight) in weights.iter().enumerate() {
                    w[(i, i)] = Complex64::new(*weight, 0.0);
                }
                Ok(w)
            }
            Self::Full { dim: n, entries } => {
                self.check_dim(*n, dim)?;
                if entries.len() != n * n {
                    return Err(ModalError::shape(format!(
                        "full weights of dimension {n} need {} entries, got {}",
                        n * n,
                        entries.len()
                    )));
                }
                Ok(CMatrix::from_row_iterator(
                    dim,
                    dim,
                    entries.iter().map(|(re, im)| Complex64::new(*re, *im)),
                ))
            }
        }
    }

    /// `A^H W B` for data matrices whose columns are vectors.
    pub fn gram(&self, a: &CMatrix, b: &CMatrix) -> Result<CMatrix> {
        if a.nrows() != b.nrows() {
            return Err(ModalError::shape(format!(
                "vectors have {} and {} entries",
                a.nrows(),
                b.nrows()
            )));
        }
        match self {
            Self::Identity => Ok(a.adjoint() * b),
            Self::Diagonal(weights) => {
                self.check_dim(weights.len(), a.nrows())?;
                Ok(a.adjoint() * scale_rows(b, weights))
            }
            Self::Full { .. } => Ok(a.adjoint() * self.matrix(a.nrows())? * b),
        }
    }

    /// `S * data` with `S^H S = W`.
    pub fn apply_sqrt(&self, data: &CMatrix) -> Result<CMatrix> {
        match self {
            Self::Identity => Ok(data.clone()),
            Self::Diagonal(weights) => {
                self.check_dim(weights.len(), data.nrows())?;
                let roots: Vec<f64> = weights.iter().map(|w| w.sqrt()).collect();
                Ok(scale_rows(data, &roots))
            }
            Self::Full { .. } => {
                let w = self.matrix(data.nrows())?;
                let cholesky = Cholesky::new(w).ok_or_else(|| {
                    ModalError::numerical("weight matrix is not positive definite")
                })?;
                Ok(cholesky.l().adjoint() * data)
            }
        }
    }

    fn check_dim(&self, have: usize, want: usize) -> Result<()> {
        if have != want {
            return Err(ModalError::shape(format!(
                "weights cover {have} entries but vectors have {want}"
            )));
        }
        Ok(())
    }
}

/// `<a, b> = a^H W b` over [`ArrayVector`]s.
#[derive(Debug, Clone, Default)]
pub struct WeightedInnerProduct {
    weights: InnerProductWeights,
    dense: Option<CMatrix>,
}

impl WeightedInnerProduct {
    pub fn new(weights: InnerProductWeights) -> Result<Self> {
        let dense = match &weights {
            InnerProductWeights::Full { dim, .. } => Some(weights.matrix(*dim)?),
            _ => None,
        };
        Ok(Self { weights, dense })
    }

    pub fn weights(&self) -> &InnerProductWeights {
        &self.weights
    }
}

impl InnerProduct<ArrayVector> for WeightedInnerProduct {
    fn inner(&self, a: &ArrayVector, b: &ArrayVector) -> Result<Complex64> {
        if a.len() != b.len() {
            return Err(ModalError::shape(format!(
                "inner product of vectors with {} and {} entries",
                a.len(),
                b.len()
            )));
        }
        match (&self.weights, &self.dense) {
            (InnerProductWeights::Diagonal(weights), _) => {
                self.weights.check_dim(weights.len(), a.len())?;
                Ok(a.0
                    .iter()
                    .zip(b.0.iter())
                    .zip(weights.iter())
                    .map(|((x, y), w)| x.conj() * y * *w)
                    .sum())
            }
            (_, Some(w)) => {
                self.weights.check_dim(w.nrows(), a.len())?;
                Ok(a.0.dotc(&(w * &b.0)))
            }
            _ => Ok(a.0.dotc(&b.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_weights() -> CMatrix {
        let base = CMatrix::from_fn(3, 3, |i, j| Complex64::new((i + j) as f64 * 0.3, 0.1 * i as f64));
        base.adjoint() * &base + CMatrix::identity(3, 3)
    }

    #[test]
    fn inner_product_is_conjugate_linear_in_first_argument() {
        let ip = WeightedInnerProduct::default();
        let a = ArrayVector(CVector::from_vec(vec![Complex64::new(0.0, 1.0), Complex64::new(2.0, 0.0)]));
        let b = ArrayVector::from_real(&[1.0, 1.0]);
        let value = ip.inner(&a, &b).expect("inner");
        assert_eq!(value, Complex64::new(2.0, -1.0));
        let swapped = ip.inner(&b, &a).expect("inner");
        assert_eq!(swapped, value.conj());
    }

    #[test]
    fn sqrt_weights_reproduce_the_gram_matrix() {
        let data = CMatrix::from_fn(3, 2, |i, j| Complex64::new(i as f64 - j as f64, 0.5 * j as f64));
        for weights in [
            InnerProductWeights::Identity,
            InnerProductWeights::Diagonal(vec![0.5, 2.0, 1.5]),
            InnerProductWeights::full(&spd_weights()).expect("weights"),
        ] {
            let gram = weights.gram(&data, &data).expect("gram");
            let root = weights.apply_sqrt(&data).expect("sqrt");
            assert_relative_eq!((root.adjoint() * root - &gram).norm(), 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn weighted_inner_product_matches_gram() {
        let weights = InnerProductWeights::full(&spd_weights()).expect("weights");
        let ip = WeightedInnerProduct::new(weights.clone()).expect("ip");
        let data = CMatrix::from_fn(3, 2, |i, j| Complex64::new(1.0 + i as f64, j as f64));
        let vecs = ArrayVector::columns_of(&data);
        let gram = weights.gram(&data, &data).expect("gram");
        let value = ip.inner(&vecs[0], &vecs[1]).expect("inner");
        assert_relative_eq!((value - gram[(0, 1)]).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let ip = WeightedInnerProduct::new(InnerProductWeights::Diagonal(vec![1.0, 1.0])).expect("ip");
        let a = ArrayVector::from_real(&[1.0, 2.0, 3.0]);
        assert!(matches!(ip.inner(&a, &a), Err(ModalError::ShapeMismatch(_))));
    }

    #[test]
    fn malformed_full_weights_are_a_shape_error() {
        let weights: InnerProductWeights =
            serde_json::from_str(r#"{"Full":{"dim":2,"entries":[[1.0,0.0],[0.0,0.0],[2.0,0.0]]}}"#)
                .expect("well-formed json");
        assert!(matches!(weights.matrix(2), Err(ModalError::ShapeMismatch(_))));
        assert!(matches!(
            WeightedInnerProduct::new(weights),
            Err(ModalError::ShapeMismatch(_))
        ));
    }
}
