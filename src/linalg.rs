//! Complex dense matrices and the small eigen/SVD kernels the decompositions run on rank 0.
//!
//! All solvers return spectra sorted in descending order. Eigenvector columns are
//! phase-normalised so the largest-magnitude entry is real, keeping its sign.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex64;

use crate::error::{ModalError, Result};

pub type CMatrix = DMatrix<Complex64>;
pub type CVector = DVector<Complex64>;

const ONE: Complex64 = Complex64::new(1.0, 0.0);
/// Eigenvector bases worse conditioned than this are treated as defective.
const MAX_EIGVEC_CONDITION: f64 = 1e12;

pub fn to_complex(m: &DMatrix<f64>) -> CMatrix {
    m.map(|value| Complex64::new(value, 0.0))
}

pub fn real_part(m: &CMatrix) -> DMatrix<f64> {
    m.map(|value| value.re)
}

pub fn ensure_square(m: &CMatrix, what: &str) -> Result<()> {
    if m.nrows() != m.ncols() {
        return Err(ModalError::shape(format!(
            "{what} must be square, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    Ok(())
}

/// `diag(factors) * m`
pub fn scale_rows(m: &CMatrix, factors: &[f64]) -> CMatrix {
    let mut scaled = m.clone();
    for (i, factor) in factors.iter().enumerate() {
        scaled.row_mut(i).scale_mut(*factor);
    }
    scaled
}

/// `m * diag(factors)`
pub fn scale_columns(m: &CMatrix, factors: &[f64]) -> CMatrix {
    let mut scaled = m.clone();
    for (j, factor) in factors.iter().enumerate() {
        scaled.column_mut(j).scale_mut(*factor);
    }
    scaled
}

pub fn scale_columns_complex(m: &CMatrix, factors: &CVector) -> CMatrix {
    let mut scaled = m.clone();
    for (j, factor) in factors.iter().enumerate() {
        let mut column = scaled.column_mut(j);
        column *= *factor;
    }
    scaled
}

pub fn powers(values: &DVector<f64>, exponent: f64) -> Vec<f64> {
    values.iter().map(|v| v.powf(exponent)).collect()
}

/// Rescales each column so its largest-magnitude entry lies on the real axis.
///
/// The entry keeps the sign of its real part, so real inputs are left unchanged.
pub fn normalize_phase(m: &mut CMatrix) {
    for mut column in m.column_iter_mut() {
        let factor = phase_factor(column.iter());
        column *= factor;
    }
}

fn phase_factor<'a>(entries: impl Iterator<Item = &'a Complex64>) -> Complex64 {
    let pivot = entries
        .copied()
        .max_by(|a, b| a.norm().partial_cmp(&b.norm()).unwrap_or(Ordering::Equal));
    match pivot {
        Some(pivot) if pivot.norm() > 0.0 => {
            let factor = Complex64::new(pivot.norm(), 0.0) / pivot;
            if pivot.re >= 0.0 {
                factor
            } else {
                -factor
            }
        }
        _ => ONE,
    }
}

fn descending_order(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));
    order
}

#[derive(Debug, Clone)]
pub struct HermitianEigen {
    pub eigvals: DVector<f64>,
    pub eigvecs: CMatrix,
}

impl HermitianEigen {
    pub fn select(&self, keep: &[usize]) -> Self {
        Self {
            eigvals: self.eigvals.select_rows(keep.iter()),
            eigvecs: self.eigvecs.select_columns(keep.iter()),
        }
    }
}

/// Eigendecomposition of a Hermitian matrix, eigenvalues descending.
pub fn eigh(m: &CMatrix) -> Result<HermitianEigen> {
    ensure_square(m, "hermitian eigen input")?;
    let eigen = SymmetricEigen::try_new(m.clone(), f64::EPSILON, 0)
        .ok_or_else(|| ModalError::numerical("hermitian eigensolver did not converge"))?;
    let values: Vec<f64> = eigen.eigenvalues.iter().copied().collect();
    let order = descending_order(&values);
    let mut eigvecs = eigen.eigenvectors.select_columns(order.iter());
    normalize_phase(&mut eigvecs);
    Ok(HermitianEigen {
        eigvals: DVector::from_iterator(order.len(), order.iter().map(|&i| values[i])),
        eigvecs,
    })
}

#[derive(Debug, Clone)]
pub struct SingularDecomp {
    pub u: CMatrix,
    pub singular_values: DVector<f64>,
    pub v: CMatrix,
}

impl SingularDecomp {
    pub fn select(&self, keep: &[usize]) -> Self {
        Self {
            u: self.u.select_columns(keep.iter()),
            singular_values: self.singular_values.select_rows(keep.iter()),
            v: self.v.select_columns(keep.iter()),
        }
    }
}

/// Thin SVD `m = U diag(s) V^H`, singular values descending.
pub fn svd(m: &CMatrix) -> Result<SingularDecomp> {
    let decomp = m
        .clone()
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| ModalError::numerical("SVD did not converge"))?;
    let (Some(u), Some(v_t)) = (decomp.u, decomp.v_t) else {
        return Err(ModalError::numerical("SVD returned no singular vectors"));
    };
    let values: Vec<f64> = decomp.singular_values.iter().copied().collect();
    let order = descending_order(&values);
    let mut u = u.select_columns(order.iter());
    let mut v = v_t.adjoint().select_columns(order.iter());
    // Phase follows V so right singular vectors match Hermitian eigenvectors of m^H m.
    for j in 0..order.len() {
        let factor = phase_factor(v.column(j).iter());
        let mut left = u.column_mut(j);
        left *= factor;
        let mut right = v.column_mut(j);
        right *= factor;
    }
    Ok(SingularDecomp {
        u,
        singular_values: DVector::from_iterator(order.len(), order.iter().map(|&i| values[i])),
        v,
    })
}

/// Eigenpairs of a general matrix with left vectors scaled so `L^H R = I`.
#[derive(Debug, Clone)]
pub struct BiorthogonalEigen {
    pub eigvals: CVector,
    /// Unit-norm right eigenvectors as columns.
    pub right: CMatrix,
    pub left: CMatrix,
}

/// Eigendecomposition of a general square matrix.
///
/// Eigenvalues come from a complex Schur factorisation `m = Q T Q^H` and are
/// sorted by magnitude, a conjugate pair listing its positive-imaginary member
/// first. Right eigenvectors are back-substituted from `T` and mapped through
/// `Q`, so repeated eigenvalues of a diagonalisable matrix keep independent
/// vectors. A defective matrix is reported as a numerical failure.
pub fn eig_biorthog(m: &CMatrix) -> Result<BiorthogonalEigen> {
    ensure_square(m, "eigen input")?;
    let n = m.nrows();
    if n == 0 {
        return Ok(BiorthogonalEigen {
            eigvals: CVector::zeros(0),
            right: CMatrix::zeros(0, 0),
            left: CMatrix::zeros(0, 0),
        });
    }
    let schur = m
        .clone()
        .try_schur(f64::EPSILON, 0)
        .ok_or_else(|| ModalError::numerical("Schur factorisation did not converge"))?;
    let (q, t) = schur.unpack();
    ensure_triangular(&t)?;

    let diagonal: Vec<Complex64> = t.diagonal().iter().copied().collect();
    let order = magnitude_order(&diagonal);
    let mut right = CMatrix::zeros(n, n);
    for (column, &k) in order.iter().enumerate() {
        let mut vector = &q * triangular_eigenvector(&t, k);
        let norm = vector.norm();
        if !norm.is_finite() || norm == 0.0 {
            return Err(ModalError::numerical(format!(
                "eigenvector for eigenvalue {} is not finite",
                diagonal[k]
            )));
        }
        vector.unscale_mut(norm);
        right.column_mut(column).copy_from(&vector);
    }
    normalize_phase(&mut right);

    let inverse = right.clone().try_inverse().ok_or_else(|| {
        ModalError::numerical("eigenvectors are linearly dependent; the operator is defective")
    })?;
    let left = inverse.adjoint();
    if !left.iter().all(|v| v.re.is_finite() && v.im.is_finite()) {
        return Err(ModalError::numerical("left eigenvectors are not finite"));
    }
    let condition = right.norm() * left.norm();
    if condition > MAX_EIGVEC_CONDITION {
        return Err(ModalError::numerical(format!(
            "eigenvector basis has condition {condition:.3e}; the operator is defective"
        )));
    }
    Ok(BiorthogonalEigen {
        eigvals: CVector::from_iterator(n, order.iter().map(|&k| diagonal[k])),
        right,
        left,
    })
}

fn ensure_triangular(t: &CMatrix) -> Result<()> {
    let negligible = f64::EPSILON * t.norm().max(1.0);
    for i in 1..t.nrows() {
        if t[(i, i - 1)].norm() > negligible {
            return Err(ModalError::numerical(format!(
                "Schur factor left an unsplit block at row {i}"
            )));
        }
    }
    Ok(())
}

/// Indices of `eigvals` by descending magnitude.
///
/// Within a run of equal magnitudes, conjugate pairs sit next to each other with
/// the positive-imaginary member first; repeated pairs alternate.
fn magnitude_order(eigvals: &[Complex64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..eigvals.len()).collect();
    order.sort_by(|&a, &b| {
        eigvals[b]
            .norm()
            .partial_cmp(&eigvals[a].norm())
            .unwrap_or(Ordering::Equal)
    });
    let scale = order.first().map_or(1.0, |&k| eigvals[k].norm().max(1.0));
    let tol = 1e-12 * scale;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len()
            && eigvals[order[end - 1]].norm() - eigvals[order[end]].norm() <= tol
        {
            end += 1;
        }
        pair_conjugates(&mut order[start..end], eigvals, tol);
        start = end;
    }
    order
}

fn pair_conjugates(run: &mut [usize], eigvals: &[Complex64], tol: f64) {
    if run.len() < 2 {
        return;
    }
    let mut remaining = run.to_vec();
    remaining.sort_by(|&a, &b| {
        eigvals[b]
            .im
            .partial_cmp(&eigvals[a].im)
            .unwrap_or(Ordering::Equal)
    });
    let mut paired = Vec::with_capacity(run.len());
    while !remaining.is_empty() {
        let first = remaining.remove(0);
        paired.push(first);
        let value = eigvals[first];
        if value.im <= tol {
            continue;
        }
        let partner = remaining
            .iter()
            .position(|&k| eigvals[k].im < -tol && (eigvals[k] - value.conj()).norm() <= tol);
        if let Some(position) = partner {
            paired.push(remaining.remove(position));
        }
    }
    run.copy_from_slice(&paired);
}

/// Eigenvector of upper-triangular `t` for its `k`-th diagonal entry.
///
/// Solves `(T[..k, ..k] - t_kk) x = -T[..k, k]` with `x_k = 1`. Near-zero pivots
/// are replaced by a floor relative to `t_kk`, so an equal diagonal entry with
/// no coupling contributes nothing instead of dividing by zero.
fn triangular_eigenvector(t: &CMatrix, k: usize) -> CVector {
    let n = t.nrows();
    let lambda = t[(k, k)];
    let floor = (f64::EPSILON * lambda.norm()).max(f64::MIN_POSITIVE.sqrt());
    let mut x = CVector::zeros(n);
    x[k] = ONE;
    for i in (0..k).rev() {
        let mut rhs = -t[(i, k)];
        for j in i + 1..k {
            rhs -= t[(i, j)] * x[j];
        }
        let mut pivot = t[(i, i)] - lambda;
        if pivot.norm() < floor {
            pivot = Complex64::new(floor, 0.0);
        }
        x[i] = rhs / pivot;
    }
    x
}
