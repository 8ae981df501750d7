//! In-memory POD, DMD and TLS-DMD over data matrices whose columns are snapshots.
//!
//! The snapshot methods build the correlation matrices explicitly. The direct
//! methods take a thin SVD of the weighted data matrix `S V` (with `S^H S = W`)
//! instead; they reproduce the same eigenvalues and, up to a per-column sign,
//! the same eigenvectors and modes.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::config::TruncationTolerance;
use crate::decomp::dmd::truncate;
use crate::decomp::mode_columns;
use crate::decomp::{DmdDecomp, PodDecomp, TlsDmdDecomp};
use crate::error::{ModalError, Result};
use crate::linalg::{powers, scale_columns, svd, CMatrix, HermitianEigen};
use crate::vectors::InnerProductWeights;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseOptions {
    pub weights: InnerProductWeights,
    pub tolerance: TruncationTolerance,
    pub max_num_eigvals: Option<usize>,
}

impl DenseOptions {
    pub fn with_weights(mut self, weights: InnerProductWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_tolerance(mut self, tolerance: TruncationTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_num_eigvals(mut self, max_num_eigvals: usize) -> Self {
        self.max_num_eigvals = Some(max_num_eigvals);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PodMatrices {
    pub modes: CMatrix,
    pub eigvals: DVector<f64>,
    pub eigvecs: CMatrix,
    pub proj_coeffs: CMatrix,
}

#[derive(Debug, Clone)]
pub struct DmdMatrices {
    pub exact_modes: CMatrix,
    pub proj_modes: CMatrix,
    pub adjoint_modes: CMatrix,
    pub spectral_coeffs: DVector<f64>,
    pub proj_coeffs: CMatrix,
    pub adv_proj_coeffs: CMatrix,
    pub decomp: DmdDecomp,
}

#[derive(Debug, Clone)]
pub struct TlsDmdMatrices {
    /// Modes and coefficients of the projected snapshot sets.
    pub dmd: DmdMatrices,
    pub decomp: TlsDmdDecomp,
}

pub fn compute_pod_matrices_snaps_method(
    data: &CMatrix,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<PodMatrices> {
    let correlation_mat = options.weights.gram(data, data)?;
    let decomp = PodDecomp::from_correlation(&correlation_mat, &options.tolerance)?;
    pod_matrices(data, decomp, mode_indices)
}

pub fn compute_pod_matrices_direct_method(
    data: &CMatrix,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<PodMatrices> {
    let corr = squared_svd(&options.weights.apply_sqrt(data)?, &options.tolerance, None)?;
    let decomp = PodDecomp {
        eigvecs: corr.eigvecs,
        eigvals: corr.eigvals,
    };
    pod_matrices(data, decomp, mode_indices)
}

fn pod_matrices(data: &CMatrix, decomp: PodDecomp, mode_indices: &[usize]) -> Result<PodMatrices> {
    let coeffs = mode_columns(&decomp.build_coeffs(), mode_indices, mode_indices)?;
    Ok(PodMatrices {
        modes: data * coeffs,
        proj_coeffs: decomp.proj_coeffs(),
        eigvals: decomp.eigvals,
        eigvecs: decomp.eigvecs,
    })
}

pub fn compute_dmd_matrices_snaps_method(
    data: &CMatrix,
    adv_data: Option<&CMatrix>,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<DmdMatrices> {
    let (vecs, adv_vecs) = split_data(data, adv_data)?;
    let correlation_mat = options.weights.gram(&vecs, &vecs)?;
    let cross_correlation_mat = options.weights.gram(&vecs, &adv_vecs)?;
    let decomp = DmdDecomp::from_correlations(
        &correlation_mat,
        &cross_correlation_mat,
        &options.tolerance,
        options.max_num_eigvals,
    )?;
    dmd_matrices(&vecs, &adv_vecs, decomp, &cross_correlation_mat, mode_indices)
}

pub fn compute_dmd_matrices_direct_method(
    data: &CMatrix,
    adv_data: Option<&CMatrix>,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<DmdMatrices> {
    let (vecs, adv_vecs) = split_data(data, adv_data)?;
    let weighted = options.weights.apply_sqrt(&vecs)?;
    let weighted_adv = options.weights.apply_sqrt(&adv_vecs)?;
    let decomp = direct_dmd(&weighted, &weighted_adv, &options.tolerance, options.max_num_eigvals)?;
    let cross_correlation_mat = weighted.adjoint() * &weighted_adv;
    dmd_matrices(&vecs, &adv_vecs, decomp, &cross_correlation_mat, mode_indices)
}

/// Needs `options.max_num_eigvals`.
pub fn compute_tls_dmd_matrices_snaps_method(
    data: &CMatrix,
    adv_data: Option<&CMatrix>,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<TlsDmdMatrices> {
    let max_num_eigvals = tls_rank(options)?;
    let (vecs, adv_vecs) = split_data(data, adv_data)?;
    let weights = &options.weights;
    let projected = TlsDmdDecomp::from_correlations(
        &weights.gram(&vecs, &vecs)?,
        &weights.gram(&vecs, &adv_vecs)?,
        &weights.gram(&adv_vecs, &adv_vecs)?,
        &options.tolerance,
        max_num_eigvals,
    )?;
    tls_matrices(
        &vecs,
        &adv_vecs,
        projected.decomp,
        &projected.proj_cross_correlation_mat,
        mode_indices,
    )
}

/// Needs `options.max_num_eigvals`.
pub fn compute_tls_dmd_matrices_direct_method(
    data: &CMatrix,
    adv_data: Option<&CMatrix>,
    mode_indices: &[usize],
    options: &DenseOptions,
) -> Result<TlsDmdMatrices> {
    let max_num_eigvals = tls_rank(options)?;
    let (vecs, adv_vecs) = split_data(data, adv_data)?;
    let weighted = options.weights.apply_sqrt(&vecs)?;
    let weighted_adv = options.weights.apply_sqrt(&adv_vecs)?;

    // Right singular vectors of [S V; S V'] diagonalise <V, V> + <V', V'>.
    let mut stacked = CMatrix::zeros(weighted.nrows() * 2, weighted.ncols());
    stacked.rows_mut(0, weighted.nrows()).copy_from(&weighted);
    stacked
        .rows_mut(weighted.nrows(), weighted.nrows())
        .copy_from(&weighted_adv);
    let summed = squared_svd(&stacked, &options.tolerance, Some(max_num_eigvals))?;
    let projector = &summed.eigvecs * summed.eigvecs.adjoint();

    let proj_weighted = &weighted * &projector;
    let proj_weighted_adv = &weighted_adv * &projector;
    let low = direct_dmd(
        &proj_weighted,
        &proj_weighted_adv,
        &options.tolerance,
        Some(max_num_eigvals),
    )?;
    let proj_cross_correlation_mat = proj_weighted.adjoint() * &proj_weighted_adv;
    let decomp = TlsDmdDecomp::assemble(low, summed);
    tls_matrices(&vecs, &adv_vecs, decomp, &proj_cross_correlation_mat, mode_indices)
}

fn tls_rank(options: &DenseOptions) -> Result<usize> {
    options
        .max_num_eigvals
        .ok_or_else(|| ModalError::config("total-least-squares DMD needs max_num_eigvals"))
}

/// Hermitian eigenpairs of `m^H m` from the SVD of `m`, truncated on the squared singular values.
fn squared_svd(
    m: &CMatrix,
    tolerance: &TruncationTolerance,
    max_num_eigvals: Option<usize>,
) -> Result<HermitianEigen> {
    let decomp = svd(m)?;
    let squared = HermitianEigen {
        eigvals: decomp.singular_values.map(|s| s * s),
        eigvecs: decomp.v,
    };
    truncate(&squared, tolerance, max_num_eigvals)
}

/// DMD from the thin SVD `S V = U_w diag(s) E^H`: `A~ = U_w^H (S V') E diag(1/s)`.
fn direct_dmd(
    weighted: &CMatrix,
    weighted_adv: &CMatrix,
    tolerance: &TruncationTolerance,
    max_num_eigvals: Option<usize>,
) -> Result<DmdDecomp> {
    let full = svd(weighted)?;
    let squared: Vec<f64> = full.singular_values.iter().map(|s| s * s).collect();
    let keep = tolerance.retained(&squared, max_num_eigvals);
    if keep.is_empty() {
        return Err(ModalError::numerical(format!(
            "no squared singular value exceeds {:e}",
            tolerance.atol
        )));
    }
    let kept = full.select(&keep);
    let inverse: Vec<f64> = kept.singular_values.iter().map(|s| s.recip()).collect();
    let low_order = scale_columns(&(kept.u.adjoint() * weighted_adv * &kept.v), &inverse);
    let corr = HermitianEigen {
        eigvals: kept.singular_values.map(|s| s * s),
        eigvecs: kept.v,
    };
    DmdDecomp::from_low_order_operator(&low_order, corr)
}

fn split_data(data: &CMatrix, adv_data: Option<&CMatrix>) -> Result<(CMatrix, CMatrix)> {
    match adv_data {
        Some(adv) if adv.shape() != data.shape() => Err(ModalError::shape(format!(
            "data is {:?} but advanced data is {:?}",
            data.shape(),
            adv.shape()
        ))),
        Some(adv) => Ok((data.clone(), adv.clone())),
        None if data.ncols() < 2 => Err(ModalError::shape(format!(
            "a sequential data set needs at least 2 snapshots, got {}",
            data.ncols()
        ))),
        None => {
            let m = data.ncols() - 1;
            Ok((data.columns(0, m).into_owned(), data.columns(1, m).into_owned()))
        }
    }
}

fn dmd_matrices(
    vecs: &CMatrix,
    adv_vecs: &CMatrix,
    decomp: DmdDecomp,
    cross_correlation_mat: &CMatrix,
    mode_indices: &[usize],
) -> Result<DmdMatrices> {
    let exact = mode_columns(&decomp.exact_build_coeffs()?, mode_indices, mode_indices)?;
    let proj = mode_columns(&decomp.proj_build_coeffs(), mode_indices, mode_indices)?;
    let inv_sqrt = powers(&decomp.correlation_mat_eigvals, -0.5);
    let adjoint_coeffs =
        scale_columns(&decomp.correlation_mat_eigvecs, &inv_sqrt) * &decomp.l_low_order_eigvecs;
    Ok(DmdMatrices {
        exact_modes: adv_vecs * exact,
        proj_modes: vecs * proj,
        adjoint_modes: vecs * adjoint_coeffs,
        spectral_coeffs: decomp.spectral_coeffs(),
        proj_coeffs: decomp.proj_coeffs(),
        adv_proj_coeffs: decomp.adv_proj_coeffs(cross_correlation_mat)?,
        decomp,
    })
}

fn tls_matrices(
    vecs: &CMatrix,
    adv_vecs: &CMatrix,
    decomp: TlsDmdDecomp,
    proj_cross_correlation_mat: &CMatrix,
    mode_indices: &[usize],
) -> Result<TlsDmdMatrices> {
    let projector = decomp.projector();
    let dmd = dmd_matrices(
        &(vecs * &projector),
        &(adv_vecs * &projector),
        decomp.projected_dmd(),
        proj_cross_correlation_mat,
        mode_indices,
    )?;
    Ok(TlsDmdMatrices { dmd, decomp })
}
