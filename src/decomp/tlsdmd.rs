//! Total-least-squares DMD.
//!
//! Both snapshot sets are projected onto the leading eigenvectors `Psi` of
//! `<V, V> + <V', V'>` before the standard DMD construction. With
//! `P = Psi Psi^H` the projected correlations are `P C P` and `P X P`, and the
//! build coefficients carry a leading `P` so the raw handles can be combined
//! directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use nalgebra::DVector;

use crate::config::TruncationTolerance;
use crate::decomp::dmd::truncate;
use crate::decomp::{
    complex_column, complex_values, ensure_handles, mode_columns, real_column, real_values, require,
    snapshot_pairs, DecompStage, DmdDecomp, MatrixIo,
};
use crate::error::{ModalError, Result};
use crate::linalg::{eigh, CMatrix, CVector, HermitianEigen};
use crate::parallel::compute_then_broadcast;
use crate::storage::MatrixStorage;
use crate::vectors::{Handle, Vector};
use crate::vectorspace::VectorSpace;

#[derive(Debug, Clone, PartialEq)]
pub struct TlsDmdDecomp {
    pub eigvals: CVector,
    pub r_low_order_eigvecs: CMatrix,
    pub l_low_order_eigvecs: CMatrix,
    pub sum_correlation_mats_eigvals: DVector<f64>,
    pub sum_correlation_mats_eigvecs: CMatrix,
    pub proj_correlation_mat_eigvals: DVector<f64>,
    pub proj_correlation_mat_eigvecs: CMatrix,
}

/// Correlations of the projected snapshot sets.
#[derive(Debug, Clone)]
pub(crate) struct Projected {
    pub(crate) decomp: TlsDmdDecomp,
    pub(crate) proj_cross_correlation_mat: CMatrix,
}

impl TlsDmdDecomp {
    pub(crate) fn from_correlations(
        correlation_mat: &CMatrix,
        cross_correlation_mat: &CMatrix,
        adv_correlation_mat: &CMatrix,
        tolerance: &TruncationTolerance,
        max_num_eigvals: usize,
    ) -> Result<Projected> {
        if adv_correlation_mat.shape() != correlation_mat.shape() {
            return Err(ModalError::shape(format!(
                "advanced correlation matrix is {:?} but correlation matrix is {:?}",
                adv_correlation_mat.shape(),
                correlation_mat.shape()
            )));
        }
        let summed = eigh(&(correlation_mat + adv_correlation_mat))?;
        let summed = truncate(&summed, tolerance, Some(max_num_eigvals))?;
        let projector = &summed.eigvecs * summed.eigvecs.adjoint();
        let proj_correlation_mat = &projector * correlation_mat * &projector;
        let proj_cross_correlation_mat = &projector * cross_correlation_mat * &projector;
        let low = DmdDecomp::from_correlations(
            &proj_correlation_mat,
            &proj_cross_correlation_mat,
            tolerance,
            Some(max_num_eigvals),
        )?;
        Ok(Projected {
            decomp: Self::assemble(low, summed),
            proj_cross_correlation_mat,
        })
    }

    pub(crate) fn assemble(low: DmdDecomp, summed: HermitianEigen) -> Self {
        Self {
            eigvals: low.eigvals,
            r_low_order_eigvecs: low.r_low_order_eigvecs,
            l_low_order_eigvecs: low.l_low_order_eigvecs,
            sum_correlation_mats_eigvals: summed.eigvals,
            sum_correlation_mats_eigvecs: summed.eigvecs,
            proj_correlation_mat_eigvals: low.correlation_mat_eigvals,
            proj_correlation_mat_eigvecs: low.correlation_mat_eigvecs,
        }
    }

    pub fn num_modes(&self) -> usize {
        self.eigvals.len()
    }

    /// `P = Psi Psi^H`
    pub fn projector(&self) -> CMatrix {
        &self.sum_correlation_mats_eigvecs * self.sum_correlation_mats_eigvecs.adjoint()
    }

    /// The standard DMD state of the projected snapshot set.
    pub fn projected_dmd(&self) -> DmdDecomp {
        DmdDecomp {
            eigvals: self.eigvals.clone(),
            r_low_order_eigvecs: self.r_low_order_eigvecs.clone(),
            l_low_order_eigvecs: self.l_low_order_eigvecs.clone(),
            correlation_mat_eigvals: self.proj_correlation_mat_eigvals.clone(),
            correlation_mat_eigvecs: self.proj_correlation_mat_eigvecs.clone(),
        }
    }

    /// `P E_p Sigma_p^-1/2 R`, applied to the raw snapshots.
    pub fn proj_build_coeffs(&self) -> CMatrix {
        self.projector() * self.projected_dmd().proj_build_coeffs()
    }

    /// `P E_p Sigma_p^-1/2 R Lambda^-1`, applied to the raw advanced snapshots.
    pub fn exact_build_coeffs(&self) -> Result<CMatrix> {
        Ok(self.projector() * self.projected_dmd().exact_build_coeffs()?)
    }

    pub fn spectral_coeffs(&self) -> DVector<f64> {
        self.projected_dmd().spectral_coeffs()
    }

    pub fn proj_coeffs(&self) -> CMatrix {
        self.projected_dmd().proj_coeffs()
    }

    pub fn adv_proj_coeffs(&self, proj_cross_correlation_mat: &CMatrix) -> Result<CMatrix> {
        self.projected_dmd().adv_proj_coeffs(proj_cross_correlation_mat)
    }

    fn check_consistent(&self) -> Result<()> {
        self.projected_dmd().check_consistent()?;
        if self.sum_correlation_mats_eigvecs.ncols() != self.sum_correlation_mats_eigvals.len()
            || self.sum_correlation_mats_eigvecs.nrows() != self.proj_correlation_mat_eigvecs.nrows()
        {
            return Err(ModalError::shape(format!(
                "summed correlation eigenvectors are {:?} for {} eigenvalues",
                self.sum_correlation_mats_eigvecs.shape(),
                self.sum_correlation_mats_eigvals.len()
            )));
        }
        Ok(())
    }

    fn into_payload(self) -> Vec<CMatrix> {
        vec![
            complex_column(&self.eigvals),
            self.r_low_order_eigvecs,
            self.l_low_order_eigvecs,
            real_column(&self.sum_correlation_mats_eigvals),
            self.sum_correlation_mats_eigvecs,
            real_column(&self.proj_correlation_mat_eigvals),
            self.proj_correlation_mat_eigvecs,
        ]
    }

    fn from_payload(payload: Vec<CMatrix>) -> Result<Self> {
        let [eigvals, right, left, sum_vals, sum_vecs, proj_vals, proj_vecs]: [CMatrix; 7] = payload
            .try_into()
            .map_err(|_| ModalError::CollectiveAborted("malformed TLS-DMD payload".to_string()))?;
        Ok(Self {
            eigvals: complex_values(&eigvals),
            r_low_order_eigvecs: right,
            l_low_order_eigvecs: left,
            sum_correlation_mats_eigvals: real_values(&sum_vals),
            sum_correlation_mats_eigvecs: sum_vecs,
            proj_correlation_mat_eigvals: real_values(&proj_vals),
            proj_correlation_mat_eigvecs: proj_vecs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsDmdDecompPaths {
    pub eigvals: PathBuf,
    pub r_low_order_eigvecs: PathBuf,
    pub l_low_order_eigvecs: PathBuf,
    pub sum_correlation_mats_eigvals: PathBuf,
    pub sum_correlation_mats_eigvecs: PathBuf,
    pub proj_correlation_mat_eigvals: PathBuf,
    pub proj_correlation_mat_eigvecs: PathBuf,
}

impl TlsDmdDecompPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            eigvals: dir.join("tlsdmd_eigvals.txt"),
            r_low_order_eigvecs: dir.join("tlsdmd_R_low_order_eigvecs.txt"),
            l_low_order_eigvecs: dir.join("tlsdmd_L_low_order_eigvecs.txt"),
            sum_correlation_mats_eigvals: dir.join("tlsdmd_sum_corr_mats_eigvals.txt"),
            sum_correlation_mats_eigvecs: dir.join("tlsdmd_sum_corr_mats_eigvecs.txt"),
            proj_correlation_mat_eigvals: dir.join("tlsdmd_proj_corr_mat_eigvals.txt"),
            proj_correlation_mat_eigvecs: dir.join("tlsdmd_proj_corr_mat_eigvecs.txt"),
        }
    }
}

pub struct TlsDmd<V> {
    space: VectorSpace<V>,
    io: MatrixIo,
    tolerance: TruncationTolerance,
    max_num_eigvals: Option<usize>,
    handles: Option<Vec<Handle<V>>>,
    adv_handles: Option<Vec<Handle<V>>>,
    decomp: Option<TlsDmdDecomp>,
    correlation_mat: Option<CMatrix>,
    cross_correlation_mat: Option<CMatrix>,
    adv_correlation_mat: Option<CMatrix>,
    spectral_coeffs: Option<DVector<f64>>,
    proj_coeffs: Option<CMatrix>,
    adv_proj_coeffs: Option<CMatrix>,
    stage: DecompStage,
}

impl<V: Vector + 'static> TlsDmd<V> {
    pub fn new(space: VectorSpace<V>) -> Self {
        let io = MatrixIo::new(space.topology_arc());
        Self {
            space,
            io,
            tolerance: TruncationTolerance::default(),
            max_num_eigvals: None,
            handles: None,
            adv_handles: None,
            decomp: None,
            correlation_mat: None,
            cross_correlation_mat: None,
            adv_correlation_mat: None,
            spectral_coeffs: None,
            proj_coeffs: None,
            adv_proj_coeffs: None,
            stage: DecompStage::Uninitialized,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn MatrixStorage>) -> Self {
        self.io.set_storage(storage);
        self
    }

    pub fn with_tolerance(mut self, tolerance: TruncationTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Rank of the total-least-squares projection. Required before `compute_decomp`.
    pub fn with_max_num_eigvals(mut self, max_num_eigvals: usize) -> Self {
        self.max_num_eigvals = Some(max_num_eigvals);
        self
    }

    pub fn stage(&self) -> DecompStage {
        self.stage
    }

    pub fn decomp(&self) -> Option<&TlsDmdDecomp> {
        self.decomp.as_ref()
    }

    pub fn correlation_mat(&self) -> Option<&CMatrix> {
        self.correlation_mat.as_ref()
    }

    pub fn cross_correlation_mat(&self) -> Option<&CMatrix> {
        self.cross_correlation_mat.as_ref()
    }

    pub fn adv_correlation_mat(&self) -> Option<&CMatrix> {
        self.adv_correlation_mat.as_ref()
    }

    pub fn spectral_coeffs(&self) -> Option<&DVector<f64>> {
        self.spectral_coeffs.as_ref()
    }

    pub fn proj_coeffs(&self) -> Option<&CMatrix> {
        self.proj_coeffs.as_ref()
    }

    pub fn adv_proj_coeffs(&self) -> Option<&CMatrix> {
        self.adv_proj_coeffs.as_ref()
    }

    pub fn sanity_check(&self, handle: &Handle<V>) -> Result<()> {
        self.space.sanity_check(handle, None)
    }

    pub fn compute_decomp(
        &mut self,
        handles: &[Handle<V>],
        adv_handles: Option<&[Handle<V>]>,
    ) -> Result<TlsDmdDecomp> {
        let max_num_eigvals = self.max_num_eigvals.ok_or_else(|| {
            ModalError::config("total-least-squares DMD needs max_num_eigvals")
        })?;
        let (vecs, adv_vecs) = snapshot_pairs(handles, adv_handles)?;
        let m = vecs.len();
        let (correlation_mat, cross_correlation_mat, adv_correlation_mat) = match adv_handles {
            None => {
                let expanded = self.space.compute_symmetric_inner_product_mat(handles)?;
                (
                    expanded.view((0, 0), (m, m)).into_owned(),
                    expanded.view((0, 1), (m, m)).into_owned(),
                    expanded.view((1, 1), (m, m)).into_owned(),
                )
            }
            Some(adv) => (
                self.space.compute_symmetric_inner_product_mat(handles)?,
                self.space.compute_inner_product_mat(handles, adv)?,
                self.space.compute_symmetric_inner_product_mat(adv)?,
            ),
        };
        let tolerance = self.tolerance;
        let payload = compute_then_broadcast(self.space.topology(), || {
            TlsDmdDecomp::from_correlations(
                &correlation_mat,
                &cross_correlation_mat,
                &adv_correlation_mat,
                &tolerance,
                max_num_eigvals,
            )
            .map(|projected| projected.decomp.into_payload())
        })?;
        let decomp = TlsDmdDecomp::from_payload(payload)?;
        if self.space.topology().is_rank_zero() {
            info!(
                "TLS-DMD of {} snapshot pairs kept {} modes (projection rank {})",
                m,
                decomp.num_modes(),
                decomp.sum_correlation_mats_eigvals.len()
            );
        }
        self.handles = Some(vecs);
        self.adv_handles = Some(adv_vecs);
        self.correlation_mat = Some(correlation_mat);
        self.cross_correlation_mat = Some(cross_correlation_mat);
        self.adv_correlation_mat = Some(adv_correlation_mat);
        self.decomp = Some(decomp.clone());
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(decomp)
    }

    pub fn set_decomp(&mut self, decomp: TlsDmdDecomp) -> Result<()> {
        decomp.check_consistent()?;
        self.decomp = Some(decomp);
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(())
    }

    /// The unprojected `<V, V'>`; projection coefficients apply `P` to it.
    pub fn set_cross_correlation_mat(&mut self, cross_correlation_mat: CMatrix) {
        self.cross_correlation_mat = Some(cross_correlation_mat);
    }

    pub fn compute_exact_modes(
        &mut self,
        mode_indices: &[usize],
        dests: &[Handle<V>],
        adv_handles: Option<&[Handle<V>]>,
    ) -> Result<()> {
        let decomp = require(&self.decomp, "TLS-DMD decomposition")?;
        let coeffs = mode_columns(&decomp.exact_build_coeffs()?, mode_indices, dests)?;
        if let Some(adv) = adv_handles {
            self.adv_handles = Some(adv.to_vec());
        }
        let basis = require(&self.adv_handles, "advanced snapshot handles")?;
        ensure_handles(basis, coeffs.nrows(), "exact modes")?;
        self.space.lin_combine(basis, &coeffs, dests)?;
        self.stage.advance(DecompStage::ModesComputed);
        Ok(())
    }

    pub fn compute_proj_modes(
        &mut self,
        mode_indices: &[usize],
        dests: &[Handle<V>],
        handles: Option<&[Handle<V>]>,
    ) -> Result<()> {
        let decomp = require(&self.decomp, "TLS-DMD decomposition")?;
        let coeffs = mode_columns(&decomp.proj_build_coeffs(), mode_indices, dests)?;
        if let Some(handles) = handles {
            self.handles = Some(handles.to_vec());
        }
        let basis = require(&self.handles, "snapshot handles")?;
        ensure_handles(basis, coeffs.nrows(), "projected modes")?;
        self.space.lin_combine(basis, &coeffs, dests)?;
        self.stage.advance(DecompStage::ModesComputed);
        Ok(())
    }

    pub fn compute_spectrum(&mut self) -> Result<DVector<f64>> {
        let spectral_coeffs = require(&self.decomp, "TLS-DMD decomposition")?.spectral_coeffs();
        self.spectral_coeffs = Some(spectral_coeffs.clone());
        self.stage.advance(DecompStage::SpectrumComputed);
        Ok(spectral_coeffs)
    }

    pub fn compute_proj_coeffs(&mut self) -> Result<(CMatrix, CMatrix)> {
        let decomp = require(&self.decomp, "TLS-DMD decomposition")?;
        let cross = require(&self.cross_correlation_mat, "cross-correlation matrix")?;
        let projector = decomp.projector();
        if cross.shape() != projector.shape() {
            return Err(ModalError::shape(format!(
                "cross-correlation matrix is {:?}, projector is {:?}",
                cross.shape(),
                projector.shape()
            )));
        }
        let proj_cross = &projector * cross * &projector;
        let proj_coeffs = decomp.proj_coeffs();
        let adv_proj_coeffs = decomp.adv_proj_coeffs(&proj_cross)?;
        self.proj_coeffs = Some(proj_coeffs.clone());
        self.adv_proj_coeffs = Some(adv_proj_coeffs.clone());
        self.stage.advance(DecompStage::ProjectionComputed);
        Ok((proj_coeffs, adv_proj_coeffs))
    }

    pub fn put_decomp(&self, paths: &TlsDmdDecompPaths) -> Result<()> {
        let decomp = self.decomp.as_ref();
        let eigvals = decomp.map(|d| complex_column(&d.eigvals));
        self.io
            .put_complex(eigvals.as_ref(), "TLS-DMD eigenvalues", &paths.eigvals)?;
        self.io.put_complex(
            decomp.map(|d| &d.r_low_order_eigvecs),
            "right low-order eigenvectors",
            &paths.r_low_order_eigvecs,
        )?;
        self.io.put_complex(
            decomp.map(|d| &d.l_low_order_eigvecs),
            "left low-order eigenvectors",
            &paths.l_low_order_eigvecs,
        )?;
        self.io.put_real(
            decomp.map(|d| &d.sum_correlation_mats_eigvals),
            "summed correlation eigenvalues",
            &paths.sum_correlation_mats_eigvals,
        )?;
        self.io.put_complex(
            decomp.map(|d| &d.sum_correlation_mats_eigvecs),
            "summed correlation eigenvectors",
            &paths.sum_correlation_mats_eigvecs,
        )?;
        self.io.put_real(
            decomp.map(|d| &d.proj_correlation_mat_eigvals),
            "projected correlation eigenvalues",
            &paths.proj_correlation_mat_eigvals,
        )?;
        self.io.put_complex(
            decomp.map(|d| &d.proj_correlation_mat_eigvecs),
            "projected correlation eigenvectors",
            &paths.proj_correlation_mat_eigvecs,
        )
    }

    pub fn get_decomp(&mut self, paths: &TlsDmdDecompPaths) -> Result<()> {
        let io = &self.io;
        let decomp = TlsDmdDecomp {
            eigvals: complex_values(&io.get_complex("TLS-DMD eigenvalues", &paths.eigvals)?),
            r_low_order_eigvecs: io.get_complex("right low-order eigenvectors", &paths.r_low_order_eigvecs)?,
            l_low_order_eigvecs: io.get_complex("left low-order eigenvectors", &paths.l_low_order_eigvecs)?,
            sum_correlation_mats_eigvals: io.get_real_vector(
                "summed correlation eigenvalues",
                &paths.sum_correlation_mats_eigvals,
            )?,
            sum_correlation_mats_eigvecs: io.get_complex(
                "summed correlation eigenvectors",
                &paths.sum_correlation_mats_eigvecs,
            )?,
            proj_correlation_mat_eigvals: io.get_real_vector(
                "projected correlation eigenvalues",
                &paths.proj_correlation_mat_eigvals,
            )?,
            proj_correlation_mat_eigvecs: io.get_complex(
                "projected correlation eigenvectors",
                &paths.proj_correlation_mat_eigvecs,
            )?,
        };
        self.set_decomp(decomp)
    }

    pub fn put_correlation_mat(&self, dest: &Path) -> Result<()> {
        self.io
            .put_complex(self.correlation_mat.as_ref(), "correlation matrix", dest)
    }

    pub fn put_cross_correlation_mat(&self, dest: &Path) -> Result<()> {
        self.io.put_complex(
            self.cross_correlation_mat.as_ref(),
            "cross-correlation matrix",
            dest,
        )
    }

    pub fn put_adv_correlation_mat(&self, dest: &Path) -> Result<()> {
        self.io.put_complex(
            self.adv_correlation_mat.as_ref(),
            "advanced correlation matrix",
            dest,
        )
    }

    pub fn put_spectral_coeffs(&self, dest: &Path) -> Result<()> {
        self.io
            .put_real(self.spectral_coeffs.as_ref(), "spectral coefficients", dest)
    }

    pub fn put_proj_coeffs(&self, proj_dest: &Path, adv_proj_dest: &Path) -> Result<()> {
        self.io
            .put_complex(self.proj_coeffs.as_ref(), "projection coefficients", proj_dest)?;
        self.io.put_complex(
            self.adv_proj_coeffs.as_ref(),
            "advanced projection coefficients",
            adv_proj_dest,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    fn correlations() -> (CMatrix, CMatrix, CMatrix) {
        let data = CMatrix::from_fn(9, 7, |i, j| {
            Complex64::new((0.41 * ((i + 1) * (j + 3)) as f64).sin(), 0.0)
        });
        let v = data.columns(0, 6).into_owned();
        let adv = data.columns(1, 6).into_owned();
        (v.adjoint() * &v, v.adjoint() * &adv, adv.adjoint() * &adv)
    }

    #[test]
    fn projector_is_idempotent_with_requested_rank() {
        let (c, x, a) = correlations();
        let projected =
            TlsDmdDecomp::from_correlations(&c, &x, &a, &TruncationTolerance::default(), 3).expect("tls");
        let p = projected.decomp.projector();
        assert_relative_eq!((&p * &p - &p).norm(), 0.0, epsilon = 1e-10);
        assert_eq!(projected.decomp.sum_correlation_mats_eigvals.len(), 3);
        assert!(projected.decomp.num_modes() <= 3);
        projected.decomp.check_consistent().expect("consistent");
    }

    #[test]
    fn payload_round_trip_preserves_state() {
        let (c, x, a) = correlations();
        let decomp = TlsDmdDecomp::from_correlations(&c, &x, &a, &TruncationTolerance::default(), 2)
            .expect("tls")
            .decomp;
        let restored = TlsDmdDecomp::from_payload(decomp.clone().into_payload()).expect("payload");
        assert_eq!(restored, decomp);
    }
}
