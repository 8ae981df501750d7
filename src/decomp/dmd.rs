use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use nalgebra::DVector;

use crate::config::TruncationTolerance;
use crate::decomp::{
    complex_column, complex_values, ensure_handles, mode_columns, real_column, real_values, require,
    snapshot_pairs, DecompStage, MatrixIo,
};
use crate::error::{ModalError, Result};
use crate::linalg::{
    eig_biorthog, eigh, powers, scale_columns, scale_columns_complex, scale_rows, CMatrix, CVector,
    HermitianEigen,
};
use crate::parallel::compute_then_broadcast;
use crate::storage::MatrixStorage;
use crate::vectors::{Handle, Vector};
use crate::vectorspace::VectorSpace;

/// Low-order DMD state: the biorthogonal eigenpairs of the reduced operator
/// and the truncated eigendecomposition of the correlation matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DmdDecomp {
    pub eigvals: CVector,
    pub r_low_order_eigvecs: CMatrix,
    pub l_low_order_eigvecs: CMatrix,
    pub correlation_mat_eigvals: DVector<f64>,
    pub correlation_mat_eigvecs: CMatrix,
}

impl DmdDecomp {
    /// Snapshot-method construction from `C = <V, V>` and `X = <V, V'>`.
    pub(crate) fn from_correlations(
        correlation_mat: &CMatrix,
        cross_correlation_mat: &CMatrix,
        tolerance: &TruncationTolerance,
        max_num_eigvals: Option<usize>,
    ) -> Result<Self> {
        if cross_correlation_mat.shape() != correlation_mat.shape() {
            return Err(ModalError::shape(format!(
                "cross-correlation matrix is {:?} but correlation matrix is {:?}",
                cross_correlation_mat.shape(),
                correlation_mat.shape()
            )));
        }
        let full = eigh(correlation_mat)?;
        let corr = truncate(&full, tolerance, max_num_eigvals)?;
        let inv_sqrt = powers(&corr.eigvals, -0.5);
        let projected = corr.eigvecs.adjoint() * cross_correlation_mat * &corr.eigvecs;
        let low_order = scale_columns(&scale_rows(&projected, &inv_sqrt), &inv_sqrt);
        Self::from_low_order_operator(&low_order, corr)
    }

    pub(crate) fn from_low_order_operator(low_order: &CMatrix, corr: HermitianEigen) -> Result<Self> {
        let eigen = eig_biorthog(low_order)?;
        Ok(Self {
            eigvals: eigen.eigvals,
            r_low_order_eigvecs: eigen.right,
            l_low_order_eigvecs: eigen.left,
            correlation_mat_eigvals: corr.eigvals,
            correlation_mat_eigvecs: corr.eigvecs,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.eigvals.len()
    }

    /// Coefficients that combine `V` into projected modes: `E Sigma^-1/2 R`.
    pub fn proj_build_coeffs(&self) -> CMatrix {
        let inv_sqrt = powers(&self.correlation_mat_eigvals, -0.5);
        &self.correlation_mat_eigvecs * scale_rows(&self.r_low_order_eigvecs, &inv_sqrt)
    }

    /// Coefficients that combine `V'` into exact modes: `E Sigma^-1/2 R Lambda^-1`.
    pub fn exact_build_coeffs(&self) -> Result<CMatrix> {
        if let Some(k) = self.eigvals.iter().position(|v| v.norm() == 0.0) {
            return Err(ModalError::numerical(format!(
                "eigenvalue {k} is zero; exact modes are undefined"
            )));
        }
        let inverses = self.eigvals.map(|v| v.inv());
        Ok(scale_columns_complex(&self.proj_build_coeffs(), &inverses))
    }

    /// `|L^H Sigma^1/2 E^H e_0|`
    pub fn spectral_coeffs(&self) -> DVector<f64> {
        let sqrt = powers(&self.correlation_mat_eigvals, 0.5);
        let first = CVector::from_iterator(
            sqrt.len(),
            sqrt.iter()
                .enumerate()
                .map(|(j, s)| self.correlation_mat_eigvecs[(0, j)].conj() * *s),
        );
        let projected = self.l_low_order_eigvecs.adjoint() * first;
        projected.map(|v| v.norm())
    }

    /// `L^H Sigma^1/2 E^H`
    pub fn proj_coeffs(&self) -> CMatrix {
        let sqrt = powers(&self.correlation_mat_eigvals, 0.5);
        self.l_low_order_eigvecs.adjoint() * scale_rows(&self.correlation_mat_eigvecs.adjoint(), &sqrt)
    }

    /// `L^H Sigma^-1/2 E^H X`
    pub fn adv_proj_coeffs(&self, cross_correlation_mat: &CMatrix) -> Result<CMatrix> {
        if cross_correlation_mat.nrows() != self.correlation_mat_eigvecs.nrows() {
            return Err(ModalError::shape(format!(
                "cross-correlation matrix has {} rows, eigenvectors have {}",
                cross_correlation_mat.nrows(),
                self.correlation_mat_eigvecs.nrows()
            )));
        }
        let inv_sqrt = powers(&self.correlation_mat_eigvals, -0.5);
        Ok(self.l_low_order_eigvecs.adjoint()
            * scale_rows(&self.correlation_mat_eigvecs.adjoint(), &inv_sqrt)
            * cross_correlation_mat)
    }

    pub(crate) fn check_consistent(&self) -> Result<()> {
        let modes = self.eigvals.len();
        let rank = self.correlation_mat_eigvals.len();
        if self.r_low_order_eigvecs.shape() != (rank, modes)
            || self.l_low_order_eigvecs.shape() != (rank, modes)
            || self.correlation_mat_eigvecs.ncols() != rank
        {
            return Err(ModalError::shape(format!(
                "inconsistent DMD state: {modes} eigenvalues, {rank} correlation eigenvalues, \
                 eigenvectors {:?} / {:?} / {:?}",
                self.r_low_order_eigvecs.shape(),
                self.l_low_order_eigvecs.shape(),
                self.correlation_mat_eigvecs.shape()
            )));
        }
        Ok(())
    }

    pub(crate) fn into_payload(self) -> Vec<CMatrix> {
        vec![
            complex_column(&self.eigvals),
            self.r_low_order_eigvecs,
            self.l_low_order_eigvecs,
            real_column(&self.correlation_mat_eigvals),
            self.correlation_mat_eigvecs,
        ]
    }

    pub(crate) fn from_payload(payload: Vec<CMatrix>) -> Result<Self> {
        let [eigvals, right, left, corr_eigvals, corr_eigvecs]: [CMatrix; 5] = payload
            .try_into()
            .map_err(|_| ModalError::CollectiveAborted("malformed DMD payload".to_string()))?;
        Ok(Self {
            eigvals: complex_values(&eigvals),
            r_low_order_eigvecs: right,
            l_low_order_eigvecs: left,
            correlation_mat_eigvals: real_values(&corr_eigvals),
            correlation_mat_eigvecs: corr_eigvecs,
        })
    }
}

/// Drops eigenpairs below tolerance, then keeps at most `max_num_eigvals`.
pub(crate) fn truncate(
    eigen: &HermitianEigen,
    tolerance: &TruncationTolerance,
    max_num_eigvals: Option<usize>,
) -> Result<HermitianEigen> {
    let keep = tolerance.retained(eigen.eigvals.as_slice(), max_num_eigvals);
    if keep.is_empty() {
        return Err(ModalError::numerical(format!(
            "no correlation eigenvalue exceeds {:e}; rank-zero data is rejected instead of kept whole",
            tolerance.atol
        )));
    }
    Ok(eigen.select(&keep))
}

/// Destinations for every matrix of a [`DmdDecomp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmdDecompPaths {
    pub eigvals: PathBuf,
    pub r_low_order_eigvecs: PathBuf,
    pub l_low_order_eigvecs: PathBuf,
    pub correlation_mat_eigvals: PathBuf,
    pub correlation_mat_eigvecs: PathBuf,
}

impl DmdDecompPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            eigvals: dir.join("dmd_eigvals.txt"),
            r_low_order_eigvecs: dir.join("dmd_R_low_order_eigvecs.txt"),
            l_low_order_eigvecs: dir.join("dmd_L_low_order_eigvecs.txt"),
            correlation_mat_eigvals: dir.join("dmd_corr_mat_eigvals.txt"),
            correlation_mat_eigvecs: dir.join("dmd_corr_mat_eigvecs.txt"),
        }
    }
}

/// Dynamic mode decomposition over vector handles (snapshot method).
pub struct Dmd<V> {
    space: VectorSpace<V>,
    io: MatrixIo,
    tolerance: TruncationTolerance,
    max_num_eigvals: Option<usize>,
    handles: Option<Vec<Handle<V>>>,
    adv_handles: Option<Vec<Handle<V>>>,
    decomp: Option<DmdDecomp>,
    correlation_mat: Option<CMatrix>,
    cross_correlation_mat: Option<CMatrix>,
    spectral_coeffs: Option<DVector<f64>>,
    proj_coeffs: Option<CMatrix>,
    adv_proj_coeffs: Option<CMatrix>,
    stage: DecompStage,
}

impl<V: Vector + 'static> Dmd<V> {
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

    pub fn with_max_num_eigvals(mut self, max_num_eigvals: usize) -> Self {
        self.max_num_eigvals = Some(max_num_eigvals);
        self
    }

    pub fn stage(&self) -> DecompStage {
        self.stage
    }

    pub fn decomp(&self) -> Option<&DmdDecomp> {
        self.decomp.as_ref()
    }

    pub fn correlation_mat(&self) -> Option<&CMatrix> {
        self.correlation_mat.as_ref()
    }

    pub fn cross_correlation_mat(&self) -> Option<&CMatrix> {
        self.cross_correlation_mat.as_ref()
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

    /// Computes the correlation matrices and the low-order decomposition.
    ///
    /// Without `adv_handles` the handles are one sequential run: `V = handles[..n-1]`
    /// and `V' = handles[1..]`, and a single symmetric matrix supplies both `C` and `X`.
    pub fn compute_decomp(
        &mut self,
        handles: &[Handle<V>],
        adv_handles: Option<&[Handle<V>]>,
    ) -> Result<DmdDecomp> {
        let (vecs, adv_vecs) = snapshot_pairs(handles, adv_handles)?;
        let (correlation_mat, cross_correlation_mat) = match adv_handles {
            None => {
                let expanded = self.space.compute_symmetric_inner_product_mat(handles)?;
                let m = vecs.len();
                (
                    expanded.view((0, 0), (m, m)).into_owned(),
                    expanded.view((0, 1), (m, m)).into_owned(),
                )
            }
            Some(adv) => (
                self.space.compute_symmetric_inner_product_mat(handles)?,
                self.space.compute_inner_product_mat(handles, adv)?,
            ),
        };
        let (tolerance, max_num_eigvals) = (self.tolerance, self.max_num_eigvals);
        let payload = compute_then_broadcast(self.space.topology(), || {
            DmdDecomp::from_correlations(&correlation_mat, &cross_correlation_mat, &tolerance, max_num_eigvals)
                .map(DmdDecomp::into_payload)
        })?;
        let decomp = DmdDecomp::from_payload(payload)?;
        if self.space.topology().is_rank_zero() {
            info!(
                "DMD of {} snapshot pairs kept {} modes",
                vecs.len(),
                decomp.num_modes()
            );
        }
        self.handles = Some(vecs);
        self.adv_handles = Some(adv_vecs);
        self.correlation_mat = Some(correlation_mat);
        self.cross_correlation_mat = Some(cross_correlation_mat);
        self.decomp = Some(decomp.clone());
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(decomp)
    }

    /// Installs a decomposition computed elsewhere.
    pub fn set_decomp(&mut self, decomp: DmdDecomp) -> Result<()> {
        decomp.check_consistent()?;
        self.decomp = Some(decomp);
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(())
    }

    pub fn set_cross_correlation_mat(&mut self, cross_correlation_mat: CMatrix) {
        self.cross_correlation_mat = Some(cross_correlation_mat);
    }

    /// Exact modes, built from the advanced snapshots `V'`.
    pub fn compute_exact_modes(
        &mut self,
        mode_indices: &[usize],
        dests: &[Handle<V>],
        adv_handles: Option<&[Handle<V>]>,
    ) -> Result<()> {
        let decomp = require(&self.decomp, "DMD decomposition")?;
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

    /// Projected modes, built from the snapshots `V`.
    pub fn compute_proj_modes(
        &mut self,
        mode_indices: &[usize],
        dests: &[Handle<V>],
        handles: Option<&[Handle<V>]>,
    ) -> Result<()> {
        let decomp = require(&self.decomp, "DMD decomposition")?;
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
        let spectral_coeffs = require(&self.decomp, "DMD decomposition")?.spectral_coeffs();
        self.spectral_coeffs = Some(spectral_coeffs.clone());
        self.stage.advance(DecompStage::SpectrumComputed);
        Ok(spectral_coeffs)
    }

    /// Projection coefficients of `V` and `V'` onto the adjoint modes.
    pub fn compute_proj_coeffs(&mut self) -> Result<(CMatrix, CMatrix)> {
        let decomp = require(&self.decomp, "DMD decomposition")?;
        let cross = require(&self.cross_correlation_mat, "cross-correlation matrix")?;
        let proj_coeffs = decomp.proj_coeffs();
        let adv_proj_coeffs = decomp.adv_proj_coeffs(cross)?;
        self.proj_coeffs = Some(proj_coeffs.clone());
        self.adv_proj_coeffs = Some(adv_proj_coeffs.clone());
        self.stage.advance(DecompStage::ProjectionComputed);
        Ok((proj_coeffs, adv_proj_coeffs))
    }

    pub fn put_decomp(&self, paths: &DmdDecompPaths) -> Result<()> {
        let decomp = self.decomp.as_ref();
        let eigvals = decomp.map(|d| complex_column(&d.eigvals));
        self.io.put_complex(eigvals.as_ref(), "DMD eigenvalues", &paths.eigvals)?;
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
            decomp.map(|d| &d.correlation_mat_eigvals),
            "correlation matrix eigenvalues",
            &paths.correlation_mat_eigvals,
        )?;
        self.io.put_complex(
            decomp.map(|d| &d.correlation_mat_eigvecs),
            "correlation matrix eigenvectors",
            &paths.correlation_mat_eigvecs,
        )
    }

    pub fn get_decomp(&mut self, paths: &DmdDecompPaths) -> Result<()> {
        let eigvals = self.io.get_complex("DMD eigenvalues", &paths.eigvals)?;
        let decomp = DmdDecomp {
            eigvals: complex_values(&eigvals),
            r_low_order_eigvecs: self
                .io
                .get_complex("right low-order eigenvectors", &paths.r_low_order_eigvecs)?,
            l_low_order_eigvecs: self
                .io
                .get_complex("left low-order eigenvectors", &paths.l_low_order_eigvecs)?,
            correlation_mat_eigvals: self
                .io
                .get_real_vector("correlation matrix eigenvalues", &paths.correlation_mat_eigvals)?,
            correlation_mat_eigvecs: self
                .io
                .get_complex("correlation matrix eigenvectors", &paths.correlation_mat_eigvecs)?,
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

    fn correlations() -> (CMatrix, CMatrix) {
        let data = CMatrix::from_fn(6, 5, |i, j| {
            Complex64::new((0.37 * ((i + 1) * (j + 2)) as f64).sin() + 0.1 * i as f64, 0.0)
        });
        let v = data.columns(0, 4).into_owned();
        let adv = data.columns(1, 4).into_owned();
        (v.adjoint() * &v, v.adjoint() * adv)
    }

    #[test]
    fn low_order_eigenvectors_are_biorthogonal() {
        let (c, x) = correlations();
        let decomp = DmdDecomp::from_correlations(&c, &x, &TruncationTolerance::default(), None)
            .expect("decomp");
        let duality = decomp.l_low_order_eigvecs.adjoint() * &decomp.r_low_order_eigvecs;
        let n = decomp.num_modes();
        assert_relative_eq!((duality - CMatrix::identity(n, n)).norm(), 0.0, epsilon = 1e-8);
        decomp.check_consistent().expect("consistent");
    }

    #[test]
    fn truncation_limits_the_rank() {
        let (c, x) = correlations();
        let decomp = DmdDecomp::from_correlations(&c, &x, &TruncationTolerance::default(), Some(2))
            .expect("decomp");
        assert_eq!(decomp.num_modes(), 2);
        assert_eq!(decomp.correlation_mat_eigvecs.shape(), (4, 2));
        assert_eq!(decomp.proj_build_coeffs().shape(), (4, 2));
    }

    #[test]
    fn zero_eigenvalue_blocks_exact_modes() {
        let (c, x) = correlations();
        let mut decomp = DmdDecomp::from_correlations(&c, &x, &TruncationTolerance::default(), None)
            .expect("decomp");
        decomp.eigvals[0] = Complex64::new(0.0, 0.0);
        assert!(matches!(decomp.exact_build_coeffs(), Err(ModalError::Numerical(_))));
    }

    #[test]
    fn payload_round_trip_preserves_state() {
        let (c, x) = correlations();
        let decomp = DmdDecomp::from_correlations(&c, &x, &TruncationTolerance::default(), None)
            .expect("decomp");
        let restored = DmdDecomp::from_payload(decomp.clone().into_payload()).expect("payload");
        assert_eq!(restored, decomp);
    }
}
