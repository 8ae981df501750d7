use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use nalgebra::DVector;

use crate::config::TruncationTolerance;
use crate::decomp::{
    ensure_handles, mode_columns, real_column, real_values, require, DecompStage, MatrixIo,
};
use crate::error::{ModalError, Result};
use crate::linalg::{powers, scale_columns, scale_rows, svd, CMatrix};
use crate::parallel::compute_then_broadcast;
use crate::storage::MatrixStorage;
use crate::vectors::{Handle, Vector};
use crate::vectorspace::VectorSpace;

/// Truncated singular value decomposition of the correlation matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PodDecomp {
    pub eigvecs: CMatrix,
    pub eigvals: DVector<f64>,
}

impl PodDecomp {
    pub(crate) fn from_correlation(correlation_mat: &CMatrix, tolerance: &TruncationTolerance) -> Result<Self> {
        let full = svd(correlation_mat)?;
        let keep = tolerance.retained(full.singular_values.as_slice(), None);
        if keep.is_empty() {
            return Err(ModalError::numerical(format!(
                "no correlation singular value exceeds {:e}; rank-zero data is rejected instead of kept whole",
                tolerance.atol
            )));
        }
        let kept = full.select(&keep);
        Ok(Self {
            eigvecs: kept.u,
            eigvals: kept.singular_values,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.eigvals.len()
    }

    /// `E Sigma^-1/2`
    pub fn build_coeffs(&self) -> CMatrix {
        scale_columns(&self.eigvecs, &powers(&self.eigvals, -0.5))
    }

    /// `Sigma^1/2 E^H`
    pub fn proj_coeffs(&self) -> CMatrix {
        scale_rows(&self.eigvecs.adjoint(), &powers(&self.eigvals, 0.5))
    }

    fn check_consistent(&self) -> Result<()> {
        if self.eigvecs.ncols() != self.eigvals.len() {
            return Err(ModalError::shape(format!(
                "{} POD eigenvalues but {} eigenvectors",
                self.eigvals.len(),
                self.eigvecs.ncols()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDecompPaths {
    pub eigvecs: PathBuf,
    pub eigvals: PathBuf,
}

impl PodDecompPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            eigvecs: dir.join("pod_eigvecs.txt"),
            eigvals: dir.join("pod_eigvals.txt"),
        }
    }
}

/// Proper orthogonal decomposition over vector handles.
pub struct Pod<V> {
    space: VectorSpace<V>,
    io: MatrixIo,
    tolerance: TruncationTolerance,
    handles: Option<Vec<Handle<V>>>,
    decomp: Option<PodDecomp>,
    correlation_mat: Option<CMatrix>,
    proj_coeffs: Option<CMatrix>,
    stage: DecompStage,
}

impl<V: Vector + 'static> Pod<V> {
    pub fn new(space: VectorSpace<V>) -> Self {
        let io = MatrixIo::new(space.topology_arc());
        Self {
            space,
            io,
            tolerance: TruncationTolerance::default(),
            handles: None,
            decomp: None,
            correlation_mat: None,
            proj_coeffs: None,
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

    pub fn stage(&self) -> DecompStage {
        self.stage
    }

    pub fn decomp(&self) -> Option<&PodDecomp> {
        self.decomp.as_ref()
    }

    pub fn correlation_mat(&self) -> Option<&CMatrix> {
        self.correlation_mat.as_ref()
    }

    pub fn proj_coeffs(&self) -> Option<&CMatrix> {
        self.proj_coeffs.as_ref()
    }

    pub fn sanity_check(&self, handle: &Handle<V>) -> Result<()> {
        self.space.sanity_check(handle, None)
    }

    pub fn compute_decomp(&mut self, handles: &[Handle<V>]) -> Result<PodDecomp> {
        let correlation_mat = self.space.compute_symmetric_inner_product_mat(handles)?;
        let tolerance = self.tolerance;
        let payload = compute_then_broadcast(self.space.topology(), || {
            let decomp = PodDecomp::from_correlation(&correlation_mat, &tolerance)?;
            Ok(vec![decomp.eigvecs, real_column(&decomp.eigvals)])
        })?;
        let [eigvecs, eigvals]: [CMatrix; 2] = payload
            .try_into()
            .map_err(|_| ModalError::CollectiveAborted("malformed POD payload".to_string()))?;
        let decomp = PodDecomp {
            eigvecs,
            eigvals: real_values(&eigvals),
        };
        if self.space.topology().is_rank_zero() {
            info!(
                "POD of {} snapshots kept {} modes",
                handles.len(),
                decomp.num_modes()
            );
        }
        self.handles = Some(handles.to_vec());
        self.correlation_mat = Some(correlation_mat);
        self.decomp = Some(decomp.clone());
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(decomp)
    }

    pub fn set_decomp(&mut self, decomp: PodDecomp) -> Result<()> {
        decomp.check_consistent()?;
        self.decomp = Some(decomp);
        self.stage.advance(DecompStage::DecompositionComputed);
        Ok(())
    }

    /// Builds the modes `mode_indices` into `dests`; `handles` replaces the stored snapshot list.
    pub fn compute_modes(
        &mut self,
        mode_indices: &[usize],
        dests: &[Handle<V>],
        handles: Option<&[Handle<V>]>,
    ) -> Result<()> {
        let decomp = require(&self.decomp, "POD decomposition")?;
        let coeffs = mode_columns(&decomp.build_coeffs(), mode_indices, dests)?;
        if let Some(handles) = handles {
            self.handles = Some(handles.to_vec());
        }
        let basis = require(&self.handles, "snapshot handles")?;
        ensure_handles(basis, coeffs.nrows(), "POD modes")?;
        self.space.lin_combine(basis, &coeffs, dests)?;
        self.stage.advance(DecompStage::ModesComputed);
        Ok(())
    }

    /// Coefficients of the snapshots in the POD mode basis.
    pub fn compute_proj_coeffs(&mut self) -> Result<CMatrix> {
        let proj_coeffs = require(&self.decomp, "POD decomposition")?.proj_coeffs();
        self.proj_coeffs = Some(proj_coeffs.clone());
        self.stage.advance(DecompStage::ProjectionComputed);
        Ok(proj_coeffs)
    }

    pub fn put_decomp(&self, paths: &PodDecompPaths) -> Result<()> {
        let decomp = self.decomp.as_ref();
        self.io
            .put_complex(decomp.map(|d| &d.eigvecs), "POD eigenvectors", &paths.eigvecs)?;
        self.io
            .put_real(decomp.map(|d| &d.eigvals), "POD eigenvalues", &paths.eigvals)
    }

    pub fn get_decomp(&mut self, paths: &PodDecompPaths) -> Result<()> {
        let decomp = PodDecomp {
            eigvecs: self.io.get_complex("POD eigenvectors", &paths.eigvecs)?,
            eigvals: self.io.get_real_vector("POD eigenvalues", &paths.eigvals)?,
        };
        self.set_decomp(decomp)
    }

    pub fn put_correlation_mat(&self, dest: &Path) -> Result<()> {
        self.io
            .put_complex(self.correlation_mat.as_ref(), "correlation matrix", dest)
    }

    pub fn put_proj_coeffs(&self, dest: &Path) -> Result<()> {
        self.io
            .put_complex(self.proj_coeffs.as_ref(), "projection coefficients", dest)
    }
}
