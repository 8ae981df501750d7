//! Handle-based modal decompositions and the state they persist.

pub mod dmd;
pub mod pod;
pub mod tlsdmd;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use nalgebra::{DMatrix, DVector};

use crate::error::{ModalError, Result};
use crate::linalg::{real_part, to_complex, CMatrix, CVector};
use crate::parallel::{compute_then_broadcast, run_on_root, Topology};
use crate::storage::MatrixStorage;
use crate::vectors::Handle;

pub use dmd::{Dmd, DmdDecomp, DmdDecompPaths};
pub use pod::{Pod, PodDecomp, PodDecompPaths};
pub use tlsdmd::{TlsDmd, TlsDmdDecomp, TlsDmdDecompPaths};

/// How far a decomposition object has progressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecompStage {
    #[default]
    Uninitialized,
    DecompositionComputed,
    ModesComputed,
    SpectrumComputed,
    ProjectionComputed,
}

impl DecompStage {
    pub(crate) fn advance(&mut self, to: DecompStage) {
        *self = (*self).max(to);
    }
}

/// Matrix persistence that writes on rank 0 and broadcasts reads.
#[derive(Clone)]
pub(crate) struct MatrixIo {
    storage: Option<Arc<dyn MatrixStorage>>,
    topology: Arc<dyn Topology>,
}

impl fmt::Debug for MatrixIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixIo")
            .field("storage", &self.storage)
            .finish()
    }
}

impl MatrixIo {
    pub(crate) fn new(topology: Arc<dyn Topology>) -> Self {
        Self {
            storage: None,
            topology,
        }
    }

    pub(crate) fn set_storage(&mut self, storage: Arc<dyn MatrixStorage>) {
        self.storage = Some(storage);
    }

    fn storage(&self) -> Result<&dyn MatrixStorage> {
        self.storage
            .as_deref()
            .ok_or_else(|| ModalError::config("no matrix storage was configured"))
    }

    pub(crate) fn put_complex(&self, mat: Option<&CMatrix>, what: &'static str, dest: &Path) -> Result<()> {
        let mat = mat.ok_or(ModalError::NotYetComputed(what))?;
        let storage = self.storage()?;
        run_on_root(self.topology.as_ref(), || {
            storage
                .put_complex(mat, dest)
                .with_context(|| format!("store {what}"))
                .map_err(ModalError::from)
        })
    }

    pub(crate) fn put_real(&self, values: Option<&DVector<f64>>, what: &'static str, dest: &Path) -> Result<()> {
        let values = values.ok_or(ModalError::NotYetComputed(what))?;
        let storage = self.storage()?;
        let column = DMatrix::from_column_slice(values.len(), 1, values.as_slice());
        run_on_root(self.topology.as_ref(), || {
            storage
                .put_real(&column, dest)
                .with_context(|| format!("store {what}"))
                .map_err(ModalError::from)
        })
    }

    pub(crate) fn get_complex(&self, what: &'static str, source: &Path) -> Result<CMatrix> {
        let storage = self.storage()?;
        let mut loaded = compute_then_broadcast(self.topology.as_ref(), || {
            let mat = storage
                .get_complex(source)
                .with_context(|| format!("load {what}"))?;
            Ok(vec![mat])
        })?;
        loaded
            .pop()
            .ok_or_else(|| ModalError::CollectiveAborted(format!("no {what} was broadcast")))
    }

    /// Loads a real vector stored as a single row or column.
    pub(crate) fn get_real_vector(&self, what: &'static str, source: &Path) -> Result<DVector<f64>> {
        let storage = self.storage()?;
        let mut loaded = compute_then_broadcast(self.topology.as_ref(), || {
            let mat = storage
                .get_real(source)
                .with_context(|| format!("load {what}"))?;
            if mat.nrows() > 1 && mat.ncols() > 1 {
                return Err(ModalError::shape(format!(
                    "{what} must be one row or column, got {}x{}",
                    mat.nrows(),
                    mat.ncols()
                )));
            }
            Ok(vec![to_complex(&mat)])
        })?;
        let mat = loaded
            .pop()
            .ok_or_else(|| ModalError::CollectiveAborted(format!("no {what} was broadcast")))?;
        Ok(real_values(&mat))
    }
}

/// Vectors travel through collectives and storage as single-column matrices.
pub(crate) fn real_column(values: &DVector<f64>) -> CMatrix {
    to_complex(&DMatrix::from_column_slice(values.len(), 1, values.as_slice()))
}

pub(crate) fn complex_column(values: &CVector) -> CMatrix {
    CMatrix::from_column_slice(values.len(), 1, values.as_slice())
}

pub(crate) fn real_values(mat: &CMatrix) -> DVector<f64> {
    DVector::from_iterator(mat.len(), real_part(mat).iter().copied())
}

pub(crate) fn complex_values(mat: &CMatrix) -> CVector {
    CVector::from_iterator(mat.len(), mat.iter().copied())
}

pub(crate) fn require<'a, T>(value: &'a Option<T>, what: &'static str) -> Result<&'a T> {
    value.as_ref().ok_or(ModalError::NotYetComputed(what))
}

/// Splits a sequential snapshot list into `(V[..n-1], V[1..])`, or checks an explicit pair.
pub(crate) fn snapshot_pairs<V>(
    handles: &[Handle<V>],
    adv_handles: Option<&[Handle<V>]>,
) -> Result<(Vec<Handle<V>>, Vec<Handle<V>>)> {
    match adv_handles {
        Some(adv) if adv.len() != handles.len() => Err(ModalError::shape(format!(
            "{} snapshots but {} advanced snapshots",
            handles.len(),
            adv.len()
        ))),
        Some(_) if handles.is_empty() => Err(ModalError::shape("no snapshots were given")),
        Some(adv) => Ok((handles.to_vec(), adv.to_vec())),
        None if handles.len() < 2 => Err(ModalError::shape(format!(
            "a sequential data set needs at least 2 snapshots, got {}",
            handles.len()
        ))),
        None => Ok((
            handles[..handles.len() - 1].to_vec(),
            handles[1..].to_vec(),
        )),
    }
}

/// Columns `indices` of `build_coeffs`, one per destination.
pub(crate) fn mode_columns<D>(build_coeffs: &CMatrix, indices: &[usize], dests: &[D]) -> Result<CMatrix> {
    if indices.len() != dests.len() {
        return Err(ModalError::shape(format!(
            "{} mode indices but {} destinations",
            indices.len(),
            dests.len()
        )));
    }
    if let Some(bad) = indices.iter().find(|&&k| k >= build_coeffs.ncols()) {
        return Err(ModalError::shape(format!(
            "mode index {bad} is out of range for {} modes",
            build_coeffs.ncols()
        )));
    }
    Ok(build_coeffs.select_columns(indices.iter()))
}

pub(crate) fn ensure_handles<V>(handles: &[Handle<V>], rows: usize, what: &str) -> Result<()> {
    if handles.len() != rows {
        return Err(ModalError::shape(format!(
            "{what}: {} handles for {rows} coefficient rows",
            handles.len()
        )));
    }
    Ok(())
}
