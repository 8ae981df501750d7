use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use num_complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::linalg::CVector;
use crate::storage::{read_json, write_json};
use crate::vectors::{ArrayVector, Handle, VecHandle, Vector};

/// Keeps the vector in memory; useful for tests and small problems.
pub struct MemoryHandle<V> {
    slot: RwLock<Option<V>>,
}

impl<V> MemoryHandle<V> {
    pub fn new(value: V) -> Self {
        Self {
            slot: RwLock::new(Some(value)),
        }
    }

    pub fn empty() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.read().is_none()
    }
}

impl<V: Clone> MemoryHandle<V> {
    pub fn get(&self) -> Option<V> {
        self.slot.read().clone()
    }
}

impl<V> fmt::Debug for MemoryHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("filled", &!self.is_empty())
            .finish()
    }
}

impl<V: Clone + Send + Sync> VecHandle<V> for MemoryHandle<V> {
    fn acquire(&self) -> Result<V> {
        self.get()
            .ok_or_else(|| anyhow!("memory handle holds no vector"))
    }

    fn release(&self, value: &V) -> Result<()> {
        *self.slot.write() = Some(value.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    re: Vec<f64>,
    im: Vec<f64>,
}

/// Stores an [`ArrayVector`] as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileHandle {
    path: PathBuf,
}

impl JsonFileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VecHandle<ArrayVector> for JsonFileHandle {
    fn acquire(&self) -> Result<ArrayVector> {
        let stored: StoredVector = read_json(&self.path)
            .with_context(|| format!("load vector from {:?}", self.path))?;
        if stored.re.len() != stored.im.len() {
            return Err(anyhow!(
                "vector file {:?} has {} real and {} imaginary parts",
                self.path,
                stored.re.len(),
                stored.im.len()
            ));
        }
        Ok(ArrayVector(CVector::from_iterator(
            stored.re.len(),
            stored
                .re
                .iter()
                .zip(&stored.im)
                .map(|(re, im)| Complex64::new(*re, *im)),
        )))
    }

    fn release(&self, value: &ArrayVector) -> Result<()> {
        let stored = StoredVector {
            re: value.0.iter().map(|v| v.re).collect(),
            im: value.0.iter().map(|v| v.im).collect(),
        };
        write_json(&self.path, &stored).with_context(|| format!("store vector to {:?}", self.path))
    }
}

/// Presents `scale * (inner - base)` on acquire; release writes through unchanged.
pub struct OffsetHandle<V> {
    inner: Handle<V>,
    base: Option<Arc<V>>,
    scale: Complex64,
}

impl<V> OffsetHandle<V> {
    pub fn new(inner: Handle<V>) -> Self {
        Self {
            inner,
            base: None,
            scale: Complex64::new(1.0, 0.0),
        }
    }

    pub fn with_base(mut self, base: Arc<V>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_scale(mut self, scale: Complex64) -> Self {
        self.scale = scale;
        self
    }
}

impl<V> fmt::Debug for OffsetHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetHandle")
            .field("inner", &self.inner)
            .field("has_base", &self.base.is_some())
            .field("scale", &self.scale)
            .finish()
    }
}

impl<V: Vector + 'static> VecHandle<V> for OffsetHandle<V> {
    fn acquire(&self) -> Result<V> {
        let mut value = self.inner.acquire()?;
        if let Some(base) = &self.base {
            value.axpy(Complex64::new(-1.0, 0.0), base);
        }
        if self.scale != Complex64::new(1.0, 0.0) {
            value.scale(self.scale);
        }
        Ok(value)
    }

    fn release(&self, value: &V) -> Result<()> {
        self.inner.release(value)
    }
}
