//! Vector, inner-product and handle capabilities the engine is generic over.

pub mod array;
pub mod handles;

use std::fmt;
use std::sync::Arc;

use num_complex::Complex64;

use crate::error::Result;

pub use array::{ArrayVector, InnerProductWeights, WeightedInnerProduct};
pub use handles::{JsonFileHandle, MemoryHandle, OffsetHandle};

/// A snapshot value. Only in-place linear operations are required.
pub trait Vector: Clone + Send + Sync {
    /// Set by backends whose `axpy` updates `self` without a temporary vector.
    const AXPY_IN_PLACE: bool = false;

    fn scale(&mut self, factor: Complex64);

    fn add_assign(&mut self, other: &Self);

    /// `self += factor * other`
    fn axpy(&mut self, factor: Complex64, other: &Self) {
        let mut scaled = other.clone();
        scaled.scale(factor);
        self.add_assign(&scaled);
    }
}

/// Conjugate-symmetric inner product, conjugate-linear in the first argument.
pub trait InnerProduct<V>: Send + Sync {
    fn inner(&self, a: &V, b: &V) -> Result<Complex64>;
}

impl<V, F> InnerProduct<V> for F
where
    F: Fn(&V, &V) -> Complex64 + Send + Sync,
{
    fn inner(&self, a: &V, b: &V) -> Result<Complex64> {
        Ok(self(a, b))
    }
}

/// Lazily materialised vector: `acquire` loads it, `release` stores one.
pub trait VecHandle<V>: Send + Sync + fmt::Debug {
    fn acquire(&self) -> anyhow::Result<V>;

    fn release(&self, value: &V) -> anyhow::Result<()>;
}

pub type Handle<V> = Arc<dyn VecHandle<V>>;
