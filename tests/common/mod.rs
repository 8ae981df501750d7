#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use modalspace::{
    ArrayVector, CMatrix, Handle, InnerProductWeights, MemoryHandle, VecHandle, Vector,
};
use nalgebra::DVector;
use num_complex::Complex64;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

pub fn random_data(rows: usize, cols: usize, seed: u64) -> CMatrix {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    CMatrix::from_fn(rows, cols, |_, _| {
        Complex64::new(rng.gen_range(-1.0..1.0), 0.0)
    })
}

pub fn random_complex_data(rows: usize, cols: usize, seed: u64) -> CMatrix {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    CMatrix::from_fn(rows, cols, |_, _| {
        Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
    })
}

/// The three weightings exercised end to end.
pub fn weight_schemes(dim: usize) -> Vec<(&'static str, InnerProductWeights)> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(17);
    let diagonal: Vec<f64> = (0..dim).map(|_| rng.gen_range(0.5..2.0)).collect();
    let factor = random_data(dim, dim, 23);
    let spd = factor.adjoint() * &factor + CMatrix::identity(dim, dim) * Complex64::new(dim as f64, 0.0);
    vec![
        ("identity", InnerProductWeights::Identity),
        ("diagonal", InnerProductWeights::Diagonal(diagonal)),
        (
            "full",
            InnerProductWeights::full(&spd).expect("spd weights"),
        ),
    ]
}

pub fn memory_handles(data: &CMatrix) -> Vec<Handle<ArrayVector>> {
    ArrayVector::columns_of(data)
        .into_iter()
        .map(|vec| Arc::new(MemoryHandle::new(vec)) as Handle<ArrayVector>)
        .collect()
}

pub fn empty_handles(n: usize) -> Vec<Arc<MemoryHandle<ArrayVector>>> {
    (0..n).map(|_| Arc::new(MemoryHandle::empty())).collect()
}

pub fn as_handles(handles: &[Arc<MemoryHandle<ArrayVector>>]) -> Vec<Handle<ArrayVector>> {
    handles
        .iter()
        .map(|h| Arc::clone(h) as Handle<ArrayVector>)
        .collect()
}

pub fn collect_columns(handles: &[Arc<MemoryHandle<ArrayVector>>]) -> CMatrix {
    let columns: Vec<_> = handles
        .iter()
        .map(|h| h.get().expect("output was written").0)
        .collect();
    CMatrix::from_columns(&columns)
}

fn close(a: Complex64, b: Complex64, rtol: f64, atol: f64) -> bool {
    (a - b).norm() <= atol + rtol * b.norm()
}

pub fn assert_allclose(actual: &CMatrix, expected: &CMatrix, rtol: f64, atol: f64) {
    assert_eq!(actual.shape(), expected.shape(), "shape");
    for (idx, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(close(*a, *b, rtol, atol), "entry {idx}: {a} vs {b}");
    }
}

pub fn assert_vectors_close(actual: &DVector<f64>, expected: &DVector<f64>, rtol: f64) {
    assert_eq!(actual.len(), expected.len(), "length");
    for (k, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!((a - b).abs() <= rtol * b.abs().max(1.0), "entry {k}: {a} vs {b}");
    }
}

/// Compares column by column, accepting a sign flip of each column.
pub fn assert_columns_close_up_to_sign(actual: &CMatrix, expected: &CMatrix, rtol: f64, atol: f64) {
    assert_eq!(actual.shape(), expected.shape(), "shape");
    for j in 0..actual.ncols() {
        let a = actual.column(j);
        let b = expected.column(j);
        let same = a.iter().zip(b.iter()).all(|(x, y)| close(*x, *y, rtol, atol));
        let flipped = a.iter().zip(b.iter()).all(|(x, y)| close(-*x, *y, rtol, atol));
        assert!(same || flipped, "column {j} differs:\n{a}\nvs\n{b}");
    }
}

/// Counts how many vectors exist at once.
#[derive(Debug, Default)]
pub struct Tracker {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    fn created(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TrackedVector {
    pub data: DVector<Complex64>,
    tracker: Arc<Tracker>,
}

impl TrackedVector {
    pub fn new(data: DVector<Complex64>, tracker: Arc<Tracker>) -> Self {
        tracker.created();
        Self { data, tracker }
    }
}

impl Clone for TrackedVector {
    fn clone(&self) -> Self {
        Self::new(self.data.clone(), Arc::clone(&self.tracker))
    }
}

impl Drop for TrackedVector {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Vector for TrackedVector {
    const AXPY_IN_PLACE: bool = true;

    fn scale(&mut self, factor: Complex64) {
        self.data *= factor;
    }

    fn add_assign(&mut self, other: &Self) {
        self.data += &other.data;
    }

    fn axpy(&mut self, factor: Complex64, other: &Self) {
        self.data.axpy(factor, &other.data, Complex64::new(1.0, 0.0));
    }
}

pub fn tracked_inner(a: &TrackedVector, b: &TrackedVector) -> Complex64 {
    a.data.dotc(&b.data)
}

/// Shared storage slot; each worker reads it through its own tracker.
#[derive(Debug)]
pub struct TrackedHandle {
    slot: Arc<RwLock<Option<DVector<Complex64>>>>,
    tracker: Arc<Tracker>,
}

impl TrackedHandle {
    pub fn slots(data: &CMatrix) -> Vec<Arc<RwLock<Option<DVector<Complex64>>>>> {
        data.column_iter()
            .map(|c| Arc::new(RwLock::new(Some(c.into_owned()))))
            .collect()
    }

    pub fn empty_slots(n: usize) -> Vec<Arc<RwLock<Option<DVector<Complex64>>>>> {
        (0..n).map(|_| Arc::new(RwLock::new(None))).collect()
    }

    pub fn over(
        slots: &[Arc<RwLock<Option<DVector<Complex64>>>>],
        tracker: &Arc<Tracker>,
    ) -> Vec<Handle<TrackedVector>> {
        slots
            .iter()
            .map(|slot| {
                Arc::new(TrackedHandle {
                    slot: Arc::clone(slot),
                    tracker: Arc::clone(tracker),
                }) as Handle<TrackedVector>
            })
            .collect()
    }
}

impl VecHandle<TrackedVector> for TrackedHandle {
    fn acquire(&self) -> anyhow::Result<TrackedVector> {
        let data = self
            .slot
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("slot is empty"))?;
        Ok(TrackedVector::new(data, Arc::clone(&self.tracker)))
    }

    fn release(&self, value: &TrackedVector) -> anyhow::Result<()> {
        *self.slot.write() = Some(value.data.clone());
        Ok(())
    }
}

/// Implements only `scale` and `add_assign`, so `axpy` falls back to a temporary copy.
#[derive(Debug, Clone)]
pub struct MinimalVector(pub TrackedVector);

impl Vector for MinimalVector {
    fn scale(&mut self, factor: Complex64) {
        self.0.data *= factor;
    }

    fn add_assign(&mut self, other: &Self) {
        self.0.data += &other.0.data;
    }
}

#[derive(Debug)]
pub struct MinimalHandle(TrackedHandle);

impl MinimalHandle {
    pub fn over(
        slots: &[Arc<RwLock<Option<DVector<Complex64>>>>],
        tracker: &Arc<Tracker>,
    ) -> Vec<Handle<MinimalVector>> {
        slots
            .iter()
            .map(|slot| {
                Arc::new(MinimalHandle(TrackedHandle {
                    slot: Arc::clone(slot),
                    tracker: Arc::clone(tracker),
                })) as Handle<MinimalVector>
            })
            .collect()
    }
}

impl VecHandle<MinimalVector> for MinimalHandle {
    fn acquire(&self) -> anyhow::Result<MinimalVector> {
        self.0.acquire().map(MinimalVector)
    }

    fn release(&self, value: &MinimalVector) -> anyhow::Result<()> {
        self.0.release(&value.0)
    }
}

pub fn collect_slots(slots: &[Arc<RwLock<Option<DVector<Complex64>>>>]) -> CMatrix {
    let columns: Vec<_> = slots
        .iter()
        .map(|slot| slot.read().clone().expect("slot was written"))
        .collect();
    CMatrix::from_columns(&columns)
}
