//! Memory-bounded inner-product matrices and linear combinations over vector handles.
//!
//! Every worker calls the same method with the same handle lists. Work is split
//! statically by rank, and no worker holds more than
//! [`VectorSpaceConfig::max_vecs_per_proc`] vectors at a time.

pub mod partition;

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::config::VectorSpaceConfig;
use crate::error::{ModalError, Result};
use crate::linalg::CMatrix;
use crate::parallel::{agree, sum_to_all, Topology};
use crate::vectors::{Handle, InnerProduct, Vector};

pub use partition::{
    chunk_ranges, general_blocks, partition_range, symmetric_blocks, Block, CombinePlan,
};

const SANITY_RTOL: f64 = 1e-10;

pub struct VectorSpace<V> {
    inner_product: Option<Arc<dyn InnerProduct<V>>>,
    topology: Arc<dyn Topology>,
    config: VectorSpaceConfig,
}

impl<V> Clone for VectorSpace<V> {
    fn clone(&self) -> Self {
        Self {
            inner_product: self.inner_product.clone(),
            topology: Arc::clone(&self.topology),
            config: self.config.clone(),
        }
    }
}

impl<V: Vector + 'static> VectorSpace<V> {
    pub fn new(topology: Arc<dyn Topology>, config: VectorSpaceConfig) -> Self {
        Self {
            inner_product: None,
            topology,
            config,
        }
    }

    pub fn with_inner_product(mut self, inner_product: impl InnerProduct<V> + 'static) -> Self {
        self.inner_product = Some(Arc::new(inner_product));
        self
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub(crate) fn topology_arc(&self) -> Arc<dyn Topology> {
        Arc::clone(&self.topology)
    }

    pub fn config(&self) -> &VectorSpaceConfig {
        &self.config
    }

    pub fn max_vecs_per_proc(&self) -> usize {
        self.config.max_vecs_per_proc(self.topology.as_ref())
    }

    fn inner_product(&self) -> Result<&dyn InnerProduct<V>> {
        self.inner_product
            .as_deref()
            .ok_or_else(|| ModalError::config("no inner product was supplied to the vector space"))
    }

    /// `M[i, j] = <rows[i], cols[j]>`, returned identically on every worker.
    pub fn compute_inner_product_mat(
        &self,
        rows: &[Handle<V>],
        cols: &[Handle<V>],
    ) -> Result<CMatrix> {
        let ip = self.inner_product()?;
        let (nrows, ncols) = (rows.len(), cols.len());
        if nrows == 0 || ncols == 0 {
            return Ok(CMatrix::zeros(nrows, ncols));
        }
        let quota = self.max_vecs_per_proc();
        let row_chunk = (quota / 2).max(1).min(nrows);
        let col_chunk = (quota - row_chunk).max(1);
        let blocks = general_blocks(nrows, ncols, row_chunk, col_chunk);
        let local = self.accumulate_blocks(ip, &blocks, rows, cols, false);
        let mat = sum_to_all(self.topology(), local)?;
        if self.topology.is_rank_zero() {
            info!(
                "computed {}x{} inner product matrix in {} blocks on {} workers",
                nrows,
                ncols,
                blocks.len(),
                self.topology.num_procs()
            );
        }
        Ok(mat)
    }

    /// Hermitian `M[i, j] = <handles[i], handles[j]>` from the upper triangle only.
    pub fn compute_symmetric_inner_product_mat(&self, handles: &[Handle<V>]) -> Result<CMatrix> {
        let ip = self.inner_product()?;
        let n = handles.len();
        if n == 0 {
            return Ok(CMatrix::zeros(0, 0));
        }
        let chunk = (self.max_vecs_per_proc() / 2).max(1);
        let blocks = symmetric_blocks(n, chunk);
        let local = self.accumulate_blocks(ip, &blocks, handles, handles, true);
        let mat = sum_to_all(self.topology(), local)?;
        if self.topology.is_rank_zero() {
            info!(
                "computed {}x{} symmetric inner product matrix in {} blocks on {} workers",
                n,
                n,
                blocks.len(),
                self.topology.num_procs()
            );
        }
        Ok(mat)
    }

    fn accumulate_blocks(
        &self,
        ip: &dyn InnerProduct<V>,
        blocks: &[Block],
        rows: &[Handle<V>],
        cols: &[Handle<V>],
        symmetric: bool,
    ) -> Result<CMatrix> {
        let topology = self.topology();
        let mine = &blocks[partition_range(blocks.len(), topology.num_procs(), topology.rank())];
        let mut partial = CMatrix::zeros(rows.len(), cols.len());
        let mut row_cache: Option<(Range<usize>, Vec<V>)> = None;
        let mut progress = Progress::new(&self.config, topology.is_rank_zero());
        for (done, block) in mine.iter().enumerate() {
            let row_vecs = cached_chunk(&mut row_cache, block.rows.clone(), rows)?;
            let loaded_cols;
            let col_vecs: &[V] = if symmetric && block.is_diagonal() {
                row_vecs
            } else {
                loaded_cols = acquire_all(cols, block.cols.clone())?;
                &loaded_cols
            };
            let (row0, col0) = (block.rows.start, block.cols.start);
            let values = block
                .pairs(symmetric)
                .into_par_iter()
                .map(|(i, j)| {
                    ip.inner(&row_vecs[i - row0], &col_vecs[j - col0])
                        .map(|value| ((i, j), value))
                })
                .collect::<Result<Vec<_>>>()?;
            for ((i, j), value) in values {
                partial[(i, j)] = value;
                if symmetric && i != j {
                    partial[(j, i)] = value.conj();
                }
            }
            progress.tick(done + 1, mine.len(), "inner product blocks");
        }
        Ok(partial)
    }

    /// Writes `sum_i coeffs[(i, k)] * basis[i]` through `outputs[k]` for every `k`.
    pub fn lin_combine(
        &self,
        basis: &[Handle<V>],
        coeffs: &CMatrix,
        outputs: &[Handle<V>],
    ) -> Result<()> {
        if basis.len() != coeffs.nrows() || outputs.len() != coeffs.ncols() {
            return Err(ModalError::shape(format!(
                "{} basis vectors and {} outputs do not fit a {}x{} coefficient matrix",
                basis.len(),
                outputs.len(),
                coeffs.nrows(),
                coeffs.ncols()
            )));
        }
        if outputs.is_empty() {
            return Ok(());
        }
        if basis.is_empty() {
            return Err(ModalError::shape("cannot build outputs from an empty basis"));
        }
        let topology = self.topology();
        let mine = partition_range(outputs.len(), topology.num_procs(), topology.rank());
        let local = self.combine_range(basis, coeffs, outputs, mine);
        agree(topology, local)?;
        if topology.is_rank_zero() {
            info!(
                "built {} outputs from {} basis vectors on {} workers",
                outputs.len(),
                basis.len(),
                topology.num_procs()
            );
        }
        Ok(())
    }

    fn combine_range(
        &self,
        basis: &[Handle<V>],
        coeffs: &CMatrix,
        outputs: &[Handle<V>],
        mine: Range<usize>,
    ) -> Result<()> {
        if mine.is_empty() {
            return Ok(());
        }
        let plan = CombinePlan::new(
            self.max_vecs_per_proc(),
            mine.len(),
            V::AXPY_IN_PLACE,
            rayon::current_num_threads(),
        );
        debug!("lin_combine plan {plan:?}");
        let mut progress = Progress::new(&self.config, self.topology.is_rank_zero());
        let total = mine.len();
        for out_range in chunk_ranges(mine.clone(), plan.outputs) {
            let mut accumulators: Vec<Option<V>> = out_range.clone().map(|_| None).collect();
            let per_task = plan.accumulators_per_task(accumulators.len());
            for basis_range in chunk_ranges(0..basis.len(), plan.basis) {
                let block = acquire_all(basis, basis_range.clone())?;
                if let [acc] = accumulators.as_mut_slice() {
                    consume_block(acc, block, coeffs, basis_range, out_range.start);
                    continue;
                }
                accumulators
                    .par_chunks_mut(per_task)
                    .enumerate()
                    .for_each(|(task, accs)| {
                        for (offset, acc) in accs.iter_mut().enumerate() {
                            let k = out_range.start + task * per_task + offset;
                            for (b, vec) in basis_range.clone().zip(&block) {
                                let factor = coeffs[(b, k)];
                                match acc {
                                    Some(sum) => sum.axpy(factor, vec),
                                    None => {
                                        let mut first = vec.clone();
                                        first.scale(factor);
                                        *acc = Some(first);
                                    }
                                }
                            }
                        }
                    });
            }
            for (k, acc) in out_range.clone().zip(accumulators) {
                if let Some(value) = acc {
                    outputs[k]
                        .release(&value)
                        .with_context(|| format!("release output vector {k}"))?;
                }
            }
            progress.tick(out_range.end - mine.start, total, "outputs");
        }
        Ok(())
    }

    /// Checks that a handle and the vector operations behave linearly.
    ///
    /// With a `scratch` handle the vector is also released and re-acquired.
    pub fn sanity_check(&self, handle: &Handle<V>, scratch: Option<&Handle<V>>) -> Result<()> {
        let ip = self.inner_product()?;
        let vec = handle.acquire().context("acquire vector for sanity check")?;
        let norm_sq = ip.inner(&vec, &vec)?;
        if !norm_sq.re.is_finite() || norm_sq.re < 0.0 {
            return Err(ModalError::config(format!(
                "inner product of a vector with itself is {norm_sq}"
            )));
        }
        let tol = SANITY_RTOL * norm_sq.norm().max(f64::MIN_POSITIVE);
        let check = |what: &str, got: Complex64, want: Complex64| -> Result<()> {
            if (got - want).norm() > tol * want.norm().max(1.0) {
                return Err(ModalError::config(format!(
                    "{what}: expected {want}, got {got}"
                )));
            }
            Ok(())
        };
        check("self inner product", norm_sq, Complex64::new(norm_sq.re, 0.0))?;

        let mut doubled = vec.clone();
        doubled.scale(Complex64::new(2.0, 0.0));
        check("scaled inner product", ip.inner(&doubled, &doubled)?, norm_sq * 4.0)?;

        let mut summed = vec.clone();
        summed.add_assign(&vec);
        check("sum inner product", ip.inner(&summed, &vec)?, norm_sq * 2.0)?;

        let mut cancelled = vec.clone();
        cancelled.axpy(Complex64::new(-1.0, 0.0), &vec);
        check("difference inner product", ip.inner(&cancelled, &cancelled)?, Complex64::new(0.0, 0.0))?;

        let again = handle.acquire().context("re-acquire vector for sanity check")?;
        check("re-acquired vector", ip.inner(&again, &vec)?, norm_sq)?;

        if let Some(scratch) = scratch {
            scratch.release(&vec).context("release vector for sanity check")?;
            let reloaded = scratch.acquire().context("acquire released vector")?;
            check("released vector", ip.inner(&reloaded, &vec)?, norm_sq)?;
        }
        debug!("sanity check passed for {:?}", handle);
        Ok(())
    }
}

/// Adds a loaded block into a lone accumulator, scaling the block vectors in place.
fn consume_block<V: Vector>(
    acc: &mut Option<V>,
    block: Vec<V>,
    coeffs: &CMatrix,
    basis_range: Range<usize>,
    k: usize,
) {
    for (b, mut vec) in basis_range.zip(block) {
        vec.scale(coeffs[(b, k)]);
        match acc {
            Some(sum) => sum.add_assign(&vec),
            None => *acc = Some(vec),
        }
    }
}

fn acquire_all<V: Vector>(handles: &[Handle<V>], range: Range<usize>) -> Result<Vec<V>> {
    let start = range.start;
    handles[range]
        .par_iter()
        .enumerate()
        .map(|(offset, handle)| {
            handle
                .acquire()
                .with_context(|| format!("acquire vector {}", start + offset))
        })
        .collect::<anyhow::Result<Vec<V>>>()
        .map_err(ModalError::from)
}

/// Returns the vectors of `range`, reusing the previous load when the range repeats.
fn cached_chunk<'a, V: Vector>(
    cache: &'a mut Option<(Range<usize>, Vec<V>)>,
    range: Range<usize>,
    handles: &[Handle<V>],
) -> Result<&'a [V]> {
    let hit = matches!(cache.as_ref(), Some((cached, _)) if *cached == range);
    if !hit {
        // Drop the old chunk before loading the new one.
        *cache = None;
        let loaded = acquire_all(handles, range.clone())?;
        return Ok(cache.insert((range, loaded)).1.as_slice());
    }
    Ok(cache.as_ref().map_or(&[][..], |(_, vecs)| vecs.as_slice()))
}

struct Progress {
    enabled: bool,
    interval: Duration,
    last: Instant,
}

impl Progress {
    fn new(config: &VectorSpaceConfig, enabled: bool) -> Self {
        Self {
            enabled,
            interval: Duration::from_secs(config.print_interval_secs),
            last: Instant::now(),
        }
    }

    fn tick(&mut self, done: usize, total: usize, what: &str) {
        if self.enabled && self.last.elapsed() >= self.interval {
            debug!("processed {done}/{total} {what}");
            self.last = Instant::now();
        }
    }
}
