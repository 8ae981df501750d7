use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ModalError, Result};
use crate::parallel::Topology;

pub const DEFAULT_MAX_VECS_PER_NODE: usize = 10_000;
pub const DEFAULT_PRINT_INTERVAL_SECS: u64 = 10;
/// Smallest quota that still fits one row and one column vector.
pub const MIN_VECS_PER_PROC: usize = 2;
pub const DEFAULT_ATOL: f64 = 1e-13;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSpaceConfig {
    /// Vectors that may be resident at once across all workers of one node.
    pub max_vecs_per_node: usize,
    /// Minimum spacing between progress messages.
    pub print_interval_secs: u64,
}

impl Default for VectorSpaceConfig {
    fn default() -> Self {
        Self {
            max_vecs_per_node: DEFAULT_MAX_VECS_PER_NODE,
            print_interval_secs: DEFAULT_PRINT_INTERVAL_SECS,
        }
    }
}

impl VectorSpaceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| ModalError::config(format!("parse vector space config: {err}")))
    }

    pub fn with_max_vecs_per_node(mut self, max_vecs_per_node: usize) -> Self {
        self.max_vecs_per_node = max_vecs_per_node;
        self
    }

    pub fn with_print_interval_secs(mut self, secs: u64) -> Self {
        self.print_interval_secs = secs;
        self
    }

    /// Per-worker quota: workers on one node share that node's budget.
    pub fn max_vecs_per_proc(&self, topology: &dyn Topology) -> usize {
        let procs = topology.num_procs().max(1);
        let derived = self.max_vecs_per_node * topology.num_nodes() / procs;
        if derived < MIN_VECS_PER_PROC {
            if topology.is_rank_zero() {
                warn!(
                    "max_vecs_per_node={} leaves {} vectors per worker; using {}",
                    self.max_vecs_per_node, derived, MIN_VECS_PER_PROC
                );
            }
            return MIN_VECS_PER_PROC;
        }
        derived
    }
}

/// Which eigen/singular values survive truncation.
///
/// A value is kept when it exceeds `atol` and, if set, `rtol` times the largest value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationTolerance {
    pub atol: f64,
    pub rtol: Option<f64>,
}

impl Default for TruncationTolerance {
    fn default() -> Self {
        Self {
            atol: DEFAULT_ATOL,
            rtol: None,
        }
    }
}

impl TruncationTolerance {
    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = Some(rtol);
        self
    }

    pub fn keeps(&self, value: f64, largest: f64) -> bool {
        value > self.atol && self.rtol.map_or(true, |rtol| value > rtol * largest)
    }

    /// Indices of `values` (sorted descending) that survive, capped at `max_rank`.
    pub fn retained(&self, values: &[f64], max_rank: Option<usize>) -> Vec<usize> {
        let largest = values.first().copied().unwrap_or(0.0);
        let mut kept: Vec<usize> = (0..values.len())
            .filter(|&i| self.keeps(values[i], largest))
            .collect();
        if let Some(max_rank) = max_rank {
            kept.truncate(max_rank);
        }
        kept
    }
}
