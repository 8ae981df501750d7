//! Process topology and the collective helpers built on top of it.
//!
//! Every worker runs the same sequence of collective calls. A worker that fails
//! locally still takes part in the collective, contributing a
//! [`Payload::Failure`] token so its peers leave with an error instead of
//! waiting forever.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi_world;

use std::fmt;

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{ModalError, Result};
use crate::linalg::CMatrix;

pub use local::{LocalCluster, SingleProcess, ThreadWorker};
#[cfg(feature = "mpi")]
pub use mpi_world::MpiTopology;

/// Rank that gathers partial results and runs the dense decompositions.
pub const ROOT: usize = 0;

#[derive(Debug, Clone)]
pub enum Payload {
    Matrices(Vec<CMatrix>),
    Failure(String),
}

#[derive(Serialize, Deserialize)]
enum WirePayload {
    Matrices(Vec<WireMatrix>),
    Failure(String),
}

#[derive(Serialize, Deserialize)]
struct WireMatrix {
    rows: usize,
    cols: usize,
    re: Vec<f64>,
    im: Vec<f64>,
}

impl Payload {
    /// Byte form for process boundaries.
    ///
    /// Non-finite entries do not survive the trip and arrive as a failure token.
    pub fn encode(&self) -> Vec<u8> {
        let wire = match self {
            Payload::Matrices(matrices) => WirePayload::Matrices(
                matrices
                    .iter()
                    .map(|m| WireMatrix {
                        rows: m.nrows(),
                        cols: m.ncols(),
                        re: m.iter().map(|v| v.re).collect(),
                        im: m.iter().map(|v| v.im).collect(),
                    })
                    .collect(),
            ),
            Payload::Failure(message) => WirePayload::Failure(message.clone()),
        };
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    /// Inverse of [`Payload::encode`]; malformed bytes decode to a failure token.
    pub fn decode(bytes: &[u8]) -> Payload {
        let wire: WirePayload = match serde_json::from_slice(bytes) {
            Ok(wire) => wire,
            Err(err) => return Payload::Failure(format!("malformed payload: {err}")),
        };
        match wire {
            WirePayload::Failure(message) => Payload::Failure(message),
            WirePayload::Matrices(matrices) => {
                let mut decoded = Vec::with_capacity(matrices.len());
                for m in matrices {
                    let len = m.rows * m.cols;
                    if m.re.len() != len || m.im.len() != len {
                        return Payload::Failure(format!(
                            "payload matrix {}x{} carries {} entries",
                            m.rows,
                            m.cols,
                            m.re.len()
                        ));
                    }
                    decoded.push(DMatrix::from_iterator(
                        m.rows,
                        m.cols,
                        m.re.iter().zip(&m.im).map(|(re, im)| Complex64::new(*re, *im)),
                    ));
                }
                Payload::Matrices(decoded)
            }
        }
    }
}

pub trait Topology: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn num_procs(&self) -> usize;

    fn num_nodes(&self) -> usize;

    fn barrier(&self);

    /// Every worker returns the payload supplied by `root`; other workers pass `None`.
    fn broadcast(&self, payload: Option<Payload>, root: usize) -> Payload;

    /// Collects one payload per worker, in rank order, on `root` only.
    fn gather(&self, payload: Payload, root: usize) -> Option<Vec<Payload>>;

    fn procs_per_node(&self) -> usize {
        let nodes = self.num_nodes().max(1);
        (self.num_procs() + nodes - 1) / nodes
    }

    fn is_rank_zero(&self) -> bool {
        self.rank() == ROOT
    }

    fn is_distributed(&self) -> bool {
        self.num_procs() > 1
    }
}

/// Runs `compute` on the root worker only and broadcasts its matrices.
///
/// A failure on the root is broadcast as a token: the root returns its own
/// error, every other worker returns [`ModalError::CollectiveAborted`].
pub fn compute_then_broadcast<F>(topology: &dyn Topology, compute: F) -> Result<Vec<CMatrix>>
where
    F: FnOnce() -> Result<Vec<CMatrix>>,
{
    if !topology.is_distributed() {
        return compute();
    }
    if topology.is_rank_zero() {
        match compute() {
            Ok(matrices) => {
                topology.broadcast(Some(Payload::Matrices(matrices.clone())), ROOT);
                Ok(matrices)
            }
            Err(err) => {
                let token = Payload::Failure(format!("rank {}: {}", ROOT, err));
                topology.broadcast(Some(token), ROOT);
                Err(err)
            }
        }
    } else {
        into_matrices(topology.broadcast(None, ROOT))
    }
}

/// Runs a side effect (typically a matrix write) on the root worker only.
pub fn run_on_root<F>(topology: &dyn Topology, action: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    compute_then_broadcast(topology, || action().map(|_| Vec::new())).map(|_| ())
}

/// Sums every worker's partial matrix and hands the total to all workers.
pub fn sum_to_all(topology: &dyn Topology, local: Result<CMatrix>) -> Result<CMatrix> {
    if !topology.is_distributed() {
        return local;
    }
    let rank = topology.rank();
    let (token, local_error) = match local {
        Ok(partial) => (Payload::Matrices(vec![partial]), None),
        Err(err) => (Payload::Failure(format!("rank {}: {}", rank, err)), Some(err)),
    };
    let reduced = topology.gather(token, ROOT).map(reduce_sum);
    let outcome = topology.broadcast(reduced, ROOT);
    if let Some(err) = local_error {
        return Err(err);
    }
    let mut matrices = into_matrices(outcome)?;
    matrices
        .pop()
        .ok_or_else(|| ModalError::CollectiveAborted("reduction produced no matrix".to_string()))
}

/// Makes every worker agree on the outcome of a local step.
///
/// Returns the local error if there was one, otherwise an abort if any peer failed.
pub fn agree(topology: &dyn Topology, local: Result<()>) -> Result<()> {
    if !topology.is_distributed() {
        return local;
    }
    let rank = topology.rank();
    let (token, local_error) = match local {
        Ok(()) => (Payload::Matrices(Vec::new()), None),
        Err(err) => (Payload::Failure(format!("rank {}: {}", rank, err)), Some(err)),
    };
    let verdict = topology.gather(token, ROOT).map(|payloads| {
        first_failure(&payloads)
            .map(Payload::Failure)
            .unwrap_or_else(|| Payload::Matrices(Vec::new()))
    });
    let outcome = topology.broadcast(verdict, ROOT);
    if let Some(err) = local_error {
        return Err(err);
    }
    into_matrices(outcome).map(|_| ())
}

fn reduce_sum(payloads: Vec<Payload>) -> Payload {
    if let Some(message) = first_failure(&payloads) {
        return Payload::Failure(message);
    }
    let mut total: Option<CMatrix> = None;
    for payload in payloads {
        let Payload::Matrices(matrices) = payload else {
            continue;
        };
        for partial in matrices {
            match total.as_mut() {
                Some(sum) if sum.shape() == partial.shape() => *sum += partial,
                Some(sum) => {
                    return Payload::Failure(format!(
                        "partial matrix shape {:?} does not match {:?}",
                        partial.shape(),
                        sum.shape()
                    ))
                }
                None => total = Some(partial),
            }
        }
    }
    match total {
        Some(sum) => Payload::Matrices(vec![sum]),
        None => Payload::Failure("no partial matrices were gathered".to_string()),
    }
}

fn first_failure(payloads: &[Payload]) -> Option<String> {
    payloads.iter().find_map(|payload| match payload {
        Payload::Failure(message) => Some(message.clone()),
        Payload::Matrices(_) => None,
    })
}

fn into_matrices(payload: Payload) -> Result<Vec<CMatrix>> {
    match payload {
        Payload::Matrices(matrices) => Ok(matrices),
        Payload::Failure(message) => Err(ModalError::CollectiveAborted(message)),
    }
}
