//! Multi-process topology over MPI, built with the `mpi` cargo feature.
//!
//! Launch the program with `mpirun -n <procs>`. Each collective sends a length
//! first and the encoded [`Payload`] bytes second.

use std::collections::BTreeSet;
use std::fmt;

use log::{info, warn};
use mpi::datatype::PartitionMut;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::{Count, Threading};
use parking_lot::Mutex;

use super::{Payload, Topology, ROOT};
use crate::error::{ModalError, Result};

pub struct MpiTopology {
    world: SimpleCommunicator,
    // Declared after `world`: dropping the universe finalises MPI.
    _universe: Universe,
    rank: usize,
    num_procs: usize,
    num_nodes: usize,
    serial: Mutex<()>,
}

// SAFETY: MPI is initialised with `Threading::Serialized`, which allows calls from
// any thread as long as they never overlap. Every call below holds `serial`.
unsafe impl Send for MpiTopology {}
unsafe impl Sync for MpiTopology {}

impl MpiTopology {
    /// Initialises MPI for this process and counts the distinct nodes.
    ///
    /// Collective: every process must call it. Fails if MPI is already initialised.
    pub fn init() -> Result<Self> {
        let (universe, provided) = mpi::initialize_with_threading(Threading::Serialized)
            .ok_or_else(|| ModalError::config("MPI is already initialised"))?;
        if matches!(provided, Threading::Single | Threading::Funneled) {
            return Err(ModalError::config(
                "the MPI library cannot serialise calls from several threads",
            ));
        }
        let world = universe.world();
        let rank = world.rank() as usize;
        let num_procs = world.size() as usize;
        let mut topology = Self {
            world,
            _universe: universe,
            rank,
            num_procs,
            num_nodes: 1,
            serial: Mutex::new(()),
        };
        topology.num_nodes = topology.count_nodes();
        if topology.is_rank_zero() {
            info!(
                "MPI topology with {} processes on {} nodes",
                topology.num_procs, topology.num_nodes
            );
        }
        Ok(topology)
    }

    fn count_nodes(&self) -> usize {
        let name = mpi::environment::processor_name().unwrap_or_else(|err| {
            warn!("rank {}: unreadable processor name ({err}); counting it as its own node", self.rank);
            format!("rank-{}", self.rank)
        });
        let names = self.gather_bytes(name.into_bytes(), ROOT);
        let mut count = names.map_or(0, |names| names.into_iter().collect::<BTreeSet<_>>().len()) as u64;
        self.world
            .process_at_rank(ROOT as i32)
            .broadcast_into(&mut count);
        (count as usize).max(1)
    }

    fn gather_bytes(&self, bytes: Vec<u8>, root: usize) -> Option<Vec<Vec<u8>>> {
        let root_process = self.world.process_at_rank(root as i32);
        let len = bytes.len() as Count;
        if self.rank != root {
            root_process.gather_into(&len);
            root_process.gather_varcount_into(&bytes[..]);
            return None;
        }
        let mut lens: Vec<Count> = vec![0; self.num_procs];
        root_process.gather_into_root(&len, &mut lens[..]);
        let displs: Vec<Count> = lens
            .iter()
            .scan(0, |offset, &len| {
                let start = *offset;
                *offset += len;
                Some(start)
            })
            .collect();
        let total: usize = lens.iter().map(|&len| len as usize).sum();
        let mut buffer = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut buffer[..], &lens[..], &displs[..]);
            root_process.gather_varcount_into_root(&bytes[..], &mut partition);
        }
        Some(
            lens.iter()
                .zip(&displs)
                .map(|(&len, &start)| {
                    let start = start as usize;
                    buffer[start..start + len as usize].to_vec()
                })
                .collect(),
        )
    }

    fn broadcast_bytes(&self, bytes: Option<Vec<u8>>, root: usize) -> Vec<u8> {
        let root_process = self.world.process_at_rank(root as i32);
        let mut buffer = bytes.unwrap_or_default();
        let mut len = buffer.len() as u64;
        root_process.broadcast_into(&mut len);
        buffer.resize(len as usize, 0);
        root_process.broadcast_into(&mut buffer[..]);
        buffer
    }
}

impl fmt::Debug for MpiTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiTopology")
            .field("rank", &self.rank)
            .field("num_procs", &self.num_procs)
            .field("num_nodes", &self.num_nodes)
            .finish()
    }
}

impl Topology for MpiTopology {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_procs(&self) -> usize {
        self.num_procs
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn barrier(&self) {
        let _serial = self.serial.lock();
        self.world.barrier();
    }

    fn broadcast(&self, payload: Option<Payload>, root: usize) -> Payload {
        let _serial = self.serial.lock();
        Payload::decode(&self.broadcast_bytes(payload.map(|p| p.encode()), root))
    }

    fn gather(&self, payload: Payload, root: usize) -> Option<Vec<Payload>> {
        let _serial = self.serial.lock();
        self.gather_bytes(payload.encode(), root)
            .map(|all| all.iter().map(|bytes| Payload::decode(bytes)).collect())
    }
}
