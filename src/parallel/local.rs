use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use super::{Payload, Topology};

const MISSING_PAYLOAD: &str = "collective slot was empty";

/// The degenerate topology: one worker, every collective is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Topology for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn num_procs(&self) -> usize {
        1
    }

    fn num_nodes(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn broadcast(&self, payload: Option<Payload>, _root: usize) -> Payload {
        payload.unwrap_or_else(|| Payload::Failure(MISSING_PAYLOAD.to_string()))
    }

    fn gather(&self, payload: Payload, _root: usize) -> Option<Vec<Payload>> {
        Some(vec![payload])
    }
}

#[derive(Debug)]
struct ClusterState {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Payload>>>,
    num_procs: usize,
    num_nodes: usize,
}

/// One worker of a [`LocalCluster`], backed by an OS thread.
#[derive(Debug, Clone)]
pub struct ThreadWorker {
    rank: usize,
    state: Arc<ClusterState>,
}

impl Topology for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_procs(&self) -> usize {
        self.state.num_procs
    }

    fn num_nodes(&self) -> usize {
        self.state.num_nodes
    }

    fn barrier(&self) {
        self.state.barrier.wait();
    }

    fn broadcast(&self, payload: Option<Payload>, root: usize) -> Payload {
        if self.rank == root {
            self.state.slots.lock()[root] = payload;
        }
        self.state.barrier.wait();
        let value = self.state.slots.lock()[root]
            .clone()
            .unwrap_or_else(|| Payload::Failure(MISSING_PAYLOAD.to_string()));
        // Nobody may reuse the slot until every worker has read it.
        self.state.barrier.wait();
        value
    }

    fn gather(&self, payload: Payload, root: usize) -> Option<Vec<Payload>> {
        self.state.slots.lock()[self.rank] = Some(payload);
        self.state.barrier.wait();
        let gathered = (self.rank == root).then(|| {
            self.state
                .slots
                .lock()
                .iter_mut()
                .map(|slot| {
                    slot.take()
                        .unwrap_or_else(|| Payload::Failure(MISSING_PAYLOAD.to_string()))
                })
                .collect()
        });
        self.state.barrier.wait();
        gathered
    }
}

/// A fixed group of in-process workers that share memory but follow the same
/// SPMD protocol as separate processes would.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    num_procs: usize,
    num_nodes: usize,
}

impl LocalCluster {
    pub fn new(num_procs: usize) -> Self {
        Self {
            num_procs: num_procs.max(1),
            num_nodes: 1,
        }
    }

    pub fn with_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes.clamp(1, self.num_procs);
        self
    }

    pub fn num_procs(&self) -> usize {
        self.num_procs
    }

    pub fn workers(&self) -> Vec<Arc<dyn Topology>> {
        let state = Arc::new(ClusterState {
            barrier: Barrier::new(self.num_procs),
            slots: Mutex::new(vec![None; self.num_procs]),
            num_procs: self.num_procs,
            num_nodes: self.num_nodes,
        });
        (0..self.num_procs)
            .map(|rank| {
                Arc::new(ThreadWorker {
                    rank,
                    state: Arc::clone(&state),
                }) as Arc<dyn Topology>
            })
            .collect()
    }

    /// Runs `job` once per worker on its own thread and returns the results in rank order.
    pub fn run<T, F>(&self, job: F) -> Vec<T>
    where
        F: Fn(Arc<dyn Topology>) -> T + Sync,
        T: Send,
    {
        let workers = self.workers();
        std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|worker| {
                    let job = &job;
                    scope.spawn(move || job(worker))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        })
    }
}
