// SPDX-License-Identifier: Apache-2.0

//! The simulated world: processes, nodes, and the shared cores that tie the
//! runtime together.
//!
//! A [`World`] is built once with a fixed node partition and then launched
//! with a per-process entry function; each simulated process runs on its own
//! OS thread and interacts with the others exclusively through runtime calls.

use crate::agent::AgentState;
use crate::buffer::RmaBuf;
use crate::coll::CollTable;
use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::mailbox::Mailbox;
use crate::window::OpStats;
use crate::Rank;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How long a blocked process waits between progress polls.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Per-process shared state.
pub(crate) struct ProcCore {
    pub(crate) mailbox: Mailbox,
    pub(crate) agent: Mutex<AgentState>,
}

/// Origin-visible synchronization counters, published by target agents.
///
/// Keys are `(window id, origin world rank, target world rank)`. All counters
/// are monotonic so origins can wait on `>=` without reset races.
#[derive(Default)]
pub(crate) struct SyncTable {
    pub(crate) completed: HashMap<(u64, Rank, Rank), u64>,
    pub(crate) granted: HashMap<(u64, Rank, Rank), u64>,
    pub(crate) unlocked: HashMap<(u64, Rank, Rank), u64>,
}

/// Shared core of a world.
pub(crate) struct WorldCore {
    pub(crate) nprocs: usize,
    pub(crate) node_of: Vec<usize>,
    pub(crate) nodes: Vec<Vec<Rank>>,
    pub(crate) procs: Vec<ProcCore>,
    pub(crate) colls: CollTable,
    pub(crate) sync: Mutex<SyncTable>,
    /// Shared regions handed out by `allocate_shared`, until their owning
    /// window is freed.
    pub(crate) regions: Mutex<HashMap<u64, RmaBuf>>,
    /// Delivery statistics per window, keyed by serving world rank.
    pub(crate) stats: Mutex<HashMap<u64, HashMap<Rank, OpStats>>>,
    next_comm_id: AtomicU64,
    next_win_id: AtomicU64,
    next_region_id: AtomicU64,
    abort_code: Mutex<Option<i32>>,
    event_seq: Mutex<u64>,
    event_cv: Condvar,
}

impl WorldCore {
    /// Wakes every blocked process so it can re-evaluate its predicate.
    pub(crate) fn notify(&self) {
        {
            let mut seq = self.event_seq.lock();
            *seq += 1;
        }
        let _ = self.event_cv.notify_all();
    }

    /// Blocks briefly, waking early on any world event.
    pub(crate) fn wait_short(&self) {
        let mut seq = self.event_seq.lock();
        let _ = self.event_cv.wait_for(&mut seq, POLL_INTERVAL);
    }

    pub(crate) fn check_abort(&self) -> Result<()> {
        match *self.abort_code.lock() {
            Some(code) => Err(Error::Aborted { code }),
            None => Ok(()),
        }
    }

    pub(crate) fn alloc_comm_id(&self) -> u64 {
        self.next_comm_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_win_id(&self) -> u64 {
        self.next_win_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_region_id(&self) -> u64 {
        self.next_region_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn bump_stats(&self, win: u64, serving: Rank, bytes: u64) {
        let mut stats = self.stats.lock();
        let entry = stats
            .entry(win)
            .or_default()
            .entry(serving)
            .or_default();
        entry.ops += 1;
        entry.bytes += bytes;
    }
}

/// Blocks world rank `rank` until `pred` yields a value, draining the
/// process's RMA agent on every poll (the progress-on-entry rule).
pub(crate) fn wait_progress<T>(
    core: &WorldCore,
    rank: Rank,
    mut pred: impl FnMut() -> Option<T>,
) -> Result<T> {
    loop {
        crate::agent::drain(core, rank);
        core.check_abort()?;
        if let Some(value) = pred() {
            return Ok(value);
        }
        core.wait_short();
    }
}

/// Builder for a [`World`].
#[derive(Debug, Clone)]
pub struct WorldBuilder {
    nodes: usize,
    procs_per_node: usize,
}

impl WorldBuilder {
    /// Sets the number of simulated nodes (default 1).
    #[must_use]
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the number of processes per node (default 1).
    #[must_use]
    pub fn procs_per_node(mut self, procs: usize) -> Self {
        self.procs_per_node = procs;
        self
    }

    /// Builds the world. Process ranks are dense, node-major: node `n` holds
    /// ranks `n * procs_per_node .. (n + 1) * procs_per_node`.
    #[must_use]
    pub fn build(self) -> World {
        let nprocs = self.nodes * self.procs_per_node;
        let mut node_of = Vec::with_capacity(nprocs);
        let mut nodes = vec![Vec::new(); self.nodes];
        for rank in 0..nprocs {
            let node = rank / self.procs_per_node;
            node_of.push(node);
            nodes[node].push(rank);
        }
        let procs = (0..nprocs)
            .map(|_| ProcCore {
                mailbox: Mailbox::new(),
                agent: Mutex::new(AgentState::default()),
            })
            .collect();
        World {
            core: Arc::new(WorldCore {
                nprocs,
                node_of,
                nodes,
                procs,
                colls: CollTable::new(),
                sync: Mutex::new(SyncTable::default()),
                regions: Mutex::new(HashMap::new()),
                stats: Mutex::new(HashMap::new()),
                next_comm_id: AtomicU64::new(1),
                next_win_id: AtomicU64::new(1),
                next_region_id: AtomicU64::new(1),
                abort_code: Mutex::new(None),
                event_seq: Mutex::new(0),
                event_cv: Condvar::new(),
            }),
        }
    }
}

/// A simulated multi-node deployment.
pub struct World {
    core: Arc<WorldCore>,
}

impl World {
    /// Starts building a world.
    #[must_use]
    pub fn builder() -> WorldBuilder {
        WorldBuilder {
            nodes: 1,
            procs_per_node: 1,
        }
    }

    /// Total number of processes.
    #[must_use]
    pub fn num_procs(&self) -> usize {
        self.core.nprocs
    }

    /// Runs `f` once per process, each on its own thread, and joins them all.
    ///
    /// Panics of any process are propagated after every thread has been
    /// joined; otherwise the first error any process returned is surfaced.
    /// The error type is generic so layers above can run their own errors
    /// through the harness.
    pub fn launch<F, E>(&self, f: F) -> std::result::Result<(), E>
    where
        F: Fn(Proc) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Send + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = (0..self.core.nprocs)
            .map(|rank| {
                let f = Arc::clone(&f);
                let core = Arc::clone(&self.core);
                std::thread::Builder::new()
                    .name(format!("proc-{rank}"))
                    .spawn(move || {
                        let proc = Proc {
                            rank,
                            core: Arc::clone(&core),
                        };
                        let outcome = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| f(proc)),
                        );
                        if outcome.is_err() {
                            // A panicking process must unblock the rest of
                            // the world before it unwinds, or their joins
                            // would never complete.
                            {
                                let mut code = core.abort_code.lock();
                                if code.is_none() {
                                    *code = Some(-2);
                                }
                            }
                            core.notify();
                        }
                        outcome
                    })
                    .expect("spawn process thread")
            })
            .collect();

        let mut first_err = None;
        let mut panic = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Ok(Err(payload)) | Err(payload) => {
                    if panic.is_none() {
                        panic = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handle of one simulated process, passed to the launch closure.
pub struct Proc {
    rank: Rank,
    core: Arc<WorldCore>,
}

impl Proc {
    /// This process's world rank.
    #[must_use]
    pub fn world_rank(&self) -> Rank {
        self.rank
    }

    /// Total number of processes in the world.
    #[must_use]
    pub fn num_procs(&self) -> usize {
        self.core.nprocs
    }

    /// Node id of this process.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.core.node_of[self.rank]
    }

    /// Number of nodes in the world.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.core.nodes.len()
    }

    /// Node id of an arbitrary world rank.
    #[must_use]
    pub fn node_of(&self, rank: Rank) -> usize {
        self.core.node_of[rank]
    }

    /// World ranks of one node, in rank order.
    #[must_use]
    pub fn node_ranks(&self, node: usize) -> &[Rank] {
        &self.core.nodes[node]
    }

    /// The communicator spanning every process.
    #[must_use]
    pub fn world_comm(&self) -> Comm {
        Comm::world(Arc::clone(&self.core), self.rank)
    }

    /// Aborts the whole world; every blocked process unblocks with
    /// [`Error::Aborted`].
    pub fn abort(&self, code: i32) {
        {
            let mut abort = self.core.abort_code.lock();
            if abort.is_none() {
                *abort = Some(code);
            }
        }
        tracing::error!(rank = self.rank, code, "world abort requested");
        self.core.notify();
    }
}
