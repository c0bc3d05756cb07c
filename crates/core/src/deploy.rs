// SPDX-License-Identifier: Apache-2.0

//! Process bootstrap: partitioning the world into users and helpers,
//! building the process-global communicators and rank tables, and running
//! user code against a deployment.
//!
//! On every node the first `num_helpers` local ranks become helper
//! processes; the rest run application code. Helpers enter their dispatch
//! loop immediately and poll the runtime until told to finalize.

use crate::control::{self, FuncCode, FuncHeader};
use crate::error::{Error, Result};
use crate::helper;
use crate::sched::{AsyncScheduler, SchedHandle};
use crate::win::{self, BaseMem, Win};
use proxima_config::{EnvParams, Info};
use proxima_runtime::{Comm, Proc, Rank, RmaBuf, WinView, World};

/// What a process does for the lifetime of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Runs application code and issues redirected RMA.
    User,
    /// Polls the runtime and serves redirected RMA for its node.
    Helper,
}

/// Per-process view of the deployment: role, communicators, rank tables.
pub(crate) struct Deployment {
    pub(crate) proc: Proc,
    pub(crate) env: EnvParams,
    pub(crate) role: Role,
    /// Every process.
    pub(crate) world: Comm,
    /// Every process on this node (helpers first, then users).
    pub(crate) local: Comm,
    /// Users: all user processes. Helpers: all helper processes.
    pub(crate) peer_world: Comm,
    /// Users: user processes of this node. Helpers: helper processes of it.
    pub(crate) peer_local: Comm,
    /// World ranks of the helpers of each node.
    pub(crate) helpers_of_node: Vec<Vec<Rank>>,
}

impl Deployment {
    fn init(proc: Proc, env: EnvParams) -> Result<Self> {
        let world = proc.world_comm();
        let node_ranks = proc.node_ranks(proc.node_id());
        if node_ranks.len() <= env.num_helpers {
            return Err(Error::TopologyInconsistent {
                details: format!(
                    "node {} has {} processes but {} helpers are configured",
                    proc.node_id(),
                    node_ranks.len(),
                    env.num_helpers
                ),
            });
        }
        let local_index = world.rank() - node_ranks[0];
        let role = if local_index < env.num_helpers {
            Role::Helper
        } else {
            Role::User
        };

        let local = world.split_node()?;
        let color = i64::from(role == Role::Helper);
        let peer_world = world.split(color, world.rank() as i64)?;
        let peer_local = local.split(color, local.rank() as i64)?;

        let mut helpers_of_node = vec![Vec::new(); proc.num_nodes()];
        for node in 0..proc.num_nodes() {
            for (i, &rank) in proc.node_ranks(node).iter().enumerate() {
                if i < env.num_helpers {
                    helpers_of_node[node].push(rank);
                }
            }
        }

        tracing::debug!(
            rank = world.rank(),
            node = proc.node_id(),
            ?role,
            "deployment initialized"
        );

        Ok(Self {
            proc,
            env,
            role,
            world,
            local,
            peer_world,
            peer_local,
            helpers_of_node,
        })
    }

    /// Local (node-comm) ranks of this node's helpers: always the first
    /// `num_helpers` ranks.
    pub(crate) fn local_helper_ranks(&self) -> Vec<Rank> {
        (0..self.env.num_helpers).collect()
    }

    /// World ranks of the helpers serving `world_rank`.
    pub(crate) fn helpers_of_world_rank(&self, world_rank: Rank) -> &[Rank] {
        &self.helpers_of_node[self.proc.node_of(world_rank)]
    }
}

/// Spawns a simulated deployment of `nodes × (users_per_node + helpers)`
/// processes and runs `f` on every user process.
///
/// Helpers run their dispatch loop and are finalized by the harness after
/// every user closure returned. Errors of any process surface from here;
/// panics propagate.
pub fn launch<F>(nodes: usize, users_per_node: usize, env: EnvParams, f: F) -> Result<()>
where
    F: Fn(&mut UserCtx) -> Result<()> + Send + Sync + 'static,
{
    let world = World::builder()
        .nodes(nodes)
        .procs_per_node(users_per_node + env.num_helpers)
        .build();
    world.launch(move |proc| -> Result<()> {
        let dep = Deployment::init(proc, env.clone())?;
        match dep.role {
            Role::Helper => helper::run(&dep),
            Role::User => {
                let sched = AsyncScheduler::handle(&dep.env);
                let mut ctx = UserCtx { dep, sched };
                let result = f(&mut ctx);
                if result.is_err() {
                    // Unblock helpers and peers instead of deadlocking on a
                    // one-sided failure.
                    ctx.dep.proc.abort(1);
                    return result;
                }
                ctx.finalize()?;
                result
            }
        }
    })
}

/// Per-user-process entry point handed to the launch closure.
pub struct UserCtx {
    pub(crate) dep: Deployment,
    pub(crate) sched: SchedHandle,
}

impl UserCtx {
    /// The communicator spanning every user process.
    #[must_use]
    pub fn user_comm(&self) -> &Comm {
        &self.dep.peer_world
    }

    /// This process's rank among user processes.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.dep.peer_world.rank()
    }

    /// Number of user processes.
    #[must_use]
    pub fn num_users(&self) -> usize {
        self.dep.peer_world.size()
    }

    /// Node id of this process.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.dep.proc.node_id()
    }

    /// The environment parameters of the deployment.
    #[must_use]
    pub fn env(&self) -> &EnvParams {
        &self.dep.env
    }

    /// Charges `elapsed` as communication time to the auto-async scheduler,
    /// as if spent inside a runtime call. Lets applications that drive
    /// communication outside this layer keep the scheduler's picture
    /// accurate.
    pub fn charge_comm_time(&mut self, elapsed: std::time::Duration) {
        self.sched.borrow_mut().add_comm_time(elapsed);
    }

    /// Collectively allocates a window over `comm` (a user communicator),
    /// redirected through helpers unless the info arguments or the auto
    /// scheduler disable asynchronous progress.
    pub fn allocate(
        &mut self,
        size: usize,
        disp_unit: usize,
        info: &Info,
        comm: &Comm,
    ) -> Result<Win> {
        win::allocate::allocate(&self.dep, &self.sched, size, disp_unit, info, comm)
    }

    /// Creates a window over caller-provided memory. Pass-through: no
    /// asynchronous progress is provided for such windows.
    pub fn create(&mut self, base: RmaBuf, disp_unit: usize, comm: &Comm) -> Result<Win> {
        let win = proxima_runtime::Win::create(comm, WinView::full(base.clone()), disp_unit)?;
        tracing::warn!(win = win.id(), "window created without asynchronous progress");
        let len = base.len();
        Ok(Win::pass_through(win, BaseMem::new(base, 0, len)))
    }

    /// Allocates a node-shared window. Pass-through: no asynchronous
    /// progress is provided for such windows.
    pub fn allocate_shared(
        &mut self,
        size: usize,
        disp_unit: usize,
        comm: &Comm,
    ) -> Result<Win> {
        let (win, shared) = proxima_runtime::Win::allocate_shared(comm, size, disp_unit)?;
        tracing::warn!(
            win = win.id(),
            "shared window allocated without asynchronous progress"
        );
        let offset = shared.offsets[comm.rank()] as usize;
        Ok(Win::pass_through(
            win,
            BaseMem::new(shared.region, offset, size),
        ))
    }

    /// Quiesces the deployment and tells the node helpers to exit.
    fn finalize(&mut self) -> Result<()> {
        // Every user must be done before any helper may leave its loop.
        self.dep.peer_world.barrier()?;
        if self.dep.peer_local.rank() == 0 {
            control::start_func(
                &self.dep.local,
                &self.dep.local_helper_ranks(),
                FuncHeader {
                    func: FuncCode::Finalize,
                    user_nprocs: self.dep.peer_world.size() as u64,
                    user_local_nprocs: self.dep.peer_local.size() as u64,
                },
            )?;
        }
        Ok(())
    }
}
