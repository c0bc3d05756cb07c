// SPDX-License-Identifier: Apache-2.0

//! In-process message-passing runtime with one-sided RMA windows.
//!
//! The runtime simulates a multi-node deployment inside a single OS process:
//! every simulated process runs on its own thread, processes are partitioned
//! into nodes, and all inter-process interaction goes through this crate
//! (tagged point-to-point messages, collectives, and RMA windows).
//!
//! The defining property is the *progress rule*: an RMA operation addressed
//! to a process is executed by that process's agent, and the agent only runs
//! when the process enters the runtime (every blocking call drains the
//! caller's agent while it waits). A process that is busy computing makes no
//! progress on RMA targeted at its memory, which is exactly the behavior an
//! asynchronous-progress layer exists to work around, and what makes such a
//! layer testable against this crate.

pub mod buffer;
pub mod comm;
pub mod error;
pub mod window;
pub mod world;

pub(crate) mod agent;
pub(crate) mod coll;
pub(crate) mod mailbox;

pub use buffer::{Datatype, ReduceOp, RmaBuf};
pub use comm::Comm;
pub use error::{Error, Result};
pub use window::{LockKind, OpStats, SharedAlloc, Win, WinView};
pub use world::{Proc, World, WorldBuilder};

/// Rank of a process within a communicator (or the world).
pub type Rank = usize;

/// Message tag for point-to-point communication.
pub type Tag = u32;
