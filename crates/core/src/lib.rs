// SPDX-License-Identifier: Apache-2.0

//! Proxima: a transparent interception layer over the message-passing
//! runtime that provides one-sided RMA with guaranteed asynchronous
//! progress.
//!
//! In the plain runtime, an RMA operation addressed to a process only
//! completes when that process enters the runtime. Proxima removes the
//! requirement by dedicating *helper* processes on every node that poll the
//! runtime continuously, and by transparently redirecting every RMA
//! operation to a helper exposing the same memory: window allocation places
//! user memory in a node-wide shared region, every helper exposes that whole
//! region, and each user displacement is translated into a helper-local
//! offset before the underlying primitive is issued.
//!
//! The interesting machinery is origin-side: per-target addressing (helper
//! lists, base offsets, segment tables), the epoch state machine spanning
//! passive and emulated active synchronization, lock promotion, and the
//! runtime load balancer that spreads operations across helpers without
//! breaking the atomicity and ordering the runtime promises.
//!
//! Entry points: [`launch`] spawns a simulated deployment and runs user code
//! against it; [`UserCtx::allocate`] builds a redirected window; [`Win`]
//! carries the full user-facing RMA surface.

pub mod error;

mod binding;
mod control;
mod deploy;
mod helper;
mod load;
mod registry;
mod sched;
mod seg;
mod win;

pub use deploy::{UserCtx, launch};
pub use error::{Error, Result};
pub use sched::AsyncStat;
pub use win::{Assert, BaseMem, SegmentDesc, Win};

// Users address the layer with the runtime's own vocabulary.
pub use proxima_config::{AsyncMode, EnvParams, EpochType, Info, WinInfo};
pub use proxima_runtime::{Datatype, LockKind, OpStats, Rank, ReduceOp, RmaBuf};
