// SPDX-License-Identifier: Apache-2.0

//! Target-side RMA agent.
//!
//! Every process owns one agent holding, per window, its exposed view, the
//! lock table, and per-origin FIFO request queues. The agent runs only when
//! its process enters the runtime ([`drain`] is called from every blocking
//! wait), which is what gives the runtime its MPI-like progress rule.

use crate::buffer::{Datatype, ReduceOp, RmaBuf, apply_reduce};
use crate::window::{LockKind, WinView};
use crate::world::WorldCore;
use crate::Rank;
use std::collections::{HashMap, VecDeque};

/// A queued request from one origin to this process.
pub(crate) enum Request {
    /// Passive-target lock acquisition.
    Lock {
        /// Requested lock kind.
        kind: LockKind,
    },
    /// Lock release. Always behind the origin's operations in the queue.
    Unlock,
    /// A one-sided operation.
    Op(OpRequest),
}

/// A one-sided operation addressed to this process.
pub(crate) struct OpRequest {
    /// Origin world rank.
    pub(crate) origin: Rank,
    /// Target displacement, in units of the target's displacement unit.
    pub(crate) target_disp: u64,
    /// Payload size in bytes, for delivery statistics.
    pub(crate) bytes: u64,
    /// The operation itself.
    pub(crate) kind: OpKind,
}

/// Payload of an [`OpRequest`].
pub(crate) enum OpKind {
    Put {
        data: Vec<u8>,
    },
    Get {
        dest: RmaBuf,
        dest_offset: usize,
        len: usize,
    },
    Accumulate {
        data: Vec<u8>,
        dtype: Datatype,
        op: ReduceOp,
    },
    GetAccumulate {
        data: Vec<u8>,
        dtype: Datatype,
        op: ReduceOp,
        dest: RmaBuf,
        dest_offset: usize,
    },
    CompareAndSwap {
        compare: Vec<u8>,
        new: Vec<u8>,
        dest: RmaBuf,
        dest_offset: usize,
    },
}

/// Per-window exposure state of one process.
pub(crate) struct AgentWin {
    pub(crate) view: WinView,
    pub(crate) disp_unit: usize,
    /// FIFO request queue per origin world rank.
    pub(crate) queues: HashMap<Rank, VecDeque<Request>>,
    /// Currently granted locks by origin world rank.
    pub(crate) holders: HashMap<Rank, LockKind>,
}

impl AgentWin {
    pub(crate) fn new(view: WinView, disp_unit: usize) -> Self {
        Self {
            view,
            disp_unit,
            queues: HashMap::new(),
            holders: HashMap::new(),
        }
    }
}

/// All exposure state of one process.
#[derive(Default)]
pub(crate) struct AgentState {
    pub(crate) wins: HashMap<u64, AgentWin>,
}

enum SyncEvent {
    Granted { win: u64, origin: Rank },
    Unlocked { win: u64, origin: Rank },
}

/// Drains every executable request addressed to `me`.
///
/// Runs to a fixpoint: unlocks can enable pending grants of other origins,
/// and grants release queued operations. Operations are executed outside the
/// agent lock; lock-table changes and completion counters are published
/// through the world's sync table.
pub(crate) fn drain(core: &WorldCore, me: Rank) {
    loop {
        let mut exec: Vec<(u64, WinView, usize, OpRequest)> = Vec::new();
        let mut events: Vec<SyncEvent> = Vec::new();

        {
            enum Head {
                Lock(LockKind),
                Unlock,
                Op,
            }

            let mut agent = core.procs[me].agent.lock();
            for (win_id, win) in &mut agent.wins {
                loop {
                    let mut progressed = false;
                    let origins: Vec<Rank> = win.queues.keys().copied().collect();
                    for origin in origins {
                        loop {
                            let Some(queue) = win.queues.get_mut(&origin) else {
                                break;
                            };
                            let head = match queue.front() {
                                Some(Request::Lock { kind }) => Head::Lock(*kind),
                                Some(Request::Unlock) => Head::Unlock,
                                Some(Request::Op(_)) => Head::Op,
                                None => break,
                            };
                            match head {
                                Head::Lock(kind) => {
                                    let grantable = match kind {
                                        LockKind::Exclusive => win.holders.is_empty(),
                                        LockKind::Shared => win
                                            .holders
                                            .values()
                                            .all(|k| matches!(k, LockKind::Shared)),
                                    };
                                    if !grantable {
                                        break;
                                    }
                                    let _ = queue.pop_front();
                                    let _ = win.holders.insert(origin, kind);
                                    events.push(SyncEvent::Granted {
                                        win: *win_id,
                                        origin,
                                    });
                                    progressed = true;
                                }
                                Head::Unlock => {
                                    let _ = queue.pop_front();
                                    let _ = win.holders.remove(&origin);
                                    events.push(SyncEvent::Unlocked {
                                        win: *win_id,
                                        origin,
                                    });
                                    progressed = true;
                                }
                                Head::Op => {
                                    // An operation at the head means no lock
                                    // request is ahead of it. It may only be
                                    // held back by someone else's exclusive
                                    // lock.
                                    let excluded = !win.holders.contains_key(&origin)
                                        && win.holders.iter().any(|(o, k)| {
                                            *o != origin && matches!(k, LockKind::Exclusive)
                                        });
                                    if excluded {
                                        break;
                                    }
                                    if let Some(Request::Op(op)) = queue.pop_front() {
                                        exec.push((
                                            *win_id,
                                            win.view.clone(),
                                            win.disp_unit,
                                            op,
                                        ));
                                        progressed = true;
                                    }
                                }
                            }
                        }
                    }
                    if !progressed {
                        break;
                    }
                }
                win.queues.retain(|_, q| !q.is_empty());
            }
        }

        if exec.is_empty() && events.is_empty() {
            return;
        }

        if !events.is_empty() {
            let mut sync = core.sync.lock();
            for event in events {
                match event {
                    SyncEvent::Granted { win, origin } => {
                        *sync.granted.entry((win, origin, me)).or_insert(0) += 1;
                    }
                    SyncEvent::Unlocked { win, origin } => {
                        *sync.unlocked.entry((win, origin, me)).or_insert(0) += 1;
                    }
                }
            }
        }

        for (win_id, view, disp_unit, op) in exec {
            execute(core, me, win_id, &view, disp_unit, op);
        }

        core.notify();
    }
}

/// Executes one operation against this process's exposed view.
fn execute(core: &WorldCore, me: Rank, win_id: u64, view: &WinView, disp_unit: usize, op: OpRequest) {
    let byte_off = view.offset() + (op.target_disp as usize) * disp_unit;
    let origin = op.origin;
    let bytes = op.bytes;

    // Ranges were validated origin-side before queueing; a failure here is an
    // internal inconsistency, not a user error.
    let outcome = match op.kind {
        OpKind::Put { data } => view.buf().write_at(byte_off, &data),
        OpKind::Get {
            dest,
            dest_offset,
            len,
        } => view
            .buf()
            .read_vec(byte_off, len)
            .and_then(|data| dest.write_at(dest_offset, &data)),
        OpKind::Accumulate { data, dtype, op } => view
            .buf()
            .with_range_mut(byte_off, data.len(), |t| apply_reduce(op, dtype, t, &data)),
        OpKind::GetAccumulate {
            data,
            dtype,
            op,
            dest,
            dest_offset,
        } => view
            .buf()
            .with_range_mut(byte_off, data.len(), |t| {
                let old = t.to_vec();
                apply_reduce(op, dtype, t, &data);
                old
            })
            .and_then(|old| dest.write_at(dest_offset, &old)),
        OpKind::CompareAndSwap {
            compare,
            new,
            dest,
            dest_offset,
        } => view
            .buf()
            .with_range_mut(byte_off, new.len(), |t| {
                let old = t.to_vec();
                if old == compare {
                    t.copy_from_slice(&new);
                }
                old
            })
            .and_then(|old| dest.write_at(dest_offset, &old)),
    };

    if let Err(err) = outcome {
        tracing::error!(win = win_id, target = me, origin, %err, "rma request failed at target");
        debug_assert!(false, "rma request failed at target: {err}");
    }

    {
        let mut sync = core.sync.lock();
        *sync.completed.entry((win_id, origin, me)).or_insert(0) += 1;
    }
    core.bump_stats(win_id, me, bytes);
}
