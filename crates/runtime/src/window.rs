// SPDX-License-Identifier: Apache-2.0

//! One-sided RMA windows.
//!
//! A window exposes a view of each member's memory to one-sided access by
//! every other member. Operations are non-blocking: they enqueue a request
//! into the target's agent and complete when the target enters the runtime.
//! `flush` and friends provide completion; passive locks provide isolation,
//! and a completed `flush` additionally implies any earlier lock request to
//! that target has been granted.

use crate::agent::{AgentWin, OpKind, OpRequest, Request};
use crate::buffer::{Datatype, ReduceOp, RmaBuf};
use crate::coll::{self, CollScope};
use crate::comm::Comm;
use crate::error::{Error, Result};
use crate::world::{WorldCore, wait_progress};
use crate::Rank;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Passive-target lock kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Mutually exclusive access.
    Exclusive,
    /// Concurrent access with other shared holders.
    Shared,
}

/// The slice of an [`RmaBuf`] one process exposes through a window.
#[derive(Clone)]
pub struct WinView {
    buf: RmaBuf,
    offset: usize,
    len: usize,
}

impl WinView {
    /// View of `len` bytes of `buf` starting at `offset`.
    #[must_use]
    pub fn new(buf: RmaBuf, offset: usize, len: usize) -> Self {
        Self { buf, offset, len }
    }

    /// View of the whole buffer.
    #[must_use]
    pub fn full(buf: RmaBuf) -> Self {
        let len = buf.len();
        Self {
            buf,
            offset: 0,
            len,
        }
    }

    /// The backing region.
    #[must_use]
    pub fn buf(&self) -> &RmaBuf {
        &self.buf
    }

    /// Byte offset of the view into the backing region.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the view in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Delivery statistics of one serving rank on a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    /// Operations executed by this rank.
    pub ops: u64,
    /// Payload bytes of those operations.
    pub bytes: u64,
}

/// Result of a shared allocation: the node region and everyone's offsets.
pub struct SharedAlloc {
    /// The node-wide backing region.
    pub region: RmaBuf,
    /// Byte offset of each member's portion, in communicator-rank order.
    pub offsets: Vec<u64>,
}

struct RemoteTarget {
    world: Rank,
    len: u64,
    disp_unit: u64,
}

#[derive(Default)]
struct OriginCounters {
    issued: u64,
    lock_reqs: u64,
    unlock_reqs: u64,
    held: u64,
}

/// A one-sided RMA window.
///
/// Like [`Comm`], a `Win` handle belongs to its process and does not cross
/// threads.
pub struct Win {
    core: Arc<WorldCore>,
    comm: Comm,
    id: u64,
    my_world: Rank,
    remotes: Vec<RemoteTarget>,
    /// Per-target (world rank) origin-side counters.
    counters: RefCell<HashMap<Rank, OriginCounters>>,
    /// Shared-region registry entry owned by this window, if any.
    owned_region: Option<u64>,
}

impl std::fmt::Debug for Win {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Win")
            .field("id", &self.id)
            .field("size", &self.remotes.len())
            .finish()
    }
}

impl Win {
    /// Collectively creates a window; each member exposes `view` with its own
    /// `disp_unit`.
    pub fn create(comm: &Comm, view: WinView, disp_unit: usize) -> Result<Win> {
        if view.offset + view.len > view.buf.len() {
            return Err(Error::ViewOutOfBounds {
                offset: view.offset,
                len: view.len,
                size: view.buf.len(),
            });
        }

        let mut blob = Vec::with_capacity(16);
        blob.extend_from_slice(&(view.len as u64).to_le_bytes());
        blob.extend_from_slice(&(disp_unit as u64).to_le_bytes());

        let key = (comm.id, CollScope::Seq(comm_seq(comm)));
        let outcome = coll::exchange(
            &comm.core,
            comm.world_rank(),
            key,
            comm.rank(),
            blob,
            comm.size(),
            |_, core| core.alloc_win_id().to_le_bytes().to_vec(),
        )?;

        let id = decode_u64(&outcome.extra, 0);
        let remotes: Vec<RemoteTarget> = outcome
            .blobs
            .iter()
            .enumerate()
            .map(|(rank, blob)| RemoteTarget {
                world: comm.group()[rank],
                len: decode_u64(blob, 0),
                disp_unit: decode_u64(blob, 8),
            })
            .collect();

        let my_world = comm.world_rank();
        {
            let mut agent = comm.core.procs[my_world].agent.lock();
            let _ = agent.wins.insert(id, AgentWin::new(view, disp_unit));
        }
        // Everyone must have registered exposure before anyone issues an op.
        comm.barrier()?;

        Ok(Win {
            core: Arc::clone(&comm.core),
            comm: comm.clone(),
            id,
            my_world,
            remotes,
            counters: RefCell::new(HashMap::new()),
            owned_region: None,
        })
    }

    /// Collectively allocates a fresh private region per member and creates a
    /// window over it.
    pub fn allocate(comm: &Comm, size: usize, disp_unit: usize) -> Result<(Win, RmaBuf)> {
        let buf = RmaBuf::zeroed(size);
        let win = Self::create(comm, WinView::full(buf.clone()), disp_unit)?;
        Ok((win, buf))
    }

    /// Collectively allocates one contiguous region per node, laid out in
    /// communicator-rank order, and creates a window exposing each member's
    /// portion.
    ///
    /// All members of `comm` must reside on one node.
    pub fn allocate_shared(
        comm: &Comm,
        size: usize,
        disp_unit: usize,
    ) -> Result<(Win, SharedAlloc)> {
        let key = (comm.id, CollScope::Seq(comm_seq(comm)));
        let outcome = coll::exchange(
            &comm.core,
            comm.world_rank(),
            key,
            comm.rank(),
            (size as u64).to_le_bytes().to_vec(),
            comm.size(),
            |contrib, core| {
                let total: u64 = contrib.values().map(|b| decode_u64(b, 0)).sum();
                let region = RmaBuf::zeroed(total as usize);
                let region_id = core.alloc_region_id();
                let _ = core.regions.lock().insert(region_id, region);
                let mut extra = Vec::with_capacity(8 + contrib.len() * 8);
                extra.extend_from_slice(&region_id.to_le_bytes());
                let mut offset = 0u64;
                for blob in contrib.values() {
                    extra.extend_from_slice(&offset.to_le_bytes());
                    offset += decode_u64(blob, 0);
                }
                extra
            },
        )?;

        let region_id = decode_u64(&outcome.extra, 0);
        let offsets: Vec<u64> = outcome.extra[8..]
            .chunks_exact(8)
            .map(|chunk| decode_u64(chunk, 0))
            .collect();
        let region = comm
            .core
            .regions
            .lock()
            .get(&region_id)
            .cloned()
            .ok_or(Error::UnknownWindow { id: region_id })?;

        let my_offset = offsets[comm.rank()] as usize;
        let view = WinView::new(region.clone(), my_offset, size);
        let mut win = Self::create(comm, view, disp_unit)?;
        win.owned_region = Some(region_id);

        Ok((win, SharedAlloc { region, offsets }))
    }

    /// The communicator the window was created over.
    #[must_use]
    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Opaque window id (unique within the world).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytes exposed by `target`.
    pub fn target_len(&self, target: Rank) -> Result<u64> {
        Ok(self.remote(target)?.len)
    }

    /// Displacement unit declared by `target`.
    pub fn target_disp_unit(&self, target: Rank) -> Result<u64> {
        Ok(self.remote(target)?.disp_unit)
    }

    // ---- one-sided operations -------------------------------------------

    /// Writes `origin` into `target`'s exposed memory at `target_disp`
    /// displacement units.
    pub fn put(&self, origin: &[u8], target: Rank, target_disp: u64) -> Result<()> {
        let nbytes = origin.len();
        self.check_range(target, target_disp, nbytes)?;
        self.enqueue(
            target,
            OpKind::Put {
                data: origin.to_vec(),
            },
            target_disp,
            nbytes as u64,
        )
    }

    /// Reads `len` bytes from `target` into `dest` at `dest_offset`; the
    /// bytes are valid after a flush of `target`.
    pub fn get(
        &self,
        dest: &RmaBuf,
        dest_offset: usize,
        len: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        if dest_offset + len > dest.len() {
            return Err(Error::BufferOutOfBounds {
                offset: dest_offset,
                len,
                size: dest.len(),
            });
        }
        self.check_range(target, target_disp, len)?;
        self.enqueue(
            target,
            OpKind::Get {
                dest: dest.clone(),
                dest_offset,
                len,
            },
            target_disp,
            len as u64,
        )
    }

    /// Applies `op` elementwise with the origin data onto the target memory.
    pub fn accumulate(
        &self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        check_elements(origin.len(), dtype)?;
        self.check_range(target, target_disp, origin.len())?;
        self.enqueue(
            target,
            OpKind::Accumulate {
                data: origin.to_vec(),
                dtype,
                op,
            },
            target_disp,
            origin.len() as u64,
        )
    }

    /// Atomically fetches the prior target contents into `result` and applies
    /// `op` with the origin data.
    #[allow(clippy::too_many_arguments)]
    pub fn get_accumulate(
        &self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        check_elements(origin.len(), dtype)?;
        if result_offset + origin.len() > result.len() {
            return Err(Error::BufferOutOfBounds {
                offset: result_offset,
                len: origin.len(),
                size: result.len(),
            });
        }
        self.check_range(target, target_disp, origin.len())?;
        self.enqueue(
            target,
            OpKind::GetAccumulate {
                data: origin.to_vec(),
                dtype,
                op,
                dest: result.clone(),
                dest_offset: result_offset,
            },
            target_disp,
            origin.len() as u64,
        )
    }

    /// Single-element atomic fetch-and-op.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_and_op(
        &self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        if origin.len() != dtype.extent() {
            return Err(Error::NotElementAligned {
                len: origin.len(),
                extent: dtype.extent(),
            });
        }
        self.get_accumulate(origin, dtype, op, result, result_offset, target, target_disp)
    }

    /// Single-element atomic compare-and-swap; the prior value lands in
    /// `result`.
    #[allow(clippy::too_many_arguments)]
    pub fn compare_and_swap(
        &self,
        compare: &[u8],
        new: &[u8],
        dtype: Datatype,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        let extent = dtype.extent();
        if compare.len() != extent || new.len() != extent {
            return Err(Error::NotElementAligned {
                len: compare.len().max(new.len()),
                extent,
            });
        }
        if result_offset + extent > result.len() {
            return Err(Error::BufferOutOfBounds {
                offset: result_offset,
                len: extent,
                size: result.len(),
            });
        }
        self.check_range(target, target_disp, extent)?;
        self.enqueue(
            target,
            OpKind::CompareAndSwap {
                compare: compare.to_vec(),
                new: new.to_vec(),
                dest: result.clone(),
                dest_offset: result_offset,
            },
            target_disp,
            extent as u64,
        )
    }

    // ---- synchronization -------------------------------------------------

    /// Requests a passive lock on `target`. Returns immediately; the grant is
    /// confirmed by the next completed flush of that target.
    pub fn lock(&self, target: Rank, kind: LockKind) -> Result<()> {
        let target_world = self.remote(target)?.world;
        {
            let mut agent = self.core.procs[target_world].agent.lock();
            let win = agent
                .wins
                .get_mut(&self.id)
                .ok_or(Error::UnknownWindow { id: self.id })?;
            win.queues
                .entry(self.my_world)
                .or_default()
                .push_back(Request::Lock { kind });
        }
        let mut counters = self.counters.borrow_mut();
        let entry = counters.entry(target_world).or_default();
        entry.lock_reqs += 1;
        entry.held += 1;
        drop(counters);
        self.core.notify();
        Ok(())
    }

    /// Takes a shared lock on every member.
    pub fn lock_all(&self) -> Result<()> {
        for target in 0..self.remotes.len() {
            self.lock(target, LockKind::Shared)?;
        }
        Ok(())
    }

    /// Releases the lock on `target`, blocking until every prior operation
    /// to it has executed and the release is acknowledged.
    pub fn unlock(&self, target: Rank) -> Result<()> {
        let target_world = self.remote(target)?.world;
        {
            let mut counters = self.counters.borrow_mut();
            let entry = counters.entry(target_world).or_default();
            if entry.held == 0 {
                return Err(Error::LockMismatch { target });
            }
            entry.held -= 1;
            entry.unlock_reqs += 1;
        }
        {
            let mut agent = self.core.procs[target_world].agent.lock();
            let win = agent
                .wins
                .get_mut(&self.id)
                .ok_or(Error::UnknownWindow { id: self.id })?;
            win.queues
                .entry(self.my_world)
                .or_default()
                .push_back(Request::Unlock);
        }
        self.core.notify();

        let expected = self.counters.borrow()[&target_world].unlock_reqs;
        let key = (self.id, self.my_world, target_world);
        wait_progress(&self.core, self.my_world, || {
            let sync = self.core.sync.lock();
            (sync.unlocked.get(&key).copied().unwrap_or(0) >= expected).then_some(())
        })
    }

    /// Releases every lock this process holds on the window.
    pub fn unlock_all(&self) -> Result<()> {
        for target in 0..self.remotes.len() {
            let held = {
                let counters = self.counters.borrow();
                counters
                    .get(&self.remotes[target].world)
                    .map_or(0, |c| c.held)
            };
            for _ in 0..held {
                self.unlock(target)?;
            }
        }
        Ok(())
    }

    /// Blocks until every operation issued to `target` has executed and any
    /// pending lock request to it has been granted.
    pub fn flush(&self, target: Rank) -> Result<()> {
        let target_world = self.remote(target)?.world;
        let (issued, lock_reqs) = {
            let counters = self.counters.borrow();
            counters
                .get(&target_world)
                .map_or((0, 0), |c| (c.issued, c.lock_reqs))
        };
        let key = (self.id, self.my_world, target_world);
        wait_progress(&self.core, self.my_world, || {
            let sync = self.core.sync.lock();
            let done = sync.completed.get(&key).copied().unwrap_or(0) >= issued;
            let granted = sync.granted.get(&key).copied().unwrap_or(0) >= lock_reqs;
            (done && granted).then_some(())
        })
    }

    /// Flushes every target.
    pub fn flush_all(&self) -> Result<()> {
        for target in 0..self.remotes.len() {
            self.flush(target)?;
        }
        Ok(())
    }

    /// Local completion; equivalent to [`Win::flush`] in this runtime.
    pub fn flush_local(&self, target: Rank) -> Result<()> {
        self.flush(target)
    }

    /// Local completion of every target.
    pub fn flush_local_all(&self) -> Result<()> {
        self.flush_all()
    }

    /// Active-target fence: completes all outstanding operations and
    /// synchronizes every member.
    pub fn fence(&self) -> Result<()> {
        self.flush_all()?;
        self.comm.barrier()
    }

    /// Collectively frees the window.
    pub fn free(self) -> Result<()> {
        self.comm.barrier()?;
        {
            let mut agent = self.core.procs[self.my_world].agent.lock();
            let _ = agent.wins.remove(&self.id);
        }
        let _ = self.core.stats.lock().remove(&self.id);
        if let Some(region_id) = self.owned_region {
            let _ = self.core.regions.lock().remove(&region_id);
        }
        Ok(())
    }

    /// Operations issued to `target` that have not yet executed there.
    ///
    /// Pure observation; does not drive progress.
    pub fn pending(&self, target: Rank) -> Result<u64> {
        let target_world = self.remote(target)?.world;
        let issued = {
            let counters = self.counters.borrow();
            counters.get(&target_world).map_or(0, |c| c.issued)
        };
        let sync = self.core.sync.lock();
        let done = sync
            .completed
            .get(&(self.id, self.my_world, target_world))
            .copied()
            .unwrap_or(0);
        Ok(issued.saturating_sub(done))
    }

    /// Delivery statistics: executed operations per serving rank
    /// (communicator ranks).
    #[must_use]
    pub fn stats(&self) -> HashMap<Rank, OpStats> {
        let stats = self.core.stats.lock();
        let mut out = HashMap::new();
        if let Some(per_rank) = stats.get(&self.id) {
            for (world, s) in per_rank {
                if let Some(rank) = self.comm.comm_rank_of_world(*world) {
                    let _ = out.insert(rank, *s);
                }
            }
        }
        out
    }

    // ---- internals -------------------------------------------------------

    fn remote(&self, target: Rank) -> Result<&RemoteTarget> {
        self.remotes.get(target).ok_or(Error::RankOutOfRange {
            rank: target,
            size: self.remotes.len(),
        })
    }

    fn check_range(&self, target: Rank, target_disp: u64, nbytes: usize) -> Result<()> {
        let remote = self.remote(target)?;
        let offset = target_disp * remote.disp_unit;
        if offset + nbytes as u64 > remote.len {
            return Err(Error::RangeOutOfBounds {
                win: self.id,
                target,
                offset,
                len: nbytes as u64,
                exposed: remote.len,
            });
        }
        Ok(())
    }

    fn enqueue(&self, target: Rank, kind: OpKind, target_disp: u64, bytes: u64) -> Result<()> {
        let target_world = self.remote(target)?.world;
        {
            let mut agent = self.core.procs[target_world].agent.lock();
            let win = agent
                .wins
                .get_mut(&self.id)
                .ok_or(Error::UnknownWindow { id: self.id })?;
            win.queues
                .entry(self.my_world)
                .or_default()
                .push_back(Request::Op(OpRequest {
                    origin: self.my_world,
                    target_disp,
                    bytes,
                    kind,
                }));
        }
        self.counters
            .borrow_mut()
            .entry(target_world)
            .or_default()
            .issued += 1;
        self.core.notify();
        Ok(())
    }
}

fn check_elements(len: usize, dtype: Datatype) -> Result<()> {
    if len % dtype.extent() != 0 {
        return Err(Error::NotElementAligned {
            len,
            extent: dtype.extent(),
        });
    }
    Ok(())
}

fn comm_seq(comm: &Comm) -> u64 {
    // Window collectives share the communicator's collective ordering.
    comm.next_seq()
}

fn decode_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
