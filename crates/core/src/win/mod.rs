// SPDX-License-Identifier: Apache-2.0

//! The layer window: per-target descriptors, epoch state, and the
//! user-facing RMA surface.
//!
//! A [`Win`] is either a plain pass-through window (asynchronous redirection
//! disabled) or a layered window whose every operation is translated to a
//! helper. All mutable state lives on the handle; dropping or freeing it
//! releases everything it owns.

use crate::error::{Error, Result};
use crate::sched::{AsyncStat, SchedHandle};
use proxima_config::{EnvParams, WinInfo};
use proxima_runtime::{self as rt, Comm, Datatype, LockKind, OpStats, Rank, ReduceOp, RmaBuf};
use std::collections::HashMap;

pub(crate) mod allocate;
pub(crate) mod free;
pub(crate) mod ops;
pub(crate) mod pscw;
pub(crate) mod sync;

use self::ops::RmaOp;

bitflags::bitflags! {
    /// Assertions passed to synchronization calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Assert: u32 {
        /// No conflicting lock will be taken; lock promotion is skipped.
        const NOCHECK = 1;
        /// No operations precede the fence.
        const NOPRECEDE = 2;
        /// No operations follow the fence (closing fence).
        const NOSUCCEED = 4;
    }
}

/// Byte displacement of the grant-lock byte on every helper's view.
pub(crate) const GRANT_LOCK_DISP: u64 = 0;

/// Byte displacement of the PSCW post-flag byte on a main helper's view.
pub(crate) const POST_FLAG_DISP: u64 = 1;

/// Bytes of shared-region prologue contributed by each helper: one machine
/// word. Helper 0's word carries the grant-lock byte and the post flag.
pub(crate) const HELPER_PROLOGUE_BYTES: usize = 8;

/// The user-visible memory of a window: a slice of the node's shared region
/// (or a private region for pass-through windows).
pub struct BaseMem {
    region: RmaBuf,
    offset: usize,
    len: usize,
}

impl BaseMem {
    pub(crate) fn new(region: RmaBuf, offset: usize, len: usize) -> Self {
        Self {
            region,
            offset,
            len,
        }
    }

    /// Length of the window memory in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window memory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Local store into the window memory.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.len {
            return Err(rt::Error::BufferOutOfBounds {
                offset,
                len: bytes.len(),
                size: self.len,
            }
            .into());
        }
        Ok(self.region.write_at(self.offset + offset, bytes)?)
    }

    /// Local load from the window memory.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset + len > self.len {
            return Err(rt::Error::BufferOutOfBounds {
                offset,
                len,
                size: self.len,
            }
            .into());
        }
        Ok(self.region.read_vec(self.offset + offset, len)?)
    }

}

/// Which epoch a window is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EpochStat {
    #[default]
    NoEpoch,
    Fence,
    Lock,
    Pscw,
}

impl EpochStat {
    pub(crate) fn name(self) -> &'static str {
        match self {
            EpochStat::NoEpoch => "no_epoch",
            EpochStat::Fence => "fence",
            EpochStat::Lock => "lock",
            EpochStat::Pscw => "pscw",
        }
    }
}

/// Lock-promotion state of one segment's main helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum MainLockStat {
    /// No operation issued since the last reset.
    #[default]
    Reset,
    /// An operation was issued; the remote lock may not be granted yet.
    OpIssued,
    /// The remote lock is confirmed granted; load balancing may spread.
    Granted,
}

/// One contiguous byte range of a target's window, owned by one helper.
#[derive(Debug, Clone)]
pub(crate) struct TargetSeg {
    /// First byte of the range within the target's window.
    pub(crate) base_offset: u64,
    /// Length of the range.
    pub(crate) size: u64,
    /// Index of the owning helper within the target's helper list.
    pub(crate) main_h_idx: usize,
    /// Operation window bound to this segment.
    pub(crate) win_idx: usize,
    pub(crate) main_lock_stat: MainLockStat,
}

/// Per-target descriptor, one per user rank of the window's communicator.
#[derive(Debug, Clone)]
pub(crate) struct WinTarget {
    pub(crate) disp_unit: u64,
    pub(crate) size: u64,
    pub(crate) local_user_rank: usize,
    pub(crate) local_user_nprocs: usize,
    pub(crate) world_rank: Rank,
    pub(crate) user_world_rank: Rank,
    /// Rank of the target itself inside the user+helpers communicator.
    pub(crate) uh_rank: Rank,
    pub(crate) node_id: usize,
    /// Helper ranks (user+helpers communicator) serving this target.
    pub(crate) h_ranks_in_uh: Vec<Rank>,
    /// Base offset of the target's memory on each helper's view.
    pub(crate) base_h_offsets: Vec<u64>,
    pub(crate) remote_lock_assert: Assert,
    pub(crate) async_stat: AsyncStat,
    /// Operation window serving this target's lock epoch.
    pub(crate) op_win_idx: usize,
    pub(crate) segs: Vec<TargetSeg>,
}

/// Segment description exposed for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDesc {
    /// First byte of the segment within the target's window.
    pub base_offset: u64,
    /// Segment length in bytes.
    pub size: u64,
    /// Index of the owning helper in the target's helper list.
    pub main_helper_index: usize,
}

/// Full state of a redirected window.
pub(crate) struct LayerWin {
    pub(crate) env: EnvParams,
    pub(crate) info: WinInfo,
    pub(crate) sched: SchedHandle,

    // Communicators. `local_comm` and `user_local_comm` alias the
    // process-global node communicators when the window was allocated over
    // the user world; they are never freed here either way (the runtime
    // reclaims them with the world).
    pub(crate) user_comm: Comm,
    pub(crate) user_local_comm: Comm,
    pub(crate) local_comm: Comm,
    pub(crate) _ur_h_comm: Option<Comm>,
    pub(crate) _uh_comm: Comm,
    pub(crate) _local_uh_comm: Comm,

    // Memory and underlying windows.
    pub(crate) base: BaseMem,
    pub(crate) shared_win: Option<rt::Win>,
    pub(crate) op_wins: Vec<rt::Win>,
    pub(crate) active_win: Option<rt::Win>,
    pub(crate) user_win: Option<rt::Win>,
    pub(crate) my_op_win_idx: usize,
    pub(crate) my_rank_in_uh: Rank,
    pub(crate) my_user_rank: Rank,

    // Topology.
    pub(crate) helper_uh_ranks: Vec<Rank>,
    pub(crate) targets: Vec<WinTarget>,

    // Epoch state.
    pub(crate) epoch: EpochStat,
    pub(crate) lock_counter: u32,
    pub(crate) lockall_counter: u32,
    pub(crate) start_counter: u32,
    pub(crate) is_self_locked: bool,
    pub(crate) start_group: Option<Vec<Rank>>,
    pub(crate) post_group: Option<Vec<Rank>>,

    // Load balancing.
    pub(crate) prev_h_off: usize,
    pub(crate) h_op_counts: Vec<u64>,
    pub(crate) h_byte_counts: Vec<u64>,

    // Helper-side handles, gathered on the local user root.
    pub(crate) helper_win_ids: Vec<u64>,
}

impl LayerWin {
    /// The underlying window an operation to `(target, seg)` must use in the
    /// current epoch.
    pub(crate) fn epoch_rt_win(&self, target: usize, seg: usize) -> &rt::Win {
        match self.epoch {
            EpochStat::NoEpoch | EpochStat::Lock if !self.op_wins.is_empty() => {
                &self.op_wins[self.targets[target].segs[seg].win_idx]
            }
            _ => self
                .active_win
                .as_ref()
                .expect("a window exists for every advertised epoch type"),
        }
    }

    /// The underlying window for self-targeted operations.
    pub(crate) fn epoch_local_rt_win(&self) -> &rt::Win {
        match self.epoch {
            EpochStat::NoEpoch | EpochStat::Lock if !self.op_wins.is_empty() => {
                &self.op_wins[self.my_op_win_idx]
            }
            _ => self
                .active_win
                .as_ref()
                .expect("a window exists for every advertised epoch type"),
        }
    }

    pub(crate) fn require_epoch_type(
        &self,
        mask: proxima_config::EpochType,
        name: &'static str,
    ) -> Result<()> {
        if self.info.epoch_type.intersects(mask) {
            Ok(())
        } else {
            Err(Error::EpochNotAdvertised { required: name })
        }
    }

    /// Closes the epoch when no synchronization remains open.
    pub(crate) fn maybe_close_epoch(&mut self) {
        if self.lock_counter == 0 && self.lockall_counter == 0 && self.start_counter == 0 {
            self.epoch = EpochStat::NoEpoch;
        }
    }

    pub(crate) fn num_helpers(&self) -> usize {
        self.env.num_helpers
    }
}

enum WinInner {
    PassThrough {
        win: rt::Win,
        base: BaseMem,
        start_group: Option<Vec<Rank>>,
        post_group: Option<Vec<Rank>>,
    },
    Layered(Box<LayerWin>),
}

/// A user-visible window handle carrying the full one-sided surface.
pub struct Win {
    inner: WinInner,
}

impl Win {
    pub(crate) fn pass_through(win: rt::Win, base: BaseMem) -> Self {
        Self {
            inner: WinInner::PassThrough {
                win,
                base,
                start_group: None,
                post_group: None,
            },
        }
    }

    pub(crate) fn layered(lw: LayerWin) -> Self {
        Self {
            inner: WinInner::Layered(Box::new(lw)),
        }
    }

    /// Whether operations on this window are redirected through helpers.
    #[must_use]
    pub fn is_layered(&self) -> bool {
        matches!(self.inner, WinInner::Layered(_))
    }

    /// The window's local memory.
    #[must_use]
    pub fn base(&self) -> &BaseMem {
        match &self.inner {
            WinInner::PassThrough { base, .. } => base,
            WinInner::Layered(lw) => &lw.base,
        }
    }

    /// Name of the currently open epoch (`no_epoch` when none is open).
    #[must_use]
    pub fn epoch_name(&self) -> &'static str {
        match &self.inner {
            WinInner::PassThrough { .. } => EpochStat::NoEpoch.name(),
            WinInner::Layered(lw) => lw.epoch.name(),
        }
    }

    // ---- one-sided operations -------------------------------------------

    /// Writes `origin` into the target window at `target_disp` displacement
    /// units.
    pub fn put(&mut self, origin: &[u8], target: Rank, target_disp: u64) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.put(origin, target, target_disp)?),
            WinInner::Layered(lw) => ops::rma(lw, RmaOp::Put { origin }, target, target_disp),
        }
    }

    /// Reads `len` bytes from the target window into `dest` at
    /// `dest_offset`; valid after a flush.
    pub fn get(
        &mut self,
        dest: &RmaBuf,
        dest_offset: usize,
        len: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => {
                Ok(win.get(dest, dest_offset, len, target, target_disp)?)
            }
            WinInner::Layered(lw) => ops::rma(
                lw,
                RmaOp::Get {
                    dest,
                    dest_offset,
                    len,
                },
                target,
                target_disp,
            ),
        }
    }

    /// Elementwise accumulate into the target window.
    pub fn accumulate(
        &mut self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => {
                Ok(win.accumulate(origin, dtype, op, target, target_disp)?)
            }
            WinInner::Layered(lw) => ops::rma(
                lw,
                RmaOp::Accumulate { origin, dtype, op },
                target,
                target_disp,
            ),
        }
    }

    /// Atomic fetch of the prior target contents combined with an
    /// elementwise accumulate.
    #[allow(clippy::too_many_arguments)]
    pub fn get_accumulate(
        &mut self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.get_accumulate(
                origin,
                dtype,
                op,
                result,
                result_offset,
                target,
                target_disp,
            )?),
            WinInner::Layered(lw) => ops::rma(
                lw,
                RmaOp::GetAccumulate {
                    origin,
                    dtype,
                    op,
                    result,
                    result_offset,
                },
                target,
                target_disp,
            ),
        }
    }

    /// Single-element atomic fetch-and-op.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_and_op(
        &mut self,
        origin: &[u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.fetch_and_op(
                origin,
                dtype,
                op,
                result,
                result_offset,
                target,
                target_disp,
            )?),
            WinInner::Layered(lw) => ops::rma(
                lw,
                RmaOp::FetchAndOp {
                    origin,
                    dtype,
                    op,
                    result,
                    result_offset,
                },
                target,
                target_disp,
            ),
        }
    }

    /// Single-element atomic compare-and-swap.
    #[allow(clippy::too_many_arguments)]
    pub fn compare_and_swap(
        &mut self,
        compare: &[u8],
        new: &[u8],
        dtype: Datatype,
        result: &RmaBuf,
        result_offset: usize,
        target: Rank,
        target_disp: u64,
    ) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.compare_and_swap(
                compare,
                new,
                dtype,
                result,
                result_offset,
                target,
                target_disp,
            )?),
            WinInner::Layered(lw) => ops::rma(
                lw,
                RmaOp::CompareAndSwap {
                    compare,
                    new,
                    dtype,
                    result,
                    result_offset,
                },
                target,
                target_disp,
            ),
        }
    }

    // ---- synchronization -------------------------------------------------

    /// Opens a passive epoch on `target`.
    pub fn lock(&mut self, target: Rank, kind: LockKind, assert: Assert) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.lock(target, kind)?),
            WinInner::Layered(lw) => sync::lock(lw, target, kind, assert),
        }
    }

    /// Opens a passive epoch on every target.
    pub fn lock_all(&mut self, assert: Assert) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.lock_all()?),
            WinInner::Layered(lw) => sync::lock_all(lw, assert),
        }
    }

    /// Closes the passive epoch on `target`.
    pub fn unlock(&mut self, target: Rank) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.unlock(target)?),
            WinInner::Layered(lw) => sync::unlock(lw, target),
        }
    }

    /// Closes the passive epoch on every target.
    pub fn unlock_all(&mut self) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.unlock_all()?),
            WinInner::Layered(lw) => sync::unlock_all(lw),
        }
    }

    /// Completes every operation issued to `target`.
    pub fn flush(&mut self, target: Rank) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.flush(target)?),
            WinInner::Layered(lw) => sync::flush(lw, target),
        }
    }

    /// Completes every outstanding operation.
    pub fn flush_all(&mut self) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.flush_all()?),
            WinInner::Layered(lw) => sync::flush_all(lw),
        }
    }

    /// Locally completes operations issued to `target`.
    pub fn flush_local(&mut self, target: Rank) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.flush_local(target)?),
            WinInner::Layered(lw) => sync::flush(lw, target),
        }
    }

    /// Locally completes every outstanding operation.
    pub fn flush_local_all(&mut self) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.flush_local_all()?),
            WinInner::Layered(lw) => sync::flush_all(lw),
        }
    }

    /// Active-target fence.
    pub fn fence(&mut self, assert: Assert) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.fence()?),
            WinInner::Layered(lw) => sync::fence(lw, assert),
        }
    }

    /// Exposes this window to the listed origins (PSCW).
    pub fn post(&mut self, group: &[Rank], assert: Assert) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { post_group, .. } => {
                *post_group = Some(group.to_vec());
                Ok(())
            }
            WinInner::Layered(lw) => pscw::post(lw, group, assert),
        }
    }

    /// Starts an access epoch on the listed targets (PSCW).
    pub fn start(&mut self, group: &[Rank], assert: Assert) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { start_group, .. } => {
                *start_group = Some(group.to_vec());
                Ok(())
            }
            WinInner::Layered(lw) => pscw::start(lw, group, assert),
        }
    }

    /// Completes the access epoch opened by [`Win::start`].
    pub fn complete(&mut self) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough {
                win, start_group, ..
            } => pscw::complete_pass_through(win, start_group.take()),
            WinInner::Layered(lw) => pscw::complete(lw),
        }
    }

    /// Waits for every origin of the posted group to complete.
    pub fn wait(&mut self) -> Result<()> {
        match &mut self.inner {
            WinInner::PassThrough { win, post_group, .. } => {
                pscw::wait_pass_through(win, post_group.take())
            }
            WinInner::Layered(lw) => pscw::wait(lw),
        }
    }

    /// Collectively frees the window and everything it owns.
    pub fn free(self) -> Result<()> {
        match self.inner {
            WinInner::PassThrough { win, .. } => Ok(win.free()?),
            WinInner::Layered(lw) => free::free(*lw),
        }
    }

    // ---- observation ------------------------------------------------------

    /// Base offsets of `target`'s memory on each of its helpers. `None` for
    /// pass-through windows.
    #[must_use]
    pub fn target_base_offsets(&self, target: Rank) -> Option<Vec<u64>> {
        self.as_layered()
            .and_then(|lw| lw.targets.get(target))
            .map(|t| t.base_h_offsets.clone())
    }

    /// Segment table of `target`. `None` for pass-through windows.
    #[must_use]
    pub fn target_segments(&self, target: Rank) -> Option<Vec<SegmentDesc>> {
        self.as_layered()
            .and_then(|lw| lw.targets.get(target))
            .map(|t| {
                t.segs
                    .iter()
                    .map(|s| SegmentDesc {
                        base_offset: s.base_offset,
                        size: s.size,
                        main_helper_index: s.main_h_idx,
                    })
                    .collect()
            })
    }

    /// Helper ranks (user+helpers communicator) serving `target`.
    #[must_use]
    pub fn target_helper_ranks(&self, target: Rank) -> Option<Vec<Rank>> {
        self.as_layered()
            .and_then(|lw| lw.targets.get(target))
            .map(|t| t.h_ranks_in_uh.clone())
    }

    /// Frozen async state of `target`.
    #[must_use]
    pub fn target_async_stat(&self, target: Rank) -> Option<AsyncStat> {
        self.as_layered()
            .and_then(|lw| lw.targets.get(target))
            .map(|t| t.async_stat)
    }

    /// Delivery statistics of each operation window, keyed by serving rank
    /// in the user+helpers communicator.
    #[must_use]
    pub fn op_window_stats(&self) -> Vec<HashMap<Rank, OpStats>> {
        self.as_layered()
            .map(|lw| lw.op_wins.iter().map(rt::Win::stats).collect())
            .unwrap_or_default()
    }

    /// Delivery statistics of the active window, if one exists.
    #[must_use]
    pub fn active_window_stats(&self) -> Option<HashMap<Rank, OpStats>> {
        self.as_layered()
            .and_then(|lw| lw.active_win.as_ref())
            .map(rt::Win::stats)
    }

    fn as_layered(&self) -> Option<&LayerWin> {
        match &self.inner {
            WinInner::PassThrough { .. } => None,
            WinInner::Layered(lw) => Some(lw),
        }
    }
}
