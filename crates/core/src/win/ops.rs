// SPDX-License-Identifier: Apache-2.0

//! Operation redirection: every one-sided operation funnels through
//! [`rma`], which picks the path the current window state dictates.
//!
//! Paths, in order: direct issue for async-off targets (user displacement
//! untouched), the local shared view for a locked self target, per-segment
//! dispatch under segment-binding in a lock epoch, and the normal redirected
//! path (helper pick, displacement translation, issue).

use crate::error::Result;
use crate::load;
use crate::sched::{AsyncStat, CommTimer};
use crate::seg;
use crate::win::{EpochStat, LayerWin};
use proxima_config::LockBinding;
use proxima_runtime::{self as rt, Datatype, Rank, ReduceOp, RmaBuf};

/// A borrowed description of one user-level operation.
#[derive(Clone, Copy)]
pub(crate) enum RmaOp<'a> {
    Put {
        origin: &'a [u8],
    },
    Get {
        dest: &'a RmaBuf,
        dest_offset: usize,
        len: usize,
    },
    Accumulate {
        origin: &'a [u8],
        dtype: Datatype,
        op: ReduceOp,
    },
    GetAccumulate {
        origin: &'a [u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &'a RmaBuf,
        result_offset: usize,
    },
    FetchAndOp {
        origin: &'a [u8],
        dtype: Datatype,
        op: ReduceOp,
        result: &'a RmaBuf,
        result_offset: usize,
    },
    CompareAndSwap {
        compare: &'a [u8],
        new: &'a [u8],
        dtype: Datatype,
        result: &'a RmaBuf,
        result_offset: usize,
    },
}

impl<'a> RmaOp<'a> {
    /// Accumulate-class operations require the runtime's atomicity and
    /// ordering and are pinned to the main helper.
    pub(crate) fn is_accumulate(&self) -> bool {
        matches!(
            self,
            RmaOp::Accumulate { .. }
                | RmaOp::GetAccumulate { .. }
                | RmaOp::FetchAndOp { .. }
                | RmaOp::CompareAndSwap { .. }
        )
    }

    /// Whether segment dispatch may cut this operation into pieces.
    fn is_segmentable(&self) -> bool {
        matches!(
            self,
            RmaOp::Put { .. }
                | RmaOp::Get { .. }
                | RmaOp::Accumulate { .. }
                | RmaOp::GetAccumulate { .. }
        )
    }

    /// Total payload bytes.
    fn nbytes(&self) -> usize {
        match self {
            RmaOp::Put { origin } => origin.len(),
            RmaOp::Get { len, .. } => *len,
            RmaOp::Accumulate { origin, .. } | RmaOp::GetAccumulate { origin, .. } => origin.len(),
            RmaOp::FetchAndOp { dtype, .. } | RmaOp::CompareAndSwap { dtype, .. } => {
                dtype.extent()
            }
        }
    }

    /// Granularity at which the operation may be cut.
    fn elem_size(&self) -> usize {
        match self {
            RmaOp::Put { .. } | RmaOp::Get { .. } => 1,
            RmaOp::Accumulate { dtype, .. }
            | RmaOp::GetAccumulate { dtype, .. }
            | RmaOp::FetchAndOp { dtype, .. }
            | RmaOp::CompareAndSwap { dtype, .. } => dtype.extent(),
        }
    }

    /// The piece of this operation covering origin bytes
    /// `start .. start + len`.
    fn sub(&self, start: usize, len: usize) -> RmaOp<'a> {
        match *self {
            RmaOp::Put { origin } => RmaOp::Put {
                origin: &origin[start..start + len],
            },
            RmaOp::Get {
                dest, dest_offset, ..
            } => RmaOp::Get {
                dest,
                dest_offset: dest_offset + start,
                len,
            },
            RmaOp::Accumulate { origin, dtype, op } => RmaOp::Accumulate {
                origin: &origin[start..start + len],
                dtype,
                op,
            },
            RmaOp::GetAccumulate {
                origin,
                dtype,
                op,
                result,
                result_offset,
            } => RmaOp::GetAccumulate {
                origin: &origin[start..start + len],
                dtype,
                op,
                result,
                result_offset: result_offset + start,
            },
            // Single-element operations are never cut.
            RmaOp::FetchAndOp { .. } | RmaOp::CompareAndSwap { .. } => unreachable!(),
        }
    }

    /// Issues this operation on an underlying window.
    fn issue_on(&self, win: &rt::Win, rank: Rank, disp: u64) -> rt::Result<()> {
        match *self {
            RmaOp::Put { origin } => win.put(origin, rank, disp),
            RmaOp::Get {
                dest,
                dest_offset,
                len,
            } => win.get(dest, dest_offset, len, rank, disp),
            RmaOp::Accumulate { origin, dtype, op } => {
                win.accumulate(origin, dtype, op, rank, disp)
            }
            RmaOp::GetAccumulate {
                origin,
                dtype,
                op,
                result,
                result_offset,
            } => win.get_accumulate(origin, dtype, op, result, result_offset, rank, disp),
            RmaOp::FetchAndOp {
                origin,
                dtype,
                op,
                result,
                result_offset,
            } => win.fetch_and_op(origin, dtype, op, result, result_offset, rank, disp),
            RmaOp::CompareAndSwap {
                compare,
                new,
                dtype,
                result,
                result_offset,
            } => win.compare_and_swap(compare, new, dtype, result, result_offset, rank, disp),
        }
    }
}

/// Redirects one operation addressed to `(target, target_disp)`.
pub(crate) fn rma(lw: &mut LayerWin, op: RmaOp<'_>, target: usize, target_disp: u64) -> Result<()> {
    let _timer = CommTimer::start(&lw.sched);
    if target >= lw.targets.len() {
        return Err(rt::Error::RankOutOfRange {
            rank: target,
            size: lw.targets.len(),
        }
        .into());
    }

    // Async-off target: no helper detour, user displacement unchanged.
    if lw.targets[target].async_stat == AsyncStat::Off {
        let uh_rank = lw.targets[target].uh_rank;
        let win = lw.epoch_rt_win(target, 0);
        op.issue_on(win, uh_rank, target_disp)?;
        tracing::trace!(target, uh_rank, "issued directly to async-off target");
        return Ok(());
    }

    // Locked self target: the local shared view completes without a hop.
    // Accumulate-class operations still go through the helper for
    // atomicity with remote origins.
    if target == lw.my_user_rank && lw.is_self_locked && !op.is_accumulate() {
        let win = lw.epoch_local_rt_win();
        op.issue_on(win, lw.my_rank_in_uh, target_disp)?;
        tracing::trace!(target, "issued to local shared view");
        return Ok(());
    }

    // Segment dispatch: a lock-epoch operation on a multi-segment target
    // must respect per-segment helper ownership.
    if lw.env.lock_binding == LockBinding::Segment
        && lw.targets[target].segs.len() > 1
        && lw.epoch == EpochStat::Lock
        && op.is_segmentable()
    {
        let splits = seg::decode(
            &lw.targets[target],
            target_disp,
            op.nbytes(),
            op.elem_size(),
        )?;
        tracing::trace!(target, pieces = splits.len(), "segment dispatch");
        for split in splits {
            let (h_rank, h_base) =
                load::choose_helper(lw, target, split.seg_idx, op.is_accumulate(), split.len as u64)?;
            let win_idx = lw.targets[target].segs[split.seg_idx].win_idx;
            let sub = op.sub(split.origin_start, split.len);
            sub.issue_on(&lw.op_wins[win_idx], h_rank, h_base + split.target_byte_off)?;
        }
        return Ok(());
    }

    // Normal path: pick a helper, translate the displacement into its view.
    let bytes = op.nbytes() as u64;
    let (h_rank, h_base) = load::choose_helper(lw, target, 0, op.is_accumulate(), bytes)?;
    let disp_bytes = h_base + lw.targets[target].disp_unit * target_disp;
    let win = lw.epoch_rt_win(target, 0);
    op.issue_on(win, h_rank, disp_bytes)?;
    tracing::trace!(
        target,
        helper = h_rank,
        disp_bytes,
        epoch = lw.epoch.name(),
        "operation redirected"
    );
    Ok(())
}
