// SPDX-License-Identifier: Apache-2.0

//! Runtime load balancer and lock promotion.
//!
//! Every redirected operation asks [`choose_helper`] which helper serves it.
//! Until the target's remote lock is confirmed granted (and always when
//! ordering is required, i.e. for accumulate-class operations) the segment's
//! main helper is the only legal choice; afterwards the configured policy
//! spreads operations across the target's helper list.

use crate::error::Result;
use crate::win::{Assert, LayerWin, MainLockStat};
use proxima_config::{LoadLock, LoadOpt};
use proxima_runtime::Rank;

/// Picks the helper (user+helpers rank) and base offset serving one
/// operation of `bytes` payload bytes to `(target, seg)`.
pub(crate) fn choose_helper(
    lw: &mut LayerWin,
    target: usize,
    seg: usize,
    order_required: bool,
    bytes: u64,
) -> Result<(Rank, u64)> {
    let main_idx = lw.targets[target].segs[seg].main_h_idx;
    let win_idx = lw.targets[target].segs[seg].win_idx;
    let main_rank = lw.targets[target].h_ranks_in_uh[main_idx];
    let main_off = lw.targets[target].base_h_offsets[main_idx];
    let nocheck = lw.targets[target]
        .remote_lock_assert
        .contains(Assert::NOCHECK);

    // Force the grant with an explicit flush once an operation is in
    // flight, so later operations can spread immediately.
    if lw.env.load_lock == LoadLock::Force
        && !nocheck
        && lw.targets[target].segs[seg].main_lock_stat == MainLockStat::OpIssued
    {
        lw.op_wins[win_idx].flush(main_rank)?;
        lw.targets[target].segs[seg].main_lock_stat = MainLockStat::Granted;
        tracing::trace!(target, seg, "main lock force-granted");
    }

    if lw.targets[target].segs[seg].main_lock_stat == MainLockStat::Reset {
        lw.targets[target].segs[seg].main_lock_stat = MainLockStat::OpIssued;
    }

    // Before the lock is granted only the main helper may see operations;
    // accumulate-class operations are pinned to it for atomicity/ordering.
    let granted = lw.targets[target].segs[seg].main_lock_stat == MainLockStat::Granted;
    if (!nocheck && !granted) || order_required {
        bump(lw, main_rank, bytes);
        tracing::trace!(target, seg, helper = main_rank, order_required, "main helper chosen");
        return Ok((main_rank, main_off));
    }

    let num_h = lw.num_helpers();
    let picked = match lw.env.load_opt {
        LoadOpt::Static => main_idx,
        LoadOpt::Random => {
            let idx = (lw.prev_h_off + 1) % num_h;
            lw.prev_h_off = idx;
            idx
        }
        LoadOpt::OpCounting => min_count_index(lw, target, &lw.h_op_counts),
        LoadOpt::ByteCounting => min_count_index(lw, target, &lw.h_byte_counts),
    };

    let rank = lw.targets[target].h_ranks_in_uh[picked];
    let off = lw.targets[target].base_h_offsets[picked];
    bump(lw, rank, bytes);
    tracing::trace!(target, seg, helper = rank, policy = ?lw.env.load_opt, "helper chosen");
    Ok((rank, off))
}

/// Lowest-count helper of the target; ties break toward the lowest index.
fn min_count_index(lw: &LayerWin, target: usize, counts: &[u64]) -> usize {
    let helpers = &lw.targets[target].h_ranks_in_uh;
    let mut best = 0;
    let mut best_count = u64::MAX;
    for (idx, &rank) in helpers.iter().enumerate() {
        let count = counts.get(rank).copied().unwrap_or(0);
        if count < best_count {
            best = idx;
            best_count = count;
        }
    }
    best
}

fn bump(lw: &mut LayerWin, helper_rank: Rank, bytes: u64) {
    match lw.env.load_opt {
        LoadOpt::OpCounting => lw.h_op_counts[helper_rank] += 1,
        LoadOpt::ByteCounting => lw.h_byte_counts[helper_rank] += bytes,
        LoadOpt::Static | LoadOpt::Random => {}
    }
}

/// Confirms the grant on every segment with an operation in flight; called
/// after a user flush or unlock completes.
pub(crate) fn promote_after_flush(lw: &mut LayerWin, target: usize) {
    for seg in &mut lw.targets[target].segs {
        if seg.main_lock_stat == MainLockStat::OpIssued {
            seg.main_lock_stat = MainLockStat::Granted;
        }
    }
    reset_target_counters(lw, target);
}

/// Zeroes the balancer counters of the target's helpers for the next round.
pub(crate) fn reset_target_counters(lw: &mut LayerWin, target: usize) {
    let helpers = lw.targets[target].h_ranks_in_uh.clone();
    for rank in helpers {
        lw.h_op_counts[rank] = 0;
        lw.h_byte_counts[rank] = 0;
    }
}

/// Resets every segment of the target to the unpromoted state.
pub(crate) fn reset_target_lock_state(lw: &mut LayerWin, target: usize) {
    for seg in &mut lw.targets[target].segs {
        seg.main_lock_stat = MainLockStat::Reset;
    }
    reset_target_counters(lw, target);
}
