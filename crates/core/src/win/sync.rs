// SPDX-License-Identifier: Apache-2.0

//! Passive-target synchronization and the fence emulation.
//!
//! Locks are forwarded to every helper of the target on the target's
//! operation window. Taking a lock on the local rank additionally forces
//! the grant through the hidden grant-lock byte, so local load/store through
//! the shared view is immediately legal. Remote grants are confirmed lazily:
//! a completed flush implies the lock was granted, which drives the
//! promotion state machine in [`crate::load`].

use crate::error::Result;
use crate::load;
use crate::sched::{AsyncStat, CommTimer};
use crate::win::{Assert, EpochStat, GRANT_LOCK_DISP, LayerWin, MainLockStat};
use proxima_config::EpochType;
use proxima_runtime::{LockKind, RmaBuf};

/// Opens a passive epoch on one target.
pub(crate) fn lock(lw: &mut LayerWin, target: usize, kind: LockKind, assert: Assert) -> Result<()> {
    lw.require_epoch_type(EpochType::LOCK, "lock")?;
    let _timer = CommTimer::start(&lw.sched);

    lw.targets[target].remote_lock_assert = assert;
    lw.epoch = EpochStat::Lock;
    lw.lock_counter += 1;

    let win_idx = lw.targets[target].op_win_idx;
    if lw.targets[target].async_stat == AsyncStat::Off {
        // An async-off target serves its own operations, so it holds the
        // lock itself.
        let uh_rank = lw.targets[target].uh_rank;
        lw.op_wins[win_idx].lock(uh_rank, kind)?;
        return Ok(());
    }
    for j in 0..lw.num_helpers() {
        let h_rank = lw.targets[target].h_ranks_in_uh[j];
        lw.op_wins[win_idx].lock(h_rank, kind)?;
        tracing::trace!(target, helper = h_rank, ?kind, "lock forwarded to helper");
    }

    if target == lw.my_user_rank && !lw.info.no_local_load_store {
        // Lock the local rank too and force the grant so load/store through
        // the shared view is safe inside this epoch.
        let me = lw.my_rank_in_uh;
        lw.op_wins[win_idx].lock(me, kind)?;
        grant_local_lock(lw)?;
        lw.is_self_locked = true;
    }
    Ok(())
}

/// Opens a passive epoch on every target.
pub(crate) fn lock_all(lw: &mut LayerWin, assert: Assert) -> Result<()> {
    lw.require_epoch_type(EpochType::LOCK_ALL, "lockall")?;
    let _timer = CommTimer::start(&lw.sched);

    for t in 0..lw.targets.len() {
        lw.targets[t].remote_lock_assert = assert;
    }

    let self_on = lw.targets[lw.my_user_rank].async_stat == AsyncStat::On;
    if lw.info.epoch_type.contains(EpochType::LOCK) {
        // Mixed epochs: separate windows are bound per target.
        for t in 0..lw.targets.len() {
            let win_idx = lw.targets[t].op_win_idx;
            if lw.targets[t].async_stat == AsyncStat::Off {
                let uh_rank = lw.targets[t].uh_rank;
                lw.op_wins[win_idx].lock(uh_rank, LockKind::Shared)?;
                continue;
            }
            for j in 0..lw.num_helpers() {
                let h_rank = lw.targets[t].h_ranks_in_uh[j];
                lw.op_wins[win_idx].lock(h_rank, LockKind::Shared)?;
            }
        }
        if !lw.info.no_local_load_store && self_on {
            let me = lw.my_rank_in_uh;
            let my_idx = lw.my_op_win_idx;
            lw.op_wins[my_idx].lock(me, LockKind::Shared)?;
        }
    } else {
        // A lockall-only epoch runs over the single operation window.
        lw.op_wins[0].lock_all()?;
    }

    if !lw.info.no_local_load_store && self_on {
        grant_local_lock(lw)?;
        lw.is_self_locked = true;
    }

    lw.lockall_counter += 1;
    if lw.epoch == EpochStat::NoEpoch {
        lw.epoch = EpochStat::Lock;
    }
    Ok(())
}

/// Closes the passive epoch on one target.
pub(crate) fn unlock(lw: &mut LayerWin, target: usize) -> Result<()> {
    lw.require_epoch_type(EpochType::LOCK, "lock")?;
    let _timer = CommTimer::start(&lw.sched);

    let win_idx = lw.targets[target].op_win_idx;
    if lw.targets[target].async_stat == AsyncStat::Off {
        let uh_rank = lw.targets[target].uh_rank;
        lw.op_wins[win_idx].unlock(uh_rank)?;
        lw.targets[target].remote_lock_assert = Assert::empty();
        lw.lock_counter -= 1;
        lw.maybe_close_epoch();
        return Ok(());
    }
    for j in 0..lw.num_helpers() {
        let h_rank = lw.targets[target].h_ranks_in_uh[j];
        lw.op_wins[win_idx].unlock(h_rank)?;
        tracing::trace!(target, helper = h_rank, "unlock forwarded to helper");
    }

    if target == lw.my_user_rank && lw.is_self_locked {
        let me = lw.my_rank_in_uh;
        lw.op_wins[win_idx].unlock(me)?;
        lw.is_self_locked = false;
    }

    lw.targets[target].remote_lock_assert = Assert::empty();
    load::reset_target_lock_state(lw, target);

    lw.lock_counter -= 1;
    lw.maybe_close_epoch();
    Ok(())
}

/// Closes the passive epoch on every target.
pub(crate) fn unlock_all(lw: &mut LayerWin) -> Result<()> {
    lw.require_epoch_type(EpochType::LOCK_ALL | EpochType::LOCK, "lockall")?;
    let _timer = CommTimer::start(&lw.sched);

    for t in 0..lw.targets.len() {
        lw.targets[t].remote_lock_assert = Assert::empty();
    }

    if !lw.info.epoch_type.contains(EpochType::LOCK) {
        // Lockall-only: the op-window unlock_all releases every rank,
        // including the local one.
        lw.op_wins[0].unlock_all()?;
        lw.is_self_locked = false;
    } else {
        for t in 0..lw.targets.len() {
            let win_idx = lw.targets[t].op_win_idx;
            if lw.targets[t].async_stat == AsyncStat::Off {
                let uh_rank = lw.targets[t].uh_rank;
                lw.op_wins[win_idx].unlock(uh_rank)?;
                continue;
            }
            for j in 0..lw.num_helpers() {
                let h_rank = lw.targets[t].h_ranks_in_uh[j];
                lw.op_wins[win_idx].unlock(h_rank)?;
            }
        }
        if lw.is_self_locked {
            let me = lw.my_rank_in_uh;
            let my_idx = lw.my_op_win_idx;
            lw.op_wins[my_idx].unlock(me)?;
            lw.is_self_locked = false;
        }
    }

    for t in 0..lw.targets.len() {
        load::reset_target_lock_state(lw, t);
    }

    lw.lockall_counter -= 1;
    lw.maybe_close_epoch();
    Ok(())
}

/// Completes every operation issued to `target` and promotes its segments.
pub(crate) fn flush(lw: &mut LayerWin, target: usize) -> Result<()> {
    lw.require_epoch_type(EpochType::LOCK | EpochType::LOCK_ALL, "lock or lockall")?;
    let _timer = CommTimer::start(&lw.sched);

    // Async-off targets received operations directly.
    if lw.targets[target].async_stat == AsyncStat::Off {
        let uh_rank = lw.targets[target].uh_rank;
        let win_idx = lw.targets[target].op_win_idx;
        lw.op_wins[win_idx].flush(uh_rank)?;
        return Ok(());
    }

    if target == lw.my_user_rank && lw.is_self_locked {
        // The local shared view carried plain loads/stores and gets/puts;
        // helper windows still carry the atomics.
        let me = lw.my_rank_in_uh;
        let my_idx = lw.my_op_win_idx;
        lw.op_wins[my_idx].flush(me)?;
    }

    // Operations may have been spread over every helper of the target.
    let win_idx = lw.targets[target].op_win_idx;
    for j in 0..lw.num_helpers() {
        let h_rank = lw.targets[target].h_ranks_in_uh[j];
        lw.op_wins[win_idx].flush(h_rank)?;
    }

    // A completed flush implies the remote lock is granted.
    load::promote_after_flush(lw, target);
    Ok(())
}

/// Flushes every target.
pub(crate) fn flush_all(lw: &mut LayerWin) -> Result<()> {
    for t in 0..lw.targets.len() {
        flush(lw, t)?;
    }
    Ok(())
}

/// Emulated active-target fence.
///
/// The active window sits under a permanent `lock_all`, so the fence is a
/// flush of every helper (and of async-off targets) followed by a barrier
/// over the user communicator.
pub(crate) fn fence(lw: &mut LayerWin, assert: Assert) -> Result<()> {
    lw.require_epoch_type(EpochType::FENCE, "fence")?;
    let _timer = CommTimer::start(&lw.sched);

    {
        let active = lw
            .active_win
            .as_ref()
            .expect("active window exists when fence is advertised");
        for &h_rank in &lw.helper_uh_ranks {
            active.flush(h_rank)?;
        }
        for t in &lw.targets {
            if t.async_stat == AsyncStat::Off {
                active.flush(t.uh_rank)?;
            }
        }
    }
    lw.user_comm.barrier()?;

    lw.epoch = if assert.contains(Assert::NOSUCCEED) {
        EpochStat::NoEpoch
    } else {
        EpochStat::Fence
    };
    tracing::trace!(epoch = lw.epoch.name(), "fence complete");
    Ok(())
}

/// Forces the local lock grant by reading the grant-lock byte from the main
/// helper of every local segment and flushing it.
pub(crate) fn grant_local_lock(lw: &mut LayerWin) -> Result<()> {
    let me = lw.my_user_rank;
    let plan: Vec<(usize, proxima_runtime::Rank)> = lw.targets[me]
        .segs
        .iter()
        .map(|seg| {
            (
                seg.win_idx,
                lw.targets[me].h_ranks_in_uh[seg.main_h_idx],
            )
        })
        .collect();

    let grant = RmaBuf::zeroed(1);
    for (win_idx, h_rank) in plan {
        lw.op_wins[win_idx].get(&grant, 0, 1, h_rank, GRANT_LOCK_DISP)?;
        lw.op_wins[win_idx].flush(h_rank)?;
        tracing::trace!(helper = h_rank, "local lock granted");
    }
    for seg in &mut lw.targets[me].segs {
        seg.main_lock_stat = MainLockStat::Granted;
    }
    Ok(())
}
