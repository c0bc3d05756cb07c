// SPDX-License-Identifier: Apache-2.0

//! Post-start-complete-wait epochs.
//!
//! The heavy lifting happened at allocation: the active window already sits
//! under a background `lock_all`, so operations inside a PSCW epoch redirect
//! to helpers like any passive-mode operation. What remains here is the
//! epoch bracketing: `post` writes the post flag on each origin's main
//! helper, `complete` flushes and sends a one-byte completion message to
//! every remote member of the start group, `wait` collects those messages.

use crate::control::PSCW_CW_TAG;
use crate::error::Result;
use crate::sched::{AsyncStat, CommTimer};
use crate::win::{Assert, EpochStat, LayerWin, POST_FLAG_DISP};
use proxima_config::EpochType;
use proxima_runtime::{self as rt, Rank};

/// Exposes this window to the listed origins.
pub(crate) fn post(lw: &mut LayerWin, group: &[Rank], _assert: Assert) -> Result<()> {
    lw.require_epoch_type(EpochType::PSCW, "pscw")?;
    let _timer = CommTimer::start(&lw.sched);

    {
        let active = lw
            .active_win
            .as_ref()
            .expect("active window exists when pscw is advertised");
        let mut flagged: Vec<Rank> = Vec::with_capacity(group.len());
        for &origin in group {
            if origin == lw.my_user_rank {
                continue;
            }
            let t = &lw.targets[origin];
            let h_rank = t.h_ranks_in_uh[t.segs[0].main_h_idx];
            active.put(&[1u8], h_rank, POST_FLAG_DISP)?;
            if !flagged.contains(&h_rank) {
                flagged.push(h_rank);
            }
        }
        for h_rank in flagged {
            active.flush(h_rank)?;
        }
    }

    lw.post_group = Some(group.to_vec());
    lw.epoch = EpochStat::Pscw;
    tracing::trace!(origins = group.len(), "posted");
    Ok(())
}

/// Starts an access epoch on the listed targets.
pub(crate) fn start(lw: &mut LayerWin, group: &[Rank], _assert: Assert) -> Result<()> {
    lw.require_epoch_type(EpochType::PSCW, "pscw")?;
    lw.start_group = Some(group.to_vec());
    lw.start_counter += 1;
    lw.epoch = EpochStat::Pscw;
    Ok(())
}

/// Completes the epoch opened by `start`: flush helpers (and async-off or
/// local members of the group), then notify every remote member.
pub(crate) fn complete(lw: &mut LayerWin) -> Result<()> {
    lw.require_epoch_type(EpochType::PSCW, "pscw")?;
    let _timer = CommTimer::start(&lw.sched);

    let Some(group) = lw.start_group.take() else {
        // Nothing was started; the standard says do nothing for an empty
        // epoch.
        return Ok(());
    };

    {
        let active = lw
            .active_win
            .as_ref()
            .expect("active window exists when pscw is advertised");
        for &h_rank in &lw.helper_uh_ranks {
            active.flush(h_rank)?;
        }
        for &t_rank in &group {
            if lw.targets[t_rank].async_stat == AsyncStat::Off {
                active.flush(lw.targets[t_rank].uh_rank)?;
            }
        }
        if group.contains(&lw.my_user_rank) {
            active.flush(lw.my_rank_in_uh)?;
        }
    }

    for &t_rank in &group {
        if t_rank != lw.my_user_rank {
            lw.user_comm.send(t_rank, PSCW_CW_TAG, &[1u8])?;
            tracing::trace!(target = t_rank, "completion message sent");
        }
    }

    lw.start_counter -= 1;
    if lw.start_counter == 0 {
        lw.maybe_close_epoch();
    }
    Ok(())
}

/// Waits for the completion message of every remote origin of the posted
/// group.
pub(crate) fn wait(lw: &mut LayerWin) -> Result<()> {
    lw.require_epoch_type(EpochType::PSCW, "pscw")?;
    let _timer = CommTimer::start(&lw.sched);

    let Some(group) = lw.post_group.take() else {
        return Ok(());
    };
    for &origin in &group {
        if origin != lw.my_user_rank {
            let _ = lw.user_comm.recv(origin, PSCW_CW_TAG)?;
            tracing::trace!(origin, "completion message received");
        }
    }
    if lw.start_counter == 0 {
        lw.maybe_close_epoch();
    }
    Ok(())
}

// Pass-through windows get the same bracketing without helpers: the
// underlying runtime has no PSCW primitives of its own, so the layer runs
// the completion-message protocol over the window's communicator.

pub(crate) fn complete_pass_through(win: &rt::Win, group: Option<Vec<Rank>>) -> Result<()> {
    let Some(group) = group else {
        return Ok(());
    };
    win.flush_all()?;
    let comm = win.comm();
    for &t_rank in &group {
        if t_rank != comm.rank() {
            comm.send(t_rank, PSCW_CW_TAG, &[1u8])?;
        }
    }
    Ok(())
}

pub(crate) fn wait_pass_through(win: &rt::Win, group: Option<Vec<Rank>>) -> Result<()> {
    let Some(group) = group else {
        return Ok(());
    };
    let comm = win.comm();
    for &origin in &group {
        if origin != comm.rank() {
            let _ = comm.recv(origin, PSCW_CW_TAG)?;
        }
    }
    Ok(())
}
