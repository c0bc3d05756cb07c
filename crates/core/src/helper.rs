// SPDX-License-Identifier: Apache-2.0

//! Helper-side dispatch loop.
//!
//! A helper spends its life inside blocking receives on the control tag;
//! every blocking runtime call drains the process's RMA agent, so a helper
//! is always making progress for operations redirected to it. Window
//! lifecycle commands from the local user root are mirrored step for step
//! against the user-side allocator.

use crate::control::{self, CTRL_TAG, FuncCode, FuncHeader};
use crate::deploy::Deployment;
use crate::error::{Error, Result};
use crate::registry::WinRegistry;
use crate::win::HELPER_PROLOGUE_BYTES;
use proxima_config::EpochType;
use proxima_runtime::{self as rt, Rank, WinView};

/// Everything a helper holds for one allocated window.
struct HelperWin {
    op_wins: Vec<rt::Win>,
    active_win: Option<rt::Win>,
    shared_win: rt::Win,
    // Kept alive until the window is freed; dropped with the struct.
    _uh_comm: rt::Comm,
    _local_uh_comm: rt::Comm,
    _ur_h_comm: rt::Comm,
}

/// Runs the dispatch loop until `FINALIZE`.
pub(crate) fn run(dep: &Deployment) -> Result<()> {
    let mut registry: WinRegistry<HelperWin> = WinRegistry::new();
    loop {
        let (src, header) = control::recv_func(&dep.local)?;
        tracing::trace!(func = ?header.func, src, "helper received control frame");
        match header.func {
            FuncCode::WinAllocate => win_allocate(dep, src, &header, &mut registry)?,
            FuncCode::WinFree => win_free(dep, src, &mut registry)?,
            FuncCode::LockAll | FuncCode::UnlockAll => {
                // Reserved by the wire format; no helper-side behavior is
                // defined for them.
                tracing::debug!(func = ?header.func, "ignoring reserved control function");
            }
            FuncCode::Abort => {
                dep.proc.abort(1);
                return Err(rt::Error::Aborted { code: 1 }.into());
            }
            FuncCode::Finalize => {
                if !registry.is_empty() {
                    tracing::warn!(live = registry.len(), "finalizing with live windows");
                }
                tracing::debug!("helper finalizing");
                return Ok(());
            }
        }
    }
}

/// Joins the window-allocation collectives, mirroring the user side.
fn win_allocate(
    dep: &Deployment,
    root_local: Rank,
    header: &FuncHeader,
    registry: &mut WinRegistry<HelperWin>,
) -> Result<()> {
    let num_h = dep.env.num_helpers;
    let mut members = dep.local_helper_ranks();
    members.push(root_local);
    let ur_h = dep.local.create_group(&members, CTRL_TAG)?;

    let p1 = control::decode_words(&ur_h.recv(num_h, CTRL_TAG)?)?;
    let user_nprocs = header.user_nprocs as usize;
    if p1.len() < 2 || p1.len() != 2 + user_nprocs + p1[1] as usize {
        return Err(Error::InvariantViolation {
            details: format!("WIN_ALLOCATE parameter block of {} words", p1.len()),
        });
    }
    let is_world = p1[0] == 1;
    let num_unique = p1[1] as usize;
    let users: Vec<Rank> = p1[2..2 + user_nprocs].iter().map(|&w| w as usize).collect();
    let helpers: Vec<Rank> = p1[2 + user_nprocs..].iter().map(|&w| w as usize).collect();

    let (uh_comm, local_uh_comm) = if is_world {
        (dep.world.clone(), dep.local.clone())
    } else {
        let mut uh_members = helpers.clone();
        uh_members.extend(users.iter().copied());
        let uh = dep.world.create_group(&uh_members, 0)?;
        let local_uh = uh.split_node()?;
        (uh, local_uh)
    };
    tracing::trace!(is_world, num_unique, users = users.len(), "helper joined window comms");

    // One prologue word into the node region; helper 0's word carries the
    // grant-lock byte and the post flag.
    let (shared_win, shared) = rt::Win::allocate_shared(&local_uh_comm, HELPER_PROLOGUE_BYTES, 1)?;
    let region = shared.region;

    let p2 = control::decode_words(&ur_h.recv(num_h, CTRL_TAG)?)?;
    if p2.len() != 2 {
        return Err(Error::InvariantViolation {
            details: format!("WIN_ALLOCATE window parameters of {} words", p2.len()),
        });
    }
    let max_local_user_nprocs = p2[0] as usize;
    let epoch_type = EpochType::from_bits_truncate(p2[1] as u32);

    // A helper exposes the whole node region, byte-addressed, on every
    // window it joins.
    let mut num_op_wins = 0;
    if epoch_type.contains(EpochType::LOCK) {
        num_op_wins = max_local_user_nprocs;
    } else if epoch_type.contains(EpochType::LOCK_ALL) {
        num_op_wins = 1;
    }
    let mut op_wins = Vec::with_capacity(num_op_wins);
    for _ in 0..num_op_wins {
        op_wins.push(rt::Win::create(&uh_comm, WinView::full(region.clone()), 1)?);
    }

    let active_win = if epoch_type.intersects(EpochType::FENCE | EpochType::PSCW) {
        let win = rt::Win::create(&uh_comm, WinView::full(region.clone()), 1)?;
        win.lock_all()?;
        Some(win)
    } else {
        None
    };

    let id = registry.insert(HelperWin {
        op_wins,
        active_win,
        shared_win,
        _uh_comm: uh_comm,
        _local_uh_comm: local_uh_comm,
        _ur_h_comm: ur_h.clone(),
    });
    ur_h.send(num_h, CTRL_TAG, &control::encode_words(&[id]))?;
    tracing::debug!(id, "helper window registered");
    Ok(())
}

/// Verifies the handle sent by the user root and tears the window down.
///
/// A helper that cannot verify the handle aborts the deployment: its window
/// bookkeeping is inconsistent and it cannot participate in any further
/// collective.
fn win_free(
    dep: &Deployment,
    root_local: Rank,
    registry: &mut WinRegistry<HelperWin>,
) -> Result<()> {
    let block = dep.local.recv(root_local, CTRL_TAG)?;
    let words = control::decode_words(&block)?;
    let handle = words.first().copied().unwrap_or(0);

    let Some(win) = registry.take(handle) else {
        tracing::error!(handle, "cannot verify window handle, aborting");
        dep.proc.abort(-1);
        return Err(Error::BadHandle { handle });
    };

    for w in win.op_wins {
        w.free()?;
    }
    if let Some(w) = win.active_win {
        w.free()?;
    }
    win.shared_win.free()?;
    tracing::debug!(handle, "helper window freed");
    Ok(())
}
