// SPDX-License-Identifier: Apache-2.0

//! Window free: verify-and-teardown on both sides of the control channel.

use crate::control::{self, CTRL_TAG, FuncCode, FuncHeader};
use crate::error::Result;
use crate::sched::CommTimer;
use crate::win::LayerWin;

/// Collectively frees a layered window.
///
/// The local root tells the node helpers which registry entry to release;
/// every side then tears down in reverse creation order. The underlying
/// collective frees provide the necessary synchronization, no extra barrier
/// is needed.
pub(crate) fn free(lw: LayerWin) -> Result<()> {
    let _timer = CommTimer::start(&lw.sched);
    let num_h = lw.env.num_helpers;

    if lw.user_local_comm.rank() == 0 {
        control::start_func(
            &lw.local_comm,
            &(0..num_h).collect::<Vec<_>>(),
            FuncHeader {
                func: FuncCode::WinFree,
                user_nprocs: lw.user_comm.size() as u64,
                user_local_nprocs: lw.user_local_comm.size() as u64,
            },
        )?;
        for h in 0..num_h {
            let block = control::encode_words(&[lw.helper_win_ids[h]]);
            lw.local_comm.send(h, CTRL_TAG, &block)?;
        }
    }

    // Operation windows first: all incoming operations must settle before
    // the shared region goes away.
    for win in lw.op_wins {
        win.free()?;
    }
    if let Some(win) = lw.active_win {
        win.free()?;
    }
    if let Some(win) = lw.user_win {
        win.free()?;
    }
    if let Some(win) = lw.shared_win {
        win.free()?;
    }

    // Auxiliary communicators drop here. Handles aliasing the
    // process-global communicators are shared and survive the drop.
    tracing::debug!("layer window freed");
    Ok(())
}
