// SPDX-License-Identifier: Apache-2.0

//! Window allocation: auxiliary communicators, the node shared region,
//! per-target descriptors, helper binding, and the underlying windows for
//! the advertised epoch types.
//!
//! The collective sequence here is mirrored step for step by the helper
//! dispatch loop (see `helper.rs`); reordering either side deadlocks the
//! allocation.

use crate::binding;
use crate::control::{self, CTRL_TAG, FuncCode, FuncHeader};
use crate::deploy::Deployment;
use crate::error::{Error, Result};
use crate::sched::{AsyncStat, CommTimer, SchedHandle};
use crate::win::{Assert, BaseMem, EpochStat, LayerWin, Win, WinTarget};
use proxima_config::{AsyncMode, EpochType, Info, WinInfo};
use proxima_runtime::{self as rt, Comm, Rank, WinView};
use std::collections::HashMap;
use std::rc::Rc;

/// Windows created so far, so a failing step can roll everything back.
#[derive(Default)]
struct AllocStage {
    shared_win: Option<rt::Win>,
    op_wins: Vec<rt::Win>,
    active_win: Option<rt::Win>,
    user_win: Option<rt::Win>,
}

impl AllocStage {
    /// Best-effort release of partially created windows. Failures here are
    /// collective like the allocation itself, so peers run the same
    /// rollback in the same order.
    fn rollback(mut self) {
        for win in self.op_wins.drain(..) {
            if let Err(err) = win.free() {
                tracing::warn!(%err, "rollback of operation window failed");
            }
        }
        for win in [
            self.active_win.take(),
            self.user_win.take(),
            self.shared_win.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(err) = win.free() {
                tracing::warn!(%err, "rollback of window failed");
            }
        }
    }
}

/// Collectively allocates a window of `size` bytes per process.
pub(crate) fn allocate(
    dep: &Deployment,
    sched: &SchedHandle,
    size: usize,
    disp_unit: usize,
    info: &Info,
    user_comm: &Comm,
) -> Result<Win> {
    let args = WinInfo::parse(info)?;
    let _timer = CommTimer::start(sched);

    // Redirection turned off: hand back a plain window and remember nothing.
    if args.enable_async == AsyncMode::Disabled {
        let (win, buf) = rt::Win::allocate(user_comm, size, disp_unit)?;
        tracing::debug!(win = win.id(), "asynchronous redirection disabled by info");
        return Ok(Win::pass_through(win, BaseMem::new(buf, 0, size)));
    }

    let my_async = if dep.env.auto_async_sched && args.enable_async != AsyncMode::ForceOn {
        sched.borrow_mut().decide()
    } else {
        AsyncStat::On
    };

    let mut stage = AllocStage::default();
    match build(dep, sched, size, disp_unit, args, user_comm, my_async, &mut stage) {
        Ok(Some(lw)) => Ok(Win::layered(lw)),
        Ok(None) => {
            // Every target reported async off; fall back to a plain window.
            let (win, buf) = rt::Win::allocate(user_comm, size, disp_unit)?;
            tracing::debug!(win = win.id(), "all targets async-off; plain window");
            Ok(Win::pass_through(win, BaseMem::new(buf, 0, size)))
        }
        Err(err) => {
            stage.rollback();
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build(
    dep: &Deployment,
    sched: &SchedHandle,
    size: usize,
    disp_unit: usize,
    args: WinInfo,
    user_comm: &Comm,
    my_async: AsyncStat,
    stage: &mut AllocStage,
) -> Result<Option<LayerWin>> {
    let num_h = dep.env.num_helpers;
    let is_world = user_comm.id() == dep.peer_world.id();

    // Node layout of this user communicator. The user-world fast path
    // reuses the process-global communicators.
    let (local_user, node_id, num_nodes) = if is_world {
        (
            dep.peer_local.clone(),
            dep.proc.node_id(),
            dep.proc.num_nodes(),
        )
    } else {
        let lu = user_comm.split_node()?;
        let ur = user_comm.split(i64::from(lu.rank() != 0), user_comm.rank() as i64)?;
        let root_blob = if lu.rank() == 0 {
            control::encode_words(&[ur.rank() as u64, ur.size() as u64])
        } else {
            Vec::new()
        };
        let blob = lu.bcast(0, &root_blob)?;
        let words = control::decode_words(&blob)?;
        if words.len() != 2 {
            return Err(Error::TopologyInconsistent {
                details: "node-id broadcast malformed".to_string(),
            });
        }
        (lu, words[0] as usize, words[1] as usize)
    };

    // Exchange every target's geometry and frozen async state.
    let descriptor = control::encode_words(&[
        disp_unit as u64,
        size as u64,
        local_user.rank() as u64,
        dep.world.rank() as u64,
        dep.peer_world.rank() as u64,
        node_id as u64,
        local_user.size() as u64,
        my_async.to_word(),
    ]);
    let blobs = user_comm.allgather(descriptor)?;

    let mut targets = Vec::with_capacity(blobs.len());
    let mut max_local_user_nprocs = 0;
    let mut all_off = true;
    for blob in &blobs {
        let words = control::decode_words(blob)?;
        if words.len() != 8 {
            return Err(Error::TopologyInconsistent {
                details: "target descriptor malformed".to_string(),
            });
        }
        let async_stat = AsyncStat::from_word(words[7]);
        all_off &= async_stat == AsyncStat::Off;
        max_local_user_nprocs = max_local_user_nprocs.max(words[6] as usize);
        targets.push(WinTarget {
            disp_unit: words[0],
            size: words[1],
            local_user_rank: words[2] as usize,
            world_rank: words[3] as usize,
            user_world_rank: words[4] as usize,
            node_id: words[5] as usize,
            local_user_nprocs: words[6] as usize,
            uh_rank: 0,
            h_ranks_in_uh: Vec::new(),
            base_h_offsets: Vec::new(),
            remote_lock_assert: Assert::empty(),
            async_stat,
            op_win_idx: 0,
            segs: Vec::new(),
        });
    }
    for (i, t) in targets.iter().enumerate() {
        tracing::trace!(
            target = i,
            disp_unit = t.disp_unit,
            size = t.size,
            local_user_rank = t.local_user_rank,
            local_user_nprocs = t.local_user_nprocs,
            world_rank = t.world_rank,
            user_world_rank = t.user_world_rank,
            node = t.node_id,
            stat = ?t.async_stat,
            "target descriptor"
        );
    }
    if all_off {
        return Ok(None);
    }

    // Helpers serving this window: the helpers of every participating node,
    // in first-seen target order. The same list is shipped to the helpers
    // so both sides build identical communicators.
    let mut unique_helpers: Vec<Rank> = Vec::new();
    for t in &targets {
        for &h in dep.helpers_of_world_rank(t.world_rank) {
            if !unique_helpers.contains(&h) {
                unique_helpers.push(h);
            }
        }
    }

    // Wake the local helpers and open the root<->helpers control channel.
    let local_root = local_user.rank() == 0;
    let mut ur_h_comm = None;
    if local_root {
        control::start_func(
            &dep.local,
            &dep.local_helper_ranks(),
            FuncHeader {
                func: FuncCode::WinAllocate,
                user_nprocs: user_comm.size() as u64,
                user_local_nprocs: local_user.size() as u64,
            },
        )?;
        let mut members = dep.local_helper_ranks();
        members.push(dep.local.rank());
        let comm = dep.local.create_group(&members, CTRL_TAG)?;

        let mut words = vec![u64::from(is_world), unique_helpers.len() as u64];
        words.extend(targets.iter().map(|t| t.world_rank as u64));
        words.extend(unique_helpers.iter().map(|&h| h as u64));
        let block = control::encode_words(&words);
        for h in 0..num_h {
            comm.send(h, CTRL_TAG, &block)?;
        }
        ur_h_comm = Some(comm);
    }

    // The user+helpers communicator and its node-local refinement.
    let (uh_comm, local_uh_comm, uh_rank_of) = if is_world {
        let identity: HashMap<Rank, Rank> =
            (0..dep.world.size()).map(|r| (r, r)).collect();
        (dep.world.clone(), dep.local.clone(), identity)
    } else {
        let mut members = unique_helpers.clone();
        members.extend(targets.iter().map(|t| t.world_rank));
        let uh = dep.world.create_group(&members, 0)?;
        let local_uh = uh.split_node()?;
        let map: HashMap<Rank, Rank> = members
            .iter()
            .enumerate()
            .map(|(uh_rank, &world)| (world, uh_rank))
            .collect();
        (uh, local_uh, map)
    };

    let rank_in_uh = |world: Rank| -> Result<Rank> {
        uh_rank_of
            .get(&world)
            .copied()
            .ok_or_else(|| Error::TopologyInconsistent {
                details: format!("world rank {world} missing from user+helpers communicator"),
            })
    };

    for t in &mut targets {
        t.uh_rank = rank_in_uh(t.world_rank)?;
        t.h_ranks_in_uh = dep
            .helpers_of_world_rank(t.world_rank)
            .iter()
            .map(|&h| rank_in_uh(h))
            .collect::<Result<_>>()?;
    }
    let helper_uh_ranks: Vec<Rank> = unique_helpers
        .iter()
        .map(|&h| rank_in_uh(h))
        .collect::<Result<_>>()?;
    let my_rank_in_uh = uh_comm.rank();

    // The node shared region: helpers contribute one prologue word each,
    // users their window size, laid out in node-rank order (helpers first).
    let (shared_win, shared) = rt::Win::allocate_shared(&local_uh_comm, size, disp_unit)?;
    stage.shared_win = Some(shared_win);
    let region = shared.region;
    let my_region_offset = shared.offsets[local_uh_comm.rank()];

    // Every local helper exposes the region from its base, so one offset
    // per target serves its whole helper list.
    let offset_blobs = user_comm.allgather(my_region_offset.to_le_bytes().to_vec())?;
    for (t, blob) in targets.iter_mut().zip(&offset_blobs) {
        let words = control::decode_words(blob)?;
        t.base_h_offsets = vec![words[0]; num_h];
    }

    binding::bind_main_helpers(&dep.env, num_nodes, &mut targets)?;

    // Ship the window-creation parameters, then create the underlying
    // windows in lockstep with the helpers.
    if let Some(comm) = &ur_h_comm {
        let block = control::encode_words(&[
            max_local_user_nprocs as u64,
            u64::from(args.epoch_type.bits()),
        ]);
        for h in 0..num_h {
            comm.send(h, CTRL_TAG, &block)?;
        }
    }

    let view = WinView::new(region.clone(), my_region_offset as usize, size);

    let mut num_op_wins = 0;
    if args.epoch_type.contains(EpochType::LOCK) {
        num_op_wins = max_local_user_nprocs;
    } else if args.epoch_type.contains(EpochType::LOCK_ALL) {
        num_op_wins = 1;
    }
    for _ in 0..num_op_wins {
        stage
            .op_wins
            .push(rt::Win::create(&uh_comm, view.clone(), disp_unit)?);
    }
    if num_op_wins > 0 {
        for t in &mut targets {
            // Two users of one node never share a lock target.
            t.op_win_idx = t.local_user_rank % num_op_wins;
            for seg in &mut t.segs {
                seg.win_idx = t.op_win_idx;
            }
        }
    }

    if args
        .epoch_type
        .intersects(EpochType::FENCE | EpochType::PSCW)
    {
        let active = rt::Win::create(&uh_comm, view.clone(), disp_unit)?;
        // Stay passive underneath: every process keeps this lock for the
        // window lifetime, so active-epoch operations can go to helpers.
        active.lock_all()?;
        stage.active_win = Some(active);
    }

    // The window the user sees spans user processes only.
    stage.user_win = Some(rt::Win::create(user_comm, view, disp_unit)?);

    // Helper-side registry ids, verified again at free time.
    let mut helper_win_ids = Vec::new();
    if let Some(comm) = &ur_h_comm {
        for h in 0..num_h {
            let blob = comm.recv(h, CTRL_TAG)?;
            let words = control::decode_words(&blob)?;
            helper_win_ids.push(words[0]);
        }
    }

    let my_user_rank = user_comm.rank();
    let my_op_win_idx = if num_op_wins > 0 {
        targets[my_user_rank].op_win_idx
    } else {
        0
    };
    let uh_size = uh_comm.size();

    tracing::debug!(
        size,
        disp_unit,
        num_nodes,
        max_local_user_nprocs,
        op_wins = num_op_wins,
        active = stage.active_win.is_some(),
        "window allocated"
    );

    Ok(Some(LayerWin {
        env: dep.env.clone(),
        info: args,
        sched: Rc::clone(sched),
        user_comm: user_comm.clone(),
        user_local_comm: local_user,
        local_comm: dep.local.clone(),
        _ur_h_comm: ur_h_comm,
        _uh_comm: uh_comm,
        _local_uh_comm: local_uh_comm,
        base: BaseMem::new(region, my_region_offset as usize, size),
        shared_win: stage.shared_win.take(),
        op_wins: std::mem::take(&mut stage.op_wins),
        active_win: stage.active_win.take(),
        user_win: stage.user_win.take(),
        my_op_win_idx,
        my_rank_in_uh,
        my_user_rank,
        helper_uh_ranks,
        targets,
        epoch: EpochStat::NoEpoch,
        lock_counter: 0,
        lockall_counter: 0,
        start_counter: 0,
        is_self_locked: false,
        start_group: None,
        post_group: None,
        prev_h_off: 0,
        h_op_counts: vec![0; uh_size],
        h_byte_counts: vec![0; uh_size],
        helper_win_ids,
    }))
}
