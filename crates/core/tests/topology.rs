// SPDX-License-Identifier: Apache-2.0

//! Allocation topology: shared-region layout, segment coverage, and the
//! async-state decisions that pick between redirection and pass-through.

use proxima_core::{Assert, AsyncStat, EnvParams, Info, LockKind, launch};
use proxima_config::{LockBinding, env_keys};
use std::time::Duration;

fn info(pairs: &[(&str, &str)]) -> Info {
    pairs
        .iter()
        .map(|&(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn base_offsets_start_after_the_grant_lock_word() {
    launch(2, 2, EnvParams::default(), |ctx| {
        let comm = ctx.user_comm().clone();
        let mut win = ctx.allocate(64, 1, &Info::new(), &comm)?;

        // One helper per node contributes one 8-byte prologue word; users
        // follow in local-rank order.
        let word = 8;
        assert_eq!(win.target_base_offsets(0), Some(vec![word]));
        assert_eq!(win.target_base_offsets(1), Some(vec![word + 64]));
        assert_eq!(win.target_base_offsets(2), Some(vec![word]));
        assert_eq!(win.target_base_offsets(3), Some(vec![word + 64]));

        comm.barrier()?;
        win.free()
    })
    .expect("launch");
}

#[test]
fn segments_partition_every_target_exactly() {
    let env = EnvParams {
        num_helpers: 3,
        lock_binding: LockBinding::Segment,
        seg_unit: 16,
        ..EnvParams::default()
    };
    launch(1, 4, env.clone(), move |ctx| {
        let comm = ctx.user_comm().clone();
        let size = 256 * (ctx.rank() + 1);
        let mut win = ctx.allocate(size, 1, &Info::new(), &comm)?;

        for target in 0..ctx.num_users() {
            let segs = win.target_segments(target).expect("layered window");
            let expected_size = 256 * (target + 1) as u64;
            let mut covered = 0;
            for seg in &segs {
                assert_eq!(seg.base_offset, covered, "contiguous segments");
                assert_eq!(seg.base_offset % env.seg_unit as u64, 0, "unit aligned");
                assert!(seg.main_helper_index < env.num_helpers);
                covered += seg.size;
            }
            assert_eq!(covered, expected_size, "segments cover [0, size)");

            let helpers = win.target_helper_ranks(target).expect("layered window");
            assert_eq!(helpers.len(), env.num_helpers);
        }

        comm.barrier()?;
        win.free()
    })
    .expect("launch");
}

#[test]
fn disabled_async_returns_a_plain_window() {
    launch(1, 2, EnvParams::default(), |ctx| {
        let comm = ctx.user_comm().clone();
        let mut win = ctx.allocate(
            32,
            1,
            &info(&[("enable_async", "false")]),
            &comm,
        )?;
        assert!(!win.is_layered());
        assert_eq!(win.target_base_offsets(0), None);

        // The pass-through window still works.
        let me = ctx.rank();
        let partner = (me + 1) % 2;
        win.lock(partner, LockKind::Shared, Assert::empty())?;
        win.put(&[9u8; 4], partner, 0)?;
        win.flush(partner)?;
        win.unlock(partner)?;
        comm.barrier()?;
        assert_eq!(win.base().read(0, 4)?, vec![9u8; 4]);
        win.free()
    })
    .expect("launch");
}

#[test]
fn scheduler_off_everywhere_falls_back_to_plain() {
    let env = EnvParams::from_vars([
        (env_keys::ASYNC_SCHED, "on"),
        (env_keys::ASYNC_THR_HIGH, "0"),
        (env_keys::ASYNC_THR_LOW, "0"),
    ])
    .expect("env");
    launch(1, 2, env, |ctx| {
        let comm = ctx.user_comm().clone();
        // Everyone looks communication-bound, so every target is off and
        // no layer state is kept.
        ctx.charge_comm_time(Duration::from_secs(1));
        let mut win = ctx.allocate(32, 1, &Info::new(), &comm)?;
        assert!(!win.is_layered());

        // Force-on overrides the scheduler's decision.
        ctx.charge_comm_time(Duration::from_secs(1));
        let mut forced = ctx.allocate(32, 1, &info(&[("enable_async", "true")]), &comm)?;
        assert!(forced.is_layered());

        comm.barrier()?;
        forced.free()?;
        win.free()
    })
    .expect("launch");
}

#[test]
fn mixed_async_states_take_the_direct_path() {
    let env = EnvParams::from_vars([
        (env_keys::ASYNC_SCHED, "on"),
        (env_keys::ASYNC_THR_HIGH, "60"),
        (env_keys::ASYNC_THR_LOW, "40"),
    ])
    .expect("env");
    launch(1, 2, env, |ctx| {
        let comm = ctx.user_comm().clone();
        let me = ctx.rank();

        // Rank 1 looks communication-bound and freezes as off; rank 0 stays
        // on, so the window is still layered.
        if me == 1 {
            ctx.charge_comm_time(Duration::from_secs(5));
        }
        let mut win = ctx.allocate(32, 1, &Info::new(), &comm)?;
        assert!(win.is_layered());
        assert_eq!(win.target_async_stat(0), Some(AsyncStat::On));
        assert_eq!(win.target_async_stat(1), Some(AsyncStat::Off));

        if me == 0 {
            win.lock(1, LockKind::Exclusive, Assert::empty())?;
            win.put(&[3u8; 8], 1, 0)?;
            win.flush(1)?;
            win.unlock(1)?;

            // The operation went straight to the async-off target (its own
            // rank in the user+helpers communicator is 2), not to the
            // helper.
            let stats = win.op_window_stats();
            let direct = stats[1].get(&2).copied().unwrap_or_default();
            assert_eq!(direct.ops, 1);
            assert_eq!(stats[1].get(&0), None);
        }
        comm.barrier()?;
        if me == 1 {
            assert_eq!(win.base().read(0, 8)?, vec![3u8; 8]);
        }
        win.free()
    })
    .expect("launch");
}
