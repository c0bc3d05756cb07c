// SPDX-License-Identifier: Apache-2.0

//! Load balancing: lock promotion pins then spreads, accumulate-class
//! operations stay on the main helper, and segment dispatch splits work
//! across segment owners.

use proxima_core::{
    Assert, Datatype, EnvParams, Info, LockKind, ReduceOp, launch,
};
use proxima_config::{LoadOpt, LockBinding};

fn env() -> EnvParams {
    EnvParams::default()
}

#[test]
fn lock_promotion_pins_then_spreads() {
    let env = EnvParams {
        num_helpers: 2,
        load_opt: LoadOpt::OpCounting,
        ..env()
    };
    launch(1, 2, env, |ctx| {
        let comm = ctx.user_comm().clone();
        let mut win = ctx.allocate(256, 1, &Info::new(), &comm)?;

        if ctx.rank() == 0 {
            // Two helpers on the node: user+helpers ranks 0 and 1. Rank
            // binding hands target 0 to helper 0 and target 1 to helper 1.
            win.lock(1, LockKind::Exclusive, Assert::empty())?;

            // Until the lock is confirmed granted, everything goes to the
            // main helper.
            win.put(&[1u8; 4], 1, 0)?;
            win.put(&[2u8; 4], 1, 4)?;
            win.flush(1)?;

            // The flush confirmed the grant; op-counting now alternates.
            win.put(&[3u8; 4], 1, 8)?;
            win.put(&[4u8; 4], 1, 12)?;
            win.put(&[5u8; 4], 1, 16)?;
            win.put(&[6u8; 4], 1, 20)?;
            win.flush(1)?;
            win.unlock(1)?;

            let stats = win.op_window_stats();
            let main = stats[1].get(&1).copied().unwrap_or_default();
            let other = stats[1].get(&0).copied().unwrap_or_default();
            assert_eq!(main.ops, 4, "2 pinned + 2 balanced on the main helper");
            assert_eq!(other.ops, 2, "2 balanced on the second helper");

            // Unlock reset the promotion: the next epoch pins again.
            win.lock(1, LockKind::Exclusive, Assert::empty())?;
            win.put(&[7u8; 4], 1, 24)?;
            win.flush(1)?;
            win.unlock(1)?;
            let stats = win.op_window_stats();
            let main = stats[1].get(&1).copied().unwrap_or_default();
            assert_eq!(main.ops, 5);
        }

        comm.barrier()?;
        if ctx.rank() == 1 {
            let mem = win.base().read(0, 28)?;
            for (chunk, value) in mem.chunks_exact(4).zip(1u8..=7) {
                assert_eq!(chunk, [value; 4]);
            }
        }
        win.free()
    })
    .expect("launch");
}

#[test]
fn accumulates_stay_on_the_main_helper() {
    let env = EnvParams {
        num_helpers: 2,
        load_opt: LoadOpt::ByteCounting,
        ..env()
    };
    launch(1, 4, env, |ctx| {
        let comm = ctx.user_comm().clone();
        let mut win = ctx.allocate(8, 8, &Info::new(), &comm)?;
        let me = ctx.rank();

        if me != 0 {
            win.lock(0, LockKind::Shared, Assert::empty())?;
            for _ in 0..10 {
                win.accumulate(&1u64.to_le_bytes(), Datatype::U64, ReduceOp::Sum, 0, 0)?;
            }
            win.flush(0)?;
            win.unlock(0)?;
        }
        comm.barrier()?;

        if me == 0 {
            // Three origins, ten increments each, one atomic cell.
            let value = u64::from_le_bytes(
                win.base().read(0, 8)?.try_into().expect("8 bytes"),
            );
            assert_eq!(value, 30);

            // Every accumulate landed on target 0's main helper (rank 0 of
            // the user+helpers communicator), never on the byte-least-loaded
            // one.
            let stats = win.op_window_stats();
            let main = stats[0].get(&0).copied().unwrap_or_default();
            assert_eq!(main.ops, 30);
            assert_eq!(stats[0].get(&1), None);
        }
        win.free()
    })
    .expect("launch");
}

#[test]
fn segment_dispatch_splits_across_owners() {
    let env = EnvParams {
        num_helpers: 2,
        lock_binding: LockBinding::Segment,
        seg_unit: 16,
        ..env()
    };
    launch(1, 2, env, |ctx| {
        let comm = ctx.user_comm().clone();
        let size = if ctx.rank() == 0 { 1024 } else { 3072 };
        let mut win = ctx.allocate(size, 1, &Info::new(), &comm)?;

        if ctx.rank() == 0 {
            // Target 1 owns [0, 1024) on helper 0 and [1024, 3072) on
            // helper 1; a put spanning byte 1024 must split.
            win.lock(1, LockKind::Exclusive, Assert::empty())?;
            let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
            win.put(&payload, 1, 512)?;
            win.flush(1)?;
            win.unlock(1)?;

            let stats = win.op_window_stats();
            let first = stats[1].get(&0).copied().unwrap_or_default();
            let second = stats[1].get(&1).copied().unwrap_or_default();
            assert_eq!(first.bytes, 512);
            assert_eq!(second.bytes, 512);
        }

        comm.barrier()?;
        if ctx.rank() == 1 {
            let expected: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
            assert_eq!(win.base().read(512, 1024)?, expected);
        }
        win.free()
    })
    .expect("launch");
}
