// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of the simulated runtime: messaging, collectives,
//! RMA completion, the progress rule, and lock semantics.

use proxima_runtime::{Datatype, LockKind, ReduceOp, RmaBuf, Win, WinView, World};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const TAG_GO: u32 = 10;
const TAG_DONE: u32 = 11;
const TAG_STOP: u32 = 12;

#[test]
fn send_recv_and_collectives() {
    let world = World::builder().nodes(2).procs_per_node(2).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let rank = comm.rank();

            if rank == 0 {
                comm.send(3, TAG_GO, b"hello")?;
            }
            if rank == 3 {
                assert_eq!(comm.recv(0, TAG_GO)?, b"hello");
            }

            let gathered = comm.allgather(vec![rank as u8])?;
            assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);

            let root_data = comm.bcast(2, if rank == 2 { b"cfg" } else { b"" })?;
            assert_eq!(root_data, b"cfg");

            // Node-local split: ranks 0,1 on node 0 and 2,3 on node 1.
            let local = comm.split_node()?;
            assert_eq!(local.size(), 2);
            assert_eq!(local.my_node(), comm.my_node());
            assert_eq!(local.rank(), rank % 2);

            // Explicit subgroup of the even ranks.
            if rank % 2 == 0 {
                let evens = comm.create_group(&[0, 2], 0)?;
                assert_eq!(evens.size(), 2);
                assert_eq!(evens.group(), &[0, 2]);
            }
            comm.barrier()
        })
        .expect("world run");
}

#[test]
fn put_flush_get_roundtrip() {
    let world = World::builder().nodes(1).procs_per_node(2).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let (win, buf) = Win::allocate(&comm, 64, 1)?;

            if comm.rank() == 0 {
                win.lock(1, LockKind::Shared)?;
                let payload: Vec<u8> = (0..32).collect();
                win.put(&payload, 1, 16)?;
                win.flush(1)?;

                let readback = RmaBuf::zeroed(32);
                win.get(&readback, 0, 32, 1, 16)?;
                win.flush(1)?;
                assert_eq!(readback.snapshot(), payload);
                win.unlock(1)?;
                comm.send(1, TAG_STOP, &[])?;
            } else {
                // Serve RMA until rank 0 is done.
                let _ = comm.recv(0, TAG_STOP)?;
                assert_eq!(buf.read_vec(16, 4)?, vec![0, 1, 2, 3]);
            }
            win.free()
        })
        .expect("world run");
}

#[test]
fn no_progress_until_target_enters_runtime() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);

    let world = World::builder().nodes(1).procs_per_node(2).build();
    world
        .launch(move |proc| {
            let comm = proc.world_comm();
            let (win, buf) = Win::allocate(&comm, 8, 1)?;

            if comm.rank() == 0 {
                win.put(&[9; 8], 1, 0)?;
                std::thread::sleep(Duration::from_millis(30));
                // Rank 1 is busy outside the runtime: nothing may have
                // executed yet.
                assert_eq!(win.pending(1)?, 1);
                released.store(true, Ordering::Release);
                win.flush(1)?;
                assert_eq!(win.pending(1)?, 0);
            } else {
                while !released.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            }
            comm.barrier()?;
            if comm.rank() == 1 {
                assert_eq!(buf.snapshot(), vec![9; 8]);
            }
            win.free()
        })
        .expect("world run");
    let _ = flag;
}

#[test]
fn exclusive_lock_blocks_other_origins() {
    let world = World::builder().nodes(1).procs_per_node(3).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let (win, _buf) = Win::allocate(&comm, 8, 1)?;

            match comm.rank() {
                0 => {
                    win.lock(1, LockKind::Exclusive)?;
                    win.put(&[5; 8], 1, 0)?;
                    win.flush(1)?;
                    comm.send(2, TAG_GO, &[])?;
                    std::thread::sleep(Duration::from_millis(20));
                    win.unlock(1)?;
                    let _ = comm.recv(2, TAG_DONE)?;
                    comm.send(1, TAG_STOP, &[])?;
                }
                1 => {
                    let _ = comm.recv(0, TAG_STOP)?;
                }
                2 => {
                    let _ = comm.recv(0, TAG_GO)?;
                    // Rank 0 still holds the exclusive lock; our access can
                    // only complete after its unlock.
                    win.lock(1, LockKind::Exclusive)?;
                    let readback = RmaBuf::zeroed(8);
                    win.get(&readback, 0, 8, 1, 0)?;
                    win.flush(1)?;
                    assert_eq!(readback.snapshot(), vec![5; 8]);
                    win.unlock(1)?;
                    comm.send(0, TAG_DONE, &[])?;
                }
                _ => unreachable!(),
            }
            comm.barrier()?;
            win.free()
        })
        .expect("world run");
}

#[test]
fn shared_allocation_is_contiguous_per_node() {
    let world = World::builder().nodes(1).procs_per_node(3).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let size = 16 * (comm.rank() + 1);
            let (win, shared) = Win::allocate_shared(&comm, size, 1)?;

            assert_eq!(shared.offsets, vec![0, 16, 48]);
            assert_eq!(shared.region.len(), 96);

            // Local store is immediately visible node-wide.
            let my_off = shared.offsets[comm.rank()] as usize;
            shared.region.write_at(my_off, &[comm.rank() as u8 + 1])?;
            comm.barrier()?;
            assert_eq!(shared.region.read_vec(0, 1)?, vec![1]);
            assert_eq!(shared.region.read_vec(16, 1)?, vec![2]);
            assert_eq!(shared.region.read_vec(48, 1)?, vec![3]);
            win.free()
        })
        .expect("world run");
}

#[test]
fn window_views_can_expose_one_region_at_different_widths() {
    // One member exposes its whole region, the other only a slice; both
    // widths are advertised through the same window.
    let world = World::builder().nodes(1).procs_per_node(2).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let region = RmaBuf::zeroed(32);
            let view = if comm.rank() == 0 {
                WinView::full(region.clone())
            } else {
                WinView::new(region.clone(), 8, 8)
            };
            let win = Win::create(&comm, view, 1)?;
            assert_eq!(win.target_len(0)?, 32);
            assert_eq!(win.target_len(1)?, 8);
            comm.barrier()?;
            win.free()
        })
        .expect("world run");
}

#[test]
fn accumulate_and_fetch_ops() {
    let world = World::builder().nodes(1).procs_per_node(2).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let (win, buf) = Win::allocate(&comm, 8, 8)?;

            if comm.rank() == 0 {
                win.lock(1, LockKind::Exclusive)?;
                win.put(&10u64.to_le_bytes(), 1, 0)?;
                win.accumulate(&5u64.to_le_bytes(), Datatype::U64, ReduceOp::Sum, 1, 0)?;

                let old = RmaBuf::zeroed(8);
                win.fetch_and_op(
                    &1u64.to_le_bytes(),
                    Datatype::U64,
                    ReduceOp::Sum,
                    &old,
                    0,
                    1,
                    0,
                )?;
                win.flush(1)?;
                assert_eq!(old.snapshot(), 15u64.to_le_bytes().to_vec());

                let swapped = RmaBuf::zeroed(8);
                win.compare_and_swap(
                    &16u64.to_le_bytes(),
                    &99u64.to_le_bytes(),
                    Datatype::U64,
                    &swapped,
                    0,
                    1,
                    0,
                )?;
                win.flush(1)?;
                assert_eq!(swapped.snapshot(), 16u64.to_le_bytes().to_vec());
                win.unlock(1)?;
                comm.send(1, TAG_STOP, &[])?;
            } else {
                let _ = comm.recv(0, TAG_STOP)?;
                assert_eq!(buf.snapshot(), 99u64.to_le_bytes().to_vec());
            }
            comm.barrier()?;
            win.free()
        })
        .expect("world run");
}

#[test]
fn stats_track_serving_rank() {
    let world = World::builder().nodes(1).procs_per_node(2).build();
    world
        .launch(|proc| {
            let comm = proc.world_comm();
            let (win, _buf) = Win::allocate(&comm, 16, 1)?;

            if comm.rank() == 0 {
                win.lock(1, LockKind::Shared)?;
                win.put(&[1; 4], 1, 0)?;
                win.put(&[2; 8], 1, 4)?;
                win.flush(1)?;
                win.unlock(1)?;
                let stats = win.stats();
                let s = stats.get(&1).copied().unwrap_or_default();
                assert_eq!(s.ops, 2);
                assert_eq!(s.bytes, 12);
                comm.send(1, TAG_STOP, &[])?;
            } else {
                let _ = comm.recv(0, TAG_STOP)?;
            }
            comm.barrier()?;
            win.free()
        })
        .expect("world run");
}
