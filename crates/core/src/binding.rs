// SPDX-License-Identifier: Apache-2.0

//! Main-helper binding: assigning every byte of every target's window to a
//! helper.
//!
//! Rank-binding hands each target wholesale to one helper; segment-binding
//! partitions the node's total window bytes into per-helper quotas and walks
//! the targets in local-rank order, emitting at most one segment per helper
//! per target. Either way the segments of a target exactly cover `[0, size)`.

use crate::error::{Error, Result};
use crate::win::{MainLockStat, TargetSeg, WinTarget};
use proxima_config::{EnvParams, LockBinding};

/// Aligns `value` up to a multiple of `unit`.
fn align_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

/// Builds the segment table of every target.
pub(crate) fn bind_main_helpers(
    env: &EnvParams,
    num_nodes: usize,
    targets: &mut [WinTarget],
) -> Result<()> {
    let mut by_node: Vec<Vec<usize>> = vec![Vec::new(); num_nodes];
    for (i, t) in targets.iter().enumerate() {
        if t.node_id >= num_nodes {
            return Err(Error::TopologyInconsistent {
                details: format!("target {i} reports node {} of {num_nodes}", t.node_id),
            });
        }
        by_node[t.node_id].push(i);
    }

    for node_targets in &mut by_node {
        node_targets.sort_by_key(|&i| targets[i].local_user_rank);
        if node_targets.is_empty() {
            continue;
        }
        match env.lock_binding {
            LockBinding::Rank => bind_by_ranks(env, node_targets, targets),
            LockBinding::Segment => bind_by_segments(env, node_targets, targets),
        }
    }

    for (i, t) in targets.iter().enumerate() {
        for seg in &t.segs {
            if seg.main_h_idx >= env.num_helpers {
                return Err(Error::TopologyInconsistent {
                    details: format!(
                        "target {i}: segment main helper {} out of {}",
                        seg.main_h_idx, env.num_helpers
                    ),
                });
            }
        }
        tracing::trace!(target = i, segs = t.segs.len(), "helper binding done");
    }
    Ok(())
}

/// One helper per target: contiguous chunks of the node's targets go to
/// successive helpers; the last helper absorbs the remainder.
fn bind_by_ranks(env: &EnvParams, order: &[usize], targets: &mut [WinTarget]) {
    let n = order.len();
    let per_helper = n / env.num_helpers;

    let mut h_off = 0;
    let mut left = per_helper;
    for &t_rank in order {
        if left == 0 {
            h_off += 1;
            left = per_helper
                + if h_off == env.num_helpers - 1 {
                    n % env.num_helpers
                } else {
                    0
                };
        }
        let h_off = h_off.min(env.num_helpers - 1);
        targets[t_rank].segs = vec![TargetSeg {
            base_offset: 0,
            size: targets[t_rank].size,
            main_h_idx: h_off,
            win_idx: 0,
            main_lock_stat: MainLockStat::Reset,
        }];
        left = left.saturating_sub(1);
    }
}

/// Byte-quota partitioning: each helper owns about `sum / num_helpers`
/// bytes (aligned to the segment unit); targets are cut at quota borders and
/// the last helper absorbs any remainder.
fn bind_by_segments(env: &EnvParams, order: &[usize], targets: &mut [WinTarget]) {
    let unit = env.seg_unit as u64;
    let sum: u64 = order.iter().map(|&i| targets[i].size).sum();
    let quota = align_up(sum / env.num_helpers as u64, unit).max(unit);

    let quota_for = |h: usize| {
        if h + 1 >= env.num_helpers {
            u64::MAX
        } else {
            quota
        }
    };

    let mut h = 0;
    let mut room = quota_for(0);
    for &t_rank in order {
        let size = targets[t_rank].size;
        let mut segs = Vec::new();
        if size == 0 {
            segs.push(TargetSeg {
                base_offset: 0,
                size: 0,
                main_h_idx: h.min(env.num_helpers - 1),
                win_idx: 0,
                main_lock_stat: MainLockStat::Reset,
            });
        }
        let mut off = 0;
        while off < size {
            if room == 0 {
                h += 1;
                room = quota_for(h);
            }
            let mut take = (size - off).min(room);
            if take == room && h + 1 < env.num_helpers {
                // Keep helper boundaries aligned to the segment unit.
                let aligned = take / unit * unit;
                if aligned == 0 {
                    h += 1;
                    room = quota_for(h);
                    continue;
                }
                take = aligned;
            }
            segs.push(TargetSeg {
                base_offset: off,
                size: take,
                main_h_idx: h,
                win_idx: 0,
                main_lock_stat: MainLockStat::Reset,
            });
            off += take;
            room -= take.min(room);
        }
        targets[t_rank].segs = segs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::AsyncStat;
    use crate::win::Assert;
    use pretty_assertions::assert_eq;

    fn target(local_rank: usize, size: u64) -> WinTarget {
        WinTarget {
            disp_unit: 1,
            size,
            local_user_rank: local_rank,
            local_user_nprocs: 0,
            world_rank: 0,
            user_world_rank: 0,
            uh_rank: 0,
            node_id: 0,
            h_ranks_in_uh: Vec::new(),
            base_h_offsets: Vec::new(),
            remote_lock_assert: Assert::empty(),
            async_stat: AsyncStat::On,
            op_win_idx: 0,
            segs: Vec::new(),
        }
    }

    fn env(binding: LockBinding, num_helpers: usize) -> EnvParams {
        EnvParams {
            num_helpers,
            lock_binding: binding,
            ..EnvParams::default()
        }
    }

    #[test]
    fn rank_binding_chunks_targets() {
        let env = env(LockBinding::Rank, 2);
        let mut targets = vec![
            target(0, 64),
            target(1, 64),
            target(2, 64),
            target(3, 64),
        ];
        bind_main_helpers(&env, 1, &mut targets).expect("bind");
        let mains: Vec<usize> = targets.iter().map(|t| t.segs[0].main_h_idx).collect();
        assert_eq!(mains, vec![0, 0, 1, 1]);
        for t in &targets {
            assert_eq!(t.segs.len(), 1);
            assert_eq!(t.segs[0].base_offset, 0);
            assert_eq!(t.segs[0].size, 64);
        }
    }

    #[test]
    fn rank_binding_uses_target_size() {
        // Targets sorted differently from their ranks must still carry their
        // own window size on the single segment.
        let env = env(LockBinding::Rank, 1);
        let mut targets = vec![target(1, 128), target(0, 32)];
        bind_main_helpers(&env, 1, &mut targets).expect("bind");
        assert_eq!(targets[0].segs[0].size, 128);
        assert_eq!(targets[1].segs[0].size, 32);
    }

    #[test]
    fn segment_binding_splits_at_quota() {
        // Two helpers, 1024 + 3072 bytes: quota is 2048. The first target
        // fits helper 0 entirely; the second gets 1024 on helper 0 and the
        // remaining 2048 on helper 1.
        let env = env(LockBinding::Segment, 2);
        let mut targets = vec![target(0, 1024), target(1, 3072)];
        bind_main_helpers(&env, 1, &mut targets).expect("bind");

        assert_eq!(targets[0].segs.len(), 1);
        assert_eq!(targets[0].segs[0].main_h_idx, 0);
        assert_eq!(targets[0].segs[0].size, 1024);

        let segs = &targets[1].segs;
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].base_offset, segs[0].size, segs[0].main_h_idx), (0, 1024, 0));
        assert_eq!(
            (segs[1].base_offset, segs[1].size, segs[1].main_h_idx),
            (1024, 2048, 1)
        );
    }

    #[test]
    fn segment_binding_covers_every_byte() {
        let env = env(LockBinding::Segment, 3);
        let sizes = [100u64, 260, 512, 48];
        let mut targets: Vec<WinTarget> = sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| target(i, s))
            .collect();
        bind_main_helpers(&env, 1, &mut targets).expect("bind");

        for (t, &size) in targets.iter().zip(&sizes) {
            let mut covered = 0;
            for seg in &t.segs {
                assert_eq!(seg.base_offset, covered, "segments must be contiguous");
                covered += seg.size;
            }
            assert_eq!(covered, size, "segments must cover the window");
            // At most one segment per helper per target.
            let mut helpers: Vec<usize> = t.segs.iter().map(|s| s.main_h_idx).collect();
            helpers.dedup();
            assert_eq!(helpers.len(), t.segs.len());
        }
    }

    #[test]
    fn rank_binding_with_more_helpers_than_targets() {
        let env = env(LockBinding::Rank, 3);
        let mut targets = vec![target(0, 16)];
        bind_main_helpers(&env, 1, &mut targets).expect("bind");
        assert!(targets[0].segs[0].main_h_idx < 3);
    }
}
