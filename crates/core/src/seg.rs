// SPDX-License-Identifier: Apache-2.0

//! Operation segmentation.
//!
//! Under segment-binding, one user operation may span byte ranges owned by
//! different helpers. The decoder cuts the operation into per-segment
//! sub-operations at element boundaries; an element whose first byte lies in
//! a segment belongs wholly to that segment. The common case decodes into a
//! handful of pieces, so the result uses an inline buffer of four with heap
//! spillover beyond.

use crate::error::{Error, Result};
use crate::win::WinTarget;
use smallvec::SmallVec;

/// One per-segment piece of a decoded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpSplit {
    /// Index into the target's segment table.
    pub(crate) seg_idx: usize,
    /// Byte offset of this piece within the origin data.
    pub(crate) origin_start: usize,
    /// Byte length of this piece.
    pub(crate) len: usize,
    /// Absolute byte offset of this piece within the target's window.
    pub(crate) target_byte_off: u64,
}

pub(crate) type SplitVec = SmallVec<[OpSplit; 4]>;

/// Cuts `nbytes` of data addressed at `target_disp` (displacement units)
/// into per-segment pieces of `elem`-byte elements.
pub(crate) fn decode(
    target: &WinTarget,
    target_disp: u64,
    nbytes: usize,
    elem: usize,
) -> Result<SplitVec> {
    debug_assert!(elem > 0 && nbytes % elem == 0);
    let start = target_disp * target.disp_unit;
    let end = start + nbytes as u64;
    if end > target.size {
        return Err(Error::Runtime(proxima_runtime::Error::RangeOutOfBounds {
            win: 0,
            target: 0,
            offset: start,
            len: nbytes as u64,
            exposed: target.size,
        }));
    }

    let mut splits = SplitVec::new();
    let mut cur = start;
    let mut origin_off = 0usize;
    while cur < end {
        let seg_idx = target
            .segs
            .iter()
            .position(|s| cur >= s.base_offset && cur < s.base_offset + s.size)
            .ok_or_else(|| Error::InvariantViolation {
                details: format!("byte {cur} of target window not covered by any segment"),
            })?;
        let seg = &target.segs[seg_idx];
        let seg_end = seg.base_offset + seg.size;

        let elem = elem as u64;
        let remaining_elems = (end - cur) / elem;
        let elems_in_seg = (seg_end - cur).div_ceil(elem);
        let n = remaining_elems.min(elems_in_seg).max(1);
        let take = n * elem;

        splits.push(OpSplit {
            seg_idx,
            origin_start: origin_off,
            len: take as usize,
            target_byte_off: cur,
        });
        cur += take;
        origin_off += take as usize;
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::AsyncStat;
    use crate::win::{Assert, MainLockStat, TargetSeg};
    use pretty_assertions::assert_eq;

    fn target_with_segs(disp_unit: u64, segs: &[(u64, u64)]) -> WinTarget {
        WinTarget {
            disp_unit,
            size: segs.iter().map(|&(_, s)| s).sum(),
            local_user_rank: 0,
            local_user_nprocs: 1,
            world_rank: 0,
            user_world_rank: 0,
            uh_rank: 0,
            node_id: 0,
            h_ranks_in_uh: Vec::new(),
            base_h_offsets: Vec::new(),
            remote_lock_assert: Assert::empty(),
            async_stat: AsyncStat::On,
            op_win_idx: 0,
            segs: segs
                .iter()
                .enumerate()
                .map(|(i, &(base, size))| TargetSeg {
                    base_offset: base,
                    size,
                    main_h_idx: i,
                    win_idx: 0,
                    main_lock_stat: MainLockStat::Reset,
                })
                .collect(),
        }
    }

    #[test]
    fn single_segment_is_one_piece() {
        let t = target_with_segs(1, &[(0, 256)]);
        let splits = decode(&t, 16, 64, 1).expect("decode");
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].target_byte_off, 16);
        assert_eq!(splits[0].len, 64);
    }

    #[test]
    fn spanning_two_segments_splits_at_boundary() {
        let t = target_with_segs(1, &[(0, 128), (128, 128)]);
        let splits = decode(&t, 96, 64, 1).expect("decode");
        assert_eq!(splits.len(), 2);
        assert_eq!(
            (splits[0].seg_idx, splits[0].origin_start, splits[0].len, splits[0].target_byte_off),
            (0, 0, 32, 96)
        );
        assert_eq!(
            (splits[1].seg_idx, splits[1].origin_start, splits[1].len, splits[1].target_byte_off),
            (1, 32, 32, 128)
        );
    }

    #[test]
    fn elements_are_not_cut() {
        // 8-byte elements starting at byte 124: the element at 124..132
        // straddles the boundary and belongs to the first segment.
        let t = target_with_segs(4, &[(0, 128), (128, 128)]);
        let splits = decode(&t, 31, 16, 8).expect("decode");
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0].len, 8);
        assert_eq!(splits[0].target_byte_off, 124);
        assert_eq!(splits[1].len, 8);
        assert_eq!(splits[1].target_byte_off, 132);
        assert_eq!(splits[1].seg_idx, 1);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let t = target_with_segs(1, &[(0, 64)]);
        assert!(decode(&t, 32, 64, 1).is_err());
    }

    #[test]
    fn disp_unit_scales_the_start() {
        let t = target_with_segs(8, &[(0, 64), (64, 64)]);
        let splits = decode(&t, 7, 16, 8).expect("decode");
        // Starts at byte 56; first element 56..64 in segment 0, second
        // element 64..72 in segment 1.
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[0].target_byte_off, 56);
        assert_eq!(splits[1].target_byte_off, 64);
    }
}
