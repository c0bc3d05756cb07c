// SPDX-License-Identifier: Apache-2.0

//! Shared byte regions and elementwise reduction.
//!
//! [`RmaBuf`] is the unit of memory a process can expose through a window or
//! hand to a fetching operation as a destination. It is a plain byte region
//! behind a lock; element interpretation happens only at the edges, driven by
//! a [`Datatype`].

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// A shared, lockable byte region.
///
/// Cloning is cheap and yields another handle to the same bytes. Local
/// load/store (the shared-memory view of a window) goes through
/// [`RmaBuf::read_at`] / [`RmaBuf::write_at`].
#[derive(Clone)]
pub struct RmaBuf {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl std::fmt::Debug for RmaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmaBuf").field("len", &self.len).finish()
    }
}

impl RmaBuf {
    /// Creates a zero-filled region of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            len,
            data: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// Creates a region holding a copy of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len(),
            data: Arc::new(Mutex::new(bytes.to_vec())),
        }
    }

    /// Length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `src` into the region at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies bytes at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    /// Returns a copy of `len` bytes starting at `offset`.
    pub fn read_vec(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check(offset, len)?;
        let data = self.data.lock();
        Ok(data[offset..offset + len].to_vec())
    }

    /// Returns a copy of the whole region.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Runs `f` over a mutable slice of the region, holding the region lock.
    ///
    /// All target-side mutation funnels through here so that read-modify-write
    /// operations are atomic with respect to concurrent accesses.
    pub(crate) fn with_range_mut<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.check(offset, len)?;
        let mut data = self.data.lock();
        Ok(f(&mut data[offset..offset + len]))
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::BufferOutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        Ok(())
    }
}

/// Basic datatypes understood by accumulating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// Unsigned byte.
    U8,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit unsigned integer.
    U64,
    /// 64-bit float.
    F64,
}

impl Datatype {
    /// Extent of one element in bytes.
    #[must_use]
    pub const fn extent(self) -> usize {
        match self {
            Datatype::U8 => 1,
            Datatype::I32 | Datatype::U32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }
}

/// Reduction applied by accumulate-class operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Overwrite the target element.
    Replace,
    /// Leave the target untouched (pure fetch for `get_accumulate`).
    NoOp,
    /// Elementwise sum (wrapping for integers).
    Sum,
    /// Elementwise minimum.
    Min,
    /// Elementwise maximum.
    Max,
}

macro_rules! reduce_typed {
    ($ty:ty, $op:expr, $target:expr, $operand:expr, $sum:expr, $min:expr, $max:expr) => {{
        const N: usize = size_of::<$ty>();
        for (t, o) in $target.chunks_exact_mut(N).zip($operand.chunks_exact(N)) {
            let mut tb = [0u8; N];
            let mut ob = [0u8; N];
            tb.copy_from_slice(t);
            ob.copy_from_slice(o);
            let tv = <$ty>::from_le_bytes(tb);
            let ov = <$ty>::from_le_bytes(ob);
            let out: $ty = match $op {
                ReduceOp::Replace => ov,
                ReduceOp::NoOp => tv,
                ReduceOp::Sum => $sum(tv, ov),
                ReduceOp::Min => $min(tv, ov),
                ReduceOp::Max => $max(tv, ov),
            };
            t.copy_from_slice(&out.to_le_bytes());
        }
    }};
}

/// Applies `op` elementwise: `target[i] = target[i] op operand[i]`.
///
/// Both slices must have equal length and be a whole number of elements;
/// callers validate before queueing, so this only debug-asserts.
pub(crate) fn apply_reduce(op: ReduceOp, dtype: Datatype, target: &mut [u8], operand: &[u8]) {
    debug_assert_eq!(target.len(), operand.len());
    debug_assert_eq!(target.len() % dtype.extent(), 0);
    match dtype {
        Datatype::U8 => {
            reduce_typed!(u8, op, target, operand, u8::wrapping_add, u8::min, u8::max)
        }
        Datatype::I32 => {
            reduce_typed!(i32, op, target, operand, i32::wrapping_add, i32::min, i32::max)
        }
        Datatype::U32 => {
            reduce_typed!(u32, op, target, operand, u32::wrapping_add, u32::min, u32::max)
        }
        Datatype::I64 => {
            reduce_typed!(i64, op, target, operand, i64::wrapping_add, i64::min, i64::max)
        }
        Datatype::U64 => {
            reduce_typed!(u64, op, target, operand, u64::wrapping_add, u64::min, u64::max)
        }
        Datatype::F64 => reduce_typed!(
            f64,
            op,
            target,
            operand,
            |a: f64, b: f64| a + b,
            f64::min,
            f64::max
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn write_then_read_roundtrips() {
        let buf = RmaBuf::zeroed(16);
        buf.write_at(4, &[1, 2, 3, 4]).expect("write");
        assert_eq!(buf.read_vec(4, 4).expect("read"), vec![1, 2, 3, 4]);
        assert_eq!(buf.read_vec(0, 2).expect("read"), vec![0, 0]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let buf = RmaBuf::zeroed(8);
        assert!(buf.write_at(6, &[0; 4]).is_err());
        assert!(buf.read_vec(9, 1).is_err());
    }

    #[test]
    fn clones_share_bytes() {
        let a = RmaBuf::zeroed(4);
        let b = a.clone();
        a.write_at(0, &[7; 4]).expect("write");
        assert_eq!(b.snapshot(), vec![7; 4]);
    }

    #[test]
    fn sum_wraps_for_integers() {
        let mut target = 250u8.to_le_bytes().to_vec();
        apply_reduce(ReduceOp::Sum, Datatype::U8, &mut target, &[10]);
        assert_eq!(target, vec![4]);
    }

    #[test]
    fn reduce_i64_elementwise() {
        let mut target = Vec::new();
        target.extend_from_slice(&5i64.to_le_bytes());
        target.extend_from_slice(&(-3i64).to_le_bytes());
        let mut operand = Vec::new();
        operand.extend_from_slice(&2i64.to_le_bytes());
        operand.extend_from_slice(&7i64.to_le_bytes());

        apply_reduce(ReduceOp::Max, Datatype::I64, &mut target, &operand);
        assert_eq!(target[..8], 5i64.to_le_bytes());
        assert_eq!(target[8..], 7i64.to_le_bytes());
    }

    #[test]
    fn noop_leaves_target() {
        let mut target = 1.5f64.to_le_bytes().to_vec();
        let operand = 9.0f64.to_le_bytes().to_vec();
        apply_reduce(ReduceOp::NoOp, Datatype::F64, &mut target, &operand);
        assert_eq!(target, 1.5f64.to_le_bytes().to_vec());
    }
}
