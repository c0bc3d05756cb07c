// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by the runtime.

use crate::Rank;

/// Convenience result alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the runtime.
///
/// Callers layered on top of the runtime are expected to preserve these and
/// forward them unchanged, so the variants stay close to the failing
/// primitive.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The world was aborted by some process.
    #[error("world aborted with code {code}")]
    Aborted {
        /// Abort code passed by the aborting process.
        code: i32,
    },

    /// A rank argument was outside the communicator.
    #[error("rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange {
        /// The offending rank.
        rank: Rank,
        /// Size of the communicator.
        size: usize,
    },

    /// An RMA access fell outside the target's exposed region.
    #[error(
        "window {win}: byte range {offset}+{len} exceeds the {exposed} bytes exposed by rank {target}"
    )]
    RangeOutOfBounds {
        /// Window id.
        win: u64,
        /// Target rank in the window's communicator.
        target: Rank,
        /// Starting byte offset of the access.
        offset: u64,
        /// Length of the access in bytes.
        len: u64,
        /// Bytes exposed by the target.
        exposed: u64,
    },

    /// Origin and target byte counts of an operation disagree.
    #[error("operation byte counts differ: origin {origin}, target {target}")]
    CountMismatch {
        /// Bytes described by the origin buffer.
        origin: usize,
        /// Bytes described by the target side.
        target: usize,
    },

    /// A buffer access fell outside the buffer.
    #[error("buffer range {offset}+{len} exceeds buffer of {size} bytes")]
    BufferOutOfBounds {
        /// Starting byte offset.
        offset: usize,
        /// Length in bytes.
        len: usize,
        /// Buffer size.
        size: usize,
    },

    /// A byte length is not a whole number of datatype elements.
    #[error("{len} bytes is not a multiple of the {extent}-byte datatype extent")]
    NotElementAligned {
        /// Byte length supplied.
        len: usize,
        /// Extent of the datatype.
        extent: usize,
    },

    /// A window id was not known to the target process.
    #[error("unknown window id {id}")]
    UnknownWindow {
        /// The offending window id.
        id: u64,
    },

    /// An unlock was issued without a matching lock.
    #[error("unlock of target {target} without a matching lock")]
    LockMismatch {
        /// Target rank in the window's communicator.
        target: Rank,
    },

    /// A view handed to window creation did not fit its backing buffer.
    #[error("window view {offset}+{len} exceeds the {size}-byte backing region")]
    ViewOutOfBounds {
        /// View offset into the region.
        offset: usize,
        /// View length.
        len: usize,
        /// Region size.
        size: usize,
    },
}
