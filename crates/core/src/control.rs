// SPDX-License-Identifier: Apache-2.0

//! Control channel between user roots and their node-local helpers.
//!
//! Wire format: a 3-word header `{func_code, user_nprocs, user_local_nprocs}`
//! on the reserved control tag, followed by function-specific parameter
//! blocks of little-endian 64-bit words. Used serially per window-lifecycle
//! event.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use proxima_runtime::{Comm, Rank, Tag};

/// Reserved tag for control frames and parameter blocks.
pub(crate) const CTRL_TAG: Tag = 9889;

/// Tag for the 1-byte completion messages of a PSCW complete/wait pair.
pub(crate) const PSCW_CW_TAG: Tag = 900;

/// Commands a user root can issue to its local helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FuncCode {
    WinAllocate,
    WinFree,
    LockAll,
    UnlockAll,
    Abort,
    Finalize,
}

impl FuncCode {
    fn to_word(self) -> u64 {
        match self {
            FuncCode::WinAllocate => 1,
            FuncCode::WinFree => 2,
            FuncCode::LockAll => 3,
            FuncCode::UnlockAll => 4,
            FuncCode::Abort => 5,
            FuncCode::Finalize => 6,
        }
    }

    fn from_word(word: u64) -> Result<Self> {
        match word {
            1 => Ok(FuncCode::WinAllocate),
            2 => Ok(FuncCode::WinFree),
            3 => Ok(FuncCode::LockAll),
            4 => Ok(FuncCode::UnlockAll),
            5 => Ok(FuncCode::Abort),
            6 => Ok(FuncCode::Finalize),
            other => Err(Error::InvariantViolation {
                details: format!("unknown control function code {other}"),
            }),
        }
    }
}

/// The 3-word control frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FuncHeader {
    pub(crate) func: FuncCode,
    pub(crate) user_nprocs: u64,
    pub(crate) user_local_nprocs: u64,
}

impl FuncHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(24);
        frame.put_u64_le(self.func.to_word());
        frame.put_u64_le(self.user_nprocs);
        frame.put_u64_le(self.user_local_nprocs);
        frame
    }

    pub(crate) fn decode(mut frame: &[u8]) -> Result<Self> {
        if frame.len() != 24 {
            return Err(Error::InvariantViolation {
                details: format!("control frame of {} bytes, expected 24", frame.len()),
            });
        }
        Ok(Self {
            func: FuncCode::from_word(frame.get_u64_le())?,
            user_nprocs: frame.get_u64_le(),
            user_local_nprocs: frame.get_u64_le(),
        })
    }
}

/// Packs a parameter block of 64-bit words.
pub(crate) fn encode_words(words: &[u64]) -> Vec<u8> {
    let mut block = Vec::with_capacity(words.len() * 8);
    for &word in words {
        block.put_u64_le(word);
    }
    block
}

/// Unpacks a parameter block of 64-bit words.
pub(crate) fn decode_words(block: &[u8]) -> Result<Vec<u64>> {
    if block.len() % 8 != 0 {
        return Err(Error::InvariantViolation {
            details: format!("parameter block of {} bytes is not word-aligned", block.len()),
        });
    }
    Ok(block.chunks_exact(8).map(|mut c| c.get_u64_le()).collect())
}

/// Sends a control frame from the local user root to every local helper.
pub(crate) fn start_func(
    local: &Comm,
    helper_local_ranks: &[Rank],
    header: FuncHeader,
) -> Result<()> {
    let frame = header.encode();
    for &helper in helper_local_ranks {
        local.send(helper, CTRL_TAG, &frame)?;
    }
    tracing::trace!(func = ?header.func, helpers = helper_local_ranks.len(), "control frame sent");
    Ok(())
}

/// Helper side: blocks for the next control frame from any local user.
pub(crate) fn recv_func(local: &Comm) -> Result<(Rank, FuncHeader)> {
    let (src, frame) = local.recv_any(CTRL_TAG)?;
    Ok((src, FuncHeader::decode(&frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip() {
        let header = FuncHeader {
            func: FuncCode::WinAllocate,
            user_nprocs: 8,
            user_local_nprocs: 2,
        };
        assert_eq!(FuncHeader::decode(&header.encode()).expect("decode"), header);
    }

    #[test]
    fn rejects_short_frames_and_bad_codes() {
        assert!(FuncHeader::decode(&[0; 16]).is_err());
        let mut frame = FuncHeader {
            func: FuncCode::Finalize,
            user_nprocs: 0,
            user_local_nprocs: 0,
        }
        .encode();
        frame[0] = 0xEE;
        assert!(FuncHeader::decode(&frame).is_err());
    }

    #[test]
    fn word_block_roundtrip() {
        let words = vec![0, 1, u64::MAX, 42];
        assert_eq!(decode_words(&encode_words(&words)).expect("decode"), words);
        assert!(decode_words(&[1, 2, 3]).is_err());
    }
}
