// SPDX-License-Identifier: Apache-2.0

//! Communicators: process groups with point-to-point messaging and
//! collectives.

use crate::coll::{self, CollScope};
use crate::error::{Error, Result};
use crate::world::{WorldCore, wait_progress};
use crate::{Rank, Tag};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

/// A group of processes that can message each other and run collectives.
///
/// A `Comm` handle belongs to the process that created it and is not meant to
/// cross threads. Clones share the collective sequence counter, so every
/// process must issue the same collectives in the same order on a given
/// communicator regardless of which clone it uses (the usual collective
/// contract).
pub struct Comm {
    pub(crate) core: Arc<WorldCore>,
    pub(crate) id: u64,
    /// Communicator rank -> world rank.
    group: Arc<Vec<Rank>>,
    my_rank: Rank,
    seq: Rc<Cell<u64>>,
}

impl Clone for Comm {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            id: self.id,
            group: Arc::clone(&self.group),
            my_rank: self.my_rank,
            seq: Rc::clone(&self.seq),
        }
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("id", &self.id)
            .field("rank", &self.my_rank)
            .field("size", &self.group.len())
            .finish()
    }
}

impl Comm {
    pub(crate) fn world(core: Arc<WorldCore>, my_world_rank: Rank) -> Self {
        let group: Vec<Rank> = (0..core.nprocs).collect();
        Self {
            core,
            id: 0,
            group: Arc::new(group),
            my_rank: my_world_rank,
            seq: Rc::new(Cell::new(0)),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    /// Opaque communicator id, unique within the world. Two handles with the
    /// same id denote the same communicator.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This process's rank in the communicator.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.my_rank
    }

    /// Number of processes in the communicator.
    #[must_use]
    pub fn size(&self) -> usize {
        self.group.len()
    }

    /// World ranks of the members, indexed by communicator rank.
    #[must_use]
    pub fn group(&self) -> &[Rank] {
        &self.group
    }

    /// This process's world rank.
    #[must_use]
    pub fn world_rank(&self) -> Rank {
        self.group[self.my_rank]
    }

    /// Translates a communicator rank to a world rank.
    pub fn world_rank_of(&self, rank: Rank) -> Result<Rank> {
        self.group
            .get(rank)
            .copied()
            .ok_or(Error::RankOutOfRange {
                rank,
                size: self.group.len(),
            })
    }

    /// Translates a world rank to a rank in this communicator, if a member.
    #[must_use]
    pub fn comm_rank_of_world(&self, world_rank: Rank) -> Option<Rank> {
        self.group.iter().position(|&w| w == world_rank)
    }

    /// Node id of this process.
    #[must_use]
    pub fn my_node(&self) -> usize {
        self.core.node_of[self.world_rank()]
    }

    /// Node id of a member.
    pub fn node_of(&self, rank: Rank) -> Result<usize> {
        Ok(self.core.node_of[self.world_rank_of(rank)?])
    }

    /// Sends `payload` to `dst` under `tag`. Non-blocking: enqueues into the
    /// destination mailbox.
    pub fn send(&self, dst: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        let dst_world = self.world_rank_of(dst)?;
        self.core.procs[dst_world]
            .mailbox
            .push((self.id, self.my_rank, tag), payload.to_vec());
        self.core.notify();
        Ok(())
    }

    /// Receives the oldest message from `src` under `tag`, blocking until one
    /// arrives.
    pub fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let _ = self.world_rank_of(src)?;
        let key = (self.id, src, tag);
        let me = self.world_rank();
        wait_progress(&self.core, me, || {
            self.core.procs[me].mailbox.try_pop(&key)
        })
    }

    /// Receives the oldest message under `tag` from any source, blocking
    /// until one arrives. Returns the source rank with the payload.
    pub fn recv_any(&self, tag: Tag) -> Result<(Rank, Vec<u8>)> {
        let me = self.world_rank();
        wait_progress(&self.core, me, || {
            self.core.procs[me].mailbox.try_pop_any(self.id, tag)
        })
    }

    /// Non-blocking receive. Drains this process's agent once either way.
    pub fn try_recv(&self, src: Rank, tag: Tag) -> Result<Option<Vec<u8>>> {
        let _ = self.world_rank_of(src)?;
        let me = self.world_rank();
        crate::agent::drain(&self.core, me);
        self.core.check_abort()?;
        Ok(self.core.procs[me].mailbox.try_pop(&(self.id, src, tag)))
    }

    /// Gathers one blob per member, returned in communicator-rank order.
    pub fn allgather(&self, blob: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let key = (self.id, CollScope::Seq(self.next_seq()));
        let outcome = coll::exchange(
            &self.core,
            self.world_rank(),
            key,
            self.my_rank,
            blob,
            self.size(),
            |_, _| Vec::new(),
        )?;
        Ok(outcome.blobs)
    }

    /// Blocks until every member has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        let _ = self.allgather(Vec::new())?;
        Ok(())
    }

    /// Broadcasts `data` from `root`; non-root members pass an empty slice
    /// and receive the root's bytes.
    pub fn bcast(&self, root: Rank, data: &[u8]) -> Result<Vec<u8>> {
        if root >= self.size() {
            return Err(Error::RankOutOfRange {
                rank: root,
                size: self.size(),
            });
        }
        let blobs = self.allgather(data.to_vec())?;
        Ok(blobs[root].clone())
    }

    /// Splits the communicator into one new communicator per distinct
    /// `color`; members are ordered by `(key, rank)`.
    pub fn split(&self, color: i64, key: i64) -> Result<Comm> {
        let mut blob = Vec::with_capacity(16);
        blob.extend_from_slice(&color.to_le_bytes());
        blob.extend_from_slice(&key.to_le_bytes());

        let coll_key = (self.id, CollScope::Seq(self.next_seq()));
        let outcome = coll::exchange(
            &self.core,
            self.world_rank(),
            coll_key,
            self.my_rank,
            blob,
            self.size(),
            |contrib, core| {
                // One id per distinct color, in ascending color order.
                let mut colors: Vec<i64> = contrib
                    .values()
                    .map(|b| decode_i64(b, 0))
                    .collect();
                colors.sort_unstable();
                colors.dedup();
                let mut extra = Vec::with_capacity(colors.len() * 16);
                for color in colors {
                    extra.extend_from_slice(&color.to_le_bytes());
                    extra.extend_from_slice(&core.alloc_comm_id().to_le_bytes());
                }
                extra
            },
        )?;

        // Reconstruct my color group from everyone's (color, key).
        let mut members: Vec<(i64, Rank)> = Vec::new();
        for (rank, blob) in outcome.blobs.iter().enumerate() {
            if decode_i64(blob, 0) == color {
                members.push((decode_i64(blob, 8), rank));
            }
        }
        members.sort_unstable();
        let group: Vec<Rank> = members
            .iter()
            .map(|&(_, rank)| self.group[rank])
            .collect();
        let my_new_rank = members
            .iter()
            .position(|&(_, rank)| rank == self.my_rank)
            .ok_or(Error::RankOutOfRange {
                rank: self.my_rank,
                size: members.len(),
            })?;

        let mut new_id = None;
        for chunk in outcome.extra.chunks_exact(16) {
            if decode_i64(chunk, 0) == color {
                new_id = Some(decode_u64(chunk, 8));
            }
        }
        let id = new_id.ok_or(Error::RankOutOfRange {
            rank: self.my_rank,
            size: self.size(),
        })?;

        Ok(Comm {
            core: Arc::clone(&self.core),
            id,
            group: Arc::new(group),
            my_rank: my_new_rank,
            seq: Rc::new(Cell::new(0)),
        })
    }

    /// Splits by node: members on the same node end up in the same
    /// communicator, ordered by rank.
    pub fn split_node(&self) -> Result<Comm> {
        let node = self.my_node();
        self.split(node as i64, self.my_rank as i64)
    }

    /// Creates a communicator from an explicit subset of members.
    ///
    /// Collective over exactly the listed members (communicator ranks; every
    /// participant must pass the same list, which defines the new rank
    /// order and must include the caller). `tag` disambiguates concurrent
    /// group creations.
    pub fn create_group(&self, ranks: &[Rank], tag: Tag) -> Result<Comm> {
        let my_pos = ranks
            .iter()
            .position(|&r| r == self.my_rank)
            .ok_or(Error::RankOutOfRange {
                rank: self.my_rank,
                size: ranks.len(),
            })?;
        for &rank in ranks {
            let _ = self.world_rank_of(rank)?;
        }

        let key = (
            self.id,
            CollScope::Group {
                ranks: ranks.to_vec(),
                tag,
            },
        );
        let outcome = coll::exchange(
            &self.core,
            self.world_rank(),
            key,
            my_pos,
            Vec::new(),
            ranks.len(),
            |_, core| core.alloc_comm_id().to_le_bytes().to_vec(),
        )?;

        let id = decode_u64(&outcome.extra, 0);
        let group: Vec<Rank> = ranks.iter().map(|&r| self.group[r]).collect();
        Ok(Comm {
            core: Arc::clone(&self.core),
            id,
            group: Arc::new(group),
            my_rank: my_pos,
            seq: Rc::new(Cell::new(0)),
        })
    }
}

fn decode_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn decode_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
