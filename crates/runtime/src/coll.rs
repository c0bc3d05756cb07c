// SPDX-License-Identifier: Apache-2.0

//! Rendezvous-based collectives.
//!
//! Every collective is an exchange: each participant contributes a byte blob
//! under a key all participants agree on, the last contributor runs a
//! finalize step (e.g. allocating communicator or window ids), and everyone
//! leaves with the full contribution set plus the finalizer's extra blob.
//! Participants keep draining their own RMA agent while blocked, so a
//! process sitting in a barrier still makes progress on RMA addressed to it.

use crate::error::Result;
use crate::world::WorldCore;
use crate::{Rank, Tag};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Scope distinguishing concurrent exchanges on the same communicator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CollScope {
    /// Ordinary collective, sequenced per communicator handle.
    Seq(u64),
    /// Group-creation rendezvous among a subset of the communicator.
    Group { ranks: Vec<Rank>, tag: Tag },
}

/// Key of one exchange: communicator id plus scope.
pub(crate) type CollKey = (u64, CollScope);

/// The shared result of a finished exchange.
#[derive(Clone)]
pub(crate) struct CollOutcome {
    /// Contributions ordered by participant rank.
    pub(crate) blobs: Vec<Vec<u8>>,
    /// Extra blob produced by the finalizer.
    pub(crate) extra: Vec<u8>,
}

struct CollEntry {
    expected: usize,
    contrib: BTreeMap<Rank, Vec<u8>>,
    result: Option<CollOutcome>,
    taken: usize,
}

impl CollEntry {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            contrib: BTreeMap::new(),
            result: None,
            taken: 0,
        }
    }
}

/// World-level table of in-flight exchanges.
#[derive(Default)]
pub(crate) struct CollTable {
    entries: Mutex<HashMap<CollKey, CollEntry>>,
}

impl CollTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// Runs one exchange as participant `my_rank` (rank within the collective
/// group) on behalf of world rank `caller`.
///
/// `finalize` runs exactly once, in whichever participant completes the
/// contribution set, and may allocate world-level resources; its return value
/// is distributed to every participant as [`CollOutcome::extra`].
pub(crate) fn exchange(
    core: &WorldCore,
    caller: Rank,
    key: CollKey,
    my_rank: Rank,
    blob: Vec<u8>,
    expected: usize,
    finalize: impl FnOnce(&BTreeMap<Rank, Vec<u8>>, &WorldCore) -> Vec<u8>,
) -> Result<CollOutcome> {
    let mut pending_blob = Some(blob);
    let mut finalizer = Some(finalize);

    loop {
        crate::agent::drain(core, caller);
        core.check_abort()?;

        let mut wake = false;
        {
            let mut entries = core.colls.entries.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CollEntry::new(expected));
            debug_assert_eq!(entry.expected, expected, "mismatched collective size");

            if let Some(my_blob) = pending_blob.take() {
                if entry.result.is_some() {
                    // A previous round under the same key is still being
                    // drained by its participants; wait for it to clear.
                    pending_blob = Some(my_blob);
                } else {
                    let previous = entry.contrib.insert(my_rank, my_blob);
                    debug_assert!(previous.is_none(), "duplicate collective contribution");
                    if entry.contrib.len() == expected {
                        let extra = match finalizer.take() {
                            Some(f) => f(&entry.contrib, core),
                            None => Vec::new(),
                        };
                        let blobs = entry.contrib.values().cloned().collect();
                        entry.result = Some(CollOutcome { blobs, extra });
                        wake = true;
                    }
                }
            } else if let Some(outcome) = entry.result.clone() {
                entry.taken += 1;
                if entry.taken == expected {
                    let _ = entries.remove(&key);
                }
                drop(entries);
                core.notify();
                return Ok(outcome);
            }
        }
        if wake {
            core.notify();
        }
        core.wait_short();
    }
}
