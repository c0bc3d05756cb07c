// SPDX-License-Identifier: Apache-2.0

//! Per-process mailbox for tagged point-to-point messages.
//!
//! Messages are matched on `(communicator, source rank, tag)` and delivered
//! in FIFO order per key. The mailbox itself never blocks; blocking receives
//! are built by the world's progress loop around [`Mailbox::try_pop`].

use crate::{Rank, Tag};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Matching key for a message: communicator id, source rank, tag.
pub(crate) type MsgKey = (u64, Rank, Tag);

#[derive(Default)]
struct MailboxState {
    queues: HashMap<MsgKey, VecDeque<Vec<u8>>>,
}

/// Inbound message store of one process.
#[derive(Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a message under its matching key.
    pub(crate) fn push(&self, key: MsgKey, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.queues.entry(key).or_default().push_back(payload);
    }

    /// Removes and returns the oldest message matching `key`, if any.
    pub(crate) fn try_pop(&self, key: &MsgKey) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let queue = state.queues.get_mut(key)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            let _ = state.queues.remove(key);
        }
        payload
    }

    /// Removes and returns a message from any source matching `(comm, tag)`,
    /// preferring the lowest source rank for determinism.
    pub(crate) fn try_pop_any(&self, comm: u64, tag: Tag) -> Option<(Rank, Vec<u8>)> {
        let mut state = self.state.lock();
        let src = state
            .queues
            .keys()
            .filter(|(c, _, t)| *c == comm && *t == tag)
            .map(|(_, src, _)| *src)
            .min()?;
        let key = (comm, src, tag);
        let queue = state.queues.get_mut(&key)?;
        let payload = queue.pop_front()?;
        if queue.is_empty() {
            let _ = state.queues.remove(&key);
        }
        Some((src, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_key() {
        let mbox = Mailbox::new();
        mbox.push((1, 0, 7), vec![1]);
        mbox.push((1, 0, 7), vec![2]);
        mbox.push((1, 3, 7), vec![9]);

        assert_eq!(mbox.try_pop(&(1, 0, 7)), Some(vec![1]));
        assert_eq!(mbox.try_pop(&(1, 0, 7)), Some(vec![2]));
        assert_eq!(mbox.try_pop(&(1, 0, 7)), None);
        assert_eq!(mbox.try_pop(&(1, 3, 7)), Some(vec![9]));
    }

    #[test]
    fn keys_do_not_alias() {
        let mbox = Mailbox::new();
        mbox.push((1, 0, 1), vec![1]);
        assert_eq!(mbox.try_pop(&(1, 0, 2)), None);
        assert_eq!(mbox.try_pop(&(2, 0, 1)), None);
        assert_eq!(mbox.try_pop(&(1, 0, 1)), Some(vec![1]));
    }
}
