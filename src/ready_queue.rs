use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::connector::Connector;
use crate::holder::{Holder, HolderId};

/// Key of a ready entry: `(idle_since, holder_id)`. Ordered so pings
/// always target the connection that has been idle the longest.
pub(crate) type ReadyKey = (Instant, HolderId);

/// The ready queue: idle holders keyed by the time they became idle.
/// Draining for a ping walks the queue from the oldest entry; draining to
/// service a waiter instead takes the specific holder that was just
/// checked in, without ever touching this map (§4.2).
pub(crate) struct ReadyQueue<C: Connector> {
    entries: BTreeMap<ReadyKey, Holder<C>>,
}

impl<C: Connector> ReadyQueue<C> {
    pub(crate) fn new() -> Self {
        ReadyQueue {
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, idle_since: Instant, holder: Holder<C>) {
        self.entries.insert((idle_since, holder.id()), holder);
    }

    pub(crate) fn first_key(&self) -> Option<ReadyKey> {
        self.entries.keys().next().copied()
    }

    /// Remove and return the oldest-idle holder, for pinging.
    pub(crate) fn pop_oldest(&mut self) -> Option<Holder<C>> {
        let key = self.first_key()?;
        self.entries.remove(&key)
    }

    /// Remove a specific holder by its ready-queue key (used when a held
    /// connection is reclaimed by id while idle, e.g. an external
    /// `disconnect` racing the ready queue).
    pub(crate) fn remove(&mut self, key: &ReadyKey) -> Option<Holder<C>> {
        self.entries.remove(key)
    }
}
