use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connector::Connector;
use crate::error::PoolError;
use crate::holder::CheckoutGrant;
use crate::options::CheckoutOptions;

/// Key of a wait entry: `(submitted_at, unique_seq)`. Ties on the clock
/// (two checkouts landing in the same tick) break on `seq`, which is
/// assigned from the same monotonic counter as holder ids, so order is
/// strictly FIFO regardless of clock resolution.
pub(crate) type WaitKey = (Instant, u64);

/// What the waiting client's task receives once the broker has decided
/// its fate: a holder if it was served, or the reason it wasn't.
pub(crate) type CheckoutReply<C> = Result<CheckoutGrant<C>, PoolError<<C as Connector>::Error>>;

/// A pending checkout request, ordered in [`WaitQueue`] by submission
/// time. `reply_tx` is the "Holder::transfer_to" recipient; dropping it
/// (the client task being cancelled) is how the broker discovers client
/// death lazily, at dequeue time, in addition to the proactive watchdog.
pub(crate) struct WaitEntry<C: Connector> {
    pub(crate) reply_tx: oneshot::Sender<CheckoutReply<C>>,
    /// The options this waiter originally submitted, kept around so the
    /// same `timeout`/`deadline` bounds both how long it may sit in the
    /// queue and, if granted, the active checkout that follows (§4.6).
    pub(crate) options: CheckoutOptions,
}

/// The FIFO wait queue: pending checkout requests keyed by monotonic
/// submission time. Backed by a `BTreeMap` so "first" is O(log n) and
/// range-dropping over-aged entries is amortised O(k log n).
pub(crate) struct WaitQueue<C: Connector> {
    entries: BTreeMap<WaitKey, WaitEntry<C>>,
}

impl<C: Connector> WaitQueue<C> {
    pub(crate) fn new() -> Self {
        WaitQueue {
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, key: WaitKey, entry: WaitEntry<C>) {
        self.entries.insert(key, entry);
    }

    pub(crate) fn first_key(&self) -> Option<WaitKey> {
        self.entries.keys().next().copied()
    }

    /// Remove and return the oldest entry, if any.
    pub(crate) fn pop_first(&mut self) -> Option<(WaitKey, WaitEntry<C>)> {
        self.entries.pop_first()
    }

    /// Remove a specific entry by key (used by client-death handling and
    /// by deadline-in-queue bookkeeping); a no-op if the key is already
    /// gone, which is what makes the lazy and proactive death-detection
    /// paths idempotent with respect to one another.
    pub(crate) fn remove(&mut self, key: &WaitKey) -> Option<WaitEntry<C>> {
        self.entries.remove(key)
    }

    /// Drop every entry whose `submitted_at` is strictly older than
    /// `now - 2 * target` (CoDel slow-mode shedding, §4.4/§4.5), replying
    /// `Dropped` to each one. Returns the number of entries dropped.
    pub(crate) fn drop_slow(&mut self, now: Instant, target: Duration) -> usize {
        let cutoff = now.checked_sub(target * 2).unwrap_or(now);
        let keep = self.entries.split_off(&(cutoff, 0));
        let dropped = std::mem::replace(&mut self.entries, keep);
        let count = dropped.len();
        for (key, entry) in dropped {
            let elapsed = now.saturating_duration_since(key.0);
            let _ = entry.reply_tx.send(Err(PoolError::Dropped { elapsed }));
        }
        count
    }
}
