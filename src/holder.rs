use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::connector::Connector;

/// Identifies a single connection slot for the lifetime of its current
/// incarnation. A fresh id is minted on every `install`; disconnect/stop
/// destroys the id along with the holder, so a stale reference (a timer
/// that fired against a connection that has since been torn down and
/// replaced) can never be confused with the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HolderId(u64);

/// Monotonic id generator shared by holder ids, wait-queue sequence
/// numbers and deadline/timer ids. A single counter is enough: the
/// invariant that matters is uniqueness, not any particular namespace.
#[derive(Debug, Default)]
pub(crate) struct IdGen(AtomicU64);

impl IdGen {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_holder_id(&self) -> HolderId {
        HolderId(self.next())
    }
}

/// Why a holder was torn down. Delivered to the [`crate::supervisor`] task
/// that installed it, so it knows whether to reconnect or to stop for
/// good.
#[derive(Debug)]
pub enum Teardown<E> {
    /// `disconnect`/forced-timeout/forced-invariant-violation: the
    /// connector should reconnect and install a replacement.
    Disconnect(Option<E>),
    /// `stop`: the connector should not reconnect this slot.
    Stop(Option<E>),
}

/// The handoff vehicle described as "Holder" in the design: it bundles the
/// live connection with its protocol module and caller-visible state.
///
/// Ownership of a `Holder` is enforced structurally rather than by a
/// runtime check: whoever holds the value by-value is the current owner.
/// The broker's copy (in the ready queue) and the client's copy (behind
/// [`crate::pool::Handle`]) can never alias, because `transfer_to` moves
/// the value across a [`oneshot`] channel instead of handing out a
/// reference.
#[derive(Debug)]
pub struct Holder<C: Connector> {
    pub(crate) id: HolderId,
    pub(crate) conn: C::Connection,
    pub(crate) module: C::Module,
    pub(crate) state: C::State,
}

impl<C: Connector> Holder<C> {
    pub(crate) fn new(id: HolderId, conn: C::Connection, module: C::Module, state: C::State) -> Self {
        Holder {
            id,
            conn,
            module,
            state,
        }
    }

    pub(crate) fn id(&self) -> HolderId {
        self.id
    }
}

/// What a successful checkout hands the client: the holder itself, plus
/// the deadline the broker armed for this checkout (so the caller can, if
/// it wants to, race its own work against the same instant rather than
/// discover the reclaim only when it next touches the pool).
///
/// Ownership transfer (`Holder::transfer_to` in the design notes) is
/// realized as sending `Ok(CheckoutGrant { .. })` down the waiter's
/// `oneshot` reply channel in [`crate::broker`]: the send either succeeds
/// (recipient acquires it, broker's copy is gone) or fails and hands the
/// holder back inside the `Err` payload for the broker to retry against
/// the next waiter — exactly the atomic-move-with-detectable-failure
/// contract the design calls for, with no separate method needed because
/// `oneshot::Sender::send` already has that shape.
#[derive(Debug)]
pub struct CheckoutGrant<C: Connector> {
    pub(crate) holder: Holder<C>,
    /// The instant at which the broker will forcibly reclaim this
    /// checkout if it hasn't been returned. `None` means no deadline was
    /// armed (infinite timeout, no absolute deadline).
    pub(crate) deadline_at: Option<Instant>,
    pub(crate) deadline_id: u64,
}
