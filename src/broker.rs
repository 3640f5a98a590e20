//! The checkout broker: the single-threaded cooperative actor that owns
//! the wait queue, the ready queue and the CoDel controller (§4.3-§4.5).
//!
//! Every other module in this crate is a passive data structure or an
//! external collaborator; this is the only place state transitions
//! happen, and they happen one event at a time off `mailbox`, exactly as
//! §5 requires.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::Future;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration, Instant};

use crate::codel::CodelState;
use crate::connector::{Connector, ErrorSink};
use crate::holder::{CheckoutGrant, Holder, HolderId, IdGen, Teardown};
use crate::options::CheckoutOptions;
use crate::ready_queue::ReadyQueue;
use crate::wait_queue::{CheckoutReply, WaitEntry, WaitKey, WaitQueue};

/// A snapshot of where every installed holder currently sits, used by
/// `Pool::state` (§6) for diagnostics; the ambient analogue of the
/// teacher's `bb8::State`.
#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    /// Holders currently installed (ready, active or mid-ping).
    pub connections: u32,
    /// Holders sitting idle in the ready queue.
    pub idle_connections: u32,
    /// Clients currently queued in the wait queue.
    pub waiting: u32,
}

/// Messages the broker's mailbox accepts. Every public `Pool`/`Handle`
/// operation and every `Connector`/supervisor operation boils down to one
/// of these.
pub(crate) enum Command<C: Connector> {
    Install {
        conn: C::Connection,
        module: C::Module,
        state: C::State,
        teardown_tx: oneshot::Sender<Teardown<C::Error>>,
    },
    Checkout {
        options: CheckoutOptions,
        reply_tx: oneshot::Sender<CheckoutReply<C>>,
        watch_rx: oneshot::Receiver<Infallible>,
    },
    Checkin {
        holder_id: HolderId,
        conn: C::Connection,
        module: C::Module,
        state: C::State,
    },
    Disconnect {
        holder_id: HolderId,
        err: Option<C::Error>,
    },
    Stop {
        holder_id: HolderId,
        err: Option<C::Error>,
    },
    State {
        reply_tx: oneshot::Sender<PoolState>,
    },
}

impl<C: Connector> std::fmt::Debug for Command<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Install { .. } => f.write_str("Command::Install"),
            Command::Checkout { .. } => f.write_str("Command::Checkout"),
            Command::Checkin { holder_id, .. } => {
                f.debug_tuple("Command::Checkin").field(holder_id).finish()
            }
            Command::Disconnect { holder_id, .. } => {
                f.debug_tuple("Command::Disconnect").field(holder_id).finish()
            }
            Command::Stop { holder_id, .. } => {
                f.debug_tuple("Command::Stop").field(holder_id).finish()
            }
            Command::State { .. } => f.write_str("Command::State"),
        }
    }
}

type PingOutcome<C> = Result<Holder<C>, (HolderId, <C as Connector>::Error)>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The broker's private state. Never shared: everything here is mutated
/// only from inside `run`.
pub(crate) struct Broker<C: Connector> {
    connector: Arc<C>,
    ready: ReadyQueue<C>,
    wait: WaitQueue<C>,
    /// Holder id -> deadline id, for holders currently checked out to a
    /// client. Absence of an id here is what makes checkin/disconnect/
    /// deadline-fire all idempotent with respect to one another (§9).
    active: HashMap<HolderId, u64>,
    /// Holder id -> the channel back to the supervisor slot that
    /// installed it, alive for the holder's entire incarnation
    /// regardless of how many ready/active cycles it goes through.
    teardown_txs: HashMap<HolderId, oneshot::Sender<Teardown<C::Error>>>,
    codel: CodelState,
    ids: IdGen,
    error_sink: Box<dyn ErrorSink<C::Error>>,
    name: String,
    deadlines: FuturesUnordered<BoxFuture<(HolderId, u64)>>,
    watchdogs: FuturesUnordered<BoxFuture<WaitKey>>,
    pings: FuturesUnordered<BoxFuture<PingOutcome<C>>>,
}

impl<C: Connector> Broker<C> {
    pub(crate) fn new(
        connector: Arc<C>,
        target: Duration,
        interval: Duration,
        idle_interval: Duration,
        error_sink: Box<dyn ErrorSink<C::Error>>,
        name: String,
    ) -> Self {
        Broker {
            connector,
            ready: ReadyQueue::new(),
            wait: WaitQueue::new(),
            active: HashMap::new(),
            teardown_txs: HashMap::new(),
            codel: CodelState::new(target, interval, idle_interval),
            ids: IdGen::default(),
            error_sink,
            name,
            deadlines: FuturesUnordered::new(),
            watchdogs: FuturesUnordered::new(),
            pings: FuturesUnordered::new(),
        }
    }

    /// Runs the event loop until every `Pool`/supervisor handle pointing
    /// at this broker has been dropped. This is the whole of §5's
    /// "single-threaded cooperative actor": one `select!` arm per event
    /// source, no locks anywhere.
    pub(crate) async fn run(mut self, mut mailbox: mpsc::Receiver<Command<C>>) {
        let mut poll_ticker = time::interval_at(Instant::now() + self.codel.interval, self.codel.interval);
        let mut idle_ticker =
            time::interval_at(Instant::now() + self.codel.idle_interval, self.codel.idle_interval);

        loop {
            tokio::select! {
                cmd = mailbox.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = poll_ticker.tick() => {
                    self.on_poll_tick(Instant::now());
                }
                _ = idle_ticker.tick() => {
                    self.on_idle_tick(Instant::now());
                }
                Some((holder_id, deadline_id)) = self.deadlines.next(), if !self.deadlines.is_empty() => {
                    self.on_deadline_fired(holder_id, deadline_id);
                }
                Some(key) = self.watchdogs.next(), if !self.watchdogs.is_empty() => {
                    self.on_client_death(key);
                }
                Some(outcome) = self.pings.next(), if !self.pings.is_empty() => {
                    self.on_ping_result(outcome);
                }
            }
        }

        tracing::debug!(pool = %self.name, "broker mailbox closed, shutting down");
    }

    fn handle_command(&mut self, cmd: Command<C>) {
        match cmd {
            Command::Install {
                conn,
                module,
                state,
                teardown_tx,
            } => self.handle_install(conn, module, state, teardown_tx),
            Command::Checkout {
                options,
                reply_tx,
                watch_rx,
            } => self.handle_checkout(options, reply_tx, watch_rx),
            Command::Checkin {
                holder_id,
                conn,
                module,
                state,
            } => self.handle_checkin(holder_id, conn, module, state),
            Command::Disconnect { holder_id, err } => self.handle_disconnect(holder_id, err),
            Command::Stop { holder_id, err } => self.handle_stop(holder_id, err),
            Command::State { reply_tx } => {
                let _ = reply_tx.send(self.state());
            }
        }
    }

    fn state(&self) -> PoolState {
        PoolState {
            connections: (self.ready.len() + self.active.len()) as u32,
            idle_connections: self.ready.len() as u32,
            waiting: self.wait.len() as u32,
        }
    }

    // ---- §4.1 install -------------------------------------------------

    fn handle_install(
        &mut self,
        conn: C::Connection,
        module: C::Module,
        state: C::State,
        teardown_tx: oneshot::Sender<Teardown<C::Error>>,
    ) {
        let id = self.ids.next_holder_id();
        self.teardown_txs.insert(id, teardown_tx);
        let holder = Holder::new(id, conn, module, state);
        tracing::trace!(pool = %self.name, holder_id = ?id, "installed");
        // "immediately offer it as a checkin" (§4.1): reuse the exact
        // dequeue-or-ready path a real checkin takes.
        self.checkin_holder(holder, Instant::now());
    }

    // ---- §4.3 checkout --------------------------------------------------

    fn handle_checkout(
        &mut self,
        options: CheckoutOptions,
        reply_tx: oneshot::Sender<CheckoutReply<C>>,
        watch_rx: oneshot::Receiver<Infallible>,
    ) {
        let now = Instant::now();
        if let Some(holder) = self.ready.pop_oldest() {
            self.grant(holder, now, &options, reply_tx);
            return;
        }

        if !options.queue {
            let _ = reply_tx.send(Err(crate::error::PoolError::Unavailable));
            return;
        }

        let key: WaitKey = (now, self.ids.next());
        self.wait.insert(key, WaitEntry { reply_tx, options });
        self.watchdogs.push(Box::pin(async move {
            let _ = watch_rx.await;
            key
        }));
    }

    /// Mint a deadline, record this holder as active, and hand it to
    /// `reply_tx`. Used both for an immediate ready-queue pop and for the
    /// dequeue path below.
    fn grant(
        &mut self,
        holder: Holder<C>,
        now: Instant,
        options: &CheckoutOptions,
        reply_tx: oneshot::Sender<CheckoutReply<C>>,
    ) {
        let deadline_at = options.effective_deadline(now);
        let deadline_id = self.ids.next();
        let holder_id = holder.id();
        self.active.insert(holder_id, deadline_id);
        if let Some(at) = deadline_at {
            self.deadlines.push(Box::pin(async move {
                time::sleep_until(at).await;
                (holder_id, deadline_id)
            }));
        }
        let grant = CheckoutGrant {
            holder,
            deadline_at,
            deadline_id,
        };
        // Recipient-gone on a direct grant just means the caller raced a
        // cancellation between submitting and being woken; nothing to
        // retry against (there was no queue to fall back into), so the
        // holder is lost here and must be reclaimed like any other
        // abandoned active holder. We treat it the same as a deadline
        // fire against an untouched holder: disconnect it immediately.
        if reply_tx.send(Ok(grant)).is_err() {
            self.active.remove(&holder_id);
            self.force_disconnect(holder_id, None);
        }
    }

    // ---- §4.4 checkin / dequeue ----------------------------------------

    fn handle_checkin(&mut self, holder_id: HolderId, conn: C::Connection, module: C::Module, state: C::State) {
        if self.active.remove(&holder_id).is_none() {
            // Stale: already reclaimed by a deadline fire, or a duplicate
            // checkin racing a disconnect. Idempotent no-op (§8 property 7).
            tracing::trace!(pool = %self.name, holder_id = ?holder_id, "ignored stale checkin");
            return;
        }
        let holder = Holder::new(holder_id, conn, module, state);
        self.checkin_holder(holder, Instant::now());
    }

    /// The actual dequeue-or-ready logic shared by `install`, `checkin`
    /// and a successful idle ping (§4.3/§4.4).
    fn checkin_holder(&mut self, mut holder: Holder<C>, now: Instant) {
        if now >= self.codel.next_check {
            if let Some((submitted_at, _)) = self.wait.first_key() {
                self.codel.enter_interval(now, submitted_at);
            }
        }

        loop {
            if self.codel.slow {
                while let Some((key, _)) = self.wait.first_key().map(|k| (k, ())) {
                    let age = now.saturating_duration_since(key.0);
                    if age > self.codel.target * 2 {
                        let (_, entry) = self.wait.pop_first().expect("first_key implies pop_first");
                        let _ = entry
                            .reply_tx
                            .send(Err(crate::error::PoolError::Dropped { elapsed: age }));
                    } else {
                        break;
                    }
                }
            }

            match self.wait.pop_first() {
                None => {
                    self.ready.insert(now, holder);
                    self.codel.reset_on_drain();
                    return;
                }
                Some((key, entry)) => {
                    // §4.6: a waiter whose own queueing bound has already
                    // elapsed by the time a holder is finally available
                    // gains nothing from being handed one; reply
                    // `DeadlineInQueue` and let the loop try the next
                    // waiter with the same holder, rather than granting a
                    // checkout the caller has already given up on.
                    if let Some(queue_deadline) = entry.options.effective_deadline(key.0) {
                        if now > queue_deadline {
                            let _ = entry.reply_tx.send(Err(crate::error::PoolError::DeadlineInQueue));
                            continue;
                        }
                    }

                    let observed = now.saturating_duration_since(key.0);
                    let deadline_id = self.ids.next();
                    let holder_id = holder.id();
                    self.active.insert(holder_id, deadline_id);
                    // The active-checkout deadline is armed fresh from
                    // the moment of handoff, using the same options the
                    // waiter originally submitted (§4.6).
                    let deadline_at = entry.options.effective_deadline(now);
                    if let Some(at) = deadline_at {
                        self.deadlines.push(Box::pin(async move {
                            time::sleep_until(at).await;
                            (holder_id, deadline_id)
                        }));
                    }
                    let grant = CheckoutGrant {
                        holder,
                        deadline_at,
                        deadline_id,
                    };
                    match entry.reply_tx.send(Ok(grant)) {
                        Ok(()) => {
                            self.codel.note_dequeue_delay(observed);
                            return;
                        }
                        Err(Ok(grant)) => {
                            // Recipient died between submission and this
                            // dequeue attempt (§4.3 tie-break rule):
                            // retry with the next waiter.
                            self.active.remove(&holder_id);
                            holder = grant.holder;
                            continue;
                        }
                        Err(Err(_)) => unreachable!("grant is always Ok here"),
                    }
                }
            }
        }
    }

    // ---- disconnect / stop ----------------------------------------------

    fn handle_disconnect(&mut self, holder_id: HolderId, err: Option<C::Error>) {
        // A holder can be disconnected whether it was active, idle, or
        // already reclaimed; only the active/teardown bookkeeping needs
        // clearing, and both removals are no-ops if already gone.
        self.active.remove(&holder_id);
        self.force_disconnect(holder_id, err);
    }

    fn handle_stop(&mut self, holder_id: HolderId, err: Option<C::Error>) {
        self.active.remove(&holder_id);
        if let Some(teardown_tx) = self.teardown_txs.remove(&holder_id) {
            let _ = teardown_tx.send(Teardown::Stop(err));
        }
    }

    fn force_disconnect(&mut self, holder_id: HolderId, err: Option<C::Error>) {
        if let Some(teardown_tx) = self.teardown_txs.remove(&holder_id) {
            let _ = teardown_tx.send(Teardown::Disconnect(err));
        }
    }

    // ---- §4.6 deadlines ---------------------------------------------------

    fn on_deadline_fired(&mut self, holder_id: HolderId, deadline_id: u64) {
        if self.active.get(&holder_id) != Some(&deadline_id) {
            // Stale fire: the holder has since been checked in,
            // disconnected, or reassigned a fresh deadline. Silently
            // dropped per the timer-identity race mitigation (§9).
            return;
        }
        self.active.remove(&holder_id);
        tracing::warn!(pool = %self.name, holder_id = ?holder_id, "checkout exceeded its deadline, forcing disconnect");
        self.force_disconnect(holder_id, None);
    }

    // ---- §4.2/§4.5 client watchdog -----------------------------------------

    fn on_client_death(&mut self, key: WaitKey) {
        if self.wait.remove(&key).is_some() {
            tracing::trace!(pool = %self.name, "removed wait entry for a dead client");
        }
    }

    // ---- §4.5 codel controller ---------------------------------------------

    fn on_poll_tick(&mut self, now: Instant) {
        let head = self.wait.first_key();
        if head == self.codel.poll_cursor {
            if let Some((submitted_at, _)) = head {
                let observed = now.saturating_duration_since(submitted_at);
                if observed > self.codel.target && self.codel.delay > self.codel.target && now >= self.codel.next_check {
                    self.codel.slow = true;
                    let dropped = self.wait.drop_slow(now, self.codel.target);
                    if dropped > 0 {
                        tracing::debug!(pool = %self.name, dropped, "codel entered slow mode and dropped stale waiters");
                    }
                }
                // No checkin has sampled the head since the last tick (no
                // progress); the poll tick is itself a sample, so it seeds
                // `delay` the same way `enter_interval` does on the
                // checkin path. Without this, an indefinitely-held
                // connection would leave `delay` at its initial zero
                // forever and slow mode could never be entered.
                self.codel.delay = observed;
            }
        }
        self.codel.next_check = now + self.codel.interval;
        self.codel.poll_cursor = self.wait.first_key();
    }

    fn on_idle_tick(&mut self, now: Instant) {
        let head = self.ready.first_key();
        if head == self.codel.idle_cursor {
            if let Some(holder) = self.ready.pop_oldest() {
                let connector = self.connector.clone();
                self.pings.push(Box::pin(async move {
                    let id = holder.id();
                    let module = holder.module;
                    let state = holder.state;
                    match connector.is_valid(holder.conn).await {
                        Ok(conn) => Ok(Holder::new(id, conn, module, state)),
                        Err((e, _conn)) => Err((id, e)),
                    }
                }));
            }
        }
        self.codel.idle_cursor = self.ready.first_key();
    }

    fn on_ping_result(&mut self, outcome: PingOutcome<C>) {
        match outcome {
            Ok(holder) => {
                tracing::trace!(pool = %self.name, holder_id = ?holder.id(), "idle ping succeeded");
                self.checkin_holder(holder, Instant::now());
            }
            Err((holder_id, err)) => {
                tracing::warn!(pool = %self.name, holder_id = ?holder_id, "idle ping failed, disconnecting");
                self.error_sink.sink(err);
                self.force_disconnect(holder_id, None);
            }
        }
    }
}
