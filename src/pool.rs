//! The public surface: [`PoolBuilder`], [`Pool`] and [`Handle`]. Mirrors
//! the teacher's `Builder<M>`/`Pool<M>` split, with the held connection's
//! structural ownership (`Handle`) taking the place of the teacher's bare
//! `Conn<C>`/`PooledConnection` pair.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::broker::{Broker, Command, PoolState};
use crate::connector::{Connector, ErrorSink, NopErrorSink};
use crate::holder::HolderId;
use crate::options::{CheckoutOptions, Timeout};
use crate::supervisor;

/// Builds a [`Pool`], mirroring the validated-setter style of the
/// teacher's `Builder<M>`.
#[derive(Debug)]
pub struct PoolBuilder<C: Connector> {
    min_idle: u32,
    queue_target: Duration,
    queue_interval: Duration,
    idle_interval: Duration,
    default_timeout: Timeout,
    error_sink: Box<dyn ErrorSink<C::Error>>,
    pool_name: String,
    mailbox_capacity: usize,
}

impl<C: Connector> Default for PoolBuilder<C> {
    fn default() -> Self {
        PoolBuilder {
            min_idle: 1,
            queue_target: Duration::from_millis(50),
            queue_interval: Duration::from_millis(1000),
            idle_interval: Duration::from_millis(1000),
            default_timeout: Timeout::default(),
            error_sink: Box::new(NopErrorSink),
            pool_name: "pool".to_string(),
            mailbox_capacity: 128,
        }
    }
}

impl<C: Connector> PoolBuilder<C> {
    /// Start from the defaults: one slot, a 50ms CoDel target, a 1000ms
    /// CoDel measurement interval, a 1000ms idle-ping interval, a 5s
    /// default checkout timeout, and a no-op error sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connection slots kept alive (connected, or reconnecting)
    /// at all times. Must be at least 1.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        assert!(min_idle >= 1, "min_idle must be at least 1");
        self.min_idle = min_idle;
        self
    }

    /// CoDel's acceptable head-of-line delay. Must be nonzero.
    pub fn queue_target(mut self, target: Duration) -> Self {
        assert!(target > Duration::ZERO, "queue_target must be nonzero");
        self.queue_target = target;
        self
    }

    /// CoDel's measurement window. Must be nonzero.
    pub fn queue_interval(mut self, interval: Duration) -> Self {
        assert!(interval > Duration::ZERO, "queue_interval must be nonzero");
        self.queue_interval = interval;
        self
    }

    /// Period between idle-connection validity pings. Must be nonzero.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        assert!(interval > Duration::ZERO, "idle_interval must be nonzero");
        self.idle_interval = interval;
        self
    }

    /// Default `timeout` applied to checkouts made with
    /// [`Pool::checkout`] rather than [`Pool::checkout_with`].
    pub fn default_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.default_timeout = timeout.into();
        self
    }

    /// Where connect/idle-ping/forced-disconnect errors that aren't tied
    /// to any particular caller are reported. Defaults to a no-op sink.
    pub fn error_sink(mut self, sink: Box<dyn ErrorSink<C::Error>>) -> Self {
        self.error_sink = sink;
        self
    }

    /// A name folded into this pool's tracing spans/events, useful when a
    /// process runs more than one pool.
    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Bound on the broker's mailbox, i.e. how many in-flight
    /// checkout/checkin/install commands may be queued to the broker
    /// before callers start backpressuring. Must be nonzero.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "mailbox_capacity must be nonzero");
        self.mailbox_capacity = capacity;
        self
    }

    /// Builds the pool, spawning the broker task and `min_idle`
    /// supervisor tasks onto the current tokio runtime.
    pub fn build(self, connector: C) -> Pool<C> {
        let connector = Arc::new(connector);
        let error_sink: Arc<dyn ErrorSink<C::Error>> = Arc::from(self.error_sink);
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);

        let broker = Broker::new(
            connector.clone(),
            self.queue_target,
            self.queue_interval,
            self.idle_interval,
            error_sink.boxed_clone(),
            self.pool_name.clone(),
        );
        tokio::spawn(broker.run(rx));

        for _ in 0..self.min_idle {
            tokio::spawn(supervisor::run_slot(
                connector.clone(),
                tx.clone(),
                error_sink.clone(),
                self.pool_name.clone(),
            ));
        }

        Pool {
            mailbox: tx,
            default_timeout: self.default_timeout,
        }
    }
}

/// A cheaply cloneable handle to a running pool. Cloning shares the same
/// broker task and the same supervisor slots; the last clone being
/// dropped closes the mailbox and the broker (and every slot it spawned)
/// shuts down in turn.
#[derive(Clone)]
pub struct Pool<C: Connector> {
    mailbox: mpsc::Sender<Command<C>>,
    default_timeout: Timeout,
}

impl<C: Connector> Pool<C> {
    /// Starts building a pool with the given connector.
    pub fn builder() -> PoolBuilder<C> {
        PoolBuilder::new()
    }

    /// Checks out a connection using this pool's default timeout and
    /// queueing enabled, the common case.
    pub async fn checkout(&self) -> Result<Handle<C>, crate::error::PoolError<C::Error>> {
        self.checkout_with(CheckoutOptions::new().timeout(self.default_timeout))
            .await
    }

    /// Checks out a connection with caller-specified options (§6).
    pub async fn checkout_with(
        &self,
        options: CheckoutOptions,
    ) -> Result<Handle<C>, crate::error::PoolError<C::Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (watch_tx, watch_rx) = oneshot::channel();

        self.mailbox
            .send(Command::Checkout {
                options,
                reply_tx,
                watch_rx,
            })
            .await
            .map_err(|_| crate::error::PoolError::Unavailable)?;

        let result = reply_rx.await;
        // Keep the watchdog sender alive for the whole wait: dropping it
        // here (rather than earlier) is what lets the broker tell a
        // genuinely cancelled checkout apart from one that's merely
        // still awaiting its reply.
        drop(watch_tx);

        match result {
            Ok(Ok(grant)) => Ok(Handle {
                pool: self.clone(),
                holder_id: grant.holder.id(),
                conn: Some(grant.holder.conn),
                module: Some(grant.holder.module),
                state: Some(grant.holder.state),
                deadline_at: grant.deadline_at,
                resolved: false,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(crate::error::PoolError::Unavailable),
        }
    }

    /// Runs `f` against a checked-out connection, checking it back in
    /// automatically on success and disconnecting it on error — the
    /// ambient convenience the teacher's `Pool::run` provides.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, crate::error::PoolError<C::Error>>
    where
        F: FnOnce(&mut C::Connection, &mut C::Module, &mut C::State) -> Fut,
        Fut: Future<Output = Result<T, C::Error>>,
    {
        let mut handle = self.checkout().await?;
        match f(handle.conn_mut(), handle.module_mut(), handle.state_mut()).await {
            Ok(value) => {
                handle.checkin();
                Ok(value)
            }
            Err(err) => {
                handle.disconnect(None);
                Err(crate::error::PoolError::User(err))
            }
        }
    }

    /// A snapshot of this pool's connection/waiter counts (§6).
    pub async fn state(&self) -> Option<PoolState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox.send(Command::State { reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }
}

/// A checked-out connection. Structurally enforces the "idempotent
/// checkin/disconnect" invariant (§8 property 7) one step further than
/// the source: `checkin`/`disconnect`/`stop` consume `self`, so calling
/// either twice is a compile error rather than a runtime no-op.
///
/// A `Handle` dropped without an explicit resolution is treated as a
/// disconnect: see the `Drop` impl below.
pub struct Handle<C: Connector> {
    pool: Pool<C>,
    holder_id: HolderId,
    conn: Option<C::Connection>,
    module: Option<C::Module>,
    state: Option<C::State>,
    deadline_at: Option<Instant>,
    resolved: bool,
}

impl<C: Connector> Handle<C> {
    /// The live connection.
    pub fn conn(&self) -> &C::Connection {
        self.conn.as_ref().expect("conn taken only by into_parts")
    }

    /// The live connection, mutably.
    pub fn conn_mut(&mut self) -> &mut C::Connection {
        self.conn.as_mut().expect("conn taken only by into_parts")
    }

    /// The protocol/strategy module recorded at install time.
    pub fn module(&self) -> &C::Module {
        self.module.as_ref().expect("module taken only by into_parts")
    }

    pub fn module_mut(&mut self) -> &mut C::Module {
        self.module.as_mut().expect("module taken only by into_parts")
    }

    /// Caller-visible state, round-tripped across checkouts.
    pub fn state(&self) -> &C::State {
        self.state.as_ref().expect("state taken only by into_parts")
    }

    pub fn state_mut(&mut self) -> &mut C::State {
        self.state.as_mut().expect("state taken only by into_parts")
    }

    /// The instant at which the broker will forcibly reclaim this
    /// checkout if it hasn't been returned by then, if any deadline was
    /// armed. A well-behaved caller races its own I/O against this with
    /// `tokio::time::timeout_at` rather than discovering the reclaim only
    /// when it next tries to check the connection back in.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline_at
    }

    /// Returns the connection to the pool for reuse.
    pub fn checkin(mut self) {
        self.resolved = true;
        let mailbox = self.pool.mailbox.clone();
        let holder_id = self.holder_id;
        let conn = self.conn.take().expect("conn present until resolved");
        let module = self.module.take().expect("module present until resolved");
        let state = self.state.take().expect("state present until resolved");
        tokio::spawn(async move {
            let _ = mailbox
                .send(Command::Checkin {
                    holder_id,
                    conn,
                    module,
                    state,
                })
                .await;
        });
    }

    /// Tears the connection down; the owning supervisor slot reconnects.
    pub fn disconnect(mut self, err: Option<C::Error>) {
        self.resolved = true;
        self.conn.take();
        self.module.take();
        self.state.take();
        let mailbox = self.pool.mailbox.clone();
        let holder_id = self.holder_id;
        tokio::spawn(async move {
            let _ = mailbox.send(Command::Disconnect { holder_id, err }).await;
        });
    }

    /// Tears the connection down permanently; the owning supervisor slot
    /// does not reconnect.
    pub fn stop(mut self, err: Option<C::Error>) {
        self.resolved = true;
        self.conn.take();
        self.module.take();
        self.state.take();
        let mailbox = self.pool.mailbox.clone();
        let holder_id = self.holder_id;
        tokio::spawn(async move {
            let _ = mailbox.send(Command::Stop { holder_id, err }).await;
        });
    }
}

impl<C: Connector> Drop for Handle<C> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // A handle dropped without an explicit checkin/disconnect/stop
        // (a panic unwinding through caller code, most commonly) is
        // treated as a disconnect: safer to reconnect a slot than to
        // assume a connection left in an unknown state is still good.
        if let (Some(conn), Some(module), Some(state)) =
            (self.conn.take(), self.module.take(), self.state.take())
        {
            drop(conn);
            drop(module);
            drop(state);
        }
        let mailbox = self.pool.mailbox.clone();
        let holder_id = self.holder_id;
        tokio::spawn(async move {
            let _ = mailbox.send(Command::Disconnect { holder_id, err: None }).await;
        });
    }
}
