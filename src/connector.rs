use std::fmt;

use async_trait::async_trait;

/// A trait which provides connection-specific functionality.
///
/// This is the CoDel broker's external collaborator named "the Connector"
/// in the accompanying design: it establishes, health-checks and tears
/// down individual connections, but never touches the wait queue, the
/// ready queue or the CoDel state machine. Those live entirely in
/// [`crate::broker`].
///
/// `Module` is the protocol/strategy identifier threaded through each
/// [`crate::holder::Holder`] alongside the connection and its state; most
/// implementors can set it to `()`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection type this connector deals with.
    type Connection: Send + 'static;
    /// Caller-visible state handed back on checkout and written back on
    /// checkin (e.g. prepared statement caches).
    type State: Send + Default + 'static;
    /// Protocol/strategy descriptor recorded alongside the connection.
    type Module: Clone + Send + Sync + 'static;
    /// The error type returned by `Connection`s.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempts to create a new connection.
    async fn connect(&self) -> Result<(Self::Connection, Self::Module, Self::State), Self::Error>;

    /// Determines if the connection is still connected to the database.
    /// Used by the idle-ping loop (`codel_idle_tick`); connections that
    /// fail validation are disconnected and the connector respawns them.
    async fn is_valid(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, (Self::Error, Self::Connection)>;

    /// Synchronously determine if the connection is no longer usable, if
    /// possible, without a round trip to the database.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;
}

/// A trait to receive errors generated by connection management that
/// aren't tied to any particular caller (connect failures, idle-ping
/// failures, forced disconnects raised by the broker itself).
pub trait ErrorSink<E>: fmt::Debug + Send + Sync + 'static {
    /// Receive an error.
    fn sink(&self, error: E);

    /// Clone this sink.
    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>>;
}

/// An `ErrorSink` implementation that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopErrorSink;

impl<E> ErrorSink<E> for NopErrorSink {
    fn sink(&self, _: E) {}

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(*self)
    }
}

/// An `ErrorSink` implementation that forwards errors to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl<E> ErrorSink<E> for TracingErrorSink
where
    E: fmt::Display,
{
    fn sink(&self, error: E) {
        tracing::warn!(%error, "connector reported an error outside of any checkout");
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(*self)
    }
}
