use std::time::Duration;

/// The `timeout` checkout option (§6): either a bounded wait or an
/// intentionally unbounded one.
///
/// Preserves the source's `:infinity` timeout verbatim (see the open
/// question in the design notes): combined with `deadline: None` it
/// produces unbounded queueing. Callers that want a hard upper bound
/// should pass `Timeout::After` or set a `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait at most this long.
    After(Duration),
    /// Never time out waiting for a connection.
    Infinite,
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::After(Duration::from_millis(5000))
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// Options recognised by [`crate::pool::Pool::checkout`] (§6).
#[derive(Debug, Clone, Copy)]
pub struct CheckoutOptions {
    /// Whether to wait in the FIFO queue when no connection is idle.
    /// Defaults to `true`; when `false` an empty ready queue fails the
    /// checkout immediately with `Unavailable`.
    pub queue: bool,
    /// Maximum total wait, combined with `deadline` as
    /// `min(now + timeout, deadline)`.
    pub timeout: Timeout,
    /// An absolute monotonic deadline, if any.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        CheckoutOptions {
            queue: true,
            timeout: Timeout::default(),
            deadline: None,
        }
    }
}

impl CheckoutOptions {
    /// Start from the defaults (`queue: true`, `timeout: 5000ms`, no
    /// absolute deadline).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `queue`.
    pub fn queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    /// Set `timeout`.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Set an absolute monotonic `deadline`.
    pub fn deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub(crate) fn effective_deadline(&self, now: tokio::time::Instant) -> Option<tokio::time::Instant> {
        let from_timeout = match self.timeout {
            Timeout::After(d) => Some(now + d),
            Timeout::Infinite => None,
        };
        match (from_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}
