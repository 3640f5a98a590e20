use std::time::Duration;

use tokio::time::Instant;

/// CoDel (Controlled Delay) state, process-global for the pool's
/// lifetime. Mirrors the classic active-queue-management algorithm:
/// measure the minimum head-of-line delay over a sliding `interval`, and
/// only authorise shedding once that minimum has persistently exceeded
/// `target`.
pub(crate) struct CodelState {
    /// Acceptable head-of-line delay.
    pub(crate) target: Duration,
    /// Measurement window.
    pub(crate) interval: Duration,
    /// Period for idle-connection pings.
    pub(crate) idle_interval: Duration,
    /// Most recent observed (minimum-in-window) head-of-line delay.
    pub(crate) delay: Duration,
    /// Whether drops are currently authorised on checkin.
    pub(crate) slow: bool,
    /// Monotonic timestamp after which the next CoDel decision may be
    /// taken.
    pub(crate) next_check: Instant,
    /// The wait-queue head key the poll timer saw the last time it fired,
    /// used to tell "no progress since last poll" apart from "a waiter
    /// was already served and a new one is now at the head".
    pub(crate) poll_cursor: Option<(Instant, u64)>,
    /// The ready-queue head key the idle timer saw the last time it
    /// fired, same purpose as `poll_cursor` but for idle pings.
    pub(crate) idle_cursor: Option<(Instant, super::holder::HolderId)>,
}

impl CodelState {
    pub(crate) fn new(target: Duration, interval: Duration, idle_interval: Duration) -> Self {
        let now = Instant::now();
        CodelState {
            target,
            interval,
            idle_interval,
            delay: Duration::ZERO,
            slow: false,
            next_check: now + interval,
            poll_cursor: None,
            idle_cursor: None,
        }
    }

    /// §4.4 "First of interval": called from the checkin/dequeue path
    /// whenever `now >= next_check`. Seeds `delay` and sets `slow` from the
    /// freshly sampled head delay, and re-arms `next_check`.
    pub(crate) fn enter_interval(&mut self, now: Instant, head_submitted_at: Instant) {
        let observed = now.saturating_duration_since(head_submitted_at);
        self.delay = observed;
        self.slow = observed > self.target;
        self.next_check = now + self.interval;
    }

    /// Record the delay observed while handing a holder to a waiter,
    /// keeping the minimum seen in the current window (§4.4 pop
    /// semantics).
    pub(crate) fn note_dequeue_delay(&mut self, observed: Duration) {
        if observed < self.delay {
            self.delay = observed;
        }
    }

    /// Called when the wait queue drains entirely during a dequeue: the
    /// CoDel window resets along with the broker's transition to Ready.
    pub(crate) fn reset_on_drain(&mut self) {
        self.delay = Duration::ZERO;
    }
}
