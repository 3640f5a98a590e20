//! End-to-end tests against a small in-memory connector, run under
//! paused virtual time so the CoDel and deadline behaviour is
//! deterministic.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use codel_pool::{CheckoutOptions, Connector, Pool, PoolError, Timeout};

#[derive(Debug, Default)]
struct CountingConnector {
    connects: AtomicU32,
    validations: AtomicU32,
}

#[async_trait]
impl Connector for CountingConnector {
    type Connection = u32;
    type State = ();
    type Module = ();
    type Error = Infallible;

    async fn connect(&self) -> Result<(Self::Connection, Self::Module, Self::State), Self::Error> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst);
        Ok((id, (), ()))
    }

    async fn is_valid(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, (Self::Error, Self::Connection)> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[tokio::test(start_paused = true)]
async fn checkout_and_checkin_reuses_the_same_connection() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .build(CountingConnector::default());

    let h1 = pool.checkout().await.unwrap();
    let first_conn = *h1.conn();
    h1.checkin();

    // give the broker a turn to process the checkin before checking out
    // again
    tokio::task::yield_now().await;

    let h2 = pool.checkout().await.unwrap();
    assert_eq!(*h2.conn(), first_conn);
    h2.checkin();
}

#[tokio::test(start_paused = true)]
async fn second_checkout_queues_until_the_first_is_returned() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .build(CountingConnector::default());

    let h1 = pool.checkout().await.unwrap();

    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.checkout().await });

    tokio::time::sleep(Duration::from_millis(1)).await;
    h1.checkin();

    let h2 = waiter.await.unwrap().unwrap();
    h2.checkin();
}

#[tokio::test(start_paused = true)]
async fn queue_false_fails_fast_when_nothing_is_idle() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .build(CountingConnector::default());

    let h1 = pool.checkout().await.unwrap();

    let err = pool
        .checkout_with(codel_pool::CheckoutOptions::new().queue(false))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Unavailable));

    h1.checkin();
}

#[tokio::test(start_paused = true)]
async fn an_overdue_checkout_is_reclaimed_and_a_replacement_connects() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .build(CountingConnector::default());

    let options = codel_pool::CheckoutOptions::new().timeout(Duration::from_millis(50));
    let handle = pool.checkout_with(options).await.unwrap();
    let deadline = handle.deadline().expect("a finite timeout arms a deadline");

    // never check the handle back in: let the deadline fire and force a
    // reclaim, then confirm the pool is serving connections again.
    std::mem::forget(handle);

    tokio::time::sleep_until(deadline + Duration::from_millis(10)).await;
    tokio::task::yield_now().await;

    let next = tokio::time::timeout(Duration::from_secs(1), pool.checkout())
        .await
        .expect("pool should recover after the deadline reclaim")
        .unwrap();
    next.checkin();
}

#[tokio::test(start_paused = true)]
async fn codel_slow_mode_drops_stale_waiters_under_sustained_overload() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .queue_target(Duration::from_millis(50))
        .queue_interval(Duration::from_millis(1000))
        .build(CountingConnector::default());

    // Hold the only connection for the whole scenario.
    let holder = pool.checkout().await.unwrap();

    // Ten waiters queue at t=0 with no timeout, mirroring scenario 3.
    let mut waiters = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        waiters.push(tokio::spawn(async move {
            pool.checkout_with(CheckoutOptions::new().timeout(Timeout::Infinite))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    // The first poll tick (t=1000) only arms `poll_cursor` against the
    // still-waiting head; it takes a second tick (t=2000) with no
    // progress in between to recognise the stall, enter slow mode, and
    // drop-slow every waiter older than `2 * target` (§4.5).
    tokio::time::advance(Duration::from_millis(2000)).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_dropped(), "expected Dropped, got {err:?}");
    }

    holder.checkin();
}

#[tokio::test(start_paused = true)]
async fn a_client_that_dies_while_queued_is_skipped_without_disturbing_the_next_waiter() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .build(CountingConnector::default());

    let holder = pool.checkout().await.unwrap();

    // C1 queues, then its task is aborted before a connection ever reaches
    // it (scenario 4: "client death before handoff").
    let dying_pool = pool.clone();
    let dying = tokio::spawn(async move { dying_pool.checkout().await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    dying.abort();
    let _ = dying.await;

    // C2 queues after C1 has died.
    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.checkout().await });
    tokio::time::sleep(Duration::from_millis(5)).await;

    holder.checkin();

    let h2 = waiter.await.unwrap().unwrap();
    h2.checkin();
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_pinged_and_rejoin_the_ready_queue() {
    let pool = Pool::<CountingConnector>::builder()
        .min_idle(1)
        .idle_interval(Duration::from_millis(1000))
        .build(CountingConnector::default());

    let holder = pool.checkout().await.unwrap();
    let conn = *holder.conn();
    holder.checkin();
    tokio::task::yield_now().await;

    // Idle since t=0; as with the poll ticker, the first idle tick (t=1000)
    // only arms `idle_cursor` against the still-idle head, and the ping
    // fires on the second tick (t=2000) once no activity is observed in
    // between (§4.5 scenario 6).
    tokio::time::advance(Duration::from_millis(2000)).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    let next = pool.checkout().await.unwrap();
    // The ping round-trips the same connection back into the ready queue
    // rather than forcing a reconnect.
    assert_eq!(*next.conn(), conn);
    next.checkin();
}
