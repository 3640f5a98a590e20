//! Connects, installs, and reconnects: the event-driven analogue of the
//! teacher's reaper-plus-`add_connection` pair, folded into a single loop
//! per slot instead of a fixed-size pool of eagerly spawned connections.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::broker::Command;
use crate::connector::{Connector, ErrorSink};
use crate::holder::Teardown;

/// Runs one connection slot for the lifetime of the pool: connect, install,
/// wait to be told the holder was torn down, then connect again. A pool
/// with `min_idle` slots configured spawns this many times at startup
/// (§4.1); nothing else ever spawns a slot.
pub(crate) async fn run_slot<C: Connector>(
    connector: Arc<C>,
    mailbox: mpsc::Sender<Command<C>>,
    error_sink: Arc<dyn ErrorSink<C::Error>>,
    name: String,
) {
    loop {
        if mailbox.is_closed() {
            return;
        }
        let (conn, module, state) = connect_with_retry(&connector, &error_sink, &name).await;

        let (teardown_tx, teardown_rx) = oneshot::channel();
        if mailbox
            .send(Command::Install {
                conn,
                module,
                state,
                teardown_tx,
            })
            .await
            .is_err()
        {
            return;
        }

        match teardown_rx.await {
            Ok(Teardown::Disconnect(err)) => {
                if let Some(err) = err {
                    error_sink.sink(err);
                }
                // loop back around and reconnect
            }
            Ok(Teardown::Stop(err)) => {
                if let Some(err) = err {
                    error_sink.sink(err);
                }
                return;
            }
            Err(_) => {
                // Broker shut down without ever resolving this holder's
                // fate (e.g. pool dropped mid-checkout). Nothing left to
                // supervise.
                return;
            }
        }
    }
}

/// Retries `connect` with a capped exponential backoff until it succeeds
/// or the mailbox is gone, mirroring the teacher's `schedule_one_reaping`
/// retry posture rather than giving up after a fixed number of attempts:
/// a pool is expected to eventually recover once the backing service does.
async fn connect_with_retry<C: Connector>(
    connector: &Arc<C>,
    error_sink: &Arc<dyn ErrorSink<C::Error>>,
    name: &str,
) -> (C::Connection, C::Module, C::State) {
    let mut backoff = std::time::Duration::from_millis(10);
    let max_backoff = std::time::Duration::from_secs(10);
    loop {
        match connector.connect().await {
            Ok(triple) => return triple,
            Err(err) => {
                tracing::warn!(pool = %name, backoff = ?backoff, "connect failed, retrying");
                error_sink.sink(err);
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, max_backoff);
            }
        }
    }
}
