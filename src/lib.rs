//! A connection pool whose checkout queue is moderated by CoDel
//! (Controlled Delay) rather than a plain FIFO semaphore.
//!
//! Under load, a semaphore-backed pool lets every waiter queue
//! indefinitely; once the queue is long enough that a connection handed
//! out now would be stale (the request upstream of it having already
//! given up) the pool is doing more harm than good by granting it at
//! all. This crate runs the classic active-queue-management algorithm
//! over the wait queue instead: once the minimum observed head-of-line
//! delay has persistently exceeded a small target, checkouts older than
//! twice that target are shed with [`PoolError::Dropped`] instead of
//! being served late.
//!
//! The pool is built around three pieces:
//!
//! - [`Connector`]: how to make, validate and recognize broken
//!   connections. Implement this for whatever you're pooling.
//! - [`Pool`]/[`PoolBuilder`]: the public handle applications hold and
//!   configure.
//! - [`Handle`]: a checked-out connection. `checkin`/`disconnect`/`stop`
//!   each consume it by value, so returning it twice is a compile error.
//!
//! ```no_run
//! # use codel_pool::{Connector, Pool};
//! # async fn run<C: Connector>(pool: Pool<C>) -> Result<(), Box<dyn std::error::Error>> {
//! let handle = pool.checkout().await?;
//! // use handle.conn_mut()
//! handle.checkin();
//! # Ok(())
//! # }
//! ```

mod broker;
mod codel;
mod connector;
mod error;
mod holder;
mod options;
mod pool;
mod ready_queue;
mod supervisor;
mod wait_queue;

pub use broker::PoolState;
pub use connector::{Connector, ErrorSink, NopErrorSink, TracingErrorSink};
pub use error::PoolError;
pub use holder::Teardown;
pub use options::{CheckoutOptions, Timeout};
pub use pool::{Handle, Pool, PoolBuilder};
