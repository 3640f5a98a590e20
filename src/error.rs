use std::fmt;
use std::time::Duration;

/// bb8's error type, renamed and widened to cover the CoDel broker's boundary
/// error vocabulary.
///
/// `PoolError::User` plays the role the teacher's `RunError::User` played:
/// it carries whatever error the `Connector` produced. The remaining
/// variants are specific to the checkout broker described alongside this
/// crate and have no equivalent in a semaphore-based pool.
#[derive(Debug)]
pub enum PoolError<E> {
    /// An error returned from connector/user code.
    User(E),
    /// `queue = false` was requested and no connection was idle.
    Unavailable,
    /// The CoDel controller shed this waiter, or the dequeue attempt was
    /// abandoned because the client died while queued.
    Dropped {
        /// How long the request had been queued when it was dropped.
        elapsed: Duration,
    },
    /// The holder was handed off after the caller's deadline had already
    /// elapsed; the holder has already been returned to the broker unused.
    DeadlineInQueue,
    /// An active checkout exceeded its deadline. The connection backing it
    /// has already been torn down and the connector notified to respawn.
    Timeout {
        /// How long the checkout had been active when it was reclaimed.
        elapsed: Duration,
    },
    /// The broker refused to hand a holder to a recipient it cannot
    /// transfer ownership to (e.g. a recipient that belongs to a foreign
    /// broker instance).
    ForeignOwner,
}

impl<E> fmt::Display for PoolError<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::User(ref err) => write!(f, "{}", err),
            PoolError::Unavailable => write!(f, "no connection was idle and queueing was disabled"),
            PoolError::Dropped { elapsed } => {
                write!(f, "request dropped by the queue after {:?}", elapsed)
            }
            PoolError::DeadlineInQueue => write!(
                f,
                "a connection was handed off after the caller's deadline had elapsed"
            ),
            PoolError::Timeout { elapsed } => {
                write!(f, "checkout exceeded its deadline after {:?}", elapsed)
            }
            PoolError::ForeignOwner => {
                write!(f, "cannot transfer this holder to a foreign owner")
            }
        }
    }
}

impl<E> std::error::Error for PoolError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::User(ref err) => Some(err),
            _ => None,
        }
    }
}

impl<E> PoolError<E> {
    /// True for errors that mean the queue shed this request rather than
    /// ever handing it a connection.
    pub fn is_dropped(&self) -> bool {
        matches!(self, PoolError::Dropped { .. })
    }
}
