//! A [`codel_pool::Connector`] backed by `redis`'s async multiplexed
//! connection.

use async_trait::async_trait;
use codel_pool::Connector;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// Connects via [`redis::Client::get_multiplexed_tokio_connection`]. A
/// multiplexed connection is itself cheaply cloneable and already
/// pipelines concurrent commands, but the pool still gives callers
/// exclusive possession of one for the duration of a checkout so command
/// ordering within a checkout is never interleaved with another caller's.
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    pub fn new(client: Client) -> Self {
        RedisConnector { client }
    }
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;
    type State = ();
    type Module = ();
    type Error = redis::RedisError;

    async fn connect(&self) -> Result<(Self::Connection, Self::Module, Self::State), Self::Error> {
        let conn = self.client.get_multiplexed_tokio_connection().await?;
        Ok((conn, (), ()))
    }

    async fn is_valid(
        &self,
        mut conn: Self::Connection,
    ) -> Result<Self::Connection, (Self::Error, Self::Connection)> {
        match redis::cmd("PING").query_async::<_, ()>(&mut conn).await {
            Ok(()) => Ok(conn),
            Err(err) => Err((err, conn)),
        }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
