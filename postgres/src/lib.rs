//! A [`codel_pool::Connector`] backed by `tokio-postgres`.

use async_trait::async_trait;
use codel_pool::Connector;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{Config, Socket};

/// Connects by cloning a [`tokio_postgres::Config`] and spawning the
/// resulting connection's driver future onto the current runtime, the
/// same pattern `tokio_postgres::connect` itself recommends.
pub struct PostgresConnector<T> {
    config: Config,
    tls: T,
}

impl<T> PostgresConnector<T> {
    pub fn new(config: Config, tls: T) -> Self {
        PostgresConnector { config, tls }
    }
}

impl<T> std::fmt::Debug for PostgresConnector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> Connector for PostgresConnector<T>
where
    T: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    T::Stream: Send + 'static,
    T::TlsConnect: Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    type Connection = tokio_postgres::Client;
    type State = ();
    type Module = ();
    type Error = tokio_postgres::Error;

    async fn connect(&self) -> Result<(Self::Connection, Self::Module, Self::State), Self::Error> {
        let (client, connection) = self.config.connect(self.tls.clone()).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(%err, "postgres connection driver exited with an error");
            }
        });
        Ok((client, (), ()))
    }

    async fn is_valid(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, (Self::Error, Self::Connection)> {
        match conn.simple_query("").await {
            Ok(_) => Ok(conn),
            Err(err) => Err((err, conn)),
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}
