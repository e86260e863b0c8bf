// src/core/postgres/query.rs

//! The cached SQL channel to the local server.
//!
//! One persistent connection is kept and lazily re-established. Transport
//! failures are retried; an error the server itself reported on a live
//! connection is surfaced immediately.

use crate::core::errors::StewardError;
use std::time::Duration;
use tokio::time::sleep;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub(super) struct QueryChannel {
    config: tokio_postgres::Config,
    client: Option<Client>,
}

impl QueryChannel {
    pub(super) fn new(config: tokio_postgres::Config) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub(super) fn disconnect(&mut self) {
        self.client = None;
    }

    async fn client(&mut self) -> Result<&Client, tokio_postgres::Error> {
        if self.client.as_ref().is_none_or(|c| c.is_closed()) {
            let (client, connection) = self.config.connect(NoTls).await?;
            // The connection task owns the socket; dropping the client ends it.
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("Local SQL connection task ended: {e}");
                }
            });
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("client was just set"))
    }

    /// Runs one statement. The connection is re-established and the statement
    /// retried up to 3 times, 5 seconds apart, when the failure is
    /// transport-level.
    pub(super) async fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, StewardError> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt != 0 {
                sleep(RETRY_DELAY).await;
            }

            match self.client().await {
                Ok(client) => match client.query(sql, params).await {
                    Ok(rows) => return Ok(rows),
                    Err(e) => {
                        if e.as_db_error().is_some() && !client.is_closed() {
                            // the server answered on an open connection
                            return Err(e.into());
                        }
                        warn!("Query failed on a dead connection: {e}");
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!("Could not connect to the local server: {e}");
                    last_error = Some(e);
                }
            }

            self.disconnect();
        }

        Err(last_error.expect("at least one attempt ran").into())
    }
}
