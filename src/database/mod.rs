use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Error as ErrReport};
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::utils::{apply_jitter, backoff_delay};

pub mod methods;
pub mod types;

// Statically link in migration files
static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_CAP: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_JITTER: f64 = 0.3;

/// Postgres error codes treated as transient connection failures:
/// admin shutdown family and connection-failure family.
const TRANSIENT_PG_CODES: &[&str] = &["57P01", "57P02", "57P03", "08003", "08006"];

/// Substrings of OS-level connection errors that warrant a retry.
const TRANSIENT_MESSAGES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "EPIPE",
    "socket hang up",
    "connection reset",
    "connection closed",
    "connection timed out",
];

pub struct Database {
    pub pool: Pool<Postgres>,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, ErrReport> {
        info!(url = %&config.database, "Connecting to database");

        // Create database if requested and does not exist
        if config.migrate && !Postgres::database_exists(config.database.expose()).await? {
            warn!(url = %&config.database, "Database does not exist, creating database");
            Postgres::create_database(config.database.expose()).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.acquire_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(config.database.expose())
            .await
            .context("error connecting to database")?;

        if config.migrate {
            info!(url = %&config.database, "Running migrations");
            MIGRATOR.run(&pool).await?;
        }

        info!(url = %&config.database, "Connected to database");

        Ok(Self { pool })
    }

    /// Runs `op`, retrying on transient connection errors with exponential
    /// backoff and jitter. Non-transient errors propagate immediately.
    ///
    /// This is the single place implementing connection resilience; callers
    /// wrap whole logical operations, not individual queries.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                    let delay = apply_jitter(backoff_delay(RETRY_BASE, RETRY_CAP, attempt), RETRY_JITTER);
                    warn!(
                        ?err,
                        attempt = attempt + 1,
                        ?delay,
                        "transient database error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("duplicate token value")]
    DuplicateToken,

    #[error("token settings row is missing")]
    MissingTokenSettings,

    #[error("video {id} not found")]
    VideoNotFound { id: i64 },
}

impl Error {
    /// Whether the error is a connection-level failure worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let Error::Database(err) = self else {
            return false;
        };

        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db_err) => db_err
                .code()
                .is_some_and(|code| TRANSIENT_PG_CODES.contains(&code.as_ref())),
            other => {
                let message = other.to_string();
                TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = Error::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));

        assert!(err.is_transient());
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = Error::Database(sqlx::Error::PoolTimedOut);

        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        let err = Error::Database(sqlx::Error::RowNotFound);

        assert!(!err.is_transient());
    }

    #[test]
    fn domain_errors_are_not_transient() {
        assert!(!Error::DuplicateToken.is_transient());
        assert!(!Error::VideoNotFound { id: 7 }.is_transient());
    }
}
