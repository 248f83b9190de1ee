use crate::error::ConnectionError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::str::FromStr;
use std::time::Duration;

/// The identity of one PostgreSQL advisory lock.
///
/// The single `bigint` form and the `(int, int)` form live in separate key
/// spaces on the server, so the two never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AdvisoryKey {
    Single(i64),
    Pair(i32, i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// A session able to take and release advisory locks.
///
/// Advisory locks belong to the session, so the implementation must keep one
/// server session for its whole life.
#[async_trait]
pub trait LockConnection: Send {
    /// Tries to take the lock without waiting. `Ok(false)` means another
    /// session holds it.
    async fn try_advisory_lock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError>;

    /// Releases one hold of the lock. `Ok(false)` means this session did not hold it.
    async fn advisory_unlock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError>;

    /// Round-trips to the server within `timeout`. A timeout yields `Ok(false)`.
    async fn is_valid(&mut self, timeout: Duration) -> Result<bool, ConnectionError>;

    fn is_closed(&self) -> bool;

    /// Sends a statement the server will reject, so that its log carries a
    /// timestamped line to line up with ours.
    async fn mark_server_log(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Ends the session, releasing whatever it still holds. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Opens fresh lock connections, both at start-up and whenever the refresh
/// task finds one dead.
#[async_trait]
pub trait ConnectionProducer: Send + Sync {
    async fn produce(&self) -> Result<Box<dyn LockConnection>, ConnectionError>;
}

fn advisory_sql(key: AdvisoryKey, mode: LockMode, acquire: bool) -> String {
    let function = match (acquire, mode) {
        (true, LockMode::Exclusive) => "pg_try_advisory_lock",
        (true, LockMode::Shared) => "pg_try_advisory_lock_shared",
        (false, LockMode::Exclusive) => "pg_advisory_unlock",
        (false, LockMode::Shared) => "pg_advisory_unlock_shared",
    };
    match key {
        AdvisoryKey::Single(_) => format!("SELECT {function}($1)"),
        AdvisoryKey::Pair(_, _) => format!("SELECT {function}($1, $2)"),
    }
}

/// A dedicated PostgreSQL session used only for advisory locks.
pub struct PgLockConnection {
    connection: Option<PgConnection>,
    lost: bool,
}

impl PgLockConnection {
    pub fn new(connection: PgConnection) -> Self {
        Self {
            connection: Some(connection),
            lost: false,
        }
    }

    async fn advisory(&mut self, key: AdvisoryKey, mode: LockMode, acquire: bool) -> Result<bool, ConnectionError> {
        let connection = self.connection.as_mut().ok_or(ConnectionError::Closed)?;
        let sql = advisory_sql(key, mode, acquire);
        let query = sqlx::query_scalar::<_, bool>(&sql);
        let query = match key {
            AdvisoryKey::Single(id) => query.bind(id),
            AdvisoryKey::Pair(prefix, name) => query.bind(prefix).bind(name),
        };
        let result = query.fetch_one(connection).await.map_err(ConnectionError::from);
        if let Err(e) = &result {
            if e.is_recoverable() {
                self.lost = true;
            }
        }
        result
    }
}

#[async_trait]
impl LockConnection for PgLockConnection {
    async fn try_advisory_lock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError> {
        self.advisory(key, mode, true).await
    }

    async fn advisory_unlock(&mut self, key: AdvisoryKey, mode: LockMode) -> Result<bool, ConnectionError> {
        self.advisory(key, mode, false).await
    }

    async fn is_valid(&mut self, timeout: Duration) -> Result<bool, ConnectionError> {
        let connection = self.connection.as_mut().ok_or(ConnectionError::Closed)?;
        match tokio::time::timeout(timeout, connection.ping()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                self.lost = true;
                Err(e.into())
            }
            Err(_) => Ok(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.is_none() || self.lost
    }

    async fn mark_server_log(&mut self) -> Result<(), ConnectionError> {
        let connection = self.connection.as_mut().ok_or(ConnectionError::Closed)?;
        let statement = format!("It is now {}", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        tracing::warn!(
            "Connection is open but failed validation. About to send a statement that will fail, \
             so the server log records the time: {statement}"
        );
        if let Err(e) = sqlx::Executor::execute(&mut *connection, sqlx::raw_sql(&statement)).await {
            tracing::warn!("Finished attempting this invalid statement: {statement}: {e}");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.connection.take() {
            Some(connection) => Ok(connection.close().await?),
            None => Ok(()),
        }
    }
}

/// Opens each lock connection straight from connect options, outside of any pool.
#[derive(Debug, Clone)]
pub struct PgConnectionProducer {
    options: PgConnectOptions,
}

impl PgConnectionProducer {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        Ok(Self::new(PgConnectOptions::from_str(url)?))
    }
}

#[async_trait]
impl ConnectionProducer for PgConnectionProducer {
    async fn produce(&self) -> Result<Box<dyn LockConnection>, ConnectionError> {
        let connection = PgConnection::connect_with(&self.options).await?;
        tracing::debug!("Opened a new lock connection.");
        Ok(Box::new(PgLockConnection::new(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_statements_pick_the_function_and_arity() {
        assert_eq!(
            advisory_sql(AdvisoryKey::Single(7), LockMode::Exclusive, true),
            "SELECT pg_try_advisory_lock($1)"
        );
        assert_eq!(
            advisory_sql(AdvisoryKey::Pair(2, -7), LockMode::Exclusive, false),
            "SELECT pg_advisory_unlock($1, $2)"
        );
        assert_eq!(
            advisory_sql(AdvisoryKey::Pair(1, 7), LockMode::Shared, true),
            "SELECT pg_try_advisory_lock_shared($1, $2)"
        );
    }

    #[test]
    fn producer_rejects_malformed_urls() {
        assert!(PgConnectionProducer::from_url("not a url").is_err());
        assert!(PgConnectionProducer::from_url("postgres://wres@localhost/wres").is_ok());
    }
}
