use crate::manager::LockFamily;
use std::time::Duration;
use thiserror::Error;

/// SQLSTATE codes meaning the session is gone but a new one may work:
/// connection exception, connection does not exist, connection failure and
/// admin shutdown.
pub const RECOVERABLE_SQL_STATES: [&str; 4] = ["08000", "08003", "08006", "57P01"];

/// A failure talking to the database over one lock connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Database error on a lock connection: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("The lock connection has been closed.")]
    Closed,

    #[error("Timed out after {0:?} waiting for the database.")]
    Timeout(Duration),
}

impl ConnectionError {
    /// The SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            ConnectionError::Sql(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }

    /// True when the session was lost rather than the statement rejected.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConnectionError::Closed => true,
            ConnectionError::Sql(sqlx::Error::Io(_)) => true,
            ConnectionError::Sql(_) => self
                .sql_state()
                .is_some_and(|state| RECOVERABLE_SQL_STATES.contains(&state.as_str())),
            ConnectionError::Timeout(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    /// Lock names must be in `1..i32::MAX`.
    #[error("Must pass a positive lock name less than {max}, not {0}", max = i32::MAX)]
    InvalidName(i32),

    #[error("Already holding the {family} lock {name}")]
    AlreadyHeld { family: LockFamily, name: i32 },

    #[error("A shared lock already exists on {0}")]
    SharedLockExists(i32),

    #[error("Must pass the name of a previously acquired {family} lock, not {name}")]
    NotHeld { family: LockFamily, name: i32 },

    /// The database refused to grant or release the advisory lock.
    #[error("The database refused to {action} the {family} lock {name} on connection {connection}")]
    Failed {
        family: LockFamily,
        name: i32,
        connection: &'static str,
        action: &'static str,
    },

    #[error("The {family} lock {name} was released concurrently by another caller")]
    ConcurrentUnlock { family: LockFamily, name: i32 },

    #[error("Lock {name} could not be managed on connection {connection}: {source}")]
    Connection {
        name: i32,
        connection: &'static str,
        #[source]
        source: ConnectionError,
    },

    #[error("Could not open a lock connection: {0}")]
    Unavailable(#[source] ConnectionError),
}

impl LockError {
    /// True for misuse by the caller: bad names, double locks, unlocking what
    /// was never locked. These are never worth retrying.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            LockError::InvalidName(_)
                | LockError::AlreadyHeld { .. }
                | LockError::SharedLockExists(_)
                | LockError::NotHeld { .. }
                | LockError::ConcurrentUnlock { .. }
        )
    }
}
