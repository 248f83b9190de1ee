//! # Locking Crate
//!
//! Named, process-wide locks for coordinating ingest, evaluation and
//! maintenance across every process sharing one PostgreSQL database.
//!
//! [`DatabaseLockManager`] turns each held name into a pair of advisory locks
//! on two dedicated sessions and keeps those sessions alive with a background
//! refresh task. Sessions come from a [`ConnectionProducer`]; in production
//! that is [`PgConnectionProducer`].

pub mod cell;
pub mod connection;
pub mod error;
pub mod manager;

#[cfg(test)]
mod testing;

pub use connection::{
    AdvisoryKey, ConnectionProducer, LockConnection, LockMode, PgConnectionProducer, PgLockConnection,
};
pub use error::{ConnectionError, LockError};
pub use manager::{
    lock_name_from_id, DatabaseLockManager, LockFamily, SHARED_READ_OR_EXCLUSIVE_DESTROY_NAME,
};
