//! # Database Crate
//!
//! The application's access point to PostgreSQL.
//!
//! - [`Database`]: a standard and a high-priority connection pool, cursors over
//!   query results, bulk `COPY`, and construction of the advisory lock manager.
//! - [`Query`]: a script with positional parameters that can run in a
//!   SERIALIZABLE transaction and be retried on chosen SQLSTATEs.
//! - [`DbError`]: the errors returned from this crate.

pub mod connection;
pub mod database;
pub mod error;
pub mod query;

pub use connection::{connect, connect_options};
pub use database::Database;
pub use error::DbError;
pub use query::{Query, SERIALIZATION_FAILURE};
