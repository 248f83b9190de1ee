//! # Tabular Crate
//!
//! A single cursor interface, [`DataProvider`], over rows of named columns,
//! whatever their origin:
//!
//! - [`SqlDataProvider`]: the rows of a PostgreSQL query result.
//! - [`DataSetProvider`]: rows held in memory, built by hand with
//!   [`DataSetBuilder`] or copied out of another provider.
//! - [`CsvDataProvider`]: delimited text read line by line.
//!
//! Cells are [`Value`]s and the typed accessors (`get_int`, `get_instant`,
//! `get_double_array`, ...) coerce them with the rules in [`coercion`]. A
//! cursor starts before its first row and never advances by itself.

pub mod coercion;
pub mod columns;
pub mod csv;
pub mod dataset;
pub mod error;
pub mod provider;
pub mod sql;
pub mod value;

pub use columns::ColumnIndex;
pub use csv::CsvDataProvider;
pub use dataset::{DataSetBuilder, DataSetProvider};
pub use error::DataError;
pub use provider::DataProvider;
pub use sql::SqlDataProvider;
pub use value::Value;
