use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("The data set is inaccessible because it has been closed.")]
    Closed,

    #[error("There is no current row; the cursor must be moved onto a row with next() first.")]
    NoCurrentRow,

    #[error("There is no column in the data set named '{0}'")]
    UnknownColumn(String),

    #[error("Row {index} is out of range for a data set of {count} rows")]
    RowOutOfRange { index: usize, count: usize },

    /// A value could not be coerced to the requested type.
    #[error("The {type_name} value '{value}' in the column '{column}' cannot be cast as {target}.")]
    Cast {
        column: String,
        value: String,
        type_name: &'static str,
        target: &'static str,
    },

    #[error("The column '{column}' has the unsupported database type {type_name}")]
    UnsupportedType { column: String, type_name: String },

    #[error("The '{0}' operation is not supported by this data source.")]
    Unsupported(&'static str),

    #[error("There isn't any data to read in {0}")]
    EmptySource(String),

    #[error("I/O error while reading tabular data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error while reading tabular data: {0}")]
    Sql(#[from] sqlx::Error),
}

impl DataError {
    /// True for errors caused by using a cursor in the wrong state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, DataError::Closed | DataError::NoCurrentRow)
    }
}
