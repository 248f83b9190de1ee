use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid database connection settings: {0}")]
    ConnectionConfigError(String),

    #[error("Failed to communicate with the database: {0}")]
    ConnectionError(#[from] sqlx::Error),

    /// SQLSTATE codes are five characters from `0-9` and `A-Z` without `I` or `O`.
    #[error("Valid SQLSTATE is exactly five digits or letters other than I and O, not '{0}'")]
    InvalidSqlState(String),

    #[error("Parameter {index} cannot be bound: {reason}")]
    InvalidParameter { index: usize, reason: String },

    #[error("{0:?} cannot delimit COPY data")]
    InvalidDelimiter(char),

    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("Row {row} has {found} values but {expected} columns were given for {table}")]
    RowWidth {
        table: String,
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("Copying into {table} failed: {source}")]
    Copy {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Tabular data error: {0}")]
    Data(#[from] tabular::DataError),

    #[error("Lock manager error: {0}")]
    Lock(#[from] locking::LockError),

    #[error("Progress bar template error: {0}")]
    ProgressBarTemplate(String),
}

impl From<indicatif::style::TemplateError> for DbError {
    fn from(error: indicatif::style::TemplateError) -> Self {
        DbError::ProgressBarTemplate(error.to_string())
    }
}

impl DbError {
    /// The SQLSTATE reported by the server, when the error came from it.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            DbError::ConnectionError(sqlx::Error::Database(db))
            | DbError::Copy {
                source: sqlx::Error::Database(db),
                ..
            } => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }
}
