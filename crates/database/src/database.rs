use crate::connection::{connect, connect_options};
use crate::error::DbError;
use crate::query::Query;
use configuration::{DatabaseSettings, LockingSettings};
use indicatif::{ProgressBar, ProgressStyle};
use locking::{DatabaseLockManager, PgConnectionProducer};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolCopyExt};
use sqlx::{PgPool, Postgres};
use std::sync::Arc;
use tabular::{DataProvider, DataSetProvider, SqlDataProvider, Value};

/// Rows sent to the server per `COPY` data message.
const COPY_BATCH_ROWS: usize = 1_000;

/// The application's access point to PostgreSQL.
///
/// Holds two pools: the standard one for most work and a smaller one for
/// latency-sensitive queries, so those never queue behind bulk ingest. The
/// advisory lock manager gets its own connections outside both.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    high_priority_pool: PgPool,
    options: PgConnectOptions,
}

impl Database {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        let options = connect_options(settings)?;
        let pool = connect(settings, options.clone(), settings.max_pool_size).await?;
        let high_priority_pool = connect(
            settings,
            options.clone(),
            settings.max_high_priority_pool_size,
        )
        .await?;

        tracing::info!(
            host = options.get_host(),
            database = options.get_database().unwrap_or_default(),
            "Connected to the database."
        );
        Ok(Self {
            pool,
            high_priority_pool,
            options,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connection(&self) -> Result<PoolConnection<Postgres>, DbError> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn high_priority_connection(&self) -> Result<PoolConnection<Postgres>, DbError> {
        Ok(self.high_priority_pool.acquire().await?)
    }

    fn pool_for(&self, query: &Query) -> &PgPool {
        if query.is_high_priority() {
            &self.high_priority_pool
        } else {
            &self.pool
        }
    }

    /// Runs the query and returns a cursor over its complete result.
    pub async fn buffer(&self, query: &Query) -> Result<SqlDataProvider, DbError> {
        let rows = query.fetch_all(self.pool_for(query)).await?;
        tracing::trace!(rows = rows.len(), "Buffered query result.");
        Ok(SqlDataProvider::new(rows))
    }

    /// Like [`Database::buffer`] but detached from the driver's row type.
    pub async fn get_data(&self, query: &Query) -> Result<DataSetProvider, DbError> {
        let mut provider = self.buffer(query).await?;
        let data = DataSetProvider::from_provider(&mut provider)?;
        provider.close();
        Ok(data)
    }

    /// Runs a script and returns the number of rows it affected.
    pub async fn execute(&self, query: &Query) -> Result<u64, DbError> {
        query.execute(self.pool_for(query)).await
    }

    /// The first column of the first row, or `None` for an empty result.
    pub async fn scalar(&self, query: &Query) -> Result<Option<Value>, DbError> {
        let mut provider = self.buffer(query).await?;
        if !provider.next()? {
            return Ok(None);
        }
        let value = provider.row_values()?.into_iter().next();
        provider.close();
        Ok(value)
    }

    /// Updates planner statistics, reclaiming dead rows first when `vacuum` is set.
    pub async fn refresh_statistics(&self, vacuum: bool) -> Result<(), DbError> {
        let script = if vacuum { "VACUUM ANALYZE" } else { "ANALYZE" };
        tracing::info!(script, "Refreshing database statistics.");
        sqlx::raw_sql(script).execute(&self.pool).await?;
        Ok(())
    }

    /// Builds a lock manager whose two connections are opened directly rather
    /// than borrowed from a pool.
    pub async fn lock_manager(
        &self,
        settings: LockingSettings,
    ) -> Result<DatabaseLockManager, DbError> {
        let producer = Arc::new(PgConnectionProducer::new(self.options.clone()));
        Ok(DatabaseLockManager::new(producer, settings).await?)
    }

    /// Bulk loads rows into `table` with `COPY ... FROM STDIN`. Each row must
    /// have one entry per column; `None` loads a null.
    pub async fn copy(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Option<String>>],
        delimiter: char,
    ) -> Result<u64, DbError> {
        self.copy_batches(table, columns, rows, delimiter, None).await
    }

    /// Copies every remaining row of `provider` into the like-named columns of
    /// `table`, optionally drawing a progress bar.
    pub async fn copy_provider(
        &self,
        provider: &mut dyn DataProvider,
        table: &str,
        show_progress: bool,
    ) -> Result<u64, DbError> {
        let columns = provider.column_names()?;
        let rows = provider.copy_rows()?;
        provider.close();

        let progress_bar = if show_progress {
            let progress_bar = ProgressBar::new(rows.len() as u64);
            progress_bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                    .progress_chars("#>-"),
            );
            progress_bar.set_message(table.to_string());
            Some(progress_bar)
        } else {
            None
        };

        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let copied = self
            .copy_batches(table, &columns, &rows, '|', progress_bar.as_ref())
            .await;
        if let Some(progress_bar) = progress_bar {
            progress_bar.finish_with_message(format!("{table} done"));
        }
        copied
    }

    async fn copy_batches(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Option<String>>],
        delimiter: char,
        progress_bar: Option<&ProgressBar>,
    ) -> Result<u64, DbError> {
        let statement = copy_statement(table, columns, delimiter)?;
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(DbError::RowWidth {
                    table: table.to_string(),
                    row: i,
                    found: row.len(),
                    expected: columns.len(),
                });
            }
        }

        let copy_error = |source: sqlx::Error| DbError::Copy {
            table: table.to_string(),
            source,
        };
        let mut copy = self.pool.copy_in_raw(&statement).await.map_err(copy_error)?;
        for batch in rows.chunks(COPY_BATCH_ROWS) {
            let mut buffer = String::new();
            for row in batch {
                encode_row(&mut buffer, row, delimiter);
            }
            let sent = copy.send(buffer.into_bytes()).await.map(|_| ());
            if let Err(source) = sent {
                if let Err(abort_error) = copy.abort("client failed to send rows").await {
                    tracing::warn!(error = %abort_error, table, "Could not abort COPY.");
                }
                return Err(copy_error(source));
            }
            if let Some(progress_bar) = progress_bar {
                progress_bar.inc(batch.len() as u64);
            }
        }
        let copied = copy.finish().await.map_err(copy_error)?;

        tracing::debug!(table, rows = copied, "Finished COPY.");
        Ok(copied)
    }

    pub async fn close(&self) {
        self.high_priority_pool.close().await;
        self.pool.close().await;
        tracing::debug!("Closed database pools.");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("host", &self.options.get_host())
            .field("database", &self.options.get_database())
            .field("pool_size", &self.pool.size())
            .field("high_priority_pool_size", &self.high_priority_pool.size())
            .finish()
    }
}

fn copy_statement(table: &str, columns: &[&str], delimiter: char) -> Result<String, DbError> {
    validate_identifier(table)?;
    if columns.is_empty() {
        return Err(DbError::InvalidIdentifier(String::new()));
    }
    for column in columns {
        validate_identifier(column)?;
    }
    validate_delimiter(delimiter)?;
    Ok(format!(
        "COPY {table} ({}) FROM STDIN WITH (FORMAT text, DELIMITER '{delimiter}')",
        columns.join(", ")
    ))
}

/// Accepts plain, optionally schema-qualified names, never quoted ones.
fn validate_identifier(name: &str) -> Result<(), DbError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    };
    if name.split('.').all(valid_part) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

fn validate_delimiter(delimiter: char) -> Result<(), DbError> {
    let printable = delimiter == '\t' || (delimiter.is_ascii() && !delimiter.is_ascii_control());
    let reserved = delimiter.is_ascii_lowercase()
        || delimiter.is_ascii_digit()
        || matches!(delimiter, '\\' | '.' | 'N' | '\'');
    if printable && !reserved {
        Ok(())
    } else {
        Err(DbError::InvalidDelimiter(delimiter))
    }
}

/// Appends one row in `COPY` text format.
fn encode_row(buffer: &mut String, row: &[Option<String>], delimiter: char) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            buffer.push(delimiter);
        }
        match cell {
            None => buffer.push_str("\\N"),
            Some(text) => {
                for c in text.chars() {
                    match c {
                        '\\' => buffer.push_str("\\\\"),
                        '\n' => buffer.push_str("\\n"),
                        '\r' => buffer.push_str("\\r"),
                        '\t' => buffer.push_str("\\t"),
                        c if c == delimiter => {
                            buffer.push('\\');
                            buffer.push(c);
                        }
                        c => buffer.push(c),
                    }
                }
            }
        }
    }
    buffer.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(row: &[Option<&str>], delimiter: char) -> String {
        let row: Vec<Option<String>> = row.iter().map(|c| c.map(str::to_string)).collect();
        let mut buffer = String::new();
        encode_row(&mut buffer, &row, delimiter);
        buffer
    }

    #[test]
    fn rows_escape_delimiters_and_control_characters() {
        assert_eq!(encoded(&[Some("a"), None, Some("c")], '|'), "a|\\N|c\n");
        assert_eq!(encoded(&[Some("x|y"), Some("back\\slash")], '|'), "x\\|y|back\\\\slash\n");
        assert_eq!(encoded(&[Some("two\nlines\r"), Some("tab\there")], ','), "two\\nlines\\r,tab\\there\n");
        assert_eq!(encoded(&[Some("")], '|'), "\n");
    }

    #[test]
    fn copy_statement_names_table_columns_and_delimiter() {
        assert_eq!(
            copy_statement("wres.timeseriesvalue", &["timeseries_id", "lead", "value"], '|').unwrap(),
            "COPY wres.timeseriesvalue (timeseries_id, lead, value) FROM STDIN WITH (FORMAT text, DELIMITER '|')"
        );
    }

    #[test]
    fn identifiers_are_plain_names() {
        assert!(validate_identifier("wres.source").is_ok());
        assert!(validate_identifier("_tmp$1").is_ok());
        for bad in ["", "1abc", "wres.", "a b", "x;DROP TABLE y", "\"quoted\""] {
            assert!(
                matches!(validate_identifier(bad), Err(DbError::InvalidIdentifier(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            copy_statement("wres.source", &[], '|'),
            Err(DbError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn delimiters_must_be_unambiguous() {
        for ok in ['|', ',', '\t', ';'] {
            assert!(validate_delimiter(ok).is_ok(), "{ok:?} should be accepted");
        }
        for bad in ['\\', '\n', '\r', 'a', '7', 'N', '.', '\'', 'é'] {
            assert!(
                matches!(validate_delimiter(bad), Err(DbError::InvalidDelimiter(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
