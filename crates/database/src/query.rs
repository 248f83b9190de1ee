use crate::error::DbError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres};
use std::collections::BTreeSet;
use std::future::Future;
use tabular::Value;

/// SQLSTATE raised when a serializable transaction loses a conflict.
pub const SERIALIZATION_FAILURE: &str = "40001";

type Statement<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// A script with positional parameters and the rules for running it.
///
/// ```
/// use database::Query;
///
/// let query = Query::new("UPDATE wres.source SET is_complete = true WHERE source_id = $1")
///     .bind(42_i64)
///     .serializable();
/// assert!(query.is_in_transaction());
/// assert!(query.retry_states().contains("40001"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    parameters: Vec<Value>,
    in_transaction: bool,
    retry_states: BTreeSet<String>,
    high_priority: bool,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
            in_transaction: false,
            retry_states: BTreeSet::new(),
            high_priority: false,
        }
    }

    /// Appends the next positional parameter, `$1` first.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Runs the script inside a SERIALIZABLE transaction.
    pub fn in_transaction(mut self) -> Self {
        self.in_transaction = true;
        self
    }

    /// Re-runs the script for as long as it fails with this SQLSTATE.
    pub fn retry_on_sql_state(mut self, sql_state: &str) -> Result<Self, DbError> {
        let code = sql_state.to_ascii_uppercase();
        if !is_valid_sql_state(&code) {
            return Err(DbError::InvalidSqlState(sql_state.to_string()));
        }
        self.retry_states.insert(code);
        Ok(self)
    }

    /// A SERIALIZABLE transaction retried on serialization failure.
    pub fn serializable(mut self) -> Self {
        self.in_transaction = true;
        self.retry_states.insert(SERIALIZATION_FAILURE.to_string());
        self
    }

    /// Routes the query to the small pool kept for latency-sensitive work.
    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn retry_states(&self) -> &BTreeSet<String> {
        &self.retry_states
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub(crate) async fn fetch_all(&self, pool: &PgPool) -> Result<Vec<PgRow>, DbError> {
        self.retrying(|| self.fetch_once(pool)).await
    }

    pub(crate) async fn execute(&self, pool: &PgPool) -> Result<u64, DbError> {
        self.retrying(|| self.execute_once(pool)).await
    }

    async fn retrying<T, F, Fut>(&self, mut attempt: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempts: u64 = 1;
        loop {
            match attempt().await {
                Err(e) if self.should_retry(&e) => {
                    tracing::debug!(
                        attempts,
                        sql_state = e.sql_state().as_deref().unwrap_or_default(),
                        "Retrying query after a retryable failure."
                    );
                    attempts += 1;
                    tokio::task::yield_now().await;
                }
                outcome => return outcome,
            }
        }
    }

    fn should_retry(&self, error: &DbError) -> bool {
        error
            .sql_state()
            .is_some_and(|state| self.retry_states.contains(&state))
    }

    async fn fetch_once(&self, pool: &PgPool) -> Result<Vec<PgRow>, DbError> {
        if !self.in_transaction {
            return Ok(self.statement()?.fetch_all(pool).await?);
        }
        let mut tx = pool.begin().await?;
        set_serializable(&mut tx).await?;
        let rows = self.statement()?.fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn execute_once(&self, pool: &PgPool) -> Result<u64, DbError> {
        // Parameterless scripts may hold several statements, which only the
        // simple query protocol accepts.
        if !self.in_transaction {
            let result = if self.parameters.is_empty() {
                sqlx::raw_sql(&self.sql).execute(pool).await?
            } else {
                self.statement()?.execute(pool).await?
            };
            return Ok(result.rows_affected());
        }

        let mut tx = pool.begin().await?;
        set_serializable(&mut tx).await?;
        let result = if self.parameters.is_empty() {
            sqlx::raw_sql(&self.sql).execute(&mut *tx).await?
        } else {
            self.statement()?.execute(&mut *tx).await?
        };
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    fn statement(&self) -> Result<Statement<'_>, DbError> {
        self.parameters
            .iter()
            .enumerate()
            .try_fold(sqlx::query(&self.sql), |statement, (i, value)| {
                bind_value(statement, i + 1, value)
            })
    }
}

async fn set_serializable(tx: &mut sqlx::Transaction<'_, Postgres>) -> Result<(), DbError> {
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Five characters from `0-9` and `A-Z` excluding `I` and `O`.
fn is_valid_sql_state(code: &str) -> bool {
    code.len() == 5
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || (b.is_ascii_uppercase() && b != b'I' && b != b'O'))
}

fn bind_value<'q>(
    statement: Statement<'q>,
    index: usize,
    value: &'q Value,
) -> Result<Statement<'q>, DbError> {
    let statement = match value {
        // Untyped nulls go over as text; the script casts when it needs to.
        Value::Null => statement.bind(None::<String>),
        Value::Bool(v) => statement.bind(*v),
        Value::Byte(v) => statement.bind(i16::from(*v)),
        Value::Short(v) => statement.bind(*v),
        Value::Int(v) => statement.bind(*v),
        Value::Long(v) => statement.bind(*v),
        Value::Float(v) => statement.bind(*v),
        Value::Double(v) => statement.bind(*v),
        Value::Decimal(v) => statement.bind(*v),
        Value::Text(v) => statement.bind(v.as_str()),
        Value::Instant(v) => statement.bind(*v),
        Value::OffsetDateTime(v) => statement.bind(*v),
        Value::LocalDateTime(v) => statement.bind(*v),
        Value::Date(v) => statement.bind(*v),
        Value::Time(v) => statement.bind(*v),
        Value::Duration(v) => statement.bind(*v),
        Value::Uri(v) => statement.bind(v.as_str()),
        Value::Json(v) => statement.bind(v.clone()),
        Value::Array(items) => bind_array(statement, index, items)?,
    };
    Ok(statement)
}

/// Arrays take the PostgreSQL type of their first non-null element.
fn bind_array<'q>(
    statement: Statement<'q>,
    index: usize,
    items: &'q [Value],
) -> Result<Statement<'q>, DbError> {
    let statement = match items.iter().find(|v| !v.is_null()) {
        None | Some(Value::Text(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        })?),
        Some(Value::Bool(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        })?),
        Some(Value::Byte(_) | Value::Short(_)) => {
            statement.bind(elements(index, items, |v| match v {
                Value::Byte(b) => Some(i16::from(*b)),
                Value::Short(s) => Some(*s),
                _ => None,
            })?)
        }
        Some(Value::Int(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })?),
        Some(Value::Long(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Long(l) => Some(*l),
            Value::Int(i) => Some(i64::from(*i)),
            _ => None,
        })?),
        Some(Value::Float(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Float(f) => Some(*f),
            _ => None,
        })?),
        Some(Value::Double(_)) => statement.bind(elements(index, items, |v| match v {
            Value::Double(d) => Some(*d),
            Value::Float(f) => Some(f64::from(*f)),
            _ => None,
        })?),
        Some(Value::Decimal(_)) => statement.bind(elements::<Decimal>(index, items, |v| match v {
            Value::Decimal(d) => Some(*d),
            _ => None,
        })?),
        Some(Value::Instant(_)) => {
            statement.bind(elements::<DateTime<Utc>>(index, items, |v| match v {
                Value::Instant(t) => Some(*t),
                _ => None,
            })?)
        }
        Some(other) => {
            return Err(DbError::InvalidParameter {
                index,
                reason: format!("arrays of {} are not supported", other.type_name()),
            });
        }
    };
    Ok(statement)
}

fn elements<T>(
    index: usize,
    items: &[Value],
    pick: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<Option<T>>, DbError> {
    items
        .iter()
        .map(|item| match item {
            Value::Null => Ok(None),
            other => pick(other).map(Some).ok_or_else(|| DbError::InvalidParameter {
                index,
                reason: format!("array mixes element types, found {}", other.type_name()),
            }),
        })
        .collect()
}
