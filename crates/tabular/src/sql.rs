use crate::coercion::cast_error;
use crate::columns::ColumnIndex;
use crate::error::DataError;
use crate::provider::{DataProvider, Position};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::PgRow;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo, ValueRef};
use std::fmt;

/// A cursor over the rows of a PostgreSQL query result.
///
/// Rows are held in memory, so every movement is supported. Values are decoded
/// from their wire type on each read. Column names come from the result
/// metadata, which sqlx only exposes through a row: an empty result has no
/// columns.
pub struct SqlDataProvider {
    rows: Vec<PgRow>,
    columns: ColumnIndex,
    position: Position,
    closed: bool,
}

impl SqlDataProvider {
    pub fn new(rows: Vec<PgRow>) -> Self {
        let columns = rows
            .first()
            .map(|row| ColumnIndex::from_names(row.columns().iter().map(|c| c.name().to_string())))
            .unwrap_or_default();
        Self {
            rows,
            columns,
            position: Position::BeforeFirst,
            closed: false,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.closed {
            Err(DataError::Closed)
        } else {
            Ok(())
        }
    }

    fn current_row(&self) -> Result<&PgRow, DataError> {
        self.ensure_open()?;
        let row = self.position.current().ok_or(DataError::NoCurrentRow)?;
        self.rows.get(row).ok_or(DataError::RowOutOfRange {
            index: row,
            count: self.rows.len(),
        })
    }
}

impl fmt::Debug for SqlDataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlDataProvider")
            .field("columns", &self.columns.names())
            .field("rows", &self.rows.len())
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DataProvider for SqlDataProvider {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.rows.clear();
        self.columns.clear();
        self.position = Position::BeforeFirst;
        self.closed = true;
    }

    fn next(&mut self) -> Result<bool, DataError> {
        self.ensure_open()?;
        Ok(self.position.advance(self.rows.len()))
    }

    fn back(&mut self) -> Result<bool, DataError> {
        self.ensure_open()?;
        Ok(self.position.retreat(self.rows.len()))
    }

    fn to_end(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        self.position.last(self.rows.len());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        self.position = Position::BeforeFirst;
        Ok(())
    }

    fn column_index(&self, column: &str) -> Result<usize, DataError> {
        self.ensure_open()?;
        self.columns
            .get(column)
            .ok_or_else(|| DataError::UnknownColumn(column.to_string()))
    }

    fn column_names(&self) -> Result<Vec<String>, DataError> {
        self.ensure_open()?;
        Ok(self.columns.names().to_vec())
    }

    fn row_index(&self) -> Result<Option<usize>, DataError> {
        self.ensure_open()?;
        Ok(self.position.current())
    }

    fn is_empty(&self) -> Result<bool, DataError> {
        self.ensure_open()?;
        Ok(self.position.current().is_none())
    }

    fn row_values(&self) -> Result<Vec<Value>, DataError> {
        let row = self.current_row()?;
        (0..row.len()).map(|index| decode(row, index)).collect()
    }

    fn get_object(&self, column: &str) -> Result<Value, DataError> {
        let index = self.column_index(column)?;
        decode(self.current_row()?, index)
    }
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<T, DataError>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    Ok(row.try_get::<T, _>(index)?)
}

fn array<'r, T>(row: &'r PgRow, index: usize) -> Result<Value, DataError>
where
    T: Into<Value>,
    Vec<Option<T>>: Decode<'r, Postgres> + Type<Postgres>,
{
    Ok(get::<Vec<Option<T>>>(row, index)?.into())
}

/// Converts an interval without a month part. Months have no fixed length.
pub(crate) fn interval_to_delta(interval: &PgInterval) -> Option<TimeDelta> {
    if interval.months != 0 {
        return None;
    }
    TimeDelta::try_days(i64::from(interval.days))?
        .checked_add(&TimeDelta::microseconds(interval.microseconds))
}

fn decode(row: &PgRow, index: usize) -> Result<Value, DataError> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }
    let column = &row.columns()[index];
    let type_name = column.type_info().name();

    let value = match type_name {
        "BOOL" => Value::Bool(get(row, index)?),
        "\"CHAR\"" => Value::Byte(get(row, index)?),
        "INT2" => Value::Short(get(row, index)?),
        "INT4" => Value::Int(get(row, index)?),
        "INT8" => Value::Long(get(row, index)?),
        "OID" => Value::Long(i64::from(get::<Oid>(row, index)?.0)),
        "FLOAT4" => Value::Float(get(row, index)?),
        "FLOAT8" => Value::Double(get(row, index)?),
        "NUMERIC" => Value::Decimal(get::<Decimal>(row, index)?),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" => Value::Text(get(row, index)?),
        "TIMESTAMPTZ" => Value::Instant(get::<DateTime<Utc>>(row, index)?),
        // Zone-less timestamps are stored as UTC.
        "TIMESTAMP" => Value::LocalDateTime(get::<NaiveDateTime>(row, index)?),
        "DATE" => Value::Date(get::<NaiveDate>(row, index)?),
        "TIME" => Value::Time(get::<NaiveTime>(row, index)?),
        "INTERVAL" => {
            let interval = get::<PgInterval>(row, index)?;
            match interval_to_delta(&interval) {
                Some(delta) => Value::Duration(delta),
                None => {
                    let raw = Value::Text(format!(
                        "{} months {} days {} microseconds",
                        interval.months, interval.days, interval.microseconds
                    ));
                    return Err(cast_error(column.name(), &raw, "a duration"));
                }
            }
        }
        "JSON" | "JSONB" => Value::Json(get::<serde_json::Value>(row, index)?),
        "UUID" => Value::Text(get::<uuid::Uuid>(row, index)?.to_string()),
        "BOOL[]" => array::<bool>(row, index)?,
        "INT2[]" => array::<i16>(row, index)?,
        "INT4[]" => array::<i32>(row, index)?,
        "INT8[]" => array::<i64>(row, index)?,
        "FLOAT4[]" => array::<f32>(row, index)?,
        "FLOAT8[]" => array::<f64>(row, index)?,
        "NUMERIC[]" => array::<Decimal>(row, index)?,
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => array::<String>(row, index)?,
        "TIMESTAMPTZ[]" => array::<DateTime<Utc>>(row, index)?,
        other => match row.try_get_unchecked::<String, _>(index) {
            Ok(text) => Value::Text(text),
            Err(_) => {
                return Err(DataError::UnsupportedType {
                    column: column.name().to_string(),
                    type_name: other.to_string(),
                });
            }
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_without_months_become_durations() {
        let interval = PgInterval {
            months: 0,
            days: 1,
            microseconds: 6 * 3_600_000_000,
        };
        assert_eq!(
            interval_to_delta(&interval),
            Some(TimeDelta::days(1) + TimeDelta::hours(6))
        );
    }

    #[test]
    fn intervals_with_months_are_rejected() {
        let interval = PgInterval {
            months: 1,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(interval_to_delta(&interval), None);
    }

    #[test]
    fn empty_results_have_no_columns() {
        let mut data = SqlDataProvider::new(Vec::new());
        assert!(!data.next().unwrap());
        assert!(data.column_names().unwrap().is_empty());
        assert!(matches!(
            data.column_index("anything"),
            Err(DataError::UnknownColumn(_))
        ));
        data.close();
        assert!(matches!(data.next(), Err(DataError::Closed)));
    }
}
