use crate::coercion;
use crate::error::DataError;
use crate::value::Value;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use url::Url;

/// Cursor position shared by the random-access providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Position {
    #[default]
    BeforeFirst,
    At(usize),
    AfterLast,
}

impl Position {
    pub(crate) fn current(self) -> Option<usize> {
        match self {
            Position::At(row) => Some(row),
            _ => None,
        }
    }

    /// Moves one row forward over `count` rows. Reaching the end parks the
    /// cursor after the last row, where it stays.
    pub(crate) fn advance(&mut self, count: usize) -> bool {
        let next = match *self {
            Position::BeforeFirst => 0,
            Position::At(row) => row + 1,
            Position::AfterLast => return false,
        };
        if next < count {
            *self = Position::At(next);
            true
        } else {
            *self = Position::AfterLast;
            false
        }
    }

    pub(crate) fn retreat(&mut self, count: usize) -> bool {
        match *self {
            Position::BeforeFirst => false,
            Position::At(0) => {
                *self = Position::BeforeFirst;
                false
            }
            Position::At(row) => {
                *self = Position::At(row - 1);
                true
            }
            Position::AfterLast if count > 0 => {
                *self = Position::At(count - 1);
                true
            }
            Position::AfterLast => {
                *self = Position::BeforeFirst;
                false
            }
        }
    }

    pub(crate) fn last(&mut self, count: usize) {
        *self = match count {
            0 => Position::BeforeFirst,
            n => Position::At(n - 1),
        };
    }
}

/// A cursor over rows of named columns.
///
/// Accessors read the current row only; the cursor never moves on its own, so
/// `next()` must return `true` before the first read. Every operation except
/// `is_closed` and `close` fails once the provider is closed.
pub trait DataProvider: Send {
    fn is_closed(&self) -> bool;

    /// Releases rows, readers and column metadata. Calling it twice is a no-op.
    fn close(&mut self);

    /// Moves onto the next row. Returns `false` at the end of the data and
    /// keeps returning `false` without moving.
    fn next(&mut self) -> Result<bool, DataError>;

    /// Moves one row backward. Forward-only sources return `Unsupported`.
    fn back(&mut self) -> Result<bool, DataError>;

    /// Moves onto the last row.
    fn to_end(&mut self) -> Result<(), DataError>;

    /// Rewinds to before the first row, so the next `next()` reaches it.
    fn reset(&mut self) -> Result<(), DataError>;

    /// Case-insensitive ordinal of the named column.
    fn column_index(&self, column: &str) -> Result<usize, DataError>;

    fn column_names(&self) -> Result<Vec<String>, DataError>;

    /// Zero-based index of the current row, `None` before the first or after the last.
    fn row_index(&self) -> Result<Option<usize>, DataError>;

    /// True when there is no current row to read.
    fn is_empty(&self) -> Result<bool, DataError>;

    /// Every value of the current row in column order.
    fn row_values(&self) -> Result<Vec<Value>, DataError>;

    /// The raw value of the named column in the current row.
    fn get_object(&self, column: &str) -> Result<Value, DataError>;

    fn has_column(&self, column: &str) -> Result<bool, DataError> {
        match self.column_index(column) {
            Ok(_) => Ok(true),
            Err(DataError::UnknownColumn(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_null(&self, column: &str) -> Result<bool, DataError> {
        Ok(self.get_object(column)?.is_null())
    }

    fn get_bool(&self, column: &str) -> Result<bool, DataError> {
        Ok(coercion::to_bool(&self.get_object(column)?))
    }

    fn get_string(&self, column: &str) -> Result<Option<String>, DataError> {
        Ok(coercion::to_string(&self.get_object(column)?))
    }

    fn get_uri(&self, column: &str) -> Result<Option<Url>, DataError> {
        coercion::to_uri(column, &self.get_object(column)?)
    }

    fn get_byte(&self, column: &str) -> Result<Option<i8>, DataError> {
        coercion::to_byte(column, &self.get_object(column)?)
    }

    fn get_short(&self, column: &str) -> Result<Option<i16>, DataError> {
        coercion::to_short(column, &self.get_object(column)?)
    }

    fn get_int(&self, column: &str) -> Result<Option<i32>, DataError> {
        coercion::to_int(column, &self.get_object(column)?)
    }

    fn get_long(&self, column: &str) -> Result<Option<i64>, DataError> {
        coercion::to_long(column, &self.get_object(column)?)
    }

    fn get_float(&self, column: &str) -> Result<Option<f32>, DataError> {
        coercion::to_float(column, &self.get_object(column)?)
    }

    /// Null values read as `NaN`.
    fn get_double(&self, column: &str) -> Result<f64, DataError> {
        coercion::to_double(column, &self.get_object(column)?)
    }

    fn get_decimal(&self, column: &str) -> Result<Option<Decimal>, DataError> {
        coercion::to_decimal(column, &self.get_object(column)?)
    }

    fn get_double_array(&self, column: &str) -> Result<Option<Vec<f64>>, DataError> {
        coercion::to_double_array(column, &self.get_object(column)?)
    }

    fn get_int_array(&self, column: &str) -> Result<Option<Vec<i32>>, DataError> {
        coercion::to_int_array(column, &self.get_object(column)?)
    }

    fn get_string_array(&self, column: &str) -> Result<Option<Vec<String>>, DataError> {
        coercion::to_string_array(column, &self.get_object(column)?)
    }

    fn get_time(&self, column: &str) -> Result<Option<NaiveTime>, DataError> {
        coercion::to_time(column, &self.get_object(column)?)
    }

    fn get_date(&self, column: &str) -> Result<Option<NaiveDate>, DataError> {
        coercion::to_date(column, &self.get_object(column)?)
    }

    fn get_offset_date_time(&self, column: &str) -> Result<Option<DateTime<FixedOffset>>, DataError> {
        coercion::to_offset_date_time(column, &self.get_object(column)?)
    }

    fn get_local_date_time(&self, column: &str) -> Result<Option<NaiveDateTime>, DataError> {
        coercion::to_local_date_time(column, &self.get_object(column)?)
    }

    fn get_instant(&self, column: &str) -> Result<Option<DateTime<Utc>>, DataError> {
        coercion::to_instant(column, &self.get_object(column)?)
    }

    fn get_duration(&self, column: &str) -> Result<Option<TimeDelta>, DataError> {
        coercion::to_duration(column, &self.get_object(column)?)
    }

    /// The value of the column rendered as text, empty for null.
    fn to_string_value(&self, column: &str) -> Result<String, DataError> {
        Ok(self.get_object(column)?.to_string())
    }

    /// Renders the remaining rows as a JSON array of objects whose values are
    /// strings, or `null` for null cells.
    fn to_json(&mut self) -> Result<serde_json::Value, DataError> {
        let names = self.column_names()?;
        let mut rows = Vec::new();
        while self.next()? {
            let values = self.row_values()?;
            let object: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .zip(values)
                .map(|(name, value)| {
                    let json = coercion::to_string(&value)
                        .map_or(serde_json::Value::Null, serde_json::Value::String);
                    (name.clone(), json)
                })
                .collect();
            rows.push(serde_json::Value::Object(object));
        }
        Ok(serde_json::Value::Array(rows))
    }

    /// Collects the remaining rows as text, `None` marking a null cell. This is
    /// the shape bulk `COPY` consumes.
    fn copy_rows(&mut self) -> Result<Vec<Vec<Option<String>>>, DataError> {
        let mut rows = Vec::new();
        while self.next()? {
            rows.push(self.row_values()?.iter().map(coercion::to_string).collect());
        }
        Ok(rows)
    }

    /// Calls `consumer` on every remaining row.
    fn consume<F, E>(&mut self, mut consumer: F) -> Result<(), E>
    where
        Self: Sized,
        F: FnMut(&Self) -> Result<(), E>,
        E: From<DataError>,
    {
        while self.next()? {
            consumer(self)?;
        }
        Ok(())
    }

    /// Maps every remaining row and collects the results.
    fn interpret<T, F, E>(&mut self, mut mapper: F) -> Result<Vec<T>, E>
    where
        Self: Sized,
        F: FnMut(&Self) -> Result<T, E>,
        E: From<DataError>,
    {
        let mut results = Vec::new();
        while self.next()? {
            results.push(mapper(self)?);
        }
        Ok(results)
    }
}

impl<P: DataProvider + ?Sized> DataProvider for Box<P> {
    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn next(&mut self) -> Result<bool, DataError> {
        (**self).next()
    }

    fn back(&mut self) -> Result<bool, DataError> {
        (**self).back()
    }

    fn to_end(&mut self) -> Result<(), DataError> {
        (**self).to_end()
    }

    fn reset(&mut self) -> Result<(), DataError> {
        (**self).reset()
    }

    fn column_index(&self, column: &str) -> Result<usize, DataError> {
        (**self).column_index(column)
    }

    fn column_names(&self) -> Result<Vec<String>, DataError> {
        (**self).column_names()
    }

    fn row_index(&self) -> Result<Option<usize>, DataError> {
        (**self).row_index()
    }

    fn is_empty(&self) -> Result<bool, DataError> {
        (**self).is_empty()
    }

    fn row_values(&self) -> Result<Vec<Value>, DataError> {
        (**self).row_values()
    }

    fn get_object(&self, column: &str) -> Result<Value, DataError> {
        (**self).get_object(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_parks_after_the_last_row() {
        let mut position = Position::default();
        assert!(position.advance(2));
        assert!(position.advance(2));
        assert!(!position.advance(2));
        assert_eq!(position, Position::AfterLast);
        assert!(!position.advance(2));
        assert_eq!(position.current(), None);
    }

    #[test]
    fn retreat_from_the_end_reaches_the_last_row() {
        let mut position = Position::AfterLast;
        assert!(position.retreat(3));
        assert_eq!(position.current(), Some(2));

        let mut position = Position::At(0);
        assert!(!position.retreat(3));
        assert_eq!(position, Position::BeforeFirst);
    }

    #[test]
    fn last_on_empty_data_stays_before_first() {
        let mut position = Position::default();
        position.last(0);
        assert_eq!(position, Position::BeforeFirst);
        position.last(4);
        assert_eq!(position.current(), Some(3));
    }
}
