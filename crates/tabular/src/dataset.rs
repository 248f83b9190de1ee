use crate::columns::ColumnIndex;
use crate::error::DataError;
use crate::provider::{DataProvider, Position};
use crate::value::Value;

/// A disconnected, fully materialized table.
///
/// Supports every cursor movement, including `back()` and `to_end()`.
#[derive(Debug, Clone, Default)]
pub struct DataSetProvider {
    columns: ColumnIndex,
    rows: Vec<Vec<Value>>,
    position: Position,
    closed: bool,
}

impl DataSetProvider {
    /// Builds a table from column names and rows. Short rows read as null in
    /// their missing columns.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: ColumnIndex::from_names(columns),
            rows,
            position: Position::BeforeFirst,
            closed: false,
        }
    }

    /// Reads every remaining row of another provider into memory.
    pub fn from_provider(source: &mut dyn DataProvider) -> Result<Self, DataError> {
        let columns = source.column_names()?;
        let mut rows = Vec::new();
        while source.next()? {
            rows.push(source.row_values()?);
        }
        tracing::trace!(rows = rows.len(), columns = columns.len(), "Materialized data set.");
        Ok(Self::from_rows(columns, rows))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Moves directly onto the given row.
    pub fn move_to(&mut self, row: usize) -> Result<(), DataError> {
        self.ensure_open()?;
        if row >= self.rows.len() {
            return Err(DataError::RowOutOfRange {
                index: row,
                count: self.rows.len(),
            });
        }
        self.position = Position::At(row);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.closed {
            Err(DataError::Closed)
        } else {
            Ok(())
        }
    }

    fn current_row(&self) -> Result<&[Value], DataError> {
        self.ensure_open()?;
        let row = self.position.current().ok_or(DataError::NoCurrentRow)?;
        self.rows
            .get(row)
            .map(Vec::as_slice)
            .ok_or(DataError::RowOutOfRange {
                index: row,
                count: self.rows.len(),
            })
    }
}

impl DataProvider for DataSetProvider {
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
        Ok((0..self.columns.len())
            .map(|i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect())
    }

    fn get_object(&self, column: &str) -> Result<Value, DataError> {
        let index = self.column_index(column)?;
        let row = self.current_row()?;
        Ok(row.get(index).cloned().unwrap_or(Value::Null))
    }
}

/// Builds an in-memory table one cell at a time, by column name.
///
/// ```
/// use tabular::{DataProvider, DataSetBuilder};
///
/// let mut data = DataSetBuilder::new()
///     .set("feature", "DRRC2")
///     .set("value", 12.5)
///     .add_row()
///     .set("feature", "SMAF1")
///     .build();
/// assert!(data.next().unwrap());
/// assert_eq!(data.get_double("value").unwrap(), 12.5);
/// ```
#[derive(Debug, Default)]
pub struct DataSetBuilder {
    columns: ColumnIndex,
    rows: Vec<Vec<Value>>,
}

impl DataSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares columns up front so they keep this order.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self
    }

    /// Starts a new row; subsequent `set` calls fill it.
    pub fn add_row(mut self) -> Self {
        self.rows.push(Vec::new());
        self
    }

    /// Sets a cell of the current row, adding the column if it is new and
    /// starting the first row if none exists yet.
    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        let index = match self.columns.get(column) {
            Some(index) => index,
            None => self.columns.push(column),
        };
        if self.rows.is_empty() {
            self.rows.push(Vec::new());
        }
        if let Some(row) = self.rows.last_mut() {
            if row.len() <= index {
                row.resize(index + 1, Value::Null);
            }
            row[index] = value.into();
        }
        self
    }

    pub fn build(self) -> DataSetProvider {
        DataSetProvider {
            columns: self.columns,
            rows: self.rows,
            position: Position::BeforeFirst,
            closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn three_rows() -> DataSetProvider {
        DataSetProvider::from_rows(
            ["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("one")],
                vec![Value::Int(2), Value::from("two")],
                vec![Value::Int(3), Value::from("three")],
            ],
        )
    }

    #[test]
    fn next_visits_each_row_then_reset_rewinds() {
        let mut data = three_rows();
        for _ in 0..3 {
            assert!(data.next().unwrap());
        }
        assert!(!data.next().unwrap());
        assert!(!data.next().unwrap());
        assert!(data.is_empty().unwrap());

        data.reset().unwrap();
        assert!(data.next().unwrap());
        assert_eq!(data.get_int("id").unwrap(), Some(1));
    }

    #[test]
    fn reading_before_next_is_an_invalid_state() {
        let data = three_rows();
        let err = data.get_int("id").unwrap_err();
        assert!(err.is_invalid_state());
        assert!(data.is_empty().unwrap());
    }

    #[test]
    fn back_and_to_end_move_randomly() {
        let mut data = three_rows();
        data.to_end().unwrap();
        assert_eq!(data.get_string("name").unwrap().as_deref(), Some("three"));
        assert!(data.back().unwrap());
        assert_eq!(data.row_index().unwrap(), Some(1));
        assert!(data.back().unwrap());
        assert!(!data.back().unwrap());
        assert!(data.is_empty().unwrap());

        data.move_to(2).unwrap();
        assert_eq!(data.get_int("ID").unwrap(), Some(3));
        assert!(matches!(
            data.move_to(3),
            Err(DataError::RowOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn unknown_columns_are_out_of_range() {
        let mut data = three_rows();
        data.next().unwrap();
        assert!(matches!(
            data.get_object("missing"),
            Err(DataError::UnknownColumn(name)) if name == "missing"
        ));
        assert!(!data.has_column("missing").unwrap());
        assert!(data.has_column("NAME").unwrap());
    }

    #[test]
    fn everything_fails_after_close() {
        let mut data = three_rows();
        data.close();
        data.close();
        assert!(data.is_closed());
        assert!(matches!(data.next(), Err(DataError::Closed)));
        assert!(matches!(data.reset(), Err(DataError::Closed)));
        assert!(matches!(data.to_end(), Err(DataError::Closed)));
        assert!(matches!(data.column_index("id"), Err(DataError::Closed)));
        assert!(matches!(data.get_object("id"), Err(DataError::Closed)));
    }

    #[test]
    fn builder_round_trips_typed_values() {
        let instant: DateTime<Utc> = "1985-01-01T00:00:00Z".parse().unwrap();
        let mut data = DataSetBuilder::new()
            .set("x", instant)
            .set("members", vec![1.0, 2.5])
            .add_row()
            .set("x", Utc.with_ymd_and_hms(1985, 1, 2, 0, 0, 0).unwrap())
            .build();

        assert!(data.next().unwrap());
        assert_eq!(data.get_instant("x").unwrap(), Some(instant));
        assert_eq!(data.get_double_array("members").unwrap(), Some(vec![1.0, 2.5]));

        assert!(data.next().unwrap());
        assert!(data.is_null("members").unwrap());
        assert!(data.get_double_array("members").unwrap().is_none());
        assert!(!data.next().unwrap());
    }

    #[test]
    fn consume_and_interpret_drive_to_completion() {
        let mut data = three_rows();
        let names: Vec<String> = data
            .interpret(|row| {
                row.get_string("name")
                    .map(|name| name.unwrap_or_default())
            })
            .unwrap();
        assert_eq!(names, ["one", "two", "three"]);

        data.reset().unwrap();
        let mut total = 0;
        data.consume(|row| {
            total += row.get_int("id")?.unwrap_or_default();
            Ok::<_, DataError>(())
        })
        .unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn from_provider_copies_remaining_rows() {
        let mut source = three_rows();
        source.next().unwrap();
        let mut copy = DataSetProvider::from_provider(&mut source).unwrap();
        assert_eq!(copy.row_count(), 2);
        copy.next().unwrap();
        assert_eq!(copy.get_int("id").unwrap(), Some(2));
    }

    #[test]
    fn json_uses_string_values() {
        let mut data = DataSetBuilder::new()
            .set("id", 1)
            .set("note", None::<String>)
            .build();
        let json = data.to_json().unwrap();
        assert_eq!(json, serde_json::json!([{ "id": "1", "note": null }]));
    }
}
