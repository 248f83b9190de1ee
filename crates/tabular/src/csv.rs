use crate::columns::ColumnIndex;
use crate::error::DataError;
use crate::provider::DataProvider;
use crate::value::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Lines starting with this prefix are skipped.
pub const DEFAULT_COMMENT_PREFIX: &str = "#";

enum Source {
    File(PathBuf),
    Stream,
}

impl Source {
    fn describe(&self) -> String {
        match self {
            Source::File(path) => format!("the file {}", path.display()),
            Source::Stream => "the provided stream".to_string(),
        }
    }
}

/// A forward-only cursor over delimited text.
///
/// Columns come from an explicit list or, failing that, from the first
/// non-comment line. Every cell is text; empty cells read as null. Rows with
/// fewer fields than columns are padded with nulls and extra fields are
/// ignored.
pub struct CsvDataProvider {
    source: Source,
    reader: Option<Box<dyn BufRead + Send>>,
    delimiter: char,
    explicit_columns: bool,
    columns: ColumnIndex,
    line: Option<Vec<Value>>,
    row: usize,
    exhausted: bool,
    closed: bool,
}

impl CsvDataProvider {
    /// Opens a delimited file whose first line names the columns.
    pub fn from_path(path: impl AsRef<Path>, delimiter: char) -> Result<Self, DataError> {
        Self::open(Source::File(path.as_ref().to_path_buf()), None, delimiter, ColumnIndex::new())
    }

    /// Opens a headerless delimited file with the given columns.
    pub fn from_path_with_columns<I, S>(
        path: impl AsRef<Path>,
        delimiter: char,
        columns: I,
    ) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = ColumnIndex::from_names(columns);
        Self::open(Source::File(path.as_ref().to_path_buf()), None, delimiter, columns)
    }

    /// Reads delimited text with a header line from any reader. The result
    /// cannot be reset.
    pub fn from_reader<R>(reader: R, delimiter: char) -> Result<Self, DataError>
    where
        R: Read + Send + 'static,
    {
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(reader));
        Self::open(Source::Stream, Some(reader), delimiter, ColumnIndex::new())
    }

    pub fn from_reader_with_columns<R, I, S>(
        reader: R,
        delimiter: char,
        columns: I,
    ) -> Result<Self, DataError>
    where
        R: Read + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(reader));
        Self::open(Source::Stream, Some(reader), delimiter, ColumnIndex::from_names(columns))
    }

    fn open(
        source: Source,
        reader: Option<Box<dyn BufRead + Send>>,
        delimiter: char,
        columns: ColumnIndex,
    ) -> Result<Self, DataError> {
        let explicit_columns = !columns.is_empty();
        let mut provider = Self {
            source,
            reader,
            delimiter,
            explicit_columns,
            columns,
            line: None,
            row: 0,
            exhausted: false,
            closed: false,
        };
        provider.rewind()?;
        Ok(provider)
    }

    /// Puts the cursor before the first data row, re-opening the file and
    /// re-reading the header when there is one.
    fn rewind(&mut self) -> Result<(), DataError> {
        if let Source::File(path) = &self.source {
            tracing::trace!(path = %path.display(), "Opening delimited file.");
            self.reader = Some(Box::new(BufReader::new(File::open(path)?)));
        }
        self.line = None;
        self.row = 0;
        self.exhausted = false;

        if !self.explicit_columns {
            let header = self
                .read_fields()?
                .ok_or_else(|| DataError::EmptySource(self.source.describe()))?;
            self.columns = ColumnIndex::from_names(header);
        }
        Ok(())
    }

    /// Reads the next non-comment line split into fields.
    fn read_fields(&mut self) -> Result<Option<Vec<String>>, DataError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buffer = String::new();
        loop {
            buffer.clear();
            if reader.read_line(&mut buffer)? == 0 {
                return Ok(None);
            }
            let line = buffer.trim_end_matches(['\r', '\n']);
            if line.starts_with(DEFAULT_COMMENT_PREFIX) {
                continue;
            }
            return Ok(Some(split_fields(line, self.delimiter)));
        }
    }

    fn read_record(&mut self) -> Result<Option<Vec<Value>>, DataError> {
        let width = self.columns.len();
        Ok(self.read_fields()?.map(|fields| {
            let mut record: Vec<Value> = fields
                .into_iter()
                .take(width)
                .map(|field| if field.is_empty() { Value::Null } else { Value::Text(field) })
                .collect();
            record.resize(width, Value::Null);
            record
        }))
    }

    fn ensure_open(&self) -> Result<(), DataError> {
        if self.closed {
            Err(DataError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Splits on the delimiter outside double quotes and drops the quotes.
fn split_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        } else if c == delimiter && !in_quotes {
            fields.push(std::mem::take(&mut field));
        } else {
            field.push(c);
        }
    }
    fields.push(field);
    fields
}

impl DataProvider for CsvDataProvider {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reader = None;
        self.line = None;
        self.columns.clear();
        self.closed = true;
    }

    fn next(&mut self) -> Result<bool, DataError> {
        self.ensure_open()?;
        if self.exhausted {
            self.line = None;
            return Ok(false);
        }
        let had_row = self.line.is_some();
        match self.read_record()? {
            Some(record) => {
                if had_row {
                    self.row += 1;
                }
                self.line = Some(record);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                self.line = None;
                Ok(false)
            }
        }
    }

    fn back(&mut self) -> Result<bool, DataError> {
        Err(DataError::Unsupported("back"))
    }

    /// Reads to the end of the stream, leaving the last line current.
    fn to_end(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        while let Some(record) = self.read_record()? {
            if self.line.is_some() {
                self.row += 1;
            }
            self.line = Some(record);
        }
        self.exhausted = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DataError> {
        self.ensure_open()?;
        if matches!(self.source, Source::Stream) {
            return Err(DataError::Unsupported("reset"));
        }
        self.rewind()
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
        Ok(self.line.as_ref().map(|_| self.row))
    }

    fn is_empty(&self) -> Result<bool, DataError> {
        self.ensure_open()?;
        Ok(self.line.is_none())
    }

    fn row_values(&self) -> Result<Vec<Value>, DataError> {
        self.ensure_open()?;
        self.line.clone().ok_or(DataError::NoCurrentRow)
    }

    fn get_object(&self, column: &str) -> Result<Value, DataError> {
        let index = self.column_index(column)?;
        let line = self.line.as_ref().ok_or(DataError::NoCurrentRow)?;
        Ok(line.get(index).cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::io::{Cursor, Write};

    fn stream(text: &'static str, delimiter: char) -> CsvDataProvider {
        CsvDataProvider::from_reader(Cursor::new(text), delimiter).unwrap()
    }

    #[test]
    fn pipe_delimited_single_row() {
        let mut data = stream("a|b|c\n1|2|3\n", '|');
        assert!(data.next().unwrap());
        assert_eq!(data.get_int("b").unwrap(), Some(2));
        assert!(!data.next().unwrap());
        assert!(!data.next().unwrap());
    }

    #[test]
    fn quotes_protect_delimiters() {
        assert_eq!(split_fields("\"a,b\",c", ','), ["a,b", "c"]);
        assert_eq!(split_fields("x,", ','), ["x", ""]);
    }

    #[test]
    fn comments_are_skipped_and_short_rows_padded() {
        let mut data = stream("# produced by a test\nid,value,flag\n# mid-file\n7,\n", ',');
        assert!(data.next().unwrap());
        assert_eq!(data.get_long("id").unwrap(), Some(7));
        assert!(data.is_null("value").unwrap());
        assert!(data.get_double("value").unwrap().is_nan());
        assert!(!data.get_bool("flag").unwrap());
        assert_eq!(data.row_values().unwrap().len(), 3);
    }

    #[test]
    fn explicit_columns_treat_every_line_as_data() {
        let mut data =
            CsvDataProvider::from_reader_with_columns(Cursor::new("1;x\n2;y\n"), ';', ["n", "s"])
                .unwrap();
        let values: Vec<i32> = data
            .interpret(|row| row.get_int("N").map(|n| n.unwrap_or_default()))
            .unwrap();
        assert_eq!(values, [1, 2]);
    }

    #[test]
    fn empty_input_has_no_header() {
        let result = CsvDataProvider::from_reader(Cursor::new(""), ',');
        assert!(matches!(result, Err(DataError::EmptySource(_))));
    }

    #[test]
    fn back_is_unsupported_and_streams_cannot_reset() {
        let mut data = stream("a\n1\n", ',');
        assert!(matches!(data.back(), Err(DataError::Unsupported("back"))));
        assert!(matches!(data.reset(), Err(DataError::Unsupported("reset"))));
    }

    #[test]
    fn files_reset_by_reopening() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "valid_time,members").unwrap();
        writeln!(file, "1985-01-01T00:00:00Z,\"{{1,2,3}}\"").unwrap();
        writeln!(file, "1985-01-01 06:00:00,\"{{4,5,6}}\"").unwrap();
        file.flush().unwrap();

        let mut data = CsvDataProvider::from_path(file.path(), ',').unwrap();
        data.to_end().unwrap();
        assert_eq!(data.row_index().unwrap(), Some(1));
        assert_eq!(data.get_int_array("members").unwrap(), Some(vec![4, 5, 6]));

        data.reset().unwrap();
        assert!(data.is_empty().unwrap());
        assert!(data.next().unwrap());
        let expected: DateTime<Utc> = "1985-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(data.get_instant("valid_time").unwrap(), Some(expected));
        assert_eq!(data.row_index().unwrap(), Some(0));
    }

    #[test]
    fn reading_before_next_fails() {
        let data = stream("a\n1\n", ',');
        assert!(matches!(data.get_object("a"), Err(DataError::NoCurrentRow)));
    }

    #[test]
    fn closed_provider_rejects_access() {
        let mut data = stream("a\n1\n", ',');
        data.close();
        assert!(matches!(data.next(), Err(DataError::Closed)));
        assert!(matches!(data.column_index("a"), Err(DataError::Closed)));
        assert!(matches!(data.to_end(), Err(DataError::Closed)));
    }
}
