use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::fmt;
use url::Url;

/// A single cell of tabular data, before any accessor coerces it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Text(String),
    /// A point on the UTC time line.
    Instant(DateTime<Utc>),
    OffsetDateTime(DateTime<FixedOffset>),
    /// A timestamp without zone, interpreted as UTC by the accessors.
    LocalDateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Duration(TimeDelta),
    Uri(Url),
    Array(Vec<Value>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in cast error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "integer",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Instant(_) => "instant",
            Value::OffsetDateTime(_) => "offset date time",
            Value::LocalDateTime(_) => "local date time",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Duration(_) => "duration",
            Value::Uri(_) => "uri",
            Value::Array(_) => "array",
            Value::Json(_) => "json",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Byte(n) => write!(f, "{n}"),
            Value::Short(n) => write!(f, "{n}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Long(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(s) => f.write_str(s),
            Value::Instant(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::OffsetDateTime(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::LocalDateTime(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S%.f")),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::Duration(d) => write!(f, "{d}"),
            Value::Uri(u) => f.write_str(u.as_str()),
            // PostgreSQL array literal, which is also what COPY expects.
            Value::Array(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match item {
                        Value::Null => f.write_str("NULL")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("}")
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

macro_rules! impl_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    Decimal => Decimal,
    String => Text,
    DateTime<Utc> => Instant,
    DateTime<FixedOffset> => OffsetDateTime,
    NaiveDateTime => LocalDateTime,
    NaiveDate => Date,
    NaiveTime => Time,
    TimeDelta => Duration,
    Url => Uri,
    serde_json::Value => Json,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn instants_render_as_utc_iso_8601() {
        let instant = Utc.with_ymd_and_hms(1985, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Value::from(instant).to_string(), "1985-01-01T00:00:00Z");
    }

    #[test]
    fn arrays_render_as_postgres_literals() {
        let value = Value::Array(vec![Value::Int(1), Value::Null, Value::Int(3)]);
        assert_eq!(value.to_string(), "{1,NULL,3}");
    }

    #[test]
    fn none_becomes_null() {
        assert!(Value::from(None::<i32>).is_null());
        assert_eq!(Value::from(Some(4_i64)), Value::Long(4));
    }
}
