//! Conversion rules shared by every `DataProvider`.
//!
//! Each function takes the column name only to build a useful error; a value
//! that cannot be coerced always yields `DataError::Cast` naming the column
//! and the raw value.

use crate::error::DataError;
use crate::value::Value;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::str::FromStr;
use url::Url;

/// Characters removed from array text before splitting on commas.
const ARRAY_DELIMITERS: &[char] = &['(', ')', '{', '}', '[', ']'];

pub(crate) fn cast_error(column: &str, value: &Value, target: &'static str) -> DataError {
    DataError::Cast {
        column: column.to_string(),
        value: value.to_string(),
        type_name: value.type_name(),
        target,
    }
}

/// Native booleans, integer 1, or any text containing "1" are true.
pub fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Byte(n) => *n == 1,
        Value::Short(n) => *n == 1,
        Value::Int(n) => *n == 1,
        Value::Long(n) => *n == 1,
        other => other.to_string().contains('1'),
    }
}

fn to_integer<T>(column: &str, value: &Value, target: &'static str) -> Result<Option<T>, DataError>
where
    T: TryFrom<i64> + FromStr,
{
    let wide = match value {
        Value::Null => return Ok(None),
        Value::Byte(n) => i64::from(*n),
        Value::Short(n) => i64::from(*n),
        Value::Int(n) => i64::from(*n),
        Value::Long(n) => *n,
        // Fractions are truncated toward zero.
        Value::Float(n) if n.is_finite() => *n as i64,
        Value::Double(n) if n.is_finite() => *n as i64,
        Value::Decimal(d) => d.trunc().to_i64().ok_or_else(|| cast_error(column, value, target))?,
        Value::Text(s) => {
            return s
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| cast_error(column, value, target));
        }
        _ => return Err(cast_error(column, value, target)),
    };
    T::try_from(wide)
        .map(Some)
        .map_err(|_| cast_error(column, value, target))
}

pub fn to_byte(column: &str, value: &Value) -> Result<Option<i8>, DataError> {
    to_integer(column, value, "a byte")
}

pub fn to_short(column: &str, value: &Value) -> Result<Option<i16>, DataError> {
    to_integer(column, value, "a short")
}

pub fn to_int(column: &str, value: &Value) -> Result<Option<i32>, DataError> {
    to_integer(column, value, "an integer")
}

pub fn to_long(column: &str, value: &Value) -> Result<Option<i64>, DataError> {
    to_integer(column, value, "a long")
}

fn to_f64(column: &str, value: &Value, target: &'static str) -> Result<Option<f64>, DataError> {
    let result = match value {
        Value::Null => return Ok(None),
        Value::Byte(n) => f64::from(*n),
        Value::Short(n) => f64::from(*n),
        Value::Int(n) => f64::from(*n),
        Value::Long(n) => *n as f64,
        Value::Float(n) => f64::from(*n),
        Value::Double(n) => *n,
        Value::Decimal(d) => d.to_f64().ok_or_else(|| cast_error(column, value, target))?,
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| cast_error(column, value, target))?,
        _ => return Err(cast_error(column, value, target)),
    };
    Ok(Some(result))
}

pub fn to_float(column: &str, value: &Value) -> Result<Option<f32>, DataError> {
    match value {
        Value::Float(n) => Ok(Some(*n)),
        _ => Ok(to_f64(column, value, "a float")?.map(|n| n as f32)),
    }
}

/// Null becomes `NaN`, the missing value sentinel for doubles.
pub fn to_double(column: &str, value: &Value) -> Result<f64, DataError> {
    Ok(to_f64(column, value, "a double")?.unwrap_or(f64::NAN))
}

pub fn to_decimal(column: &str, value: &Value) -> Result<Option<Decimal>, DataError> {
    const TARGET: &str = "a decimal";
    let result = match value {
        Value::Null => return Ok(None),
        Value::Decimal(d) => *d,
        Value::Byte(n) => Decimal::from(*n),
        Value::Short(n) => Decimal::from(*n),
        Value::Int(n) => Decimal::from(*n),
        Value::Long(n) => Decimal::from(*n),
        Value::Float(n) => Decimal::from_f32(*n).ok_or_else(|| cast_error(column, value, TARGET))?,
        Value::Double(n) => Decimal::from_f64(*n).ok_or_else(|| cast_error(column, value, TARGET))?,
        Value::Text(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .map_err(|_| cast_error(column, value, TARGET))?,
        _ => return Err(cast_error(column, value, TARGET)),
    };
    Ok(Some(result))
}

pub fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub fn to_uri(column: &str, value: &Value) -> Result<Option<Url>, DataError> {
    match value {
        Value::Null => Ok(None),
        Value::Uri(u) => Ok(Some(u.clone())),
        other => Url::parse(&other.to_string())
            .map(Some)
            .map_err(|_| cast_error(column, value, "a URI")),
    }
}

/// Splits array text such as `{1,2,3}` or `(1, 2, 3)` into its elements.
fn split_array_text(text: &str) -> Vec<String> {
    let stripped: String = text.chars().filter(|c| !ARRAY_DELIMITERS.contains(c)).collect();
    if stripped.trim().is_empty() {
        return Vec::new();
    }
    stripped.split(',').map(|s| s.trim().to_string()).collect()
}

fn to_array<T>(
    column: &str,
    value: &Value,
    target: &'static str,
    element: impl Fn(&Value) -> Result<Option<T>, DataError>,
) -> Result<Option<Vec<T>>, DataError> {
    let items: Vec<Value> = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => items.clone(),
        Value::Text(s) => split_array_text(s).into_iter().map(Value::Text).collect(),
        _ => return Err(cast_error(column, value, target)),
    };
    items
        .iter()
        .map(|item| match element(item) {
            Ok(Some(v)) => Ok(v),
            // Null elements and unparsable elements both fail the whole array.
            Ok(None) | Err(_) => Err(cast_error(column, value, target)),
        })
        .collect::<Result<Vec<T>, DataError>>()
        .map(Some)
}

pub fn to_double_array(column: &str, value: &Value) -> Result<Option<Vec<f64>>, DataError> {
    to_array(column, value, "a double array", |item| to_f64(column, item, "a double"))
}

pub fn to_int_array(column: &str, value: &Value) -> Result<Option<Vec<i32>>, DataError> {
    to_array(column, value, "an integer array", |item| match item {
        Value::Text(s) => to_int(column, &Value::Text(s.trim().to_string())),
        other => to_int(column, other),
    })
}

pub fn to_string_array(column: &str, value: &Value) -> Result<Option<Vec<String>>, DataError> {
    to_array(column, value, "a string array", |item| Ok(to_string(item)))
}

/// Normalizes database timestamp text to ISO-8601 UTC: the space separator
/// becomes `T` and a trailing `Z` is appended when absent.
fn normalize_timestamp_text(text: &str) -> String {
    let mut normalized = text.trim().replace(' ', "T");
    if !normalized.ends_with('Z') {
        normalized.push('Z');
    }
    normalized
}

fn from_epoch_seconds(column: &str, value: &Value, seconds: i64) -> Result<DateTime<Utc>, DataError> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| cast_error(column, value, "an instant"))
}

pub fn to_instant(column: &str, value: &Value) -> Result<Option<DateTime<Utc>>, DataError> {
    let instant = match value {
        Value::Null => return Ok(None),
        Value::Instant(t) => *t,
        Value::OffsetDateTime(t) => t.with_timezone(&Utc),
        Value::LocalDateTime(t) => t.and_utc(),
        Value::Text(s) => {
            let normalized = normalize_timestamp_text(s);
            DateTime::parse_from_rfc3339(&normalized)
                .map(|t| t.with_timezone(&Utc))
                .or_else(|_| normalized.parse::<DateTime<Utc>>())
                .map_err(|_| cast_error(column, value, "an instant"))?
        }
        Value::Int(n) => from_epoch_seconds(column, value, i64::from(*n))?,
        Value::Long(n) => from_epoch_seconds(column, value, *n)?,
        Value::Double(n) if n.is_finite() => from_epoch_seconds(column, value, *n as i64)?,
        _ => return Err(cast_error(column, value, "an instant")),
    };
    Ok(Some(instant))
}

pub fn to_offset_date_time(
    column: &str,
    value: &Value,
) -> Result<Option<DateTime<FixedOffset>>, DataError> {
    match value {
        Value::OffsetDateTime(t) => Ok(Some(*t)),
        other => Ok(to_instant(column, other)?.map(|t| t.fixed_offset())),
    }
}

pub fn to_local_date_time(column: &str, value: &Value) -> Result<Option<NaiveDateTime>, DataError> {
    match value {
        Value::LocalDateTime(t) => Ok(Some(*t)),
        other => Ok(to_offset_date_time(column, other)?.map(|t| t.naive_utc())),
    }
}

pub fn to_date(column: &str, value: &Value) -> Result<Option<NaiveDate>, DataError> {
    match value {
        Value::Date(d) => Ok(Some(*d)),
        Value::LocalDateTime(t) => Ok(Some(t.date())),
        Value::OffsetDateTime(t) => Ok(Some(t.date_naive())),
        other => Ok(to_instant(column, other)?.map(|t| t.date_naive())),
    }
}

pub fn to_time(column: &str, value: &Value) -> Result<Option<NaiveTime>, DataError> {
    match value {
        Value::Time(t) => Ok(Some(*t)),
        Value::LocalDateTime(t) => Ok(Some(t.time())),
        Value::OffsetDateTime(t) => Ok(Some(t.time())),
        other => Ok(to_instant(column, other)?.map(|t| t.time())),
    }
}

/// Numbers are lead durations in minutes; text is ISO-8601 (`PnDTnHnMn.nS`).
pub fn to_duration(column: &str, value: &Value) -> Result<Option<TimeDelta>, DataError> {
    let duration = match value {
        Value::Null => return Ok(None),
        Value::Duration(d) => *d,
        Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) => {
            let minutes = to_long(column, value)?.unwrap_or_default();
            TimeDelta::try_minutes(minutes).ok_or_else(|| cast_error(column, value, "a duration"))?
        }
        Value::Text(s) => parse_iso_duration(s).ok_or_else(|| cast_error(column, value, "a duration"))?,
        _ => return Err(cast_error(column, value, "a duration")),
    };
    Ok(Some(duration))
}

/// Parses the ISO-8601 duration subset `[-]PnDTnHnMn.nS`.
pub fn parse_iso_duration(text: &str) -> Option<TimeDelta> {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let rest = rest.strip_prefix('P').or_else(|| rest.strip_prefix('p'))?;
    let (date_part, time_part) = match rest.find(['T', 't']) {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };

    let mut total = TimeDelta::zero();
    let mut any = false;

    if !date_part.is_empty() {
        let days = date_part.strip_suffix(['D', 'd'])?.parse::<i64>().ok()?;
        total = total.checked_add(&TimeDelta::try_days(days)?)?;
        any = true;
    }

    if let Some(mut time) = time_part {
        if time.is_empty() {
            return None;
        }
        while !time.is_empty() {
            let unit_at = time.find(|c: char| c.is_ascii_alphabetic())?;
            let (number, unit) = (&time[..unit_at], &time[unit_at..unit_at + 1]);
            let part = match unit.to_ascii_uppercase().as_str() {
                "H" => TimeDelta::try_hours(number.parse::<i64>().ok()?)?,
                "M" => TimeDelta::try_minutes(number.parse::<i64>().ok()?)?,
                "S" => {
                    let seconds = number.parse::<f64>().ok()?;
                    TimeDelta::try_milliseconds((seconds * 1000.0).round() as i64)?
                }
                _ => return None,
            };
            total = total.checked_add(&part)?;
            time = &time[unit_at + 1..];
            any = true;
        }
    }

    if !any {
        return None;
    }
    Some(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn padded_numeric_text_reads_the_same_for_every_numeric_type() {
        let padded = Value::Text(" 12 ".into());
        assert_eq!(to_int("c", &padded).unwrap(), Some(12));
        assert_eq!(to_long("c", &padded).unwrap(), Some(12));
        assert_eq!(to_short("c", &padded).unwrap(), Some(12));
        assert_eq!(to_double("c", &padded).unwrap(), 12.0);
        assert!(to_int("c", &Value::Text("1 2".into())).is_err());
    }

    #[test]
    fn booleans_follow_the_one_rule() {
        assert!(to_bool(&Value::Bool(true)));
        assert!(to_bool(&Value::Int(1)));
        assert!(!to_bool(&Value::Int(2)));
        assert!(to_bool(&Value::Text("1".into())));
        assert!(to_bool(&Value::Text("t1".into())));
        assert!(!to_bool(&Value::Text("true".into())));
        assert!(!to_bool(&Value::Null));
    }

    #[test]
    fn non_numeric_text_fails_with_column_and_value() {
        let err = to_int("flow", &Value::Text("high".into())).unwrap_err();
        match err {
            DataError::Cast { column, value, target, .. } => {
                assert_eq!(column, "flow");
                assert_eq!(value, "high");
                assert_eq!(target, "an integer");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = to_double("stage", &Value::Text("n/a".into())).unwrap_err();
        assert!(err.to_string().contains("'stage'"));
        assert!(err.to_string().contains("'n/a'"));
    }

    #[test]
    fn numbers_convert_between_widths() {
        assert_eq!(to_int("c", &Value::Long(42)).unwrap(), Some(42));
        assert_eq!(to_long("c", &Value::Double(7.9)).unwrap(), Some(7));
        assert_eq!(to_short("c", &Value::Text("12".into())).unwrap(), Some(12));
        assert!(to_byte("c", &Value::Int(1000)).is_err());
        assert_eq!(to_decimal("c", &Value::Text("1.25".into())).unwrap(), Some(dec!(1.25)));
        assert_eq!(to_float("c", &Value::Int(3)).unwrap(), Some(3.0));
    }

    #[test]
    fn null_double_is_nan() {
        assert!(to_double("c", &Value::Null).unwrap().is_nan());
        assert_eq!(to_int("c", &Value::Null).unwrap(), None);
    }

    #[test]
    fn timestamp_text_is_normalized_to_utc() {
        let expected = Utc.with_ymd_and_hms(1985, 1, 1, 0, 0, 0).unwrap();
        let from_db = to_instant("t", &Value::Text("1985-01-01 00:00:00".into())).unwrap();
        assert_eq!(from_db, Some(expected));
        let iso = to_instant("t", &Value::Text("1985-01-01T00:00:00Z".into())).unwrap();
        assert_eq!(iso, Some(expected));
    }

    #[test]
    fn epoch_seconds_are_accepted() {
        let expected = Utc.with_ymd_and_hms(1970, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(to_instant("t", &Value::Int(60)).unwrap(), Some(expected));
        assert_eq!(to_instant("t", &Value::Long(60)).unwrap(), Some(expected));
        assert_eq!(to_instant("t", &Value::Double(60.7)).unwrap(), Some(expected));
        assert!(to_instant("t", &Value::Bool(true)).is_err());
    }

    #[test]
    fn dates_and_times_derive_from_instants() {
        let text = Value::Text("2020-03-04 05:06:07".into());
        assert_eq!(
            to_date("t", &text).unwrap(),
            NaiveDate::from_ymd_opt(2020, 3, 4)
        );
        assert_eq!(
            to_time("t", &text).unwrap(),
            NaiveTime::from_hms_opt(5, 6, 7)
        );
        let local = to_local_date_time("t", &text).unwrap().unwrap();
        assert_eq!(local.and_utc().timestamp(), 1_583_298_367);
    }

    #[test]
    fn array_text_strips_brackets() {
        assert_eq!(
            to_double_array("a", &Value::Text("{1.5,2,3}".into())).unwrap(),
            Some(vec![1.5, 2.0, 3.0])
        );
        assert_eq!(
            to_int_array("a", &Value::Text("(1, 2, 3)".into())).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(
            to_string_array("a", &Value::Text("[x,y]".into())).unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(to_int_array("a", &Value::Text("{}".into())).unwrap(), Some(vec![]));
    }

    #[test]
    fn bad_array_element_names_column_and_value() {
        let err = to_double_array("members", &Value::Text("{1,two}".into())).unwrap_err();
        match err {
            DataError::Cast { column, value, .. } => {
                assert_eq!(column, "members");
                assert_eq!(value, "{1,two}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn durations_from_minutes_and_iso_text() {
        assert_eq!(
            to_duration("lead", &Value::Int(90)).unwrap(),
            Some(TimeDelta::minutes(90))
        );
        assert_eq!(parse_iso_duration("PT6H"), Some(TimeDelta::hours(6)));
        assert_eq!(
            parse_iso_duration("P1DT30M"),
            Some(TimeDelta::days(1) + TimeDelta::minutes(30))
        );
        assert_eq!(parse_iso_duration("-PT1.5S"), Some(-TimeDelta::milliseconds(1500)));
        assert_eq!(parse_iso_duration("P"), None);
        assert_eq!(parse_iso_duration("6 hours"), None);
    }
}
