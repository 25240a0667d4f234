//! SQL values and conversions.

use bytes::Bytes;
use thiserror::Error;

/// A single column value as delivered by the wire session.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer of any width.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Character data.
    Text(String),
    /// Binary data.
    Binary(Bytes),
    /// Timestamp without time zone.
    #[cfg(feature = "chrono")]
    Timestamp(chrono::NaiveDateTime),
}

impl SqlValue {
    /// Whether the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type name used in conversion errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Binary(_) => "BINARY",
            #[cfg(feature = "chrono")]
            Self::Timestamp(_) => "TIMESTAMP",
        }
    }
}

/// Errors converting a [`SqlValue`] into a Rust type.
#[derive(Debug, Error)]
pub enum TypeError {
    /// The value has a different type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type.
        expected: &'static str,
        /// What was found instead.
        actual: String,
    },

    /// The value was NULL where a non-null type was requested.
    #[error("unexpected NULL value")]
    UnexpectedNull,

    /// The value does not fit the target type.
    #[error("value out of range for {target}")]
    OutOfRange {
        /// Target type.
        target: &'static str,
    },
}

/// Conversion from a SQL value.
pub trait FromSql: Sized {
    /// Convert a non-null value.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Convert a value that may be NULL.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    if value.is_null() {
        TypeError::UnexpectedNull
    } else {
        TypeError::TypeMismatch {
            expected,
            actual: value.type_name().to_string(),
        }
    }
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(i) => Ok(*i != 0),
            other => Err(mismatch("BOOLEAN", other)),
        }
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Int(i) => Ok(*i),
            other => Err(mismatch("INTEGER", other)),
        }
    }
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        let wide = i64::from_sql(value)?;
        i32::try_from(wide).map_err(|_| TypeError::OutOfRange { target: "i32" })
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(f) => Ok(*f),
            #[allow(clippy::cast_precision_loss)]
            SqlValue::Int(i) => Ok(*i as f64),
            other => Err(mismatch("FLOAT", other)),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(mismatch("TEXT", other)),
        }
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(b) => Ok(b.clone()),
            other => Err(mismatch("BINARY", other)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Timestamp(ts) => Ok(*ts),
            other => Err(mismatch("TIMESTAMP", other)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

#[cfg(feature = "chrono")]
impl From<chrono::NaiveDateTime> for SqlValue {
    fn from(v: chrono::NaiveDateTime) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_conversions() {
        let v = SqlValue::Int(42);
        assert_eq!(i64::from_sql(&v).unwrap(), 42);
        assert_eq!(i32::from_sql(&v).unwrap(), 42);
        assert!((f64::from_sql(&v).unwrap() - 42.0).abs() < f64::EPSILON);

        let big = SqlValue::Int(i64::MAX);
        assert!(matches!(
            i32::from_sql(&big),
            Err(TypeError::OutOfRange { target: "i32" })
        ));
    }

    #[test]
    fn test_null_handling() {
        assert!(matches!(
            String::from_sql(&SqlValue::Null),
            Err(TypeError::UnexpectedNull)
        ));
        assert_eq!(String::from_sql_nullable(&SqlValue::Null).unwrap(), None);
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
    }

    #[test]
    fn test_mismatch_reports_actual_type() {
        let err = i64::from_sql(&SqlValue::Text("x".into())).unwrap_err();
        assert_eq!(err.to_string(), "type mismatch: expected INTEGER, got TEXT");
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_timestamp_round_trip_through_value() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let v = SqlValue::from(ts);
        assert_eq!(chrono::NaiveDateTime::from_sql(&v).unwrap(), ts);
    }
}
