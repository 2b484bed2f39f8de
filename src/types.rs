//! Core types for the log shipper.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a queued record. Assigned by the queue store,
/// strictly increasing, and the delivery order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn next(self) -> Self {
        RecordId(self.0 + 1)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch, UTC.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time, truncated to milliseconds.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_millis())
    }

    /// ISO-8601 rendering with millisecond precision, e.g.
    /// `2024-05-01T12:30:00.250Z`.
    pub fn to_iso8601(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_iso8601())
    }
}

/// Severity of a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    /// Numeric rank sent as `level_num`.
    pub fn rank(self) -> u8 {
        match self {
            LogLevel::Debug => 10,
            LogLevel::Info => 20,
            LogLevel::Warning => 30,
            LogLevel::Error => 40,
            LogLevel::Critical => 50,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.rank() == rank)
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Debug
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(rank) = s.parse::<u8>() {
            return Self::from_rank(rank).ok_or_else(|| format!("unknown level rank {rank}"));
        }
        Self::ALL
            .into_iter()
            .find(|level| level.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown level {s:?}"))
    }
}

/// String-keyed map of extra values attached to a record.
pub type Extras = BTreeMap<String, ExtraValue>;

/// A JSON-compatible value carried in `extra` or `extra_fields`.
///
/// Numbers are always finite, so every value encodes to JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum ExtraValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<ExtraValue>),
    Map(Extras),
}

/// Non-finite floats have no JSON form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NonFiniteNumber(pub f64);

impl fmt::Display for NonFiniteNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not representable in JSON", self.0)
    }
}

impl std::error::Error for NonFiniteNumber {}

impl From<serde_json::Value> for ExtraValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ExtraValue::Null,
            Value::Bool(b) => ExtraValue::Bool(b),
            Value::Number(n) => ExtraValue::Number(n),
            Value::String(s) => ExtraValue::String(s),
            Value::Array(items) => ExtraValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                ExtraValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<ExtraValue> for serde_json::Value {
    fn from(value: ExtraValue) -> Self {
        use serde_json::Value;
        match value {
            ExtraValue::Null => Value::Null,
            ExtraValue::Bool(b) => Value::Bool(b),
            ExtraValue::Number(n) => Value::Number(n),
            ExtraValue::String(s) => Value::String(s),
            ExtraValue::Array(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            ExtraValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for ExtraValue {
    fn from(b: bool) -> Self {
        ExtraValue::Bool(b)
    }
}

impl From<&str> for ExtraValue {
    fn from(s: &str) -> Self {
        ExtraValue::String(s.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(s: String) -> Self {
        ExtraValue::String(s)
    }
}

macro_rules! extra_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ExtraValue {
                fn from(n: $t) -> Self {
                    ExtraValue::Number(n.into())
                }
            }
        )*
    };
}

extra_from_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl TryFrom<f64> for ExtraValue {
    type Error = NonFiniteNumber;

    fn try_from(n: f64) -> Result<Self, Self::Error> {
        serde_json::Number::from_f64(n)
            .map(ExtraValue::Number)
            .ok_or(NonFiniteNumber(n))
    }
}

impl<T: Into<ExtraValue>> From<Vec<T>> for ExtraValue {
    fn from(items: Vec<T>) -> Self {
        ExtraValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<Extras> for ExtraValue {
    fn from(map: Extras) -> Self {
        ExtraValue::Map(map)
    }
}

impl<T: Into<ExtraValue>> From<Option<T>> for ExtraValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ExtraValue::Null, Into::into)
    }
}

/// Build an [`Extras`] map from `key => value` pairs.
///
/// ```
/// let extra = logsend::extras! { "user_id" => 123, "region" => "eu" };
/// assert_eq!(extra.len(), 2);
/// ```
#[macro_export]
macro_rules! extras {
    () => { $crate::Extras::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::Extras::new();
        $( map.insert(($key).to_string(), $crate::ExtraValue::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_ordering_and_rank() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Critical);
        assert_eq!(LogLevel::Warning.rank(), 30);
        assert_eq!(LogLevel::from_rank(50), Some(LogLevel::Critical));
        assert_eq!(LogLevel::from_rank(15), None);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("20".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_serializes_as_name() {
        assert_eq!(serde_json::to_value(LogLevel::Info).unwrap(), json!("INFO"));
    }

    #[test]
    fn test_timestamp_iso8601_millis() {
        let ts = Timestamp(1_714_566_600_250);
        assert_eq!(ts.to_iso8601(), "2024-05-01T12:30:00.250Z");
        assert_eq!(Timestamp(0).to_iso8601(), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_extra_value_from_json() {
        let value: ExtraValue = json!({"a": [1, "two", null], "b": {"c": true}}).into();
        match &value {
            ExtraValue::Map(map) => {
                assert_eq!(
                    map["a"],
                    ExtraValue::Array(vec![1.into(), "two".into(), ExtraValue::Null])
                );
                assert!(matches!(map["b"], ExtraValue::Map(_)));
            }
            other => panic!("expected map, got {other:?}"),
        }
        let back: serde_json::Value = value.into();
        assert_eq!(back["b"]["c"], json!(true));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(ExtraValue::try_from(f64::NAN).is_err());
        assert!(ExtraValue::try_from(f64::INFINITY).is_err());
        assert_eq!(
            ExtraValue::try_from(1.5).unwrap(),
            ExtraValue::Number(serde_json::Number::from_f64(1.5).unwrap())
        );
    }

    #[test]
    fn test_extras_macro() {
        let extra = extras! { "user_id" => 7, "name" => "ann", "missing" => None::<i32> };
        assert_eq!(extra["user_id"], ExtraValue::from(7));
        assert_eq!(extra["missing"], ExtraValue::Null);
        assert!(extras! {}.is_empty());
    }
}
