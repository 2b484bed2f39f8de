//! Log records and their NDJSON wire form.

use crate::types::{Extras, LogLevel, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys every wire object carries. Configured extra fields may not reuse them.
pub const RESERVED_KEYS: [&str; 7] = [
    "timestamp",
    "level",
    "level_num",
    "message",
    "project",
    "table",
    "extra",
];

/// A record before the queue store has assigned its id.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordDraft {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub message: String,
    pub project: String,
    pub table: String,
    pub extra: Extras,
    pub fields: Extras,
}

impl RecordDraft {
    /// Create a draft stamped with the current time.
    ///
    /// `extra_fields` are copied into the top-level fields; a call-site
    /// `extra` entry with the same key overrides the configured value.
    pub fn new(
        level: LogLevel,
        message: impl Into<String>,
        project: impl Into<String>,
        table: impl Into<String>,
        extra: Extras,
        extra_fields: &Extras,
    ) -> Self {
        let mut fields = extra_fields.clone();
        for (key, value) in &extra {
            if let Some(slot) = fields.get_mut(key) {
                *slot = value.clone();
            }
        }

        Self {
            timestamp: Timestamp::now(),
            level,
            message: message.into(),
            project: project.into(),
            table: table.into(),
            extra,
            fields,
        }
    }

    /// Attach the store-assigned id.
    pub fn into_record(self, id: RecordId) -> LogRecord {
        LogRecord {
            id,
            timestamp: self.timestamp,
            level: self.level,
            message: self.message,
            project: self.project,
            table: self.table,
            extra: self.extra,
            fields: self.fields,
        }
    }
}

/// A persisted log record. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique identifier (assigned by store).
    pub id: RecordId,

    /// When the log call happened.
    pub timestamp: Timestamp,

    pub level: LogLevel,

    pub message: String,

    pub project: String,

    pub table: String,

    /// Call-site extras, sent nested under `extra`.
    #[serde(default)]
    pub extra: Extras,

    /// Configured extra fields, sent at the top level.
    #[serde(default)]
    pub fields: Extras,
}

impl LogRecord {
    /// Build the JSON object sent to the collector.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut object = Map::new();
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone().into());
        }

        object.insert("timestamp".into(), Value::String(self.timestamp.to_iso8601()));
        object.insert("level".into(), Value::String(self.level.name().into()));
        object.insert("level_num".into(), Value::from(self.level.rank()));
        object.insert("message".into(), Value::String(self.message.clone()));
        object.insert("project".into(), Value::String(self.project.clone()));
        object.insert("table".into(), Value::String(self.table.clone()));

        let extra: Map<String, Value> = self
            .extra
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        object.insert("extra".into(), Value::Object(extra));

        object
    }
}

/// Encode a batch as newline-delimited JSON, one newline-terminated object
/// per record, in the order given.
pub fn encode_ndjson(records: &[LogRecord]) -> serde_json::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(&mut body, &record.to_wire())?;
        body.push(b'\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extras;
    use serde_json::json;

    fn draft(extra: Extras, fields: &Extras) -> RecordDraft {
        RecordDraft::new(LogLevel::Warning, "disk almost full", "p", "t", extra, fields)
    }

    #[test]
    fn test_wire_object_shape() {
        let fields = extras! { "environment" => "prod", "version" => "1.0.0" };
        let mut record = draft(extras! { "percent" => 93 }, &fields).into_record(RecordId(4));
        record.timestamp = Timestamp(1_714_566_600_250);

        let wire = Value::Object(record.to_wire());
        assert_eq!(
            wire,
            json!({
                "timestamp": "2024-05-01T12:30:00.250Z",
                "level": "WARNING",
                "level_num": 30,
                "message": "disk almost full",
                "project": "p",
                "table": "t",
                "extra": {"percent": 93},
                "environment": "prod",
                "version": "1.0.0",
            })
        );
    }

    #[test]
    fn test_empty_extra_is_still_sent() {
        let record = draft(Extras::new(), &Extras::new()).into_record(RecordId(1));
        assert_eq!(record.to_wire()["extra"], json!({}));
    }

    #[test]
    fn test_call_site_extra_wins_over_fields() {
        let fields = extras! { "environment" => "prod", "region" => "eu" };
        let record = draft(extras! { "environment" => "canary" }, &fields).into_record(RecordId(1));

        let wire = record.to_wire();
        assert_eq!(wire["environment"], json!("canary"));
        assert_eq!(wire["region"], json!("eu"));
        assert_eq!(wire["extra"], json!({"environment": "canary"}));
    }

    #[test]
    fn test_ndjson_lines_in_order() {
        let records: Vec<_> = (1..=3)
            .map(|i| {
                let mut d = draft(Extras::new(), &Extras::new());
                d.message = format!("line {i}");
                d.into_record(RecordId(i))
            })
            .collect();

        let body = encode_ndjson(&records).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.ends_with('\n'));

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let value: Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["message"], json!(format!("line {}", i + 1)));
        }
    }

    #[test]
    fn test_ndjson_empty_batch() {
        assert!(encode_ndjson(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_record_json_roundtrip_keeps_nested_extras() {
        let extra = extras! { "ctx" => extras! { "ids" => vec![1, 2, 3] }, "ok" => true };
        let record = draft(extra, &Extras::new()).into_record(RecordId(9));

        let bytes = serde_json::to_vec(&record).unwrap();
        let back: LogRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
