//! Entry types and the append-merge rule

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Data value broadcast to viewers to tell them to drop every entry.
/// Never stored as a real entry.
pub const CLEAR_SENTINEL: &str = "___clear___";

/// Identifier that `log` calls accumulate into when no id is given
pub const DEFAULT_LOG_ID: &str = "log";

/// Renderer hints understood by the dashboard.
///
/// The server never interprets these; they travel as plain strings in
/// [`Entry::view`]. The enum only exists so the client's convenience
/// wrappers cannot misspell a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    /// Rows of records
    Table,
    /// Collapsible JSON tree
    Json,
    /// Rendered markdown text
    Markdown,
    /// Progress bar
    Progress,
    /// Pie chart
    Pie,
    /// Single large number
    Number,
    /// Area chart
    Area,
    /// Bar chart
    Bar,
    /// Card layout
    Card,
    /// Map location
    Location,
    /// Unformatted value
    Raw,
    /// Timestamped log lines
    Log,
    /// Stack trace
    Stack,
}

impl View {
    /// Tag sent over the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Table => "table",
            View::Json => "json",
            View::Markdown => "markdown",
            View::Progress => "progress",
            View::Pie => "pie",
            View::Number => "number",
            View::Area => "area",
            View::Bar => "bar",
            View::Card => "card",
            View::Location => "location",
            View::Raw => "raw",
            View::Log => "log",
            View::Stack => "stack",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The latest visualized value for one identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique key within the store
    pub id: String,

    /// Arbitrary JSON value
    pub data: Value,

    /// Opaque renderer tag, passed through untouched
    pub view: Option<String>,
}

impl Entry {
    /// Create an entry with the given fields
    pub fn new(id: impl Into<String>, data: Value, view: Option<String>) -> Self {
        Self {
            id: id.into(),
            data,
            view,
        }
    }

    /// Create the clear signal broadcast when the store is wiped
    pub fn clear_signal() -> Self {
        Self::new(generate_id(), Value::String(CLEAR_SENTINEL.to_string()), None)
    }

    /// Whether this entry carries the clear sentinel
    pub fn is_clear_signal(&self) -> bool {
        self.data.as_str() == Some(CLEAR_SENTINEL)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fresh identifier for entries sent without one. Never reused.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Body of `POST /api/send`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    /// Value to store; absent or falsy values are rejected
    pub data: Option<Value>,
    /// Target identifier; a new one is generated when absent
    pub id: Option<String>,
    /// Renderer tag
    pub view: Option<String>,
    /// Merge into the existing value instead of replacing it
    #[serde(deserialize_with = "null_as_false")]
    pub append: bool,
}

impl SendRequest {
    /// Take the data out if it is present and truthy
    pub fn take_accepted_data(&mut self) -> Option<Value> {
        self.data.take().filter(is_truthy)
    }
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// JSON truthiness: null, false, 0, "", [] and {} are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Combine `incoming` into `existing` for an append update.
///
/// Strings and arrays concatenate, objects merge key by key with the
/// incoming keys winning. Any other pairing replaces the old value.
pub fn merge_append(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::String(mut old), Value::String(new)) => {
            old.push_str(&new);
            Value::String(old)
        }
        (Value::Array(mut old), Value::Array(new)) => {
            old.extend(new);
            Value::Array(old)
        }
        (Value::Object(mut old), Value::Object(new)) => {
            for (key, value) in new {
                old.insert(key, value);
            }
            Value::Object(old)
        }
        (old, new) => {
            tracing::debug!(
                existing = kind(&old),
                incoming = kind(&new),
                "Append between unmergeable shapes, replacing"
            );
            new
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Build a one-line log record: `[[json_text, unix_seconds]]`.
///
/// The outer array lets successive records append onto an existing log entry.
pub fn log_record(values: &[Value]) -> Result<Value, serde_json::Error> {
    let text = serde_json::to_string(values)?;
    let captured = Utc::now().timestamp_millis() as f64 / 1000.0;
    Ok(Value::Array(vec![Value::Array(vec![
        Value::String(text),
        Value::from(captured),
    ])]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_concatenates_strings_and_arrays() {
        assert_eq!(merge_append(json!("ab"), json!("cd")), json!("abcd"));
        assert_eq!(merge_append(json!([1, 2]), json!([3])), json!([1, 2, 3]));
    }

    #[test]
    fn test_merge_objects_keeps_both_keys() {
        let merged = merge_append(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));

        let overwritten = merge_append(json!({"a": 1}), json!({"a": 5}));
        assert_eq!(overwritten, json!({"a": 5}));
    }

    #[test]
    fn test_merge_mismatched_shapes_replaces() {
        assert_eq!(merge_append(json!("text"), json!([1])), json!([1]));
        assert_eq!(merge_append(json!(1), json!(2)), json!(2));
        assert_eq!(merge_append(json!({"a": 1}), json!("x")), json!("x"));
    }

    #[test]
    fn test_truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{} should be falsy", falsy);
        }
        for truthy in [json!(true), json!(-1), json!("0"), json!([0]), json!({"k": null})] {
            assert!(is_truthy(&truthy), "{} should be truthy", truthy);
        }
    }

    #[test]
    fn test_send_request_parsing() {
        let mut request: SendRequest =
            serde_json::from_str(r#"{"data": [1], "id": "x", "append": null}"#).unwrap();
        assert_eq!(request.id.as_deref(), Some("x"));
        assert!(!request.append);
        assert_eq!(request.take_accepted_data(), Some(json!([1])));
        assert!(request.data.is_none());

        let mut empty: SendRequest = serde_json::from_str(r#"{"data": null}"#).unwrap();
        assert!(empty.take_accepted_data().is_none());

        let mut falsy: SendRequest = serde_json::from_str(r#"{"data": {}}"#).unwrap();
        assert!(falsy.take_accepted_data().is_none());

        let mut missing: SendRequest = serde_json::from_str(r#"{"view": "json"}"#).unwrap();
        assert!(missing.take_accepted_data().is_none());
    }

    #[test]
    fn test_log_record_shape() {
        let record = log_record(&[json!("hello"), json!(3)]).unwrap();
        let line = &record[0];
        assert_eq!(line[0], json!(r#"["hello",3]"#));
        assert!(line[1].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_clear_signal() {
        let signal = Entry::clear_signal();
        assert!(signal.is_clear_signal());
        assert!(signal.view.is_none());
        assert!(!Entry::new("x", json!("hello"), None).is_clear_signal());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_view_tags() {
        assert_eq!(View::Table.as_str(), "table");
        assert_eq!(View::Stack.to_string(), "stack");
        assert_eq!(serde_json::to_string(&View::Location).unwrap(), "\"location\"");
    }
}
