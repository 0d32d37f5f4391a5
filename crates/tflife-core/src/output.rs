//! Structured output parsing and assertions.
//!
//! Parses the JSON object the provisioning tool prints for `output -json`
//! (or a JSON apply stdout) and offers pure assertion helpers over it.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("malformed structured output: {0}")]
    Malformed(String),
    #[error("output key not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// A failed caller assertion over structured output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AssertionFailure {
    /// Output key the assertion was about, if any.
    pub key: Option<String>,
    pub message: String,
}

impl AssertionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            key: None,
            message: message.into(),
        }
    }

    pub fn for_key(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            message: message.into(),
        }
    }
}

/// Output key to JSON value mapping, read-only after parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredOutput {
    values: BTreeMap<String, Value>,
}

/// Keys of a Terraform `output -json` envelope.
const ENVELOPE_KEYS: [&str; 3] = ["sensitive", "type", "value"];

fn is_envelope(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == ENVELOPE_KEYS.len() && ENVELOPE_KEYS.iter().all(|k| map.contains_key(*k))
        }
        _ => false,
    }
}

impl StructuredOutput {
    /// Parse tool stdout into structured output.
    ///
    /// The text must be a JSON object. When every entry is an `output -json`
    /// envelope the inner `value` is unwrapped.
    pub fn parse(stdout: &str) -> Result<Self> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(OutputError::Malformed("empty output".to_string()));
        }

        let parsed: Value =
            serde_json::from_str(trimmed).map_err(|e| OutputError::Malformed(e.to_string()))?;
        let Value::Object(map) = parsed else {
            return Err(OutputError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(&parsed)
            )));
        };

        let unwrap = !map.is_empty() && map.values().all(is_envelope);
        let values = map
            .into_iter()
            .map(|(key, value)| {
                let value = if unwrap {
                    unwrap_envelope(value)
                } else {
                    value
                };
                (key, value)
            })
            .collect();

        Ok(Self { values })
    }

    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| OutputError::NotFound(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The outputs as one JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Fails if `key` is absent.
    pub fn assert_present(&self, key: &str) -> std::result::Result<(), AssertionFailure> {
        if self.has(key) {
            Ok(())
        } else {
            Err(AssertionFailure::for_key(
                key,
                format!("output `{key}` is missing"),
            ))
        }
    }

    /// Fails if `key` is absent or its value is empty.
    pub fn assert_non_empty(&self, key: &str) -> std::result::Result<(), AssertionFailure> {
        let value = self.get(key).map_err(|e| AssertionFailure::for_key(key, e.to_string()))?;
        if is_non_empty(value) {
            Ok(())
        } else {
            Err(AssertionFailure::for_key(
                key,
                format!("output `{key}` should not be empty"),
            ))
        }
    }

    /// Fails unless `key` is an object containing `nested`.
    pub fn assert_contains_key(
        &self,
        key: &str,
        nested: &str,
    ) -> std::result::Result<(), AssertionFailure> {
        let value = self.get(key).map_err(|e| AssertionFailure::for_key(key, e.to_string()))?;
        if contains_key(value, nested) {
            Ok(())
        } else {
            Err(AssertionFailure::for_key(
                key,
                format!("output `{key}` should contain `{nested}`"),
            ))
        }
    }

    pub fn assert_string(&self, key: &str) -> std::result::Result<(), AssertionFailure> {
        self.assert_shape(key, Value::is_string, "a string")
    }

    pub fn assert_object(&self, key: &str) -> std::result::Result<(), AssertionFailure> {
        self.assert_shape(key, Value::is_object, "an object")
    }

    fn assert_shape(
        &self,
        key: &str,
        check: fn(&Value) -> bool,
        expected: &str,
    ) -> std::result::Result<(), AssertionFailure> {
        let value = self.get(key).map_err(|e| AssertionFailure::for_key(key, e.to_string()))?;
        if check(value) {
            Ok(())
        } else {
            Err(AssertionFailure::for_key(
                key,
                format!("output `{key}` should be {expected}, got {}", json_kind(value)),
            ))
        }
    }
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        other => other,
    }
}

/// Emptiness in the testify sense: null, "", [], {} and false are empty.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Object key membership; for arrays, element equality with a string.
pub fn contains_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => map.contains_key(key),
        Value::Array(items) => items.iter().any(|item| item.as_str() == Some(key)),
        Value::String(s) => s.contains(key),
        _ => false,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl From<Map<String, Value>> for StructuredOutput {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }
}
