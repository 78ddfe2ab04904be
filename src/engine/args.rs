//! Connection arguments
//!
//! Handlers receive their credentials as a flat JSON object. Arguments are
//! read fresh on every connect; nothing is cached across attempts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use quarry_core::{FederationError, FederationResult};

use crate::observability::sensitive::redact_json;

/// Ordered key/value connection parameters.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionArgs(Map<String, JsonValue>);

impl ConnectionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: JsonValue) -> FederationResult<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Ok(Self::default()),
            other => Err(FederationError::configuration(format!(
                "connection arguments must be an object, got {other}"
            ))),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    fn is_present(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    /// Fails with a configuration error listing every absent field.
    pub fn require(&self, handler: &str, fields: &[&str]) -> FederationResult<()> {
        let missing: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|field| !self.is_present(field))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FederationError::missing_fields(handler, &missing))
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// String argument; numbers and booleans are rendered as text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Like [`get_str`](Self::get_str) but for a field already checked by `require`.
    pub fn required_str(&self, handler: &str, key: &str) -> FederationResult<String> {
        self.get_str(key)
            .ok_or_else(|| FederationError::missing_fields(handler, &[key]))
    }

    pub fn get_u64(&self, key: &str) -> FederationResult<Option<u64>> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                FederationError::configuration(format!("'{key}' must be a non-negative integer"))
            }),
            Some(JsonValue::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| {
                FederationError::configuration(format!("'{key}' must be a non-negative integer"))
            }),
            Some(_) => Err(FederationError::configuration(format!(
                "'{key}' must be a non-negative integer"
            ))),
        }
    }

    pub fn get_bool(&self, key: &str) -> FederationResult<Option<bool>> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(FederationError::configuration(format!(
                    "'{key}' must be a boolean"
                ))),
            },
            Some(_) => Err(FederationError::configuration(format!(
                "'{key}' must be a boolean"
            ))),
        }
    }
}

impl fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", redact_json(&JsonValue::Object(self.0.clone())))
    }
}
