//! Event instances.

use crate::error::ChartError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An event name with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: BTreeMap::new(),
        }
    }

    /// Adds a payload entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Builds an event from a JSON object payload (`null` means no payload).
    pub fn from_json(name: impl Into<String>, payload: &serde_json::Value) -> Result<Self, ChartError> {
        let mut event = Event::new(name);
        match payload {
            serde_json::Value::Null => {}
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let value = Value::from_json(v).ok_or_else(|| ChartError::InvalidPayload {
                        reason: format!("field '{}' is not a scalar", k),
                    })?;
                    event.payload.insert(k.clone(), value);
                }
            }
            other => {
                return Err(ChartError::InvalidPayload {
                    reason: format!("expected an object, got {}", other),
                })
            }
        }
        Ok(event)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

impl From<String> for Event {
    fn from(name: String) -> Self {
        Event::new(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            return write!(f, "{}", self.name);
        }
        let fields: Vec<String> = self
            .payload
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}({})", self.name, fields.join(", "))
    }
}
