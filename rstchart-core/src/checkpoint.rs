//! Interpreter snapshots.

use crate::context::Context;
use crate::error::ChartError;
use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything needed to resume an interpreter on the same model.
///
/// Produced by [`crate::Interpreter::checkpoint`] and consumed by
/// [`crate::Interpreter::restore`], which checks it against the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique checkpoint ID.
    pub id: String,

    /// Name of the model.
    pub model: String,

    /// Model checksum at the time of the checkpoint.
    pub checksum: String,

    /// Creation timestamp (Unix millis).
    pub created_at: i64,

    /// Simulated time.
    pub time: f64,

    pub last_event_time: f64,

    /// Active states, ordered by depth.
    pub active_states: Vec<String>,

    pub context: Context,

    /// Entry time of every active state.
    pub entry_timestamps: BTreeMap<String, f64>,

    /// History memory, keyed by history state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub history: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_events: Vec<Event>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_events: Vec<Event>,
}

impl Checkpoint {
    pub fn generate_id() -> String {
        format!("ckpt-{}", uuid::Uuid::new_v4())
    }

    pub fn to_json(&self) -> Result<String, ChartError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ChartError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
