use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::signal::ClientEnvelope;
use crate::transfer::FileMetadata;

/// Session-level notices carried inside signaling `control` envelopes. The
/// coordinator relays these without inspection; only the peers interpret them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ControlPayload {
    /// Batch summary announced before transfer starts, so the receiver can
    /// verify integrity identically on the direct and relay paths.
    Batch { files: Vec<FileMetadata> },
    /// The sender has switched this session to the relay path.
    Fallback { reason: String },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control payload is not an object")]
    NotAnObject,
    #[error("unrecognized control payload: {0}")]
    Unrecognized(#[source] serde_json::Error),
}

impl ControlPayload {
    pub fn into_envelope(self) -> ClientEnvelope {
        let payload = match serde_json::to_value(&self) {
            Ok(Value::Object(payload)) => payload,
            _ => Map::new(),
        };
        ClientEnvelope::Control { payload }
    }

    /// Parse a relayed control message. Extra fields added in transit (`from`,
    /// `type`) are ignored.
    pub fn from_relayed(value: &Value) -> Result<ControlPayload, ControlError> {
        let Value::Object(map) = value else {
            return Err(ControlError::NotAnObject);
        };
        let mut map: Map<String, Value> = map.clone();
        map.remove("type");
        map.remove("from");
        serde_json::from_value(Value::Object(map)).map_err(ControlError::Unrecognized)
    }
}
