use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed length of a room code.
pub const CODE_LENGTH: usize = 6;

/// The two roles a room can hold, one peer each.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Initiator,
    Joiner,
}

impl RoomRole {
    pub fn other(self) -> RoomRole {
        match self {
            RoomRole::Initiator => RoomRole::Joiner,
            RoomRole::Joiner => RoomRole::Initiator,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Ready,
}

/// Messages a peer sends to the coordinator. The offer/answer/ice/control
/// payloads are opaque: the coordinator forwards every field verbatim and only
/// injects a `from` field on relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    Join {
        code: String,
        role: RoomRole,
    },
    Offer {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    Answer {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    Ice {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    Control {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl ClientEnvelope {
    /// Wire name of a relayable kind, `None` for `join`.
    pub fn relay_kind(&self) -> Option<&'static str> {
        match self {
            ClientEnvelope::Join { .. } => None,
            ClientEnvelope::Offer { .. } => Some("offer"),
            ClientEnvelope::Answer { .. } => Some("answer"),
            ClientEnvelope::Ice { .. } => Some("ice"),
            ClientEnvelope::Control { .. } => Some("control"),
        }
    }

    pub fn into_relay_payload(self) -> Option<Map<String, Value>> {
        match self {
            ClientEnvelope::Join { .. } => None,
            ClientEnvelope::Offer { payload }
            | ClientEnvelope::Answer { payload }
            | ClientEnvelope::Ice { payload }
            | ClientEnvelope::Control { payload } => Some(payload),
        }
    }
}

/// Messages the coordinator originates. Relayed peer traffic is rebuilt with
/// [`relayed`] instead and never passes through this enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorMessage {
    Joined {
        code: String,
        role: RoomRole,
        status: RoomStatus,
    },
    /// Pairing notification pushed to the peer that was already waiting.
    PeerJoined {
        role: RoomRole,
        status: RoomStatus,
    },
    PeerDisconnected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    RoomExpired {
        code: String,
    },
    Error {
        error: String,
    },
}

/// Rebuild a relayed message: the original payload fields, the original
/// `type`, and a `from` field naming the sending peer.
pub fn relayed(kind: &str, payload: Map<String, Value>, from: &str) -> Value {
    let mut map = payload;
    map.insert("type".into(), Value::String(kind.into()));
    map.insert("from".into(), Value::String(from.into()));
    Value::Object(map)
}

/// Room codes are fixed-length alphanumeric, compared case-insensitively.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Canonical registry form of a code.
pub fn normalize_code(code: &str) -> String {
    code.to_ascii_uppercase()
}
