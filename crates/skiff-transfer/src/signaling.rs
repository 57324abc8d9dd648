use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use skiff_protocol::control::ControlPayload;
use skiff_protocol::signal::{ClientEnvelope, CoordinatorMessage, RoomRole, RoomStatus};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling connection closed")]
    Closed,
}

/// What a peer observes on its signaling connection: typed coordinator
/// messages, plus opaque payloads relayed from the other room member.
#[derive(Debug)]
pub enum SignalingEvent {
    Joined {
        code: String,
        role: RoomRole,
        status: RoomStatus,
    },
    PeerJoined {
        role: RoomRole,
        status: RoomStatus,
    },
    PeerDisconnected {
        client_id: String,
    },
    RoomExpired {
        code: String,
    },
    ErrorNotice {
        error: String,
    },
    /// offer/answer/ice relayed verbatim from the other member.
    Handshake {
        kind: String,
        payload: Value,
    },
    Control(ControlPayload),
}

/// Peer-side connection to the harbor coordinator: a writer task draining an
/// outbox and a reader task turning frames into [`SignalingEvent`]s.
pub struct SignalingClient {
    outbox: mpsc::UnboundedSender<ClientEnvelope>,
    events: Mutex<mpsc::UnboundedReceiver<SignalingEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, SignalError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalError::Connect(e.to_string()))?;
        debug!(%url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbox_rx.recv().await {
                let Ok(text) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_event(&text) {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(Self {
            outbox: outbox_tx,
            events: Mutex::new(event_rx),
            tasks: vec![writer, reader],
        })
    }

    pub fn join(&self, code: &str, role: RoomRole) -> Result<(), SignalError> {
        self.send(ClientEnvelope::Join {
            code: code.to_string(),
            role,
        })
    }

    pub fn send_control(&self, payload: ControlPayload) -> Result<(), SignalError> {
        self.send(payload.into_envelope())
    }

    pub fn send(&self, envelope: ClientEnvelope) -> Result<(), SignalError> {
        self.outbox.send(envelope).map_err(|_| SignalError::Closed)
    }

    /// Next event from the coordinator; `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<SignalingEvent> {
        self.events.lock().await.recv().await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn parse_event(text: &str) -> Option<SignalingEvent> {
    if let Ok(message) = serde_json::from_str::<CoordinatorMessage>(text) {
        return Some(match message {
            CoordinatorMessage::Joined { code, role, status } => {
                SignalingEvent::Joined { code, role, status }
            }
            CoordinatorMessage::PeerJoined { role, status } => {
                SignalingEvent::PeerJoined { role, status }
            }
            CoordinatorMessage::PeerDisconnected { client_id } => {
                SignalingEvent::PeerDisconnected { client_id }
            }
            CoordinatorMessage::RoomExpired { code } => SignalingEvent::RoomExpired { code },
            CoordinatorMessage::Error { error } => SignalingEvent::ErrorNotice { error },
        });
    }

    // Not coordinator-originated: a payload relayed from the other member.
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "undecodable signaling frame");
            return None;
        }
    };
    let kind = value.get("type").and_then(Value::as_str)?.to_string();
    match kind.as_str() {
        "control" => match ControlPayload::from_relayed(&value) {
            Ok(payload) => Some(SignalingEvent::Control(payload)),
            Err(err) => {
                warn!(error = %err, "unrecognized control payload");
                None
            }
        },
        "offer" | "answer" | "ice" => Some(SignalingEvent::Handshake {
            kind,
            payload: value,
        }),
        other => {
            warn!(kind = other, "unrecognized signaling message kind");
            None
        }
    }
}
