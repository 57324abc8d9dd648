use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use skiff_protocol::signal::{
    normalize_code, ClientEnvelope, CoordinatorMessage, RoomRole, RoomStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::{JoinOutcome, Outbound, PeerHandle, RelayFault, RoomRegistry};

#[derive(Clone)]
pub struct CoordinatorState {
    pub registry: Arc<RoomRegistry>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<CoordinatorState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: CoordinatorState) {
    let peer_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let text = match &outbound {
                Outbound::Message(message) => serde_json::to_string(message),
                Outbound::Relay(value) => serde_json::to_string(value),
            };
            let Ok(text) = text else { continue };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(peer = %writer_peer, "writer task ended");
    });

    debug!(peer = %peer_id, "peer connected");

    let mut membership: Option<(String, RoomRole)> = None;
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "websocket error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                handle_envelope(&text, &peer_id, &mut membership, &state.registry, &tx);
            }
            Message::Close(_) => break,
            // Pings and pongs are handled by axum; binary frames have no
            // meaning on the signaling channel.
            _ => {}
        }
    }

    // Departure always goes through the registry, so the other member is
    // notified exactly once.
    if let Some((code, _)) = membership.take() {
        state.registry.leave(&code, &peer_id);
    }
    debug!(peer = %peer_id, "peer disconnected");
}

/// Dispatch one signaling message. Malformed or unrecognized kinds get an
/// error reply and never take the router down.
fn handle_envelope(
    text: &str,
    peer_id: &str,
    membership: &mut Option<(String, RoomRole)>,
    registry: &RoomRegistry,
    tx: &mpsc::UnboundedSender<Outbound>,
) {
    let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(peer = %peer_id, error = %err, "unparseable signaling message");
            send_error(tx, "unrecognized or malformed message");
            return;
        }
    };

    match envelope {
        ClientEnvelope::Join { code, role } => {
            if membership.is_some() {
                send_error(tx, "already in a room");
                return;
            }
            let peer = PeerHandle {
                peer_id: peer_id.to_string(),
                tx: tx.clone(),
            };
            match registry.create_or_join(&code, role, peer) {
                JoinOutcome::Created => {
                    let code = normalize_code(&code);
                    *membership = Some((code.clone(), role));
                    let _ = tx.send(Outbound::Message(CoordinatorMessage::Joined {
                        code,
                        role,
                        status: RoomStatus::Waiting,
                    }));
                }
                JoinOutcome::Joined => {
                    let code = normalize_code(&code);
                    *membership = Some((code.clone(), role));
                    let _ = tx.send(Outbound::Message(CoordinatorMessage::Joined {
                        code,
                        role,
                        status: RoomStatus::Ready,
                    }));
                }
                JoinOutcome::Full => send_error(tx, "room is full"),
                JoinOutcome::Invalid => send_error(tx, "invalid room code"),
            }
        }
        other => {
            let Some((code, _)) = membership.as_ref() else {
                send_error(tx, "not in a room");
                return;
            };
            let (Some(kind), Some(payload)) = (other.relay_kind(), other.into_relay_payload())
            else {
                // Join is the only non-relay kind and was handled above.
                return;
            };
            match registry.relay(code, peer_id, kind, payload) {
                Ok(()) => {}
                Err(RelayFault::NotInRoom) => send_error(tx, "not in a room"),
                Err(RelayFault::NoPeer) => send_error(tx, "no peer in room"),
            }
        }
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Outbound>, error: &str) {
    let _ = tx.send(Outbound::Message(CoordinatorMessage::Error {
        error: error.to_string(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    fn expect_message(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> CoordinatorMessage {
        match rx.try_recv().expect("an outbound message") {
            Outbound::Message(message) => message,
            Outbound::Relay(value) => panic!("expected coordinator message, got relay {value}"),
        }
    }

    #[tokio::test]
    async fn join_handshake_matches_the_wire_contract() {
        let registry = RoomRegistry::new(3600, 16);
        let (x_tx, mut x_rx) = connect();
        let (y_tx, mut y_rx) = connect();
        let mut x_room = None;
        let mut y_room = None;

        handle_envelope(
            r#"{"type":"join","code":"a1b2c3","role":"initiator"}"#,
            "peer-x",
            &mut x_room,
            &registry,
            &x_tx,
        );
        assert_eq!(
            expect_message(&mut x_rx),
            CoordinatorMessage::Joined {
                code: "A1B2C3".into(),
                role: RoomRole::Initiator,
                status: RoomStatus::Waiting,
            }
        );

        handle_envelope(
            r#"{"type":"join","code":"a1b2c3","role":"joiner"}"#,
            "peer-y",
            &mut y_room,
            &registry,
            &y_tx,
        );
        assert_eq!(
            expect_message(&mut y_rx),
            CoordinatorMessage::Joined {
                code: "A1B2C3".into(),
                role: RoomRole::Joiner,
                status: RoomStatus::Ready,
            }
        );
        // Both members observe ready: the joiner in its reply, the
        // initiator through the pairing notification.
        assert_eq!(
            expect_message(&mut x_rx),
            CoordinatorMessage::PeerJoined {
                role: RoomRole::Joiner,
                status: RoomStatus::Ready,
            }
        );
    }

    #[tokio::test]
    async fn handshake_payloads_relay_verbatim_with_from() {
        let registry = RoomRegistry::new(3600, 16);
        let (x_tx, _x_rx) = connect();
        let (y_tx, mut y_rx) = connect();
        let mut x_room = None;
        let mut y_room = None;

        handle_envelope(
            r#"{"type":"join","code":"ROOM10","role":"initiator"}"#,
            "peer-x",
            &mut x_room,
            &registry,
            &x_tx,
        );
        handle_envelope(
            r#"{"type":"join","code":"ROOM10","role":"joiner"}"#,
            "peer-y",
            &mut y_room,
            &registry,
            &y_tx,
        );

        handle_envelope(
            r#"{"type":"ice","candidate":"udp 192.0.2.1","sdpMid":"0"}"#,
            "peer-x",
            &mut x_room,
            &registry,
            &x_tx,
        );
        match y_rx.try_recv().unwrap() {
            Outbound::Relay(value) => {
                assert_eq!(value["type"], "ice");
                assert_eq!(value["candidate"], "udp 192.0.2.1");
                assert_eq!(value["sdpMid"], "0");
                assert_eq!(value["from"], "peer-x");
            }
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn structural_errors_reach_only_the_sender() {
        let registry = RoomRegistry::new(3600, 16);
        let (tx, mut rx) = connect();
        let mut room = None;

        // Relaying before joining any room.
        handle_envelope(
            r#"{"type":"offer","sdp":"v=0"}"#,
            "peer-z",
            &mut room,
            &registry,
            &tx,
        );
        assert_eq!(
            expect_message(&mut rx),
            CoordinatorMessage::Error {
                error: "not in a room".into()
            }
        );

        // Joined but alone: relay has nobody to reach.
        handle_envelope(
            r#"{"type":"join","code":"ROOM11","role":"initiator"}"#,
            "peer-z",
            &mut room,
            &registry,
            &tx,
        );
        let _ = expect_message(&mut rx); // joined reply
        handle_envelope(
            r#"{"type":"offer","sdp":"v=0"}"#,
            "peer-z",
            &mut room,
            &registry,
            &tx,
        );
        assert_eq!(
            expect_message(&mut rx),
            CoordinatorMessage::Error {
                error: "no peer in room".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_kinds_get_an_error_reply() {
        let registry = RoomRegistry::new(3600, 16);
        let (tx, mut rx) = connect();
        let mut room = None;

        handle_envelope(
            r#"{"type":"subscribe","topic":"rooms"}"#,
            "peer-q",
            &mut room,
            &registry,
            &tx,
        );
        assert_eq!(
            expect_message(&mut rx),
            CoordinatorMessage::Error {
                error: "unrecognized or malformed message".into()
            }
        );

        handle_envelope("not json at all", "peer-q", &mut room, &registry, &tx);
        assert_eq!(
            expect_message(&mut rx),
            CoordinatorMessage::Error {
                error: "unrecognized or malformed message".into()
            }
        );
    }

    #[tokio::test]
    async fn double_join_is_rejected() {
        let registry = RoomRegistry::new(3600, 16);
        let (tx, mut rx) = connect();
        let mut room = None;

        handle_envelope(
            r#"{"type":"join","code":"ROOM12","role":"initiator"}"#,
            "peer-a",
            &mut room,
            &registry,
            &tx,
        );
        let _ = expect_message(&mut rx);
        handle_envelope(
            r#"{"type":"join","code":"ROOM13","role":"initiator"}"#,
            "peer-a",
            &mut room,
            &registry,
            &tx,
        );
        assert_eq!(
            expect_message(&mut rx),
            CoordinatorMessage::Error {
                error: "already in a room".into()
            }
        );
    }
}
