use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};
use skiff_protocol::signal::{
    is_valid_code, normalize_code, relayed, CoordinatorMessage, RoomRole, RoomStatus, CODE_LENGTH,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the coordinator pushes down a peer's connection: a typed message of
/// its own, or a payload relayed verbatim from the other room member.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(CoordinatorMessage),
    Relay(Value),
}

/// One connected peer as the registry sees it: opaque id plus its outbox.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: String,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug)]
struct Room {
    code: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    members: HashMap<RoomRole, PeerHandle>,
}

impl Room {
    fn new(code: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            code,
            created_at: now,
            expires_at: now + ttl,
            members: HashMap::new(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn status(&self) -> RoomStatus {
        if self.members.len() == 2 {
            RoomStatus::Ready
        } else {
            RoomStatus::Waiting
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First member under this code; the room was created, status waiting.
    Created,
    /// Second member; both roles filled, the waiting peer was notified.
    Joined,
    Full,
    Invalid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelayFault {
    NotInRoom,
    NoPeer,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room code space exhausted after {0} attempts")]
    CodeSpaceExhausted(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct RoomSnapshot {
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The live pairing registry. DashMap entry locking serializes create, join,
/// leave, and sweep per room code; independent rooms never contend.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    ttl: Duration,
    max_code_attempts: usize,
}

impl RoomRegistry {
    pub fn new(ttl_seconds: u64, max_code_attempts: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            ttl: Duration::seconds(ttl_seconds as i64),
            max_code_attempts,
        }
    }

    /// A fresh code from a CSPRNG, collision-checked against the live
    /// registry. Bounded: beyond the attempt budget this is a fatal error.
    pub fn allocate_code(&self) -> Result<String, RegistryError> {
        for _ in 0..self.max_code_attempts {
            let code = generate_code();
            match self.rooms.get(&code) {
                None => return Ok(code),
                Some(room) if room.is_expired(Utc::now()) => {
                    drop(room);
                    self.expire_room(&code, Utc::now());
                    return Ok(code);
                }
                Some(_) => {
                    debug!(%code, "room code collision, retrying");
                }
            }
        }
        Err(RegistryError::CodeSpaceExhausted(self.max_code_attempts))
    }

    /// Join `code` as `role`, creating the room on the first join with an
    /// unseen code. On the second distinct peer, the waiting member gets a
    /// pairing notification and both sides are ready.
    pub fn create_or_join(&self, code: &str, role: RoomRole, peer: PeerHandle) -> JoinOutcome {
        if !is_valid_code(code) {
            return JoinOutcome::Invalid;
        }
        let code = normalize_code(code);
        let now = Utc::now();

        // An expired room is inert: reject it on lookup, clear it, and let
        // the join proceed as if the code had never been seen.
        if self
            .rooms
            .get(&code)
            .map(|room| room.is_expired(now))
            .unwrap_or(false)
        {
            self.expire_room(&code, now);
        }

        match self.rooms.entry(code.clone()) {
            Entry::Vacant(vacant) => {
                let mut room = Room::new(code.clone(), now, self.ttl);
                room.members.insert(role, peer);
                vacant.insert(room);
                info!(%code, ?role, "room created");
                JoinOutcome::Created
            }
            Entry::Occupied(mut occupied) => {
                let room = occupied.get_mut();
                if room.members.contains_key(&role) {
                    return JoinOutcome::Full;
                }
                let other = room.members.get(&role.other()).cloned();
                room.members.insert(role, peer);
                if let Some(other) = other {
                    let _ = other.tx.send(Outbound::Message(CoordinatorMessage::PeerJoined {
                        role,
                        status: RoomStatus::Ready,
                    }));
                }
                info!(%code, ?role, "room ready");
                JoinOutcome::Joined
            }
        }
    }

    /// Remove `peer_id` from its room. An emptied room is deleted; otherwise
    /// the remaining member is told about the departure, exactly once.
    pub fn leave(&self, code: &str, peer_id: &str) {
        let code = normalize_code(code);
        let mut emptied = false;
        if let Some(mut room) = self.rooms.get_mut(&code) {
            let before = room.members.len();
            room.members.retain(|_, member| member.peer_id != peer_id);
            if room.members.len() == before {
                return;
            }
            for member in room.members.values() {
                let _ = member
                    .tx
                    .send(Outbound::Message(CoordinatorMessage::PeerDisconnected {
                        client_id: peer_id.to_string(),
                    }));
            }
            emptied = room.members.is_empty();
            debug!(%code, peer = %peer_id, "peer left room");
        }
        if emptied {
            self.rooms.remove_if(&code, |_, room| room.members.is_empty());
            info!(%code, "room reclaimed");
        }
    }

    /// Forward an opaque payload to the other member of the sender's room.
    pub fn relay(
        &self,
        code: &str,
        from_peer: &str,
        kind: &str,
        payload: Map<String, Value>,
    ) -> Result<(), RelayFault> {
        let code = normalize_code(code);
        let room = self.rooms.get(&code).ok_or(RelayFault::NotInRoom)?;
        if room.is_expired(Utc::now()) {
            return Err(RelayFault::NotInRoom);
        }
        if !room
            .members
            .values()
            .any(|member| member.peer_id == from_peer)
        {
            return Err(RelayFault::NotInRoom);
        }
        let target = room
            .members
            .values()
            .find(|member| member.peer_id != from_peer)
            .ok_or(RelayFault::NoPeer)?;
        target
            .tx
            .send(Outbound::Relay(relayed(kind, payload, from_peer)))
            .map_err(|_| RelayFault::NoPeer)
    }

    /// Room state for the HTTP surface. Expired rooms read as absent.
    pub fn status(&self, code: &str) -> Option<RoomSnapshot> {
        let code = normalize_code(code);
        let now = Utc::now();
        let snapshot = self.rooms.get(&code).map(|room| {
            (
                room.is_expired(now),
                RoomSnapshot {
                    status: room.status(),
                    created_at: room.created_at,
                    expires_at: room.expires_at,
                },
            )
        })?;
        let (expired, snapshot) = snapshot;
        if expired {
            self.expire_room(&code, now);
            return None;
        }
        Some(snapshot)
    }

    /// Delete every expired room, telling any remaining members first.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        let mut swept = 0;
        for code in expired {
            if self.expire_room(&code, now) {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(count = swept, "swept expired rooms");
        }
        swept
    }

    fn expire_room(&self, code: &str, now: DateTime<Utc>) -> bool {
        match self.rooms.remove_if(code, |_, room| room.is_expired(now)) {
            Some((_, room)) => {
                for member in room.members.values() {
                    let _ = member
                        .tx
                        .send(Outbound::Message(CoordinatorMessage::RoomExpired {
                            code: room.code.clone(),
                        }));
                }
                warn!(%code, "room expired");
                true
            }
            None => false,
        }
    }
}

fn generate_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(CODE_LENGTH)
        .collect()
}
