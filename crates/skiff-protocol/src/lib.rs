//! Wire grammar for the skiff transfer system: signaling envelopes exchanged
//! with the harbor coordinator, control payloads relayed between peers, and
//! the chunked transfer-channel protocol.

pub mod control;
pub mod signal;
pub mod transfer;

pub use control::ControlPayload;
pub use signal::{ClientEnvelope, CoordinatorMessage, RoomRole, RoomStatus};
pub use transfer::{chunk_id, Frame, FileMetadata, TransferMessage, WireError};
