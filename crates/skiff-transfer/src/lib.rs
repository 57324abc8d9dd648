//! Transfer engine for skiff: chunked file transfer over a direct peer
//! channel with acknowledgment-based retry, flow control, end-to-end
//! integrity verification, and a one-way fallback onto a store-and-forward
//! relay when the direct channel cannot be established or fails.

pub mod assembler;
pub mod channel;
pub mod config;
pub mod events;
pub mod fallback;
pub mod hash;
pub mod receiver;
pub mod relay;
pub mod sender;
pub mod session;
pub mod signaling;

pub use channel::{ChannelError, ChannelEvent, DirectChannel};
pub use config::TransferConfig;
pub use events::{ReceivedFile, SessionState, TransferError, TransferEvent};
pub use fallback::TransferPath;
pub use sender::OutgoingFile;
