use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::ChannelEvent;

/// Which delivery path a session is on. `Relay` is absorbing: once chosen,
/// the direct channel is never reconsidered for that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    AttemptingDirect,
    Direct,
    Relay,
}

/// The fallback decision machine. Pure transitions; [`drive`] owns the timer
/// and the channel-event subscription so the transition happens in exactly
/// one task and the open/timeout race cannot produce two active paths.
#[derive(Debug)]
pub struct FallbackArbiter {
    path: TransferPath,
}

impl FallbackArbiter {
    pub fn new() -> Self {
        Self {
            path: TransferPath::AttemptingDirect,
        }
    }

    pub fn path(&self) -> TransferPath {
        self.path
    }

    /// Feed a channel lifecycle report; returns the new path if it changed.
    pub fn on_channel_event(&mut self, event: &ChannelEvent) -> Option<TransferPath> {
        match (self.path, event) {
            (TransferPath::AttemptingDirect, ChannelEvent::Open) => {
                self.path = TransferPath::Direct;
                Some(TransferPath::Direct)
            }
            // Failure before or after the channel opened both divert to the
            // relay: fallback is a recovery path, not only a connect path.
            (TransferPath::AttemptingDirect, ChannelEvent::Error(_) | ChannelEvent::Closed)
            | (TransferPath::Direct, ChannelEvent::Error(_) | ChannelEvent::Closed) => {
                self.path = TransferPath::Relay;
                Some(TransferPath::Relay)
            }
            (TransferPath::Direct, ChannelEvent::Open) => None,
            (TransferPath::Relay, _) => None,
        }
    }

    /// The direct-channel open deadline fired.
    pub fn on_timeout(&mut self) -> Option<TransferPath> {
        match self.path {
            TransferPath::AttemptingDirect => {
                self.path = TransferPath::Relay;
                Some(TransferPath::Relay)
            }
            _ => None,
        }
    }
}

impl Default for FallbackArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the arbiter against a channel's event stream. The watch receiver
/// reports the current path; it settles permanently once `Relay` is reached.
pub fn drive(
    mut events: broadcast::Receiver<ChannelEvent>,
    timeout: Duration,
) -> (watch::Receiver<TransferPath>, JoinHandle<()>) {
    let (path_tx, path_rx) = watch::channel(TransferPath::AttemptingDirect);
    let task = tokio::spawn(async move {
        let mut arbiter = FallbackArbiter::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let changed = tokio::select! {
                // Biased toward channel reports: an open that raced the
                // deadline wins. Guarding kills the deadline the instant
                // the channel opens; both branches run in this one task.
                biased;
                event = events.recv() => match event {
                    Ok(event) => arbiter.on_channel_event(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut deadline, if arbiter.path() == TransferPath::AttemptingDirect => {
                    arbiter.on_timeout()
                }
            };

            if let Some(path) = changed {
                info!(?path, "transfer path decided");
                if path_tx.send(path).is_err() {
                    break;
                }
                if path == TransferPath::Relay {
                    break;
                }
            }
        }
    });
    (path_rx, task)
}
