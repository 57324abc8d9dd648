use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use skiff_protocol::transfer::Frame;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Lifecycle reports from the underlying channel implementation. The channel
/// is externally negotiated; the engine only reacts to these events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Closed,
    Error(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel send failed: {0}")]
    Send(String),
}

/// The already-negotiated duplex frame transport between two peers. NAT
/// traversal and encryption belong to the implementation, not this trait.
#[async_trait]
pub trait DirectChannel: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Next inbound frame; `None` once the channel is closed.
    async fn recv(&self) -> Option<Frame>;

    /// Bytes the transport has accepted but not yet flushed to the peer.
    /// Backpressure admission control gates on this number.
    fn buffered_amount(&self) -> usize;

    fn events(&self) -> broadcast::Receiver<ChannelEvent>;
}

fn frame_len(frame: &Frame) -> usize {
    match frame {
        Frame::Text(text) => text.len(),
        Frame::Binary(bytes) => bytes.len(),
    }
}

/// In-memory channel pair for tests and same-process embedding. Each side's
/// `buffered_amount` is the byte count its peer has not yet received.
pub struct MemoryChannel {
    outbox: mpsc::UnboundedSender<Frame>,
    inbox: Mutex<mpsc::UnboundedReceiver<Frame>>,
    /// Our unflushed outbound bytes; drained by the peer's `recv`.
    buffered: Arc<AtomicUsize>,
    /// The peer's counter, which our `recv` drains.
    peer_buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    events_tx: broadcast::Sender<ChannelEvent>,
}

pub fn memory_channel_pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a_buffered = Arc::new(AtomicUsize::new(0));
    let b_buffered = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let (a_events, _) = broadcast::channel(16);
    let (b_events, _) = broadcast::channel(16);

    let a = Arc::new(MemoryChannel {
        outbox: b_tx,
        inbox: Mutex::new(a_rx),
        buffered: a_buffered.clone(),
        peer_buffered: b_buffered.clone(),
        closed: closed.clone(),
        events_tx: a_events,
    });
    let b = Arc::new(MemoryChannel {
        outbox: a_tx,
        inbox: Mutex::new(b_rx),
        buffered: b_buffered,
        peer_buffered: a_buffered,
        closed,
        events_tx: b_events,
    });
    (a, b)
}

impl MemoryChannel {
    /// Report the channel as open to anyone watching events.
    pub fn mark_open(&self) {
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    /// Inject a transport failure: further sends fail and watchers see the
    /// error.
    pub fn inject_error(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Error(reason.to_string()));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }
}

#[async_trait]
impl DirectChannel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.buffered.fetch_add(frame_len(&frame), Ordering::SeqCst);
        self.outbox
            .send(frame)
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn recv(&self) -> Option<Frame> {
        let frame = self.inbox.lock().await.recv().await?;
        self.peer_buffered
            .fetch_sub(frame_len(&frame), Ordering::SeqCst);
        Some(frame)
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn frames_cross_the_pair_in_order() {
        let (a, b) = memory_channel_pair();
        a.send(Frame::Text("one".into())).await.unwrap();
        a.send(Frame::Binary(Bytes::from_static(b"two")))
            .await
            .unwrap();
        assert_eq!(b.recv().await, Some(Frame::Text("one".into())));
        assert_eq!(
            b.recv().await,
            Some(Frame::Binary(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn buffered_amount_tracks_undrained_bytes() {
        let (a, b) = memory_channel_pair();
        a.send(Frame::Binary(Bytes::from(vec![0u8; 100])))
            .await
            .unwrap();
        a.send(Frame::Binary(Bytes::from(vec![0u8; 50])))
            .await
            .unwrap();
        assert_eq!(a.buffered_amount(), 150);
        let _ = b.recv().await;
        assert_eq!(a.buffered_amount(), 50);
        let _ = b.recv().await;
        assert_eq!(a.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn injected_error_fails_sends_and_notifies() {
        let (a, _b) = memory_channel_pair();
        let mut events = a.events();
        a.inject_error("carrier lost");
        assert!(matches!(
            a.send(Frame::Text("x".into())).await,
            Err(ChannelError::Closed)
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Error("carrier lost".into())
        );
    }
}
