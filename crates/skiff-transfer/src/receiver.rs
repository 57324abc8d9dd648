use std::collections::HashMap;
use std::sync::Arc;

use skiff_protocol::transfer::{Frame, TransferMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::assembler::{AssembleError, ChunkAssembler};
use crate::channel::DirectChannel;
use crate::config::TransferConfig;
use crate::events::{ReceivedFile, SessionState, TransferError, TransferEvent};

/// Control surface for a running receiver task.
pub struct ReceiverHandle {
    cancel: mpsc::UnboundedSender<()>,
}

impl ReceiverHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }
}

/// Header seen, binary payload not yet arrived.
struct PendingHeader {
    file_id: String,
    chunk_index: u32,
    chunk_id: String,
    size: u32,
}

pub fn spawn_receiver(
    channel: Arc<dyn DirectChannel>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> (ReceiverHandle, JoinHandle<Result<Vec<ReceivedFile>, TransferError>>) {
    let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
    let receiver = Receiver {
        channel,
        config,
        events,
        cancel: cancel_rx,
        assembler: ChunkAssembler::new(),
        pending_header: None,
        completed: Vec::new(),
        last_progress: HashMap::new(),
        state: SessionState::Idle,
    };
    let task = tokio::spawn(receiver.run());
    (ReceiverHandle { cancel: cancel_tx }, task)
}

struct Receiver {
    channel: Arc<dyn DirectChannel>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
    cancel: mpsc::UnboundedReceiver<()>,
    assembler: ChunkAssembler,
    pending_header: Option<PendingHeader>,
    completed: Vec<ReceivedFile>,
    last_progress: HashMap<String, Instant>,
    state: SessionState,
}

enum Step {
    Cancelled,
    Frame(Option<Frame>),
}

impl Receiver {
    async fn run(mut self) -> Result<Vec<ReceivedFile>, TransferError> {
        self.set_state(SessionState::Streaming);
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.recv() => Step::Cancelled,
                frame = self.channel.recv() => Step::Frame(frame),
            };

            match step {
                Step::Cancelled => {
                    self.set_state(SessionState::Cancelled);
                    return Err(TransferError::Cancelled);
                }
                // Not a terminal state here: channel loss is the fallback
                // arbiter's call.
                Step::Frame(None) => {
                    return Err(TransferError::Channel(
                        "channel closed before transfer completed".into(),
                    ));
                }
                Step::Frame(Some(Frame::Text(text))) => {
                    if self.handle_text(&text).await? {
                        self.set_state(SessionState::Done);
                        return Ok(std::mem::take(&mut self.completed));
                    }
                }
                Step::Frame(Some(Frame::Binary(payload))) => {
                    self.handle_binary(payload).await?;
                }
            }
        }
    }

    /// Returns `true` once the sender has signalled transfer completion.
    async fn handle_text(&mut self, text: &str) -> Result<bool, TransferError> {
        match TransferMessage::decode(text) {
            Ok(TransferMessage::FileMetadata(meta)) => {
                debug!(
                    file = %meta.file_id,
                    chunks = meta.total_chunks,
                    "file metadata announced"
                );
                let file_id = meta.file_id.clone();
                if let Err(err) = self.assembler.announce(meta) {
                    self.emit_file_error(&file_id, &err);
                }
            }
            Ok(TransferMessage::ChunkHeader {
                file_id,
                chunk_index,
                chunk_id,
                size,
            }) => {
                if self.pending_header.is_some() {
                    warn!(chunk = %chunk_id, "chunk header arrived before previous payload");
                }
                self.pending_header = Some(PendingHeader {
                    file_id,
                    chunk_index,
                    chunk_id,
                    size,
                });
            }
            Ok(TransferMessage::TransferComplete { .. }) => return Ok(true),
            Ok(TransferMessage::ChunkAck { chunk_id, .. }) => {
                warn!(chunk = %chunk_id, "unexpected ack on receiver side");
            }
            Err(err) => {
                warn!(error = %err, "undecodable text frame on transfer channel");
            }
        }
        Ok(false)
    }

    async fn handle_binary(&mut self, payload: bytes::Bytes) -> Result<(), TransferError> {
        let Some(header) = self.pending_header.take() else {
            warn!(
                bytes = payload.len(),
                "binary frame without a preceding chunk header"
            );
            return Ok(());
        };
        if payload.len() != header.size as usize {
            warn!(
                chunk = %header.chunk_id,
                declared = header.size,
                actual = payload.len(),
                "chunk payload length differs from its header"
            );
        }

        let outcome = match self.assembler.ingest(
            &header.file_id,
            header.chunk_index,
            &header.chunk_id,
            payload,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Desynchronization: discard the chunk, fail that file, keep
                // the session alive for the rest of the batch.
                self.emit_file_error(&header.file_id, &err);
                return Ok(());
            }
        };

        let ack = outcome
            .ack
            .encode()
            .map_err(|e| TransferError::Wire(e.to_string()))?;
        self.channel
            .send(ack)
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;

        // Throttled per file; the completing chunk always reports.
        let now = Instant::now();
        let file_done = outcome.stored_chunks == outcome.total_chunks;
        let due = self
            .last_progress
            .get(&header.file_id)
            .map_or(true, |last| now - *last >= self.config.progress_interval);
        if file_done || due {
            self.last_progress.insert(header.file_id.clone(), now);
            let _ = self.events.send(TransferEvent::FileProgress {
                file_id: header.file_id.clone(),
                transferred: outcome.received_bytes,
                total: outcome.total_bytes,
                chunks_done: outcome.stored_chunks,
                total_chunks: outcome.total_chunks,
            });
        }

        if let Some(file) = outcome.completed {
            self.completed.push(file.clone());
            let _ = self.events.send(TransferEvent::FileCompleted(file));
        }
        if let Some(err) = outcome.failed {
            self.emit_file_error(&header.file_id, &err);
        }
        Ok(())
    }

    fn emit_file_error(&self, file_id: &str, err: &AssembleError) {
        let error = match err {
            AssembleError::HashMismatch { file_id, filename } => TransferError::IntegrityFailure {
                file_id: file_id.clone(),
                filename: filename.clone(),
            },
            other => TransferError::Desync(other.to_string()),
        };
        let _ = self.events.send(TransferEvent::FileFailed {
            file_id: file_id.to_string(),
            error,
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let _ = self.events.send(TransferEvent::StateChanged(state));
    }
}
