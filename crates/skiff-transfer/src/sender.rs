use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use skiff_protocol::transfer::{
    chunk_id, generate_file_id, unix_millis, FileMetadata, Frame, TransferMessage,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::DirectChannel;
use crate::config::TransferConfig;
use crate::events::{SessionState, TransferError, TransferEvent};
use crate::hash::content_hash;

/// One file handed to the sender, before planning.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// A file with its announced descriptor fixed: id, hash, and chunk count are
/// computed once here and never change afterwards.
#[derive(Debug, Clone)]
pub struct FilePlan {
    pub meta: FileMetadata,
    pub bytes: Bytes,
}

/// Assign ids and compute hashes/chunk counts for a batch, in batch order.
pub fn plan_batch(files: Vec<OutgoingFile>, config: &TransferConfig) -> Vec<FilePlan> {
    files
        .into_iter()
        .enumerate()
        .map(|(index, file)| FilePlan {
            meta: FileMetadata {
                file_id: generate_file_id(),
                filename: file.filename,
                size: file.bytes.len() as u64,
                mime_type: file.mime_type,
                chunk_size: config.chunk_size,
                total_chunks: FileMetadata::total_chunks_for(
                    file.bytes.len() as u64,
                    config.chunk_size,
                ),
                content_hash: content_hash(&file.bytes),
                file_index: index as u32,
            },
            bytes: file.bytes,
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub enum SenderCommand {
    Pause,
    Resume,
    Cancel,
}

/// Control surface for a running sender task. Dropping the handle cancels the
/// session.
pub struct SenderHandle {
    commands: mpsc::UnboundedSender<SenderCommand>,
}

impl SenderHandle {
    pub fn pause(&self) {
        let _ = self.commands.send(SenderCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(SenderCommand::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(SenderCommand::Cancel);
    }
}

/// Outstanding chunk bookkeeping: one record per unacknowledged chunk id.
struct AckRecord {
    file: usize,
    chunk_index: u32,
    retries: u32,
    deadline: Instant,
}

pub fn spawn_sender(
    channel: Arc<dyn DirectChannel>,
    plans: Vec<FilePlan>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> (SenderHandle, JoinHandle<Result<(), TransferError>>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let sender = Sender {
        channel,
        config,
        events,
        commands: command_rx,
        acked_chunks: vec![0; plans.len()],
        plans,
        pending: HashMap::new(),
        last_progress: HashMap::new(),
        paused: false,
        backpressured: false,
        file_cursor: 0,
        chunk_cursor: 0,
        state: SessionState::Idle,
    };
    let task = tokio::spawn(sender.run());
    (
        SenderHandle {
            commands: command_tx,
        },
        task,
    )
}

struct Sender {
    channel: Arc<dyn DirectChannel>,
    plans: Vec<FilePlan>,
    config: TransferConfig,
    events: mpsc::UnboundedSender<TransferEvent>,
    commands: mpsc::UnboundedReceiver<SenderCommand>,
    pending: HashMap<String, AckRecord>,
    acked_chunks: Vec<u32>,
    last_progress: HashMap<usize, Instant>,
    paused: bool,
    backpressured: bool,
    file_cursor: usize,
    chunk_cursor: u32,
    state: SessionState,
}

impl Sender {
    async fn run(mut self) -> Result<(), TransferError> {
        let result = self.drive().await;
        match &result {
            Ok(()) => {}
            Err(TransferError::Cancelled) => self.set_state(SessionState::Cancelled),
            // Channel failures are the fallback arbiter's call, not a
            // terminal session state; everything else is.
            Err(TransferError::Channel(_)) => {}
            Err(_) => self.set_state(SessionState::Failed),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        self.set_state(SessionState::AnnouncingMetadata);
        for i in 0..self.plans.len() {
            self.poll_commands()?;
            let frame = TransferMessage::FileMetadata(self.plans[i].meta.clone())
                .encode()
                .map_err(|e| TransferError::Wire(e.to_string()))?;
            self.channel
                .send(frame)
                .await
                .map_err(|e| TransferError::Channel(e.to_string()))?;
            debug!(
                file = %self.plans[i].meta.file_id,
                chunks = self.plans[i].meta.total_chunks,
                "announced file metadata"
            );
        }

        self.set_state(SessionState::Streaming);
        while !(self.all_sent() && self.pending.is_empty()) {
            // Admission gates, re-evaluated before every chunk.
            let gated = self.check_backpressure();
            let window_full = self.pending.len() >= self.config.window;
            let admit = !self.paused && !window_full && !self.all_sent();
            let next_deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    self.apply_command(cmd)?;
                }
                frame = self.channel.recv() => match frame {
                    Some(Frame::Text(text)) => self.handle_text(&text),
                    Some(Frame::Binary(_)) => {
                        warn!("unexpected binary frame on sender side");
                    }
                    None => {
                        return Err(TransferError::Channel(
                            "channel closed while streaming".into(),
                        ));
                    }
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.handle_retries().await?;
                }
                _ = std::future::ready(()), if admit && !gated => {
                    self.send_next().await?;
                }
                _ = tokio::time::sleep(self.config.backpressure_poll), if admit && gated => {}
            }
        }

        self.set_state(SessionState::Completing);
        let frame = TransferMessage::TransferComplete {
            timestamp: unix_millis(),
        }
        .encode()
        .map_err(|e| TransferError::Wire(e.to_string()))?;
        self.channel
            .send(frame)
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;
        self.set_state(SessionState::Done);
        Ok(())
    }

    fn apply_command(&mut self, cmd: Option<SenderCommand>) -> Result<(), TransferError> {
        match cmd {
            Some(SenderCommand::Pause) => {
                self.paused = true;
                Ok(())
            }
            Some(SenderCommand::Resume) => {
                self.paused = false;
                Ok(())
            }
            Some(SenderCommand::Cancel) => Err(TransferError::Cancelled),
            // A dropped handle counts as cancellation: nobody can resume or
            // control this session anymore.
            None => Err(TransferError::Cancelled),
        }
    }

    fn poll_commands(&mut self) -> Result<(), TransferError> {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => self.apply_command(Some(cmd))?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(TransferError::Cancelled)
                }
            }
        }
    }

    /// High/low-water hysteresis on the transport's own buffered-byte level.
    fn check_backpressure(&mut self) -> bool {
        let buffered = self.channel.buffered_amount();
        if self.backpressured {
            if buffered <= self.config.low_water {
                self.backpressured = false;
            }
        } else if buffered >= self.config.high_water {
            self.backpressured = true;
        }
        self.backpressured
    }

    fn all_sent(&self) -> bool {
        self.file_cursor >= self.plans.len()
    }

    async fn send_next(&mut self) -> Result<(), TransferError> {
        let file = self.file_cursor;
        let index = self.chunk_cursor;
        self.send_chunk(file, index).await?;

        self.chunk_cursor += 1;
        if self.chunk_cursor >= self.plans[file].meta.total_chunks {
            self.file_cursor += 1;
            self.chunk_cursor = 0;
        }
        Ok(())
    }

    async fn send_chunk(&mut self, file: usize, index: u32) -> Result<(), TransferError> {
        let plan = &self.plans[file];
        let (start, end) = plan.meta.chunk_span(index);
        let payload = plan.bytes.slice(start as usize..end as usize);
        let id = chunk_id(&plan.meta.file_id, index);

        let header = TransferMessage::ChunkHeader {
            file_id: plan.meta.file_id.clone(),
            chunk_index: index,
            chunk_id: id.clone(),
            size: payload.len() as u32,
        }
        .encode()
        .map_err(|e| TransferError::Wire(e.to_string()))?;
        self.channel
            .send(header)
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;
        self.channel
            .send(Frame::Binary(payload))
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;

        let deadline = Instant::now() + self.config.retry_timeout;
        self.pending
            .entry(id)
            .and_modify(|record| record.deadline = deadline)
            .or_insert(AckRecord {
                file,
                chunk_index: index,
                retries: 0,
                deadline,
            });
        Ok(())
    }

    async fn handle_retries(&mut self) -> Result<(), TransferError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(record) = self.pending.get_mut(&id) else {
                continue;
            };
            let (file, chunk_index, retries) = (record.file, record.chunk_index, record.retries);
            if retries >= self.config.max_retries {
                let file_id = self.plans[file].meta.file_id.clone();
                return Err(TransferError::RetryExhausted {
                    file_id,
                    chunk_index,
                    retries,
                });
            }
            record.retries = retries + 1;
            warn!(
                chunk = %id,
                attempt = retries + 2,
                "chunk unacknowledged, resending"
            );
            self.send_chunk(file, chunk_index).await?;
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        match TransferMessage::decode(text) {
            Ok(TransferMessage::ChunkAck { chunk_id, .. }) => self.handle_ack(&chunk_id),
            Ok(other) => {
                warn!(?other, "unexpected transfer message on sender side");
            }
            Err(err) => {
                warn!(error = %err, "undecodable text frame on transfer channel");
            }
        }
    }

    fn handle_ack(&mut self, chunk_id: &str) {
        // Acks for chunks we no longer track (late duplicates) are ignored.
        let Some(record) = self.pending.remove(chunk_id) else {
            return;
        };
        let meta = &self.plans[record.file].meta;
        self.acked_chunks[record.file] += 1;
        let chunks_done = self.acked_chunks[record.file];

        // Throttled per file; the completing ack always reports.
        let now = Instant::now();
        let file_done = chunks_done == meta.total_chunks;
        let due = self
            .last_progress
            .get(&record.file)
            .map_or(true, |last| now - *last >= self.config.progress_interval);
        if !(file_done || due) {
            return;
        }
        self.last_progress.insert(record.file, now);

        let transferred = if file_done {
            meta.size
        } else {
            (chunks_done as u64 * meta.chunk_size as u64).min(meta.size)
        };
        let _ = self.events.send(TransferEvent::FileProgress {
            file_id: meta.file_id.clone(),
            transferred,
            total: meta.size,
            chunks_done,
            total_chunks: meta.total_chunks,
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
