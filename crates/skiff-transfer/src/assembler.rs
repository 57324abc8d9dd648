use std::collections::HashMap;

use bytes::Bytes;
use skiff_protocol::transfer::{unix_millis, FileMetadata, TransferMessage};
use thiserror::Error;

use crate::events::ReceivedFile;
use crate::hash::content_hash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("duplicate metadata announcement for file {file_id}")]
    DuplicateMetadata { file_id: String },
    #[error("chunk for unknown file {file_id}")]
    UnknownFile { file_id: String },
    #[error("chunk index {chunk_index} out of range for file {file_id} ({total_chunks} chunks)")]
    IndexOutOfRange {
        file_id: String,
        chunk_index: u32,
        total_chunks: u32,
    },
    #[error("content hash mismatch for file {file_id} ({filename})")]
    HashMismatch { file_id: String, filename: String },
}

/// What one stored chunk produced: the immediate acknowledgment, progress
/// counters, and either a verified file or a file-fatal integrity error.
#[derive(Debug)]
pub struct IngestOutcome {
    pub ack: TransferMessage,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub stored_chunks: u32,
    pub total_chunks: u32,
    pub completed: Option<ReceivedFile>,
    pub failed: Option<AssembleError>,
}

#[derive(Debug)]
enum Reception {
    /// Chunks still outstanding.
    Filling {
        meta: FileMetadata,
        slots: Vec<Option<Bytes>>,
        stored: u32,
        received_bytes: u64,
    },
    /// Reassembled and verified (or failed verification); late duplicate
    /// chunks are re-acked without a second completion.
    Settled { meta: FileMetadata },
}

/// Receiver-side reassembly buffer (§ChunkAssembler): stores chunks by index,
/// detects completion, and verifies the announced content hash. Purely
/// synchronous; the receiver session owns the channel I/O around it.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    files: HashMap<String, Reception>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an announced file. Announcements are final: re-announcing a
    /// known file id is a protocol error, never a redefinition.
    pub fn announce(&mut self, meta: FileMetadata) -> Result<(), AssembleError> {
        if self.files.contains_key(&meta.file_id) {
            return Err(AssembleError::DuplicateMetadata {
                file_id: meta.file_id,
            });
        }
        let slots = vec![None; meta.total_chunks as usize];
        self.files.insert(
            meta.file_id.clone(),
            Reception::Filling {
                meta,
                slots,
                stored: 0,
                received_bytes: 0,
            },
        );
        Ok(())
    }

    pub fn is_announced(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }

    /// Store one chunk. Unknown files and out-of-range indices are rejected
    /// as desynchronization errors; storing is idempotent by index.
    pub fn ingest(
        &mut self,
        file_id: &str,
        chunk_index: u32,
        chunk_id: &str,
        payload: Bytes,
    ) -> Result<IngestOutcome, AssembleError> {
        let reception = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| AssembleError::UnknownFile {
                file_id: file_id.to_string(),
            })?;

        let ack = TransferMessage::ChunkAck {
            chunk_id: chunk_id.to_string(),
            timestamp: unix_millis(),
        };

        let (meta, slots, stored, received_bytes) = match reception {
            Reception::Settled { meta } => {
                if chunk_index >= meta.total_chunks {
                    return Err(AssembleError::IndexOutOfRange {
                        file_id: file_id.to_string(),
                        chunk_index,
                        total_chunks: meta.total_chunks,
                    });
                }
                // Resend raced the ack; re-ack without double completion.
                return Ok(IngestOutcome {
                    ack,
                    received_bytes: meta.size,
                    total_bytes: meta.size,
                    stored_chunks: meta.total_chunks,
                    total_chunks: meta.total_chunks,
                    completed: None,
                    failed: None,
                });
            }
            Reception::Filling {
                meta,
                slots,
                stored,
                received_bytes,
            } => (meta, slots, stored, received_bytes),
        };

        if chunk_index >= meta.total_chunks {
            return Err(AssembleError::IndexOutOfRange {
                file_id: file_id.to_string(),
                chunk_index,
                total_chunks: meta.total_chunks,
            });
        }

        let slot = &mut slots[chunk_index as usize];
        match slot {
            Some(existing) => {
                // Duplicate delivery overwrites in place.
                *received_bytes -= existing.len() as u64;
                *received_bytes += payload.len() as u64;
                *existing = payload;
            }
            None => {
                *received_bytes += payload.len() as u64;
                *slot = Some(payload);
                *stored += 1;
            }
        }

        let mut outcome = IngestOutcome {
            ack,
            received_bytes: *received_bytes,
            total_bytes: meta.size,
            stored_chunks: *stored,
            total_chunks: meta.total_chunks,
            completed: None,
            failed: None,
        };

        if *stored == meta.total_chunks {
            let meta = meta.clone();
            let mut combined = Vec::with_capacity(meta.size as usize);
            for slot in slots.iter() {
                // Every slot is Some once stored == total.
                if let Some(bytes) = slot {
                    combined.extend_from_slice(bytes);
                }
            }
            self.files.insert(
                file_id.to_string(),
                Reception::Settled { meta: meta.clone() },
            );

            if content_hash(&combined) == meta.content_hash {
                outcome.completed = Some(ReceivedFile {
                    filename: sanitize_filename(&meta.filename),
                    bytes: Bytes::from(combined),
                    metadata: meta,
                });
            } else {
                outcome.failed = Some(AssembleError::HashMismatch {
                    file_id: meta.file_id.clone(),
                    filename: meta.filename.clone(),
                });
            }
        }

        Ok(outcome)
    }
}

/// Portable filename form of a declared name: anything outside
/// `[A-Za-z0-9._-]` becomes `_`, capped at 255 bytes.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.chars().take(255).collect()
}
