use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One frame on the transfer channel. Control traffic is JSON text; chunk
/// payloads ride in a binary frame immediately after their header frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode transfer message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode transfer message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Per-file descriptor announced before any chunk of the file is sent. Total
/// chunk count and content hash are fixed once announced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub content_hash: String,
    pub file_index: u32,
}

impl FileMetadata {
    /// `ceil(size / chunk_size)`; zero-byte files still occupy one chunk slot
    /// of zero so completion detection has something to count.
    pub fn total_chunks_for(size: u64, chunk_size: u32) -> u32 {
        if size == 0 {
            return 1;
        }
        ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
    }

    /// Byte range `[start, end)` covered by `chunk_index`.
    pub fn chunk_span(&self, chunk_index: u32) -> (u64, u64) {
        let start = chunk_index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.size);
        (start, end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferMessage {
    FileMetadata(FileMetadata),
    #[serde(rename_all = "camelCase")]
    ChunkHeader {
        file_id: String,
        chunk_index: u32,
        chunk_id: String,
        size: u32,
    },
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        chunk_id: String,
        timestamp: u64,
    },
    TransferComplete {
        timestamp: u64,
    },
}

impl TransferMessage {
    pub fn encode(&self) -> Result<Frame, WireError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(WireError::Encode)
    }

    pub fn decode(text: &str) -> Result<TransferMessage, WireError> {
        serde_json::from_str(text).map_err(WireError::Decode)
    }
}

/// Correlation id for one `(file, chunk)` in flight.
pub fn chunk_id(file_id: &str, chunk_index: u32) -> String {
    format!("{}_{}", file_id, chunk_index)
}

pub fn generate_file_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the epoch, the timestamp unit of acks and completion.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(FileMetadata::total_chunks_for(40_000, 16_384), 3);
        assert_eq!(FileMetadata::total_chunks_for(16_384, 16_384), 1);
        assert_eq!(FileMetadata::total_chunks_for(16_385, 16_384), 2);
        assert_eq!(FileMetadata::total_chunks_for(0, 16_384), 1);
    }

    #[test]
    fn chunk_span_clamps_final_chunk() {
        let meta = FileMetadata {
            file_id: "f1".into(),
            filename: "a.bin".into(),
            size: 40_000,
            mime_type: "application/octet-stream".into(),
            chunk_size: 16_384,
            total_chunks: 3,
            content_hash: String::new(),
            file_index: 0,
        };
        assert_eq!(meta.chunk_span(0), (0, 16_384));
        assert_eq!(meta.chunk_span(1), (16_384, 32_768));
        assert_eq!(meta.chunk_span(2), (32_768, 40_000));
    }

    #[test]
    fn metadata_wire_shape_is_camel_case() {
        let msg = TransferMessage::FileMetadata(FileMetadata {
            file_id: "f1".into(),
            filename: "notes.txt".into(),
            size: 10,
            mime_type: "text/plain".into(),
            chunk_size: 16_384,
            total_chunks: 1,
            content_hash: "ab".into(),
            file_index: 0,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "file-metadata");
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["mimeType"], "text/plain");
        assert_eq!(json["totalChunks"], 1);
        assert_eq!(json["contentHash"], "ab");
        assert_eq!(json["fileIndex"], 0);
    }

    #[test]
    fn header_and_ack_round_trip() {
        let header = TransferMessage::ChunkHeader {
            file_id: "f1".into(),
            chunk_index: 2,
            chunk_id: chunk_id("f1", 2),
            size: 7_232,
        };
        let Frame::Text(text) = header.encode().unwrap() else {
            panic!("header must encode as text");
        };
        assert_eq!(TransferMessage::decode(&text).unwrap(), header);

        let ack = TransferMessage::ChunkAck {
            chunk_id: "f1_2".into(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "chunk-ack");
        assert_eq!(json["chunkId"], "f1_2");
    }
}
