use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use skiff_protocol::transfer::FileMetadata;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::assembler::sanitize_filename;
use crate::config::TransferConfig;
use crate::events::{ReceivedFile, TransferError, TransferEvent};
use crate::hash::content_hash;
use crate::sender::FilePlan;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(String),
    #[error("relay store has no batch for code {0}")]
    UnknownBatch(String),
    #[error("relay store has no file {file_id} in batch {code}")]
    UnknownFile { code: String, file_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayFileEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUploadReceipt {
    #[serde(rename = "filesCount")]
    pub files_count: usize,
    pub files: Vec<RelayFileEntry>,
}

/// One file pushed to the relay store. Identity and declared size carry over
/// from the direct-path descriptor unchanged.
#[derive(Debug, Clone)]
pub struct RelayUpload {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// The store-and-forward collaborator (§relay path). Only the contract is
/// fixed; the store's own persistence format is its business.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn create_batch_upload(
        &self,
        code: &str,
        files: Vec<RelayUpload>,
    ) -> Result<BatchUploadReceipt, RelayError>;

    async fn list_batch(&self, code: &str) -> Result<Vec<RelayFileEntry>, RelayError>;

    async fn download_one(&self, code: &str, file_id: &str) -> Result<Bytes, RelayError>;
}

/// HTTP client for a relay store exposing the upload/list/download routes.
pub struct HttpRelayStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelayStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn session_url(&self, code: &str) -> String {
        format!("{}/sessions/{}", self.base_url, code)
    }
}

#[derive(Debug, Deserialize)]
struct ListBatchResponse {
    files: Vec<RelayFileEntry>,
}

#[async_trait]
impl RelayStore for HttpRelayStore {
    async fn create_batch_upload(
        &self,
        code: &str,
        files: Vec<RelayUpload>,
    ) -> Result<BatchUploadReceipt, RelayError> {
        let mut form = reqwest::multipart::Form::new();
        for file in files {
            let part = reqwest::multipart::Part::bytes(file.bytes.to_vec())
                .file_name(file.name)
                .mime_str(&file.mime_type)
                .map_err(|e| RelayError::Http(e.to_string()))?;
            form = form.part(format!("file-{}", file.id), part);
        }
        let response = self
            .client
            .post(format!("{}/files", self.session_url(code)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Http(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))
    }

    async fn list_batch(&self, code: &str) -> Result<Vec<RelayFileEntry>, RelayError> {
        let response = self
            .client
            .get(self.session_url(code))
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Http(e.to_string()))?;
        let listing: ListBatchResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;
        Ok(listing.files)
    }

    async fn download_one(&self, code: &str, file_id: &str) -> Result<Bytes, RelayError> {
        let url = format!("{}/files/{}", self.session_url(code), file_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Http(e.to_string()))?;
        response
            .bytes()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))
    }
}

/// In-memory relay store for tests and same-process setups.
#[derive(Default)]
pub struct MemoryRelayStore {
    batches: Mutex<HashMap<String, Vec<RelayUpload>>>,
}

impl MemoryRelayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayStore for MemoryRelayStore {
    async fn create_batch_upload(
        &self,
        code: &str,
        files: Vec<RelayUpload>,
    ) -> Result<BatchUploadReceipt, RelayError> {
        let mut batches = self.batches.lock().await;
        let batch = batches.entry(code.to_string()).or_default();
        let mut receipt = Vec::new();
        for file in files {
            receipt.push(RelayFileEntry {
                id: file.id.clone(),
                name: file.name.clone(),
                size: file.bytes.len() as u64,
            });
            batch.retain(|existing| existing.id != file.id);
            batch.push(file);
        }
        Ok(BatchUploadReceipt {
            files_count: receipt.len(),
            files: receipt,
        })
    }

    async fn list_batch(&self, code: &str) -> Result<Vec<RelayFileEntry>, RelayError> {
        let batches = self.batches.lock().await;
        let batch = batches
            .get(code)
            .ok_or_else(|| RelayError::UnknownBatch(code.to_string()))?;
        Ok(batch
            .iter()
            .map(|file| RelayFileEntry {
                id: file.id.clone(),
                name: file.name.clone(),
                size: file.bytes.len() as u64,
            })
            .collect())
    }

    async fn download_one(&self, code: &str, file_id: &str) -> Result<Bytes, RelayError> {
        let batches = self.batches.lock().await;
        let batch = batches
            .get(code)
            .ok_or_else(|| RelayError::UnknownBatch(code.to_string()))?;
        batch
            .iter()
            .find(|file| file.id == file_id)
            .map(|file| file.bytes.clone())
            .ok_or_else(|| RelayError::UnknownFile {
                code: code.to_string(),
                file_id: file_id.to_string(),
            })
    }
}

/// Sender half of the relay path: push the whole batch, identities unchanged.
pub async fn relay_upload(
    store: &dyn RelayStore,
    code: &str,
    plans: &[FilePlan],
) -> Result<BatchUploadReceipt, TransferError> {
    let uploads: Vec<RelayUpload> = plans
        .iter()
        .map(|plan| RelayUpload {
            id: plan.meta.file_id.clone(),
            name: plan.meta.filename.clone(),
            mime_type: plan.meta.mime_type.clone(),
            bytes: plan.bytes.clone(),
        })
        .collect();
    let receipt = store
        .create_batch_upload(code, uploads)
        .await
        .map_err(|e| TransferError::Relay(e.to_string()))?;
    debug!(code, files = receipt.files_count, "batch uploaded to relay");
    Ok(receipt)
}

/// Receiver half of the relay path: poll until every announced file is
/// present (bounded by the relay deadline), then download and verify each
/// against its announced hash — the same verification as the direct path.
pub async fn relay_download(
    store: &dyn RelayStore,
    code: &str,
    announced: &[FileMetadata],
    skip: &[String],
    config: &TransferConfig,
    events: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<Vec<ReceivedFile>, TransferError> {
    let wanted: Vec<&FileMetadata> = announced
        .iter()
        .filter(|meta| !skip.contains(&meta.file_id))
        .collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let deadline = tokio::time::Instant::now() + config.relay_deadline;
    loop {
        match store.list_batch(code).await {
            Ok(listing) => {
                let present = |meta: &&FileMetadata| {
                    listing.iter().any(|entry| entry.id == meta.file_id)
                };
                if wanted.iter().all(present) {
                    break;
                }
            }
            Err(err) => {
                debug!(code, error = %err, "relay batch not listable yet");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransferError::Relay(format!(
                "batch {} incomplete after {:?}",
                code, config.relay_deadline
            )));
        }
        tokio::time::sleep(config.relay_poll).await;
    }

    let mut received = Vec::new();
    for meta in wanted {
        let bytes = store
            .download_one(code, &meta.file_id)
            .await
            .map_err(|e| TransferError::Relay(e.to_string()))?;
        if content_hash(&bytes) != meta.content_hash {
            warn!(file = %meta.file_id, "relay download failed integrity check");
            let _ = events.send(TransferEvent::FileFailed {
                file_id: meta.file_id.clone(),
                error: TransferError::IntegrityFailure {
                    file_id: meta.file_id.clone(),
                    filename: meta.filename.clone(),
                },
            });
            continue;
        }
        let file = ReceivedFile {
            metadata: meta.clone(),
            filename: sanitize_filename(&meta.filename),
            bytes,
        };
        let _ = events.send(TransferEvent::FileCompleted(file.clone()));
        received.push(file);
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn plan_for(id: &str, bytes: &'static [u8]) -> FilePlan {
        FilePlan {
            meta: FileMetadata {
                file_id: id.into(),
                filename: format!("{id}.txt"),
                size: bytes.len() as u64,
                mime_type: "text/plain".into(),
                chunk_size: 4,
                total_chunks: FileMetadata::total_chunks_for(bytes.len() as u64, 4),
                content_hash: content_hash(bytes),
                file_index: 0,
            },
            bytes: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn identity_and_hash_survive_the_relay_round_trip() {
        let store = MemoryRelayStore::new();
        let plans = vec![plan_for("f1", b"hello relay"), plan_for("f2", b"second")];
        let receipt = relay_upload(&store, "A1B2C3", &plans).await.unwrap();
        assert_eq!(receipt.files_count, 2);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let announced: Vec<FileMetadata> = plans.iter().map(|p| p.meta.clone()).collect();
        let config = TransferConfig::default();
        let received = relay_download(&store, "A1B2C3", &announced, &[], &config, &events_tx)
            .await
            .unwrap();

        assert_eq!(received.len(), 2);
        assert_eq!(received[0].metadata.file_id, "f1");
        assert_eq!(&received[0].bytes[..], b"hello relay");
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            TransferEvent::FileCompleted(_)
        ));
    }

    #[tokio::test]
    async fn corrupted_relay_file_fails_that_file_only() {
        let store = MemoryRelayStore::new();
        let good = plan_for("good", b"intact");
        let mut bad = plan_for("bad", b"original");
        // The store serves different bytes than were announced.
        bad.bytes = Bytes::from_static(b"tampered");
        relay_upload(&store, "ROOM01", &[good.clone(), bad.clone()])
            .await
            .unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let announced = vec![good.meta.clone(), bad.meta.clone()];
        let config = TransferConfig::default();
        let received = relay_download(&store, "ROOM01", &announced, &[], &config, &events_tx)
            .await
            .unwrap();

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].metadata.file_id, "good");

        let mut saw_failure = false;
        while let Ok(event) = events_rx.try_recv() {
            if let TransferEvent::FileFailed { file_id, error } = event {
                assert_eq!(file_id, "bad");
                assert!(matches!(error, TransferError::IntegrityFailure { .. }));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn download_gives_up_at_the_relay_deadline() {
        let store = MemoryRelayStore::new();
        let plan = plan_for("f1", b"never uploaded");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = TransferConfig {
            relay_poll: Duration::from_millis(100),
            relay_deadline: Duration::from_millis(500),
            ..TransferConfig::default()
        };

        let err = relay_download(
            &store,
            "EMPTY1",
            &[plan.meta.clone()],
            &[],
            &config,
            &events_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Relay(_)));
    }

    #[tokio::test]
    async fn already_received_files_are_skipped() {
        let store = MemoryRelayStore::new();
        let plans = vec![plan_for("f1", b"one"), plan_for("f2", b"two")];
        relay_upload(&store, "SKIP01", &plans).await.unwrap();

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let announced: Vec<FileMetadata> = plans.iter().map(|p| p.meta.clone()).collect();
        let config = TransferConfig::default();
        let received = relay_download(
            &store,
            "SKIP01",
            &announced,
            &["f1".to_string()],
            &config,
            &events_tx,
        )
        .await
        .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].metadata.file_id, "f2");
    }
}
