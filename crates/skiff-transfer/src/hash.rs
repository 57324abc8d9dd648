use sha2::{Digest, Sha256};

/// Content hash used in metadata announcements and end-to-end verification:
/// SHA-256, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
