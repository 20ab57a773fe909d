use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the shared service credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Header carrying the owner id vouched for by the upstream proxy.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Header carrying the 0-based index of the chunk being uploaded.
pub const CHUNK_INDEX_HEADER: &str = "X-Chunk-Index";

/// Header carrying the client-computed SHA-256 of the chunk, hex-encoded.
pub const CHUNK_CHECKSUM_HEADER: &str = "X-Chunk-Checksum";

/// How the finished object is kept on the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageStrategy {
    /// One remote blob per chunk plus a manifest document.
    RepoChunks,

    /// A single release asset holding the assembled file.
    ReleaseAsset,

    /// Tagged as LFS but materialized through the repo-chunks procedure.
    GitLfs,

    /// A single inline content blob, no manifest.
    InlineBlob,
}

impl StorageStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoChunks => "repo-chunks",
            Self::ReleaseAsset => "release-asset",
            Self::GitLfs => "git-lfs",
            Self::InlineBlob => "inline-blob",
        }
    }
}

impl fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InProgress,
    Processing,
    Completed,
    Failed,
    Aborted,
}

impl UploadStatus {
    /// Whether the session can no longer accept any mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Request to create a new upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Original filename as the client knows it.
    pub filename: String,

    /// Declared total size in bytes.
    pub size: i64,

    /// MIME hint supplied by the client; not verified.
    #[serde(default)]
    pub mime_type: String,

    /// Logical folder the finished file should appear under.
    #[serde(default)]
    pub folder: String,
}

/// Session parameters returned from init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub upload_id: Uuid,
    pub chunk_size: i64,
    pub total_chunks: i32,
    pub strategy: StorageStrategy,
    pub repo_name: String,
    pub max_upload_size: i64,
    pub expires_at: DateTime<Utc>,
}

/// Result of a single chunk upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    /// The index that was just acknowledged.
    pub received_chunk: i32,

    /// The only index the server will accept next.
    pub next_chunk_index: i32,

    /// Whether every chunk has now been received.
    pub is_complete: bool,
}

/// Snapshot of an upload session, sufficient to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub strategy: StorageStrategy,
    pub received_bytes: i64,
    pub received_chunks: i32,
    pub total_chunks: i32,
    pub chunk_size: i64,
    pub next_chunk: i32,
}

/// Coordinates of the durable file created at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResult {
    pub file_id: Uuid,
    pub path: String,
    pub name: String,
    pub size: i64,
    pub completed_at: DateTime<Utc>,
}

/// Acknowledgement of an abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub status: UploadStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_tags_are_kebab_case() {
        assert_eq!(
            serde_json::to_string(&StorageStrategy::RepoChunks).unwrap(),
            "\"repo-chunks\""
        );
        assert_eq!(
            serde_json::to_string(&StorageStrategy::ReleaseAsset).unwrap(),
            "\"release-asset\""
        );
        assert_eq!(StorageStrategy::GitLfs.to_string(), "git-lfs");
    }

    #[test]
    fn status_terminality() {
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Aborted.is_terminal());
        assert!(!UploadStatus::Pending.is_terminal());
        assert!(!UploadStatus::InProgress.is_terminal());
        assert!(!UploadStatus::Processing.is_terminal());
    }
}
