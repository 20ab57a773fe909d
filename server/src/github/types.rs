//! Payload shapes for the subset of the GitHub REST API we speak.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ContentWriteRequest {
    pub message: String,
    /// Base64-encoded file content.
    pub content: String,
    /// Blob SHA of the file being replaced; required on update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentWriteResponse {
    pub content: Option<ContentInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ContentInfo {
    pub sha: String,
}

/// Metadata of an existing file, as returned by a contents GET.
#[derive(Debug, Deserialize)]
pub struct ContentMetadata {
    pub sha: String,
}

#[derive(Debug, Serialize)]
pub struct ContentDeleteRequest {
    pub message: String,
    pub sha: String,
}

#[derive(Debug, Serialize)]
pub struct CreateReleaseRequest {
    pub tag_name: String,
    pub name: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct Release {
    pub id: i64,
    pub tag_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseAsset {
    pub id: i64,
    pub name: String,
}
