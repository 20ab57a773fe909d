//! Upload session entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use gitstash::api::v1::upload as api;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "uploads")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub target_path: String,
    pub strategy: StorageStrategy,
    pub status: UploadStatus,
    pub chunk_size_bytes: i64,
    pub total_chunks: i32,
    pub total_size_bytes: i64,
    pub received_chunks: i32,
    pub received_bytes: i64,
    pub repo_name: String,
    pub manifest_path: Option<String>,
    pub error_message: Option<String>,
    pub file_id: Option<Uuid>,
    pub expires_at: DateTimeUtc,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub completed_at: Option<DateTimeUtc>,
}

/// Lifecycle states of an upload session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "aborted")]
    Aborted,
}

impl UploadStatus {
    /// Whether no further transition out of this status is legal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl From<UploadStatus> for api::UploadStatus {
    fn from(status: UploadStatus) -> Self {
        match status {
            UploadStatus::Pending => Self::Pending,
            UploadStatus::InProgress => Self::InProgress,
            UploadStatus::Processing => Self::Processing,
            UploadStatus::Completed => Self::Completed,
            UploadStatus::Failed => Self::Failed,
            UploadStatus::Aborted => Self::Aborted,
        }
    }
}

/// Storage strategy fixed on the session at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "kebab-case")]
pub enum StorageStrategy {
    #[sea_orm(string_value = "repo-chunks")]
    RepoChunks,
    #[sea_orm(string_value = "release-asset")]
    ReleaseAsset,
    #[sea_orm(string_value = "git-lfs")]
    GitLfs,
    #[sea_orm(string_value = "inline-blob")]
    InlineBlob,
}

impl From<StorageStrategy> for api::StorageStrategy {
    fn from(strategy: StorageStrategy) -> Self {
        match strategy {
            StorageStrategy::RepoChunks => Self::RepoChunks,
            StorageStrategy::ReleaseAsset => Self::ReleaseAsset,
            StorageStrategy::GitLfs => Self::GitLfs,
            StorageStrategy::InlineBlob => Self::InlineBlob,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::upload_chunk::Entity")]
    UploadChunk,
}

impl Related<super::upload_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UploadChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
