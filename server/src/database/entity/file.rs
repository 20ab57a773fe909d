//! Durable file record created at successful finalization.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::upload::StorageStrategy;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub repo_name: String,
    /// Remote blob reference: a manifest path, a content path, or
    /// `release:<release_id>:<asset_id>`.
    pub blob_path: String,
    pub storage_strategy: StorageStrategy,
    /// Strategy-specific details as an opaque document.
    pub storage_metadata: Json,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
