//! Metadata store access.
//!
//! Entities live in [`entity`], schema migrations in [`migration`]. The
//! [`StashDatabase`] extension adds the conditional-update primitives the
//! session service relies on; the row-level compare-and-set in
//! [`StashDatabase::advance_progress`] is the only cross-process
//! serialization the upload protocol needs.

pub mod entity;
pub mod migration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter,
};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{ServerError, ServerResult};
use self::entity::storage_usage;
use self::entity::upload::{self, Entity as Upload, UploadStatus};

/// Connects to the metadata store.
pub async fn connect(config: &DatabaseConfig) -> ServerResult<DatabaseConnection> {
    Database::connect(config.url.as_str())
        .await
        .map_err(ServerError::database_error)
}

/// Extension methods over any connection (including transactions).
#[async_trait]
pub trait StashDatabase {
    /// Conditionally advances a session's progress cursor.
    ///
    /// Succeeds only when the session's `received_chunks` still equals
    /// `expected_index` and the status is `pending` or `in_progress`;
    /// returns `false` otherwise so the caller can answer idempotently
    /// or report an ordering error. The first successful advance flips
    /// `pending` to `in_progress`.
    async fn advance_progress(
        &self,
        upload_id: Uuid,
        expected_index: i32,
        chunk_bytes: i64,
    ) -> ServerResult<bool>;

    /// Links the finished file to the session and marks it completed.
    ///
    /// Only touches sessions that have not already reached a terminal
    /// status, which makes replays harmless.
    async fn link_file(&self, upload_id: Uuid, file_id: Uuid) -> ServerResult<()>;

    /// Bumps the owner's storage usage counters by one file of
    /// `delta_bytes`.
    async fn bump_storage_usage(&self, user_id: Uuid, delta_bytes: i64) -> ServerResult<()>;
}

#[async_trait]
impl<C: ConnectionTrait + Send> StashDatabase for C {
    async fn advance_progress(
        &self,
        upload_id: Uuid,
        expected_index: i32,
        chunk_bytes: i64,
    ) -> ServerResult<bool> {
        let result = Upload::update_many()
            .col_expr(
                upload::Column::ReceivedChunks,
                Expr::col(upload::Column::ReceivedChunks).add(1),
            )
            .col_expr(
                upload::Column::ReceivedBytes,
                Expr::col(upload::Column::ReceivedBytes).add(chunk_bytes),
            )
            .col_expr(upload::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(upload::Column::Id.eq(upload_id))
            .filter(upload::Column::ReceivedChunks.eq(expected_index))
            .filter(
                upload::Column::Status
                    .is_in([UploadStatus::Pending, UploadStatus::InProgress]),
            )
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected == 0 {
            return Ok(false);
        }

        Upload::update_many()
            .col_expr(
                upload::Column::Status,
                Expr::value(UploadStatus::InProgress),
            )
            .filter(upload::Column::Id.eq(upload_id))
            .filter(upload::Column::Status.eq(UploadStatus::Pending))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(true)
    }

    async fn link_file(&self, upload_id: Uuid, file_id: Uuid) -> ServerResult<()> {
        let now = Utc::now();
        Upload::update_many()
            .col_expr(upload::Column::FileId, Expr::value(file_id))
            .col_expr(upload::Column::Status, Expr::value(UploadStatus::Completed))
            .col_expr(upload::Column::CompletedAt, Expr::value(now))
            .col_expr(upload::Column::UpdatedAt, Expr::value(now))
            .filter(upload::Column::Id.eq(upload_id))
            .filter(upload::Column::Status.is_in([
                UploadStatus::Pending,
                UploadStatus::InProgress,
                UploadStatus::Processing,
            ]))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn bump_storage_usage(&self, user_id: Uuid, delta_bytes: i64) -> ServerResult<()> {
        let updated = storage_usage::Entity::update_many()
            .col_expr(
                storage_usage::Column::TotalBytes,
                Expr::col(storage_usage::Column::TotalBytes).add(delta_bytes),
            )
            .col_expr(
                storage_usage::Column::FileCount,
                Expr::col(storage_usage::Column::FileCount).add(1),
            )
            .col_expr(storage_usage::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(storage_usage::Column::UserId.eq(user_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if updated.rows_affected > 0 {
            return Ok(());
        }

        let row = storage_usage::ActiveModel {
            user_id: Set(user_id),
            total_bytes: Set(delta_bytes),
            file_count: Set(1),
            updated_at: Set(Utc::now()),
        };

        match row.insert(self).await {
            Ok(_) => Ok(()),
            // Lost the insert race; fold the delta into the winner's row.
            Err(_) => {
                storage_usage::Entity::update_many()
                    .col_expr(
                        storage_usage::Column::TotalBytes,
                        Expr::col(storage_usage::Column::TotalBytes).add(delta_bytes),
                    )
                    .col_expr(
                        storage_usage::Column::FileCount,
                        Expr::col(storage_usage::Column::FileCount).add(1),
                    )
                    .col_expr(storage_usage::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(storage_usage::Column::UserId.eq(user_id))
                    .exec(self)
                    .await
                    .map_err(ServerError::database_error)?;
                Ok(())
            }
        }
    }
}
