//! Upload session lifecycle.
//!
//! The session service owns every status transition; the other
//! components only report facts to it. Mutations on one session are
//! serialized twice over: a per-session lock keeps local writers out of
//! each other's way, and the conditional update in
//! [`StashDatabase::advance_progress`] stays authoritative even when
//! several server processes share the metadata store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use gitstash::api::v1::upload::{
    ChunkResult, FinalizeResult, InitRequest, InitResponse, StatusResponse,
};

use crate::config::Config;
use crate::database::entity::upload::{self, Entity as Upload, UploadStatus};
use crate::database::entity::upload_chunk;
use crate::database::StashDatabase;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::github::RemoteStore;
use crate::materialize::Materializer;
use crate::scratch::ScratchStore;
use crate::strategy;

/// Orchestrates the upload lifecycle between the metadata store, the
/// scratch store, and the materializer.
pub struct SessionService {
    config: Arc<Config>,
    db: DatabaseConnection,
    scratch: ScratchStore,
    materializer: Materializer,
    locks: SessionLocks,
}

/// Registry of per-session mutexes, created on demand.
#[derive(Default)]
struct SessionLocks {
    inner: std::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, upload_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap();
            map.entry(upload_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops the registry entry once a session reaches a terminal state.
    /// Holders of the old Arc finish unaffected.
    fn forget(&self, upload_id: Uuid) {
        self.inner.lock().unwrap().remove(&upload_id);
    }
}

impl SessionService {
    pub fn new(
        config: Arc<Config>,
        db: DatabaseConnection,
        scratch: ScratchStore,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            config,
            materializer: Materializer::new(remote, scratch.clone()),
            db,
            scratch,
            locks: SessionLocks::default(),
        }
    }

    /// Creates a new session and returns the chunking instructions.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn init(&self, user_id: Uuid, request: InitRequest) -> ServerResult<InitResponse> {
        if request.filename.trim().is_empty() {
            return Err(ServerError::request_error(anyhow!("filename is required")));
        }
        if request.size <= 0 {
            return Err(ServerError::request_error(anyhow!(
                "file size must be greater than zero"
            )));
        }
        let policy = &self.config.strategy;
        if request.size > policy.max_upload_bytes {
            return Err(ServerError::request_error(anyhow!(
                "file size exceeds max limit ({} bytes)",
                policy.max_upload_bytes
            )));
        }

        let chunk_size = strategy::chunk_size_for(&self.config.chunking, request.size);
        let total_chunks = strategy::total_chunks(request.size, chunk_size);
        let chosen = strategy::select_strategy(policy, request.size);

        let upload_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + self.config.session.ttl;

        upload::ActiveModel {
            id: Set(upload_id),
            user_id: Set(user_id),
            filename: Set(request.filename.clone()),
            mime_type: Set(request.mime_type.clone()),
            target_path: Set(sanitize_path(&request.folder)),
            strategy: Set(chosen),
            status: Set(UploadStatus::Pending),
            chunk_size_bytes: Set(chunk_size),
            total_chunks: Set(total_chunks),
            total_size_bytes: Set(request.size),
            received_chunks: Set(0),
            received_bytes: Set(0),
            repo_name: Set(self.config.github.repo.clone()),
            manifest_path: Set(None),
            error_message: Set(None),
            file_id: Set(None),
            expires_at: Set(expires_at),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(&self.db)
        .await
        .map_err(ServerError::database_error)?;

        info!(%upload_id, size = request.size, ?chosen, total_chunks, "initialized upload");

        Ok(InitResponse {
            upload_id,
            chunk_size,
            total_chunks,
            strategy: chosen.into(),
            repo_name: self.config.github.repo.clone(),
            max_upload_size: policy.max_upload_bytes,
            expires_at,
        })
    }

    /// Stages one chunk and advances the session's progress cursor.
    #[instrument(skip_all, fields(upload_id = %upload_id, chunk_index = chunk_index))]
    pub async fn put_chunk<R>(
        &self,
        user_id: Uuid,
        upload_id: Uuid,
        chunk_index: i32,
        client_checksum: Option<String>,
        data: R,
    ) -> ServerResult<ChunkResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _guard = self.locks.acquire(upload_id).await;

        let upload = self.load_session(user_id, upload_id).await?;
        self.fail_if_expired(&upload).await?;

        match upload.status {
            UploadStatus::Completed => {
                return Ok(ChunkResult {
                    received_chunk: chunk_index,
                    next_chunk_index: upload.total_chunks,
                    is_complete: true,
                });
            }
            UploadStatus::Aborted => {
                return Err(ErrorKind::IllegalState("upload aborted".to_string()).into());
            }
            UploadStatus::Failed => {
                return Err(ErrorKind::IllegalState("upload failed".to_string()).into());
            }
            UploadStatus::Processing => {
                return Err(
                    ErrorKind::IllegalState("upload is being finalized".to_string()).into(),
                );
            }
            UploadStatus::Pending | UploadStatus::InProgress => {}
        }

        // Replays of already-accepted chunks succeed without side effects.
        if chunk_index < upload.received_chunks {
            return Ok(ChunkResult {
                received_chunk: chunk_index,
                next_chunk_index: upload.received_chunks,
                is_complete: upload.received_chunks == upload.total_chunks,
            });
        }
        if chunk_index > upload.received_chunks || chunk_index >= upload.total_chunks {
            return Err(ErrorKind::ChunkOutOfOrder {
                expected: upload.received_chunks,
                got: chunk_index,
            }
            .into());
        }

        let staged = self.scratch.write_chunk(upload_id, chunk_index, data).await?;

        let expected_size = strategy::expected_chunk_size(
            upload.total_size_bytes,
            upload.chunk_size_bytes,
            chunk_index,
            upload.total_chunks,
        );
        if staged.size_bytes != expected_size {
            self.scratch.discard_chunk(upload_id, chunk_index).await?;
            return Err(ErrorKind::IntegrityError(format!(
                "chunk {chunk_index} size mismatch: got {} bytes, expected {expected_size}",
                staged.size_bytes
            ))
            .into());
        }

        if let Some(hint) = &client_checksum {
            if !hint.eq_ignore_ascii_case(&staged.checksum) {
                self.scratch.discard_chunk(upload_id, chunk_index).await?;
                return Err(ErrorKind::IntegrityError(format!(
                    "checksum mismatch for chunk {chunk_index}"
                ))
                .into());
            }
        }

        let record = upload_chunk::ActiveModel {
            upload_id: Set(upload_id),
            chunk_index: Set(chunk_index),
            size_bytes: Set(staged.size_bytes),
            checksum: Set(staged.checksum.clone()),
            client_checksum: Set(client_checksum),
            scratch_path: Set(staged.path.to_string_lossy().into_owned()),
            received_at: Set(Utc::now()),
        };
        let recorded = upload_chunk::Entity::insert(record)
            .on_conflict(
                OnConflict::columns([
                    upload_chunk::Column::UploadId,
                    upload_chunk::Column::ChunkIndex,
                ])
                .update_columns([
                    upload_chunk::Column::SizeBytes,
                    upload_chunk::Column::Checksum,
                    upload_chunk::Column::ClientChecksum,
                    upload_chunk::Column::ScratchPath,
                    upload_chunk::Column::ReceivedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await;
        if let Err(e) = recorded {
            let _ = self.scratch.discard_chunk(upload_id, chunk_index).await;
            return Err(ServerError::database_error(e));
        }

        let advanced = self
            .db
            .advance_progress(upload_id, chunk_index, staged.size_bytes)
            .await?;
        if !advanced {
            // Another writer advanced past us, or the status moved under
            // our feet; answer from the fresh state.
            let fresh = self.load_session(user_id, upload_id).await?;
            if chunk_index < fresh.received_chunks {
                return Ok(ChunkResult {
                    received_chunk: chunk_index,
                    next_chunk_index: fresh.received_chunks,
                    is_complete: fresh.received_chunks == fresh.total_chunks,
                });
            }
            return Err(ErrorKind::ChunkOutOfOrder {
                expected: fresh.received_chunks,
                got: chunk_index,
            }
            .into());
        }

        let next = chunk_index + 1;
        Ok(ChunkResult {
            received_chunk: chunk_index,
            next_chunk_index: next,
            is_complete: next == upload.total_chunks,
        })
    }

    /// Snapshot of the session, sufficient for a client to resume.
    pub async fn status(&self, user_id: Uuid, upload_id: Uuid) -> ServerResult<StatusResponse> {
        let upload = self.load_session(user_id, upload_id).await?;
        self.fail_if_expired(&upload).await?;

        Ok(StatusResponse {
            upload_id: upload.id,
            status: upload.status.into(),
            strategy: upload.strategy.into(),
            received_bytes: upload.received_bytes,
            received_chunks: upload.received_chunks,
            total_chunks: upload.total_chunks,
            chunk_size: upload.chunk_size_bytes,
            next_chunk: upload.received_chunks,
        })
    }

    /// Materializes a complete chunk set into a durable file.
    #[instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn finalize(&self, user_id: Uuid, upload_id: Uuid) -> ServerResult<FinalizeResult> {
        let _guard = self.locks.acquire(upload_id).await;

        let mut upload = self.load_session(user_id, upload_id).await?;
        self.fail_if_expired(&upload).await?;

        match upload.status {
            UploadStatus::Completed => {
                // Finalize is idempotent: answer with the recorded file.
                let file_id = upload.file_id.ok_or_else(|| {
                    ServerError::database_error(anyhow!(
                        "completed session {upload_id} has no file record"
                    ))
                })?;
                return Ok(FinalizeResult {
                    file_id,
                    path: upload.target_path,
                    name: upload.filename,
                    size: upload.total_size_bytes,
                    completed_at: upload.completed_at.unwrap_or_else(Utc::now),
                });
            }
            UploadStatus::Aborted => {
                return Err(ErrorKind::IllegalState("upload aborted".to_string()).into());
            }
            UploadStatus::Failed => {
                return Err(ErrorKind::IllegalState("upload failed".to_string()).into());
            }
            // Processing survives a crashed finalize attempt; let a
            // retry drive it to a terminal state.
            UploadStatus::Pending | UploadStatus::InProgress | UploadStatus::Processing => {}
        }

        if upload.received_chunks != upload.total_chunks {
            return Err(ErrorKind::IllegalState(format!(
                "cannot finalize: received {}/{} chunks",
                upload.received_chunks, upload.total_chunks
            ))
            .into());
        }

        let chunks = upload_chunk::Entity::find()
            .filter(upload_chunk::Column::UploadId.eq(upload_id))
            .order_by_asc(upload_chunk::Column::ChunkIndex)
            .all(&self.db)
            .await
            .map_err(ServerError::database_error)?;

        self.set_status(upload_id, UploadStatus::Processing).await?;
        upload.status = UploadStatus::Processing;

        match self.materializer.materialize(&self.db, &upload, &chunks).await {
            Ok(file_id) => {
                self.scratch.remove_session(upload_id).await?;
                self.locks.forget(upload_id);
                Ok(FinalizeResult {
                    file_id,
                    path: upload.target_path,
                    name: upload.filename,
                    size: upload.total_size_bytes,
                    completed_at: Utc::now(),
                })
            }
            Err(e) => {
                // Scratch is kept so operators can inspect the staged
                // bytes; a sweeper reclaims it later.
                warn!(%upload_id, "materialization failed: {e}");
                self.mark_failed(upload_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Aborts a session and releases its scratch space.
    #[instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn abort(&self, user_id: Uuid, upload_id: Uuid) -> ServerResult<()> {
        let _guard = self.locks.acquire(upload_id).await;

        let upload = self.load_session(user_id, upload_id).await?;
        self.fail_if_expired(&upload).await?;

        match upload.status {
            UploadStatus::Aborted => return Ok(()),
            UploadStatus::Completed => {
                return Err(
                    ErrorKind::IllegalState("cannot abort completed upload".to_string()).into(),
                );
            }
            UploadStatus::Failed => {
                return Err(ErrorKind::IllegalState("upload failed".to_string()).into());
            }
            UploadStatus::Processing => {
                return Err(ErrorKind::IllegalState(
                    "cannot abort while the upload is being finalized".to_string(),
                )
                .into());
            }
            UploadStatus::Pending | UploadStatus::InProgress => {}
        }

        self.set_status(upload_id, UploadStatus::Aborted).await?;
        upload_chunk::Entity::delete_many()
            .filter(upload_chunk::Column::UploadId.eq(upload_id))
            .exec(&self.db)
            .await
            .map_err(ServerError::database_error)?;
        self.scratch.remove_session(upload_id).await?;
        self.locks.forget(upload_id);

        info!(%upload_id, "aborted upload");
        Ok(())
    }

    async fn load_session(&self, user_id: Uuid, upload_id: Uuid) -> ServerResult<upload::Model> {
        Upload::find_by_id(upload_id)
            .filter(upload::Column::UserId.eq(user_id))
            .one(&self.db)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ErrorKind::NoSuchSession.into())
    }

    /// Lazily fails sessions past their expiration and releases their
    /// scratch space. Expired sessions accept no further operation.
    async fn fail_if_expired(&self, upload: &upload::Model) -> ServerResult<()> {
        if upload.status.is_terminal() || upload.expires_at >= Utc::now() {
            return Ok(());
        }

        warn!(upload_id = %upload.id, "session expired, failing it");
        self.mark_failed(upload.id, "upload session expired").await?;
        self.scratch.remove_session(upload.id).await?;
        self.locks.forget(upload.id);
        Err(ErrorKind::SessionExpired.into())
    }

    async fn set_status(&self, upload_id: Uuid, status: UploadStatus) -> ServerResult<()> {
        Upload::update_many()
            .col_expr(upload::Column::Status, Expr::value(status))
            .col_expr(upload::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(upload::Column::Id.eq(upload_id))
            .filter(upload::Column::Status.is_in([
                UploadStatus::Pending,
                UploadStatus::InProgress,
                UploadStatus::Processing,
            ]))
            .exec(&self.db)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }

    async fn mark_failed(&self, upload_id: Uuid, message: &str) -> ServerResult<()> {
        Upload::update_many()
            .col_expr(upload::Column::Status, Expr::value(UploadStatus::Failed))
            .col_expr(
                upload::Column::ErrorMessage,
                Expr::value(message.to_string()),
            )
            .col_expr(upload::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(upload::Column::Id.eq(upload_id))
            .filter(upload::Column::Status.is_in([
                UploadStatus::Pending,
                UploadStatus::InProgress,
                UploadStatus::Processing,
            ]))
            .exec(&self.db)
            .await
            .map_err(ServerError::database_error)?;
        Ok(())
    }
}

/// Normalizes a client-supplied logical folder to an absolute, lexically
/// clean path.
fn sanitize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }

    let mut stack: Vec<&str> = Vec::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}
