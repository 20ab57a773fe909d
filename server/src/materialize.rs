//! Strategy-specific finalization.
//!
//! Given a complete chunk set, produces a durable remote object and a
//! file record. Remote writes are retried inside the remote client; this
//! module decides *what* to write for each strategy and keeps the
//! database consistent with the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use gitstash::util::Finally;

use crate::database::entity::upload::{self, Entity as Upload, StorageStrategy};
use crate::database::entity::{file, upload_chunk};
use crate::database::StashDatabase;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::github::{content_type_from_name, RemoteStore};
use crate::scratch::ScratchStore;

/// Version tag written into every chunk manifest.
pub const MANIFEST_SCHEMA_VERSION: &str = "2024-11-01";

/// Manifest document enumerating the chunks of a repo-chunks object.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    schema_version: &'static str,
    strategy: StorageStrategy,
    upload_id: Uuid,
    user_id: Uuid,
    file_name: &'a str,
    size_bytes: i64,
    chunk_size: i64,
    total_chunks: i32,
    chunks_path: &'a str,
    chunks: Vec<ManifestChunk>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ManifestChunk {
    index: i32,
    size: i64,
    checksum: String,
    path: String,
}

/// Outcome of the strategy-specific remote writes.
struct MaterializedObject {
    blob_path: String,
    metadata: serde_json::Value,
    manifest_path: Option<String>,
}

/// Turns a complete chunk set into a durable remote object plus a
/// [`file`] record.
pub struct Materializer {
    remote: Arc<dyn RemoteStore>,
    scratch: ScratchStore,
}

impl Materializer {
    pub fn new(remote: Arc<dyn RemoteStore>, scratch: ScratchStore) -> Self {
        Self { remote, scratch }
    }

    /// Runs the strategy procedure and records the file, returning the
    /// new file id. The session must already be in `processing`.
    #[instrument(skip_all, fields(upload_id = %upload.id, strategy = ?upload.strategy))]
    pub async fn materialize(
        &self,
        db: &DatabaseConnection,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
    ) -> ServerResult<Uuid> {
        self.verify_chunk_set(upload, chunks).await?;

        let object = match upload.strategy {
            StorageStrategy::RepoChunks | StorageStrategy::GitLfs => {
                self.write_repo_chunks(upload, chunks).await?
            }
            StorageStrategy::ReleaseAsset => self.write_release_asset(upload, chunks).await?,
            StorageStrategy::InlineBlob => self.write_inline_blob(upload, chunks).await?,
        };

        let file_id = Uuid::new_v4();
        let txn = db.begin().await.map_err(ServerError::database_error)?;

        file::ActiveModel {
            id: Set(file_id),
            user_id: Set(upload.user_id),
            name: Set(upload.filename.clone()),
            path: Set(upload.target_path.clone()),
            size_bytes: Set(upload.total_size_bytes),
            repo_name: Set(upload.repo_name.clone()),
            blob_path: Set(object.blob_path),
            storage_strategy: Set(upload.strategy),
            storage_metadata: Set(object.metadata),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(ServerError::database_error)?;

        if let Some(manifest_path) = &object.manifest_path {
            Upload::update_many()
                .col_expr(
                    upload::Column::ManifestPath,
                    Expr::value(manifest_path.clone()),
                )
                .filter(upload::Column::Id.eq(upload.id))
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;
        }

        txn.link_file(upload.id, file_id).await?;
        txn.bump_storage_usage(upload.user_id, upload.total_size_bytes)
            .await?;

        txn.commit().await.map_err(ServerError::database_error)?;

        info!(%file_id, "materialized upload");
        Ok(file_id)
    }

    /// Common preconditions: a dense chunk set whose bytes are on disk
    /// and sum to the declared size.
    async fn verify_chunk_set(
        &self,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
    ) -> ServerResult<()> {
        if chunks.len() as i32 != upload.total_chunks {
            return Err(ErrorKind::IntegrityError(format!(
                "chunk set incomplete ({}/{})",
                chunks.len(),
                upload.total_chunks
            ))
            .into());
        }

        let mut total = 0i64;
        for (position, chunk) in chunks.iter().enumerate() {
            if chunk.chunk_index != position as i32 {
                return Err(ErrorKind::IntegrityError(format!(
                    "chunk sequence has a gap at index {position}"
                ))
                .into());
            }
            match fs::metadata(&chunk.scratch_path).await {
                Ok(meta) if meta.is_file() => {}
                _ => {
                    return Err(ErrorKind::IntegrityError(format!(
                        "chunk {} is missing from scratch storage",
                        chunk.chunk_index
                    ))
                    .into());
                }
            }
            total += chunk.size_bytes;
        }

        if total != upload.total_size_bytes {
            return Err(ErrorKind::IntegrityError(format!(
                "received {total} bytes but {} were declared",
                upload.total_size_bytes
            ))
            .into());
        }

        Ok(())
    }

    /// Writes every chunk as its own remote blob, then a manifest
    /// enumerating them. On failure the blobs written so far are removed
    /// best-effort; the session is about to fail terminally, so they
    /// would otherwise be unreachable garbage in the repository.
    async fn write_repo_chunks(
        &self,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
    ) -> ServerResult<MaterializedObject> {
        let root = remote_root(upload);
        let chunks_dir = format!("{root}/chunks");

        let mut written: Vec<String> = Vec::new();
        match self
            .push_chunks_and_manifest(upload, chunks, &root, &chunks_dir, &mut written)
            .await
        {
            Ok(manifest_path) => Ok(MaterializedObject {
                blob_path: manifest_path.clone(),
                metadata: json!({
                    "manifestPath": manifest_path,
                    "chunksPath": chunks_dir,
                }),
                manifest_path: Some(manifest_path),
            }),
            Err(e) => {
                let message = format!("Remove partial upload {}", upload.id);
                for path in &written {
                    if let Err(cleanup_err) = self
                        .remote
                        .delete_path(&upload.repo_name, path, &message)
                        .await
                    {
                        warn!("failed to clean up partial blob {path}: {cleanup_err}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn push_chunks_and_manifest(
        &self,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
        root: &str,
        chunks_dir: &str,
        written: &mut Vec<String>,
    ) -> ServerResult<String> {
        for chunk in chunks {
            let data = fs::read(&chunk.scratch_path)
                .await
                .map_err(ServerError::storage_error)?;
            let path = format!("{chunks_dir}/chunk-{:05}", chunk.chunk_index);
            let message = format!(
                "Upload chunk {} for {}",
                chunk.chunk_index, upload.filename
            );
            self.remote
                .put_file(&upload.repo_name, &path, &message, &data)
                .await?;
            written.push(path);
        }

        let manifest = build_manifest(upload, chunks, chunks_dir);
        let body = serde_json::to_vec_pretty(&manifest).map_err(ServerError::request_error)?;
        let manifest_path = format!("{root}/manifest.json");
        self.remote
            .put_file(
                &upload.repo_name,
                &manifest_path,
                &format!("Add manifest for {}", upload.filename),
                &body,
            )
            .await?;

        Ok(manifest_path)
    }

    /// Assembles the chunks into one file and uploads it as a release
    /// asset under a tag derived from the session id.
    async fn write_release_asset(
        &self,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
    ) -> ServerResult<MaterializedObject> {
        let scratch_paths: Vec<String> = chunks.iter().map(|c| c.scratch_path.clone()).collect();
        let assembled = self.scratch.assemble(upload.id, scratch_paths).await?;
        let cleanup = Finally::new({
            let assembled = assembled.clone();
            async move {
                let _ = fs::remove_file(&assembled).await;
            }
        });

        let tag = format!("upload-{}", upload.id);
        let release_id = self
            .remote
            .ensure_release(
                &upload.repo_name,
                &tag,
                &upload.filename,
                &format!("Release for upload {}", upload.filename),
            )
            .await?;

        let asset = self
            .remote
            .upload_release_asset(
                &upload.repo_name,
                release_id,
                &upload.filename,
                content_type_from_name(&upload.filename),
                &assembled,
            )
            .await?;

        let _ = fs::remove_file(&assembled).await;
        cleanup.cancel();

        Ok(MaterializedObject {
            blob_path: format!("release:{}:{}", release_id, asset.asset_id),
            metadata: json!({
                "releaseId": release_id,
                "assetId": asset.asset_id,
                "assetName": asset.name,
                "tag": tag,
            }),
            manifest_path: None,
        })
    }

    /// Collapses the upload into a single remote content blob.
    async fn write_inline_blob(
        &self,
        upload: &upload::Model,
        chunks: &[upload_chunk::Model],
    ) -> ServerResult<MaterializedObject> {
        let scratch_paths: Vec<String> = chunks.iter().map(|c| c.scratch_path.clone()).collect();
        let assembled = self.scratch.assemble(upload.id, scratch_paths).await?;
        let cleanup = Finally::new({
            let assembled = assembled.clone();
            async move {
                let _ = fs::remove_file(&assembled).await;
            }
        });

        let data = fs::read(&assembled)
            .await
            .map_err(ServerError::storage_error)?;
        let path = format!(
            "{}/{}",
            remote_root(upload),
            sanitize_component(&upload.filename)
        );
        self.remote
            .put_file(
                &upload.repo_name,
                &path,
                &format!("Upload {}", upload.filename),
                &data,
            )
            .await?;

        let _ = fs::remove_file(&assembled).await;
        cleanup.cancel();

        Ok(MaterializedObject {
            blob_path: path.clone(),
            metadata: json!({ "path": path }),
            manifest_path: None,
        })
    }
}

fn remote_root(upload: &upload::Model) -> String {
    format!("uploads/{}/{}", upload.user_id, upload.id)
}

fn build_manifest<'a>(
    upload: &'a upload::Model,
    chunks: &[upload_chunk::Model],
    chunks_dir: &'a str,
) -> Manifest<'a> {
    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        strategy: upload.strategy,
        upload_id: upload.id,
        user_id: upload.user_id,
        file_name: &upload.filename,
        size_bytes: upload.total_size_bytes,
        chunk_size: upload.chunk_size_bytes,
        total_chunks: upload.total_chunks,
        chunks_path: chunks_dir,
        chunks: chunks
            .iter()
            .map(|chunk| ManifestChunk {
                index: chunk.chunk_index,
                size: chunk.size_bytes,
                checksum: chunk.checksum.clone(),
                path: format!("{chunks_dir}/chunk-{:05}", chunk.chunk_index),
            })
            .collect(),
        created_at: Utc::now(),
    }
}

/// Maps a filename to a remote-path-safe component.
fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}
