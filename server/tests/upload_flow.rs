//! End-to-end exercises of the upload session lifecycle against an
//! in-memory metadata store, a tempdir scratch root, and a mock remote.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use sea_orm_migration::MigratorTrait;
use tempfile::TempDir;
use uuid::Uuid;

use gitstash::api::v1::upload::{InitRequest, InitResponse, StorageStrategy};
use gitstash::hash::sha256_hex;

use gitstash_server::config::{
    ChunkingConfig, Config, DatabaseConfig, GitHubConfig, ScratchConfig, SessionConfig,
    StrategyConfig,
};
use gitstash_server::database::entity::upload::{self, UploadStatus};
use gitstash_server::database::entity::{file, upload_chunk};
use gitstash_server::database::migration::Migrator;
use gitstash_server::error::{ErrorKind, ServerError, ServerResult};
use gitstash_server::github::{ReleaseAssetRef, RemoteStore};
use gitstash_server::scratch::ScratchStore;
use gitstash_server::session::SessionService;

const MIB: i64 = 1024 * 1024;

/// In-memory stand-in for the GitHub client.
struct MockRemote {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    releases: Mutex<HashMap<String, i64>>,
    assets: Mutex<Vec<StoredAsset>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
    /// When >= 0, put_file fails once this many writes have succeeded.
    fail_puts_after: AtomicI64,
    deleted: Mutex<Vec<String>>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self {
            files: Mutex::default(),
            releases: Mutex::default(),
            assets: Mutex::default(),
            next_id: AtomicI64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_puts_after: AtomicI64::new(-1),
            deleted: Mutex::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredAsset {
    release_id: i64,
    asset_id: i64,
    name: String,
    size: u64,
}

impl MockRemote {
    fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn file_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    fn release_for_tag(&self, tag: &str) -> Option<i64> {
        self.releases.lock().unwrap().get(tag).copied()
    }

    fn assets(&self) -> Vec<StoredAsset> {
        self.assets.lock().unwrap().clone()
    }

    fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    fn fail_puts_after(&self, successes: i64) {
        self.fail_puts_after.store(successes, Ordering::SeqCst);
    }

    fn deleted_paths(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn put_file(
        &self,
        _repo: &str,
        path: &str,
        _message: &str,
        content: &[u8],
    ) -> ServerResult<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServerError::remote_error(anyhow!("injected remote failure")));
        }
        let remaining = self.fail_puts_after.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                return Err(ServerError::remote_error(anyhow!("injected remote failure")));
            }
            self.fail_puts_after.store(remaining - 1, Ordering::SeqCst);
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(sha256_hex(content))
    }

    async fn delete_path(&self, _repo: &str, path: &str, _message: &str) -> ServerResult<()> {
        self.files.lock().unwrap().remove(path);
        self.deleted.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn ensure_release(
        &self,
        _repo: &str,
        tag: &str,
        _name: &str,
        _body: &str,
    ) -> ServerResult<i64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServerError::remote_error(anyhow!("injected remote failure")));
        }
        let mut releases = self.releases.lock().unwrap();
        let id = *releases
            .entry(tag.to_string())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(id)
    }

    async fn upload_release_asset(
        &self,
        _repo: &str,
        release_id: i64,
        name: &str,
        _content_type: &str,
        local_file: &Path,
    ) -> ServerResult<ReleaseAssetRef> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServerError::remote_error(anyhow!("injected remote failure")));
        }
        let size = tokio::fs::metadata(local_file)
            .await
            .map_err(ServerError::storage_error)?
            .len();
        let asset_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.assets.lock().unwrap().push(StoredAsset {
            release_id,
            asset_id,
            name: name.to_string(),
            size,
        });
        Ok(ReleaseAssetRef {
            release_id,
            asset_id,
            name: name.to_string(),
        })
    }
}

struct Harness {
    service: SessionService,
    db: DatabaseConnection,
    remote: Arc<MockRemote>,
    scratch_root: PathBuf,
    user_id: Uuid,
    _scratch_dir: TempDir,
}

fn test_config(scratch_root: &Path) -> Config {
    Config {
        listen: ([127, 0, 0, 1], 0).into(),
        api_key: "test-key".to_string(),
        request_timeout: Duration::from_secs(30),
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        github: GitHubConfig {
            token: "token".to_string(),
            owner: "owner".to_string(),
            repo: "storage".to_string(),
            api_base: "https://api.github.com".to_string(),
            uploads_base: "https://uploads.github.com".to_string(),
            max_attempts: 2,
        },
        chunking: ChunkingConfig {
            default_chunk_size: 5 * MIB,
            max_chunk_size: 50 * MIB,
        },
        strategy: StrategyConfig {
            max_upload_bytes: 100 * MIB,
            release_max_bytes: 10 * MIB,
            lfs_threshold_bytes: 1024 * MIB,
            inline_max_bytes: MIB,
            enable_release_assets: false,
            enable_git_lfs: false,
            enable_inline_blob: false,
        },
        scratch: ScratchConfig {
            root: scratch_root.to_path_buf(),
            idle_chunk_timeout: Duration::from_secs(1800),
        },
        session: SessionConfig {
            ttl: Duration::from_secs(3600),
        },
    }
}

async fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let scratch_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(scratch_dir.path());
    tweak(&mut config);

    let remote = Arc::new(MockRemote::default());
    let service = SessionService::new(
        Arc::new(config),
        db.clone(),
        ScratchStore::new(scratch_dir.path()),
        remote.clone(),
    );

    Harness {
        service,
        db,
        remote,
        scratch_root: scratch_dir.path().to_path_buf(),
        user_id: Uuid::new_v4(),
        _scratch_dir: scratch_dir,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn test_bytes(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(7))
        .collect()
}

async fn init_upload(h: &Harness, filename: &str, size: i64) -> InitResponse {
    h.service
        .init(
            h.user_id,
            InitRequest {
                filename: filename.to_string(),
                size,
                mime_type: "application/octet-stream".to_string(),
                folder: "/".to_string(),
            },
        )
        .await
        .unwrap()
}

/// Uploads all chunks of `data` in order with correct checksums.
async fn put_all_chunks(h: &Harness, init: &InitResponse, data: &[u8]) {
    for index in 0..init.total_chunks {
        let start = index as usize * init.chunk_size as usize;
        let end = (start + init.chunk_size as usize).min(data.len());
        let slice = &data[start..end];
        let result = h
            .service
            .put_chunk(
                h.user_id,
                init.upload_id,
                index,
                Some(sha256_hex(slice)),
                Cursor::new(slice.to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(result.received_chunk, index);
        assert_eq!(result.next_chunk_index, index + 1);
        assert_eq!(result.is_complete, index + 1 == init.total_chunks);
    }
}

async fn load_upload(db: &DatabaseConnection, id: Uuid) -> upload::Model {
    upload::Entity::find_by_id(id).one(db).await.unwrap().unwrap()
}

#[tokio::test]
async fn happy_path_repo_chunks() {
    let h = harness().await;
    let data = test_bytes(12_500_000);

    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.chunk_size, 5 * MIB);
    assert_eq!(init.total_chunks, 3);
    assert_eq!(init.strategy, StorageStrategy::RepoChunks);

    put_all_chunks(&h, &init, &data).await;

    let result = h.service.finalize(h.user_id, init.upload_id).await.unwrap();
    assert_eq!(result.size, 12_500_000);
    assert_eq!(result.name, "x.bin");
    assert_eq!(result.path, "/");

    // Session row reached the terminal invariant.
    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.status, UploadStatus::Completed);
    assert_eq!(row.received_bytes, 12_500_000);
    assert_eq!(row.file_id, Some(result.file_id));
    assert!(row.completed_at.is_some());

    // A file record with matching coordinates exists.
    let record = file::Entity::find_by_id(result.file_id)
        .one(&h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.size_bytes, 12_500_000);
    assert_eq!(record.user_id, h.user_id);

    // The remote holds three chunk blobs plus the manifest.
    let root = format!("uploads/{}/{}", h.user_id, init.upload_id);
    let manifest_path = format!("{root}/manifest.json");
    assert_eq!(record.blob_path, manifest_path);
    assert_eq!(h.remote.file_paths().len(), 4);
    assert_eq!(
        h.remote.file(&format!("{root}/chunks/chunk-00000")).unwrap(),
        data[..5 * MIB as usize].to_vec()
    );

    let manifest: serde_json::Value =
        serde_json::from_slice(&h.remote.file(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["schemaVersion"], "2024-11-01");
    assert_eq!(manifest["strategy"], "repo-chunks");
    assert_eq!(manifest["totalChunks"], 3);
    assert_eq!(manifest["sizeBytes"], 12_500_000);
    assert_eq!(manifest["chunks"].as_array().unwrap().len(), 3);
    assert_eq!(manifest["chunks"][2]["size"], 2_014_240);

    // Scratch space is gone.
    assert!(!h.scratch_root.join(init.upload_id.to_string()).exists());
}

#[tokio::test]
async fn out_of_order_chunk_is_rejected() {
    let h = harness().await;
    let data = test_bytes(12 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 3);

    let slice = &data[..5 * MIB as usize];
    h.service
        .put_chunk(h.user_id, init.upload_id, 0, None, Cursor::new(slice.to_vec()))
        .await
        .unwrap();

    let err = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            2,
            None,
            Cursor::new(slice.to_vec()),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ChunkOutOfOrder { expected: 1, got: 2 }
    ));

    let status = h.service.status(h.user_id, init.upload_id).await.unwrap();
    assert_eq!(status.next_chunk, 1);
    assert_eq!(status.received_chunks, 1);
}

#[tokio::test]
async fn replayed_chunk_is_idempotent() {
    let h = harness().await;
    let data = test_bytes(6 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 2);

    let slice = &data[..5 * MIB as usize];
    let first = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            0,
            Some(sha256_hex(slice)),
            Cursor::new(slice.to_vec()),
        )
        .await
        .unwrap();
    let replay = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            0,
            Some(sha256_hex(slice)),
            Cursor::new(slice.to_vec()),
        )
        .await
        .unwrap();

    assert_eq!(first.next_chunk_index, 1);
    assert_eq!(replay.next_chunk_index, 1);
    assert!(!replay.is_complete);

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.received_chunks, 1);
    assert_eq!(row.received_bytes, 5 * MIB);
    assert_eq!(row.status, UploadStatus::InProgress);
}

#[tokio::test]
async fn checksum_mismatch_rejects_the_chunk() {
    let h = harness().await;
    let data = test_bytes(3 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 1);

    let err = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            0,
            Some("deadbeef".repeat(8)),
            Cursor::new(data.clone()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IntegrityError(_)));

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.received_chunks, 0);
    assert_eq!(row.received_bytes, 0);

    // The staged bytes were discarded.
    let chunk_path = h
        .scratch_root
        .join(init.upload_id.to_string())
        .join("chunks")
        .join("chunk-00000");
    assert!(!chunk_path.exists());
}

#[tokio::test]
async fn short_non_final_chunk_is_rejected() {
    let h = harness().await;
    let data = test_bytes(12 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 3);

    // Half a chunk at position 0.
    let short = &data[..(init.chunk_size / 2) as usize];
    let err = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            0,
            None,
            Cursor::new(short.to_vec()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IntegrityError(_)));

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.received_chunks, 0);
}

#[tokio::test]
async fn abort_mid_upload_releases_everything() {
    let h = harness().await;
    let data = test_bytes(12 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;

    let slice = &data[..5 * MIB as usize];
    h.service
        .put_chunk(h.user_id, init.upload_id, 0, None, Cursor::new(slice.to_vec()))
        .await
        .unwrap();

    h.service.abort(h.user_id, init.upload_id).await.unwrap();

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.status, UploadStatus::Aborted);

    let chunks = upload_chunk::Entity::find().all(&h.db).await.unwrap();
    assert!(chunks.is_empty());
    assert!(!h.scratch_root.join(init.upload_id.to_string()).exists());

    // Aborting again is a no-op; uploading into it is a state error.
    h.service.abort(h.user_id, init.upload_id).await.unwrap();
    let err = h
        .service
        .put_chunk(
            h.user_id,
            init.upload_id,
            1,
            None,
            Cursor::new(slice.to_vec()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IllegalState(_)));
}

#[tokio::test]
async fn release_asset_strategy_end_to_end() {
    let h = harness_with(|config| {
        config.strategy.enable_release_assets = true;
    })
    .await;
    let data = test_bytes(2_500_000);

    let init = init_upload(&h, "video.bin", data.len() as i64).await;
    assert_eq!(init.strategy, StorageStrategy::ReleaseAsset);
    assert_eq!(init.total_chunks, 1);

    put_all_chunks(&h, &init, &data).await;
    let result = h.service.finalize(h.user_id, init.upload_id).await.unwrap();

    let tag = format!("upload-{}", init.upload_id);
    let release_id = h.remote.release_for_tag(&tag).unwrap();
    let assets = h.remote.assets();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].release_id, release_id);
    assert_eq!(assets[0].size, 2_500_000);
    assert_eq!(assets[0].name, "video.bin");

    let record = file::Entity::find_by_id(result.file_id)
        .one(&h.db)
        .await
        .unwrap()
        .unwrap();
    assert!(record.blob_path.starts_with("release:"));
    assert_eq!(
        record.blob_path,
        format!("release:{}:{}", release_id, assets[0].asset_id)
    );

    // The assembled temporary went away with the rest of the scratch.
    assert!(!h.scratch_root.join(init.upload_id.to_string()).exists());
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let h = harness().await;
    let data = test_bytes(2 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;

    put_all_chunks(&h, &init, &data).await;
    let first = h.service.finalize(h.user_id, init.upload_id).await.unwrap();
    let second = h.service.finalize(h.user_id, init.upload_id).await.unwrap();

    assert_eq!(first.file_id, second.file_id);
    assert_eq!(first.path, second.path);
    assert_eq!(first.size, second.size);

    // Only one file record was created.
    let files = file::Entity::find().all(&h.db).await.unwrap();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn expired_session_fails_on_first_touch() {
    let h = harness_with(|config| {
        config.session.ttl = Duration::ZERO;
    })
    .await;
    let data = test_bytes(MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;

    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = h
        .service
        .put_chunk(h.user_id, init.upload_id, 0, None, Cursor::new(data))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::SessionExpired));

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.status, UploadStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("upload session expired"));
}

#[tokio::test]
async fn init_validates_size_bounds() {
    let h = harness().await;

    let err = h
        .service
        .init(
            h.user_id,
            InitRequest {
                filename: "x.bin".to_string(),
                size: 0,
                mime_type: String::new(),
                folder: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RequestError(_)));

    // Exactly at the limit is accepted; one past it is not.
    init_upload(&h, "x.bin", 100 * MIB).await;
    let err = h
        .service
        .init(
            h.user_id,
            InitRequest {
                filename: "x.bin".to_string(),
                size: 100 * MIB + 1,
                mime_type: String::new(),
                folder: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RequestError(_)));
}

#[tokio::test]
async fn aligned_upload_ends_with_a_full_chunk() {
    let h = harness().await;
    let data = test_bytes(10 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 2);

    put_all_chunks(&h, &init, &data).await;
    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.received_bytes, 10 * MIB);
}

#[tokio::test]
async fn materializer_failure_fails_the_session_and_keeps_scratch() {
    let h = harness().await;
    let data = test_bytes(2 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    put_all_chunks(&h, &init, &data).await;

    h.remote.fail_writes();
    let err = h.service.finalize(h.user_id, init.upload_id).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RemoteError(_)));

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.status, UploadStatus::Failed);
    assert!(row.error_message.is_some());

    // Staged bytes are retained for inspection.
    let chunk_path = h
        .scratch_root
        .join(init.upload_id.to_string())
        .join("chunks")
        .join("chunk-00000");
    assert!(chunk_path.exists());
}

#[tokio::test]
async fn partial_repo_chunk_writes_are_cleaned_up_on_failure() {
    let h = harness().await;
    let data = test_bytes(12 * MIB as usize);
    let init = init_upload(&h, "x.bin", data.len() as i64).await;
    assert_eq!(init.total_chunks, 3);
    put_all_chunks(&h, &init, &data).await;

    // The first chunk write succeeds, the second fails.
    h.remote.fail_puts_after(1);
    let err = h.service.finalize(h.user_id, init.upload_id).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RemoteError(_)));

    // The orphaned blob was removed from the repository.
    let written = format!(
        "uploads/{}/{}/chunks/chunk-00000",
        h.user_id, init.upload_id
    );
    assert_eq!(h.remote.deleted_paths(), vec![written]);
    assert!(h.remote.file_paths().is_empty());

    let row = load_upload(&h.db, init.upload_id).await;
    assert_eq!(row.status, UploadStatus::Failed);
}

#[tokio::test]
async fn foreign_sessions_are_invisible() {
    let h = harness().await;
    let init = init_upload(&h, "x.bin", MIB).await;

    let stranger = Uuid::new_v4();
    let err = h
        .service
        .status(stranger, init.upload_id)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NoSuchSession));
}
