//! On-disk staging area for in-flight chunks.
//!
//! Chunks are written to `<root>/<session>/chunks/chunk-<05d>`, going
//! through a `.partial` sibling that is renamed into place only after a
//! full flush. The metadata store is updated only after the rename, so a
//! crash anywhere in between leaves the session consistent: a stray
//! `.partial` or an unrecorded chunk file is dead weight for the sweeper,
//! never corrupt state.

use std::path::{Path, PathBuf};

use gitstash::hash::StreamingDigest;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// A chunk staged on scratch disk.
#[derive(Debug)]
pub struct StagedChunk {
    pub path: PathBuf,
    pub size_bytes: i64,
    /// Server-computed SHA-256, lowercase hex.
    pub checksum: String,
}

/// Content staging keyed by `(session, chunk index)`. Oblivious to
/// session state and storage strategies.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_root(&self) -> ServerResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(ServerError::storage_error)
    }

    /// On-disk location of a staged chunk.
    pub fn chunk_path(&self, upload_id: Uuid, chunk_index: i32) -> PathBuf {
        self.root
            .join(upload_id.to_string())
            .join("chunks")
            .join(format!("chunk-{chunk_index:05}"))
    }

    /// Streams a chunk to disk, hashing it along the way.
    ///
    /// The bytes land at the final path only via rename, so readers never
    /// observe a half-written chunk.
    pub async fn write_chunk<R>(
        &self,
        upload_id: Uuid,
        chunk_index: i32,
        mut data: R,
    ) -> ServerResult<StagedChunk>
    where
        R: AsyncRead + Unpin,
    {
        let final_path = self.chunk_path(upload_id, chunk_index);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(ServerError::storage_error)?;
        }

        let partial_path = final_path.with_extension("partial");
        let mut file = fs::File::create(&partial_path)
            .await
            .map_err(ServerError::storage_error)?;

        let mut digest = StreamingDigest::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = match data.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = fs::remove_file(&partial_path).await;
                    return Err(ServerError::storage_error(e));
                }
            };
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]).await {
                let _ = fs::remove_file(&partial_path).await;
                return Err(ServerError::storage_error(e));
            }
        }

        if let Err(e) = file.flush().await {
            let _ = fs::remove_file(&partial_path).await;
            return Err(ServerError::storage_error(e));
        }
        drop(file);

        if let Err(e) = fs::rename(&partial_path, &final_path).await {
            let _ = fs::remove_file(&partial_path).await;
            return Err(ServerError::storage_error(e));
        }

        let (checksum, size) = digest.finish();
        Ok(StagedChunk {
            path: final_path,
            size_bytes: size as i64,
            checksum,
        })
    }

    /// Removes a staged chunk, e.g. after a failed integrity check.
    pub async fn discard_chunk(&self, upload_id: Uuid, chunk_index: i32) -> ServerResult<()> {
        let path = self.chunk_path(upload_id, chunk_index);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    /// Concatenates staged chunks, in the order given, into a single
    /// file under the session's scratch directory.
    pub async fn assemble(
        &self,
        upload_id: Uuid,
        chunk_paths: impl IntoIterator<Item = impl AsRef<Path>>,
    ) -> ServerResult<PathBuf> {
        let dest = self.root.join(upload_id.to_string()).join("assembled.bin");
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(ServerError::storage_error)?;
        }

        let mut out = fs::File::create(&dest)
            .await
            .map_err(ServerError::storage_error)?;

        for path in chunk_paths {
            let mut chunk = fs::File::open(path.as_ref())
                .await
                .map_err(ServerError::storage_error)?;
            tokio::io::copy(&mut chunk, &mut out)
                .await
                .map_err(ServerError::storage_error)?;
        }

        out.flush().await.map_err(ServerError::storage_error)?;
        Ok(dest)
    }

    /// Deletes the entire scratch subtree for a session. Safe to call on
    /// a session that never staged anything, and safe to call twice.
    pub async fn remove_session(&self, upload_id: Uuid) -> ServerResult<()> {
        let dir = self.root.join(upload_id.to_string());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitstash::hash::sha256_hex;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, ScratchStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn write_chunk_stages_bytes_and_digest() {
        let (_dir, store) = store();
        let upload_id = Uuid::new_v4();
        let data = vec![0xA5u8; 70_000];

        let staged = store
            .write_chunk(upload_id, 0, Cursor::new(data.clone()))
            .await
            .unwrap();

        assert_eq!(staged.size_bytes, 70_000);
        assert_eq!(staged.checksum, sha256_hex(&data));
        assert_eq!(staged.path, store.chunk_path(upload_id, 0));
        assert_eq!(fs::read(&staged.path).await.unwrap(), data);

        // No .partial left behind after the rename.
        assert!(!staged.path.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn chunk_paths_are_zero_padded() {
        let (_dir, store) = store();
        let upload_id = Uuid::new_v4();
        let path = store.chunk_path(upload_id, 7);
        assert!(path.ends_with(format!("{upload_id}/chunks/chunk-00007")));
    }

    #[tokio::test]
    async fn assemble_preserves_order() {
        let (_dir, store) = store();
        let upload_id = Uuid::new_v4();

        let a = store
            .write_chunk(upload_id, 0, Cursor::new(b"hello ".to_vec()))
            .await
            .unwrap();
        let b = store
            .write_chunk(upload_id, 1, Cursor::new(b"world".to_vec()))
            .await
            .unwrap();

        let assembled = store
            .assemble(upload_id, [&a.path, &b.path])
            .await
            .unwrap();
        assert_eq!(fs::read(&assembled).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn remove_session_is_idempotent() {
        let (_dir, store) = store();
        let upload_id = Uuid::new_v4();

        store
            .write_chunk(upload_id, 0, Cursor::new(vec![1, 2, 3]))
            .await
            .unwrap();

        store.remove_session(upload_id).await.unwrap();
        assert!(!store.chunk_path(upload_id, 0).exists());
        store.remove_session(upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn discard_chunk_tolerates_missing_file() {
        let (_dir, store) = store();
        store.discard_chunk(Uuid::new_v4(), 3).await.unwrap();
    }
}
