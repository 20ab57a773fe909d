//! Chunked upload with resume and per-chunk retry.

use std::fmt::Write;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use indicatif::{HumanBytes, ProgressBar, ProgressState, ProgressStyle};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use gitstash::api::v1::upload::{ChunkResult, FinalizeResult, InitRequest};
use gitstash::hash::sha256_hex;

use crate::api::ApiClient;

const MAX_CHUNK_RETRIES: usize = 3;

/// Uploads a local file, either as a fresh session or by resuming an
/// existing one from the server's progress cursor.
pub async fn upload_file(
    api: &ApiClient,
    path: &Path,
    folder: &str,
    resume: Option<Uuid>,
) -> Result<FinalizeResult> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    let size = metadata.len() as i64;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("input path has no usable filename"))?
        .to_string();

    let (upload_id, chunk_size, total_chunks, mut next_chunk) = match resume {
        Some(upload_id) => {
            let status = api.status(upload_id).await?;
            if status.status.is_terminal() {
                bail!(
                    "session {upload_id} is no longer resumable (status {:?})",
                    status.status
                );
            }
            eprintln!(
                "resuming {upload_id} at chunk {}/{}",
                status.next_chunk, status.total_chunks
            );
            (
                upload_id,
                status.chunk_size,
                status.total_chunks,
                status.next_chunk,
            )
        }
        None => {
            let init = api
                .init(&InitRequest {
                    filename: filename.clone(),
                    size,
                    mime_type: "application/octet-stream".to_string(),
                    folder: folder.to_string(),
                })
                .await?;
            eprintln!(
                "upload {} started: {} chunk(s) of up to {} via {}",
                init.upload_id,
                init.total_chunks,
                HumanBytes(init.chunk_size as u64),
                init.strategy
            );
            (init.upload_id, init.chunk_size, init.total_chunks, 0)
        }
    };

    let pb = progress_bar(size as u64, &filename);
    pb.set_position((next_chunk as u64).saturating_mul(chunk_size as u64));

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(next_chunk as u64 * chunk_size as u64))
        .await?;

    while next_chunk < total_chunks {
        let length = chunk_len(size, chunk_size, next_chunk, total_chunks);
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)
            .await
            .context("short read from input file")?;

        let checksum = sha256_hex(&buf);
        let result = put_chunk_with_retry(
            api,
            upload_id,
            next_chunk,
            &checksum,
            Bytes::from(buf),
            MAX_CHUNK_RETRIES,
        )
        .await?;

        pb.inc(length as u64);
        next_chunk = result.next_chunk_index;
    }
    pb.finish();

    api.finalize(upload_id).await
}

/// Uploads a single chunk with retry logic.
async fn put_chunk_with_retry(
    api: &ApiClient,
    upload_id: Uuid,
    chunk_index: i32,
    checksum: &str,
    data: Bytes,
    max_retries: usize,
) -> Result<ChunkResult> {
    let mut attempt = 0;

    loop {
        match api
            .put_chunk(upload_id, chunk_index, checksum, data.clone())
            .await
        {
            Ok(result) => return Ok(result),
            Err(_e) if attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt as u32))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn progress_bar(total: u64, name: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let template = format!(
        "{{spinner}} {: <20.20} {{bar:40.green/blue}} {{human_bytes:10}} ({{average_speed}})",
        name,
    );
    let style = ProgressStyle::with_template(&template)
        .unwrap()
        .progress_chars("██ ")
        .with_key("human_bytes", |state: &ProgressState, w: &mut dyn Write| {
            write!(w, "{}", HumanBytes(state.pos())).unwrap();
        })
        .with_key(
            "average_speed",
            |state: &ProgressState, w: &mut dyn Write| match (state.pos(), state.elapsed()) {
                (pos, elapsed) if elapsed > Duration::ZERO => {
                    let bytes_per_sec = pos as f64 / elapsed.as_secs_f64();
                    write!(w, "{}/s", HumanBytes(bytes_per_sec as u64)).unwrap();
                }
                _ => write!(w, "-").unwrap(),
            },
        );
    pb.set_style(style);
    pb
}

/// Length of the chunk at `index`: full-size everywhere except possibly
/// the last.
fn chunk_len(size: i64, chunk_size: i64, index: i32, total: i32) -> usize {
    if index == total - 1 {
        (size - (total as i64 - 1) * chunk_size) as usize
    } else {
        chunk_size as usize
    }
}
