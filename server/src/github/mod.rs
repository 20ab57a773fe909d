//! Thin client for the remote object store (GitHub contents and
//! releases APIs).
//!
//! This is the only module that speaks the remote's wire protocol, and
//! the only place retries happen: transient failures (connect errors,
//! 5xx, rate limits) are retried with bounded exponential backoff, other
//! client errors surface immediately. Callers see sessions and chunks;
//! this module sees repos, paths, and tags.

pub mod types;

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client as HttpClient, Response, StatusCode};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};

use crate::config::GitHubConfig;
use crate::error::{ServerError, ServerResult};

const GITSTASH_USER_AGENT: &str = concat!("gitstash-server/", env!("CARGO_PKG_VERSION"));

/// Longest single backoff sleep between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reference to an uploaded release asset.
#[derive(Debug, Clone)]
pub struct ReleaseAssetRef {
    pub release_id: i64,
    pub asset_id: i64,
    pub name: String,
}

/// Capability surface over the remote object store.
///
/// Implementations have no knowledge of sessions, chunks, or strategies.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates or updates a file, returning its content SHA.
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        content: &[u8],
    ) -> ServerResult<String>;

    /// Removes a file; succeeds if the path does not exist.
    async fn delete_path(&self, repo: &str, path: &str, message: &str) -> ServerResult<()>;

    /// Fetches the release for `tag`, creating it if absent.
    async fn ensure_release(
        &self,
        repo: &str,
        tag: &str,
        name: &str,
        body: &str,
    ) -> ServerResult<i64>;

    /// Streams a local file up as a release asset.
    async fn upload_release_asset(
        &self,
        repo: &str,
        release_id: i64,
        name: &str,
        content_type: &str,
        local_file: &Path,
    ) -> ServerResult<ReleaseAssetRef>;
}

/// GitHub-backed implementation of [`RemoteStore`].
pub struct GitHubClient {
    http: HttpClient,
    api_base: String,
    uploads_base: String,
    owner: String,
    max_attempts: u32,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("invalid GitHub token")?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(GITSTASH_USER_AGENT));

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            uploads_base: config.uploads_base.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            max_attempts: config.max_attempts,
        })
    }

    fn contents_url(&self, repo: &str, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base, self.owner, repo, path
        )
    }

    /// Sends a request, retrying transient failures.
    ///
    /// Any response outside the retryable classes is returned as-is so
    /// callers can classify 404/422 themselves.
    async fn send_with_retry(
        &self,
        context: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> ServerResult<Response> {
        let mut attempt = 1;
        loop {
            match build().send().await {
                Ok(res) if is_retryable(res.status()) && attempt < self.max_attempts => {
                    let delay = retry_after(&res).unwrap_or_else(|| backoff_delay(attempt));
                    warn!(
                        context,
                        status = %res.status(),
                        attempt,
                        "transient remote failure, backing off for {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(res) if is_retryable(res.status()) => {
                    return Err(error_for(context, res).await);
                }
                Ok(res) => return Ok(res),
                Err(e) if attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(context, attempt, "remote request error: {e}, backing off for {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ServerError::remote_error(
                        anyhow!(e).context(format!("github {context} failed")),
                    ));
                }
            }
            attempt += 1;
        }
    }

    async fn fetch_content_sha(&self, repo: &str, path: &str) -> ServerResult<Option<String>> {
        let url = self.contents_url(repo, path);
        let res = self
            .send_with_retry("get contents", || self.http.get(&url))
            .await?;

        if is_not_found(res.status()) {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(error_for("get contents", res).await);
        }

        let meta: types::ContentMetadata = res.json().await.map_err(ServerError::remote_error)?;
        Ok(Some(meta.sha))
    }
}

#[async_trait]
impl RemoteStore for GitHubClient {
    #[instrument(skip_all, fields(repo = %repo, path = %path))]
    async fn put_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        content: &[u8],
    ) -> ServerResult<String> {
        let url = self.contents_url(repo, path);
        let payload = types::ContentWriteRequest {
            message: message.to_string(),
            content: BASE64.encode(content),
            sha: None,
        };

        // Create first; the common case is a fresh path.
        let res = self
            .send_with_retry("put contents", || self.http.put(&url).json(&payload))
            .await?;

        if res.status().is_success() {
            let body: types::ContentWriteResponse =
                res.json().await.map_err(ServerError::remote_error)?;
            return Ok(body.content.map(|c| c.sha).unwrap_or_default());
        }

        if !is_unprocessable(res.status()) {
            return Err(error_for("put contents", res).await);
        }

        // The path already exists; fetch the current sha and update.
        let sha = self
            .fetch_content_sha(repo, path)
            .await?
            .ok_or_else(|| {
                ServerError::remote_error(anyhow!(
                    "github reported {path} as existing but it has no content sha"
                ))
            })?;

        let payload = types::ContentWriteRequest {
            sha: Some(sha),
            ..payload
        };
        let res = self
            .send_with_retry("update contents", || self.http.put(&url).json(&payload))
            .await?;

        if !res.status().is_success() {
            return Err(error_for("update contents", res).await);
        }

        let body: types::ContentWriteResponse =
            res.json().await.map_err(ServerError::remote_error)?;
        Ok(body.content.map(|c| c.sha).unwrap_or_default())
    }

    #[instrument(skip_all, fields(repo = %repo, path = %path))]
    async fn delete_path(&self, repo: &str, path: &str, message: &str) -> ServerResult<()> {
        let Some(sha) = self.fetch_content_sha(repo, path).await? else {
            return Ok(());
        };

        let url = self.contents_url(repo, path);
        let payload = types::ContentDeleteRequest {
            message: message.to_string(),
            sha,
        };
        let res = self
            .send_with_retry("delete contents", || self.http.delete(&url).json(&payload))
            .await?;

        if res.status().is_success() || is_not_found(res.status()) {
            Ok(())
        } else {
            Err(error_for("delete contents", res).await)
        }
    }

    #[instrument(skip_all, fields(repo = %repo, tag = %tag))]
    async fn ensure_release(
        &self,
        repo: &str,
        tag: &str,
        name: &str,
        body: &str,
    ) -> ServerResult<i64> {
        let by_tag = format!(
            "{}/repos/{}/{}/releases/tags/{}",
            self.api_base, self.owner, repo, tag
        );
        let res = self
            .send_with_retry("get release", || self.http.get(&by_tag))
            .await?;

        if res.status().is_success() {
            let release: types::Release = res.json().await.map_err(ServerError::remote_error)?;
            return Ok(release.id);
        }
        if !is_not_found(res.status()) {
            return Err(error_for("get release", res).await);
        }

        let create_url = format!("{}/repos/{}/{}/releases", self.api_base, self.owner, repo);
        let payload = types::CreateReleaseRequest {
            tag_name: tag.to_string(),
            name: name.to_string(),
            body: body.to_string(),
        };
        let res = self
            .send_with_retry("create release", || {
                self.http.post(&create_url).json(&payload)
            })
            .await?;

        if res.status().is_success() {
            let release: types::Release = res.json().await.map_err(ServerError::remote_error)?;
            return Ok(release.id);
        }

        // Lost a creation race; the release now exists under the tag.
        if is_unprocessable(res.status()) {
            let res = self
                .send_with_retry("get release", || self.http.get(&by_tag))
                .await?;
            if res.status().is_success() {
                let release: types::Release =
                    res.json().await.map_err(ServerError::remote_error)?;
                return Ok(release.id);
            }
            return Err(error_for("get release", res).await);
        }

        Err(error_for("create release", res).await)
    }

    #[instrument(skip_all, fields(repo = %repo, release_id = release_id, name = %name))]
    async fn upload_release_asset(
        &self,
        repo: &str,
        release_id: i64,
        name: &str,
        content_type: &str,
        local_file: &Path,
    ) -> ServerResult<ReleaseAssetRef> {
        let url = format!(
            "{}/repos/{}/{}/releases/{}/assets",
            self.uploads_base, self.owner, repo, release_id
        );

        // The body is streamed from disk, so each attempt reopens the
        // file rather than replaying a spent stream.
        let mut attempt = 1;
        loop {
            let file = fs::File::open(local_file)
                .await
                .map_err(ServerError::storage_error)?;
            let length = file
                .metadata()
                .await
                .map_err(ServerError::storage_error)?
                .len();
            let request = self
                .http
                .post(&url)
                .query(&[("name", name)])
                .header(CONTENT_TYPE, content_type)
                .header(CONTENT_LENGTH, length)
                .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));

            match request.send().await {
                Ok(res) if res.status().is_success() => {
                    let asset: types::ReleaseAsset =
                        res.json().await.map_err(ServerError::remote_error)?;
                    return Ok(ReleaseAssetRef {
                        release_id,
                        asset_id: asset.id,
                        name: asset.name,
                    });
                }
                Ok(res) if is_retryable(res.status()) && attempt < self.max_attempts => {
                    let delay = retry_after(&res).unwrap_or_else(|| backoff_delay(attempt));
                    warn!(
                        status = %res.status(),
                        attempt,
                        "asset upload failed transiently, backing off for {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(res) => return Err(error_for("upload release asset", res).await),
                Err(e) if attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt, "asset upload error: {e}, backing off for {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(ServerError::remote_error(
                        anyhow!(e).context("github upload release asset failed"),
                    ));
                }
            }
            attempt += 1;
        }
    }
}

pub fn is_not_found(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
}

pub fn is_unprocessable(status: StatusCode) -> bool {
    status == StatusCode::UNPROCESSABLE_ENTITY
}

pub fn is_rate_limited(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || is_rate_limited(status)
}

/// Base 1 s, doubling per attempt, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

fn retry_after(res: &Response) -> Option<Duration> {
    res.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn error_for(context: &str, res: Response) -> ServerError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let body = body.chars().take(256).collect::<String>();
    ServerError::remote_error(anyhow!("github {context} failed: HTTP {status}: {body}"))
}

/// Infers the content type of a release asset from its filename.
pub fn content_type_from_name(name: &str) -> &'static str {
    if name.ends_with(".zip") {
        "application/zip"
    } else if name.ends_with(".tar") {
        "application/x-tar"
    } else {
        "application/octet-stream"
    }
}
