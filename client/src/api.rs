//! HTTP client for the GitStash server API.

use std::error::Error as StdError;
use std::fmt;

use anyhow::Result;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client as HttpClient, Response, StatusCode, Url};
use serde::Deserialize;
use uuid::Uuid;

use displaydoc::Display;
use gitstash::api::v1::upload::{
    AbortResponse, ChunkResult, FinalizeResult, InitRequest, InitResponse, StatusResponse,
    API_KEY_HEADER, CHUNK_CHECKSUM_HEADER, CHUNK_INDEX_HEADER, USER_ID_HEADER,
};

/// The User-Agent string of the CLI.
const GITSTASH_USER_AGENT: &str = concat!("gitstash/", env!("CARGO_PKG_VERSION"));

/// The GitStash API client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// Base endpoint of the server.
    endpoint: Url,

    /// An initialized HTTP client.
    client: HttpClient,
}

/// An API error.
#[derive(Debug, Display)]
pub enum ApiError {
    /// {0}
    Structured(StructuredApiError),

    /// HTTP {0}: {1}
    Unstructured(StatusCode, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredApiError {
    error: String,
}

impl ApiClient {
    pub fn new(endpoint: &str, api_key: &str, user_id: Uuid) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            endpoint.set_path(&format!("{}/", endpoint.path()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(api_key)?);
        headers.insert(USER_ID_HEADER, HeaderValue::from_str(&user_id.to_string())?);
        headers.insert(USER_AGENT, HeaderValue::from_static(GITSTASH_USER_AGENT));

        let client = HttpClient::builder().default_headers(headers).build()?;

        Ok(Self { endpoint, client })
    }

    /// Creates a new upload session.
    pub async fn init(&self, request: &InitRequest) -> Result<InitResponse> {
        let endpoint = self.endpoint.join("uploads/init")?;
        let res = self.client.post(endpoint).json(request).send().await?;
        parse_response(res).await
    }

    /// Uploads one chunk.
    pub async fn put_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: i32,
        checksum: &str,
        data: Bytes,
    ) -> Result<ChunkResult> {
        let endpoint = self.endpoint.join(&format!("uploads/{upload_id}/chunks"))?;
        let res = self
            .client
            .post(endpoint)
            .header(CHUNK_INDEX_HEADER, chunk_index)
            .header(CHUNK_CHECKSUM_HEADER, checksum)
            .body(data)
            .send()
            .await?;
        parse_response(res).await
    }

    /// Finalizes a complete session.
    pub async fn finalize(&self, upload_id: Uuid) -> Result<FinalizeResult> {
        let endpoint = self.endpoint.join(&format!("uploads/{upload_id}/finalize"))?;
        let res = self.client.post(endpoint).send().await?;
        parse_response(res).await
    }

    /// Aborts a session.
    pub async fn abort(&self, upload_id: Uuid) -> Result<AbortResponse> {
        let endpoint = self.endpoint.join(&format!("uploads/{upload_id}/abort"))?;
        let res = self.client.post(endpoint).send().await?;
        parse_response(res).await
    }

    /// Fetches the resumable state of a session.
    pub async fn status(&self, upload_id: Uuid) -> Result<StatusResponse> {
        let endpoint = self.endpoint.join(&format!("uploads/{upload_id}"))?;
        let res = self.client.get(endpoint).send().await?;
        parse_response(res).await
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(res: Response) -> Result<T> {
    if res.status().is_success() {
        Ok(res.json().await?)
    } else {
        let api_error = ApiError::try_from_response(res).await?;
        Err(api_error.into())
    }
}

impl StdError for ApiError {}

impl ApiError {
    async fn try_from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(s) => Ok(Self::Structured(s)),
            Err(_) => Ok(Self::Unstructured(status, text)),
        }
    }
}

impl fmt::Display for StructuredApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}
