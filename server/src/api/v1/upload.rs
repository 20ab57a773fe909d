//! Handlers for the chunked upload endpoints.

use std::io;

use anyhow::anyhow;
use axum::body::Body;
use axum::extract::{Extension, Json, Path};
use axum::http::HeaderMap;
use futures::StreamExt;
use tokio_util::io::StreamReader;
use tracing::instrument;
use uuid::Uuid;

use gitstash::api::v1::upload::{
    AbortResponse, ChunkResult, FinalizeResult, InitRequest, InitResponse, StatusResponse,
    UploadStatus, CHUNK_CHECKSUM_HEADER, CHUNK_INDEX_HEADER,
};

use crate::access::RequestState;
use crate::error::{ErrorKind, ServerResult};
use crate::State;

#[instrument(skip_all)]
#[axum_macros::debug_handler]
pub(crate) async fn init(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Json(request): Json<InitRequest>,
) -> ServerResult<Json<InitResponse>> {
    let response = state.sessions.init(req_state.user_id, request).await?;
    Ok(Json(response))
}

/// Accepts one chunk as a raw octet stream.
///
/// The chunk index and optional client checksum arrive in headers; the
/// body is streamed straight to scratch disk without full buffering.
#[instrument(skip_all)]
#[axum_macros::debug_handler]
pub(crate) async fn put_chunk(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(upload_id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> ServerResult<Json<ChunkResult>> {
    let chunk_index: i32 = headers
        .get(CHUNK_INDEX_HEADER)
        .ok_or_else(|| {
            ErrorKind::RequestError(anyhow!("missing {CHUNK_INDEX_HEADER} header"))
        })?
        .to_str()
        .map_err(|_| ErrorKind::RequestError(anyhow!("invalid {CHUNK_INDEX_HEADER} header")))?
        .parse()
        .map_err(|_| ErrorKind::RequestError(anyhow!("invalid chunk index")))?;
    if chunk_index < 0 {
        return Err(ErrorKind::RequestError(anyhow!("chunk index must be non-negative")).into());
    }

    let client_checksum = match headers.get(CHUNK_CHECKSUM_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| {
                    ErrorKind::RequestError(anyhow!("invalid {CHUNK_CHECKSUM_HEADER} header"))
                })?
                .to_string(),
        ),
        None => None,
    };

    let stream = body.into_data_stream();
    let reader = StreamReader::new(
        stream.map(|result| {
            result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        }),
    );

    let result = state
        .sessions
        .put_chunk(req_state.user_id, upload_id, chunk_index, client_checksum, reader)
        .await?;
    Ok(Json(result))
}

#[instrument(skip_all)]
#[axum_macros::debug_handler]
pub(crate) async fn finalize(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(upload_id): Path<Uuid>,
) -> ServerResult<Json<FinalizeResult>> {
    let result = state.sessions.finalize(req_state.user_id, upload_id).await?;
    Ok(Json(result))
}

#[instrument(skip_all)]
#[axum_macros::debug_handler]
pub(crate) async fn abort(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(upload_id): Path<Uuid>,
) -> ServerResult<Json<AbortResponse>> {
    state.sessions.abort(req_state.user_id, upload_id).await?;
    Ok(Json(AbortResponse {
        status: UploadStatus::Aborted,
    }))
}

#[instrument(skip_all)]
#[axum_macros::debug_handler]
pub(crate) async fn status(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    Path(upload_id): Path<Uuid>,
) -> ServerResult<Json<StatusResponse>> {
    let snapshot = state.sessions.status(req_state.user_id, upload_id).await?;
    Ok(Json(snapshot))
}
