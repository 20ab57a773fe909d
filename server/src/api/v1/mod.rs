//! Version 1 upload API.

pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Extension, Router};

use crate::access::apply_auth;
use crate::State;

/// Slack on top of the configured chunk ceiling, so a full-size chunk
/// plus transfer framing never trips the limit.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

pub fn router(state: State) -> Router {
    let body_limit = state.config.chunking.max_chunk_size as usize + BODY_LIMIT_SLACK;

    Router::new()
        .route("/uploads/init", post(upload::init))
        .route("/uploads/{upload_id}/chunks", post(upload::put_chunk))
        .route("/uploads/{upload_id}/finalize", post(upload::finalize))
        .route("/uploads/{upload_id}/abort", post(upload::abort))
        .route("/uploads/{upload_id}", get(upload::status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(apply_auth))
        .layer(Extension(state))
}
