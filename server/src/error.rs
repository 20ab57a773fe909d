//! Server error types and their HTTP mapping.

use std::error::Error as StdError;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub type ServerResult<T> = Result<T, ServerError>;

/// The kind of an error, determining the status code and whether the
/// message is safe to surface to the caller.
#[derive(Debug)]
pub enum ErrorKind {
    /// Malformed or invalid request data.
    RequestError(anyhow::Error),

    /// Missing or invalid credentials.
    Unauthorized(&'static str),

    /// The session does not exist or belongs to another owner.
    NoSuchSession,

    /// The operation is illegal in the session's current status.
    IllegalState(String),

    /// The chunk index is not the next expected one.
    ChunkOutOfOrder { expected: i32, got: i32 },

    /// A digest or size check failed.
    IntegrityError(String),

    /// The session is past its expiration.
    SessionExpired,

    /// The metadata store failed.
    DatabaseError(anyhow::Error),

    /// Scratch disk I/O failed.
    StorageError(anyhow::Error),

    /// The remote object store failed after exhausting retries.
    RemoteError(anyhow::Error),
}

impl ErrorKind {
    fn http_status(&self) -> StatusCode {
        match self {
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NoSuchSession => StatusCode::NOT_FOUND,
            Self::IllegalState(_) => StatusCode::BAD_REQUEST,
            Self::ChunkOutOfOrder { .. } => StatusCode::CONFLICT,
            Self::IntegrityError(_) => StatusCode::BAD_REQUEST,
            Self::SessionExpired => StatusCode::GONE,
            Self::DatabaseError(_) | Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RemoteError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::RequestError(_) => "RequestError",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NoSuchSession => "NoSuchSession",
            Self::IllegalState(_) => "IllegalState",
            Self::ChunkOutOfOrder { .. } => "ChunkOutOfOrder",
            Self::IntegrityError(_) => "IntegrityError",
            Self::SessionExpired => "SessionExpired",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RemoteError(_) => "RemoteError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestError(e) => write!(f, "{e}"),
            Self::Unauthorized(msg) => write!(f, "{msg}"),
            Self::NoSuchSession => write!(f, "upload session not found"),
            Self::IllegalState(msg) => write!(f, "{msg}"),
            Self::ChunkOutOfOrder { expected, got } => {
                write!(f, "unexpected chunk index {got}, expected {expected}")
            }
            Self::IntegrityError(msg) => write!(f, "{msg}"),
            Self::SessionExpired => write!(f, "upload session has expired"),
            Self::DatabaseError(e) => write!(f, "database error: {e}"),
            Self::StorageError(e) => write!(f, "storage error: {e}"),
            Self::RemoteError(e) => write!(f, "remote store error: {e}"),
        }
    }
}

/// A server-side error that knows how to render itself as a response.
#[derive(Debug)]
pub struct ServerError {
    kind: ErrorKind,
}

impl ServerError {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn request_error(error: impl Into<anyhow::Error>) -> Self {
        ErrorKind::RequestError(error.into()).into()
    }

    pub fn database_error(error: impl Into<anyhow::Error>) -> Self {
        ErrorKind::DatabaseError(error.into()).into()
    }

    pub fn storage_error(error: impl Into<anyhow::Error>) -> Self {
        ErrorKind::StorageError(error.into()).into()
    }

    pub fn remote_error(error: impl Into<anyhow::Error>) -> Self {
        ErrorKind::RemoteError(error.into()).into()
    }
}

impl From<ErrorKind> for ServerError {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl StdError for ServerError {}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.kind.http_status();

        // Infrastructure details stay in the logs; the caller gets a
        // generic message while the specific cause is recorded on the
        // session where applicable.
        let message = if status.is_server_error() {
            error!("{}: {}", self.kind.name(), self.kind);
            "internal server error".to_string()
        } else {
            self.kind.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
