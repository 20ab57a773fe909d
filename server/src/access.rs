//! Request authentication.
//!
//! Every non-health request must carry the shared service credential and
//! an owner id vouched for by the upstream proxy. The proxy has already
//! validated the end user; we only verify that the request actually came
//! through the proxy and scope all session access to the presented owner.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;
use uuid::Uuid;

use gitstash::api::v1::upload::{API_KEY_HEADER, USER_ID_HEADER};

use crate::error::{ErrorKind, ServerError};
use crate::State;

/// Per-request state derived by the auth middleware.
#[derive(Debug, Clone)]
pub struct RequestState {
    /// Owner id all session lookups are scoped to.
    pub user_id: Uuid,
}

/// Verifies the service credential and owner headers, then exposes
/// [`RequestState`] to the handlers.
pub async fn apply_auth(
    Extension(state): Extension<State>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let headers = request.headers();

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ErrorKind::Unauthorized("missing api key"))?;
    if !constant_time_eq(api_key.as_bytes(), state.config.api_key.as_bytes()) {
        return Err(ErrorKind::Unauthorized("invalid api key").into());
    }

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(ErrorKind::Unauthorized("missing user id"))?;
    let user_id =
        Uuid::parse_str(user_id).map_err(|_| ErrorKind::Unauthorized("invalid user id"))?;

    request.extensions_mut().insert(RequestState { user_id });
    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn compares_keys() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre7"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"", b"secret"));
    }
}
