//! HTTP surface.

pub mod v1;

use axum::Json;
use serde_json::{json, Value};

/// Liveness probe; the only route exempt from authentication.
pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
