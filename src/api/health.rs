use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness probe: status, current time and process uptime in seconds.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "uptime": state.uptime_secs(),
    }))
}
