use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::ApiState;

pub async fn list_sessions(State(state): State<ApiState>) -> Json<Value> {
    let sessions = state.app_state.sessions().list();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}
