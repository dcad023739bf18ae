//! Labels API endpoints.
//!
//! Provides:
//! - GET /api/labels - List active labels, the targets a MOVE action may name

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use super::engine_error_response;
use crate::AppState;

/// Create the labels API router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_labels))
}

async fn list_labels(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.labels().await {
        Ok(labels) => (StatusCode::OK, Json(labels)).into_response(),
        Err(err) => engine_error_response("Failed to list labels", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use mailsift_core::LabelRepository;
    use serde_json::Value;

    #[tokio::test]
    async fn lists_only_active_labels() {
        let (state, _dir) = crate::test_support::state().await;
        LabelRepository::new(state.db.clone())
            .set_active("Label_1", false)
            .await
            .expect("deactivate");

        let response = list_labels(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body: Vec<Value> = serde_json::from_slice(&body_bytes).expect("json body");
        let names: Vec<&str> = body.iter().filter_map(|l| l["name"].as_str()).collect();
        assert_eq!(names, vec!["INBOX"]);
    }
}
