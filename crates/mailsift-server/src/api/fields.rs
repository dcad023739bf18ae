//! GET /api/fields - the filterable fields and the operators each accepts.

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_fields))
}

async fn list_fields(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.fields().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use serde_json::Value;

    #[tokio::test]
    async fn lists_catalog_with_operators() {
        let (state, _dir) = crate::test_support::state().await;

        let response = list_fields(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body: Vec<Value> = serde_json::from_slice(&body_bytes).expect("json body");
        let received_at = body
            .iter()
            .find(|field| field["name"] == "received_at")
            .expect("received_at listed");
        assert_eq!(received_at["field_type"], "number");
        assert!(
            received_at["operators"]
                .as_array()
                .expect("operators")
                .iter()
                .any(|op| op.as_str() == Some("greater_than"))
        );
    }
}
