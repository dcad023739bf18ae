//! Rules API endpoints.
//!
//! Provides:
//! - GET /api/rules - List rules with details and actions
//! - POST /api/rules - Validate and create a rule
//! - GET /api/rules/:id - Get a rule by ID
//! - GET /api/rules/by-name/:name - Get a rule by name
//! - DELETE /api/rules/:id - Delete a rule
//! - POST /api/rules/:id/execute - Run a rule, optionally applying its actions
//! - POST /api/rules/by-name/:name/execute - Same, addressed by name

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use mailsift_core::rules::{NewRule, Rule};
use mailsift_core::{Page, RuleRef};

use super::engine_error_response;
use crate::AppState;

/// Create the rules API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/by-name/{name}", get(get_rule_by_name))
        .route("/by-name/{name}/execute", post(execute_rule_by_name))
        .route("/{id}", get(get_rule).delete(delete_rule))
        .route("/{id}/execute", post(execute_rule))
}

#[derive(Debug, Serialize)]
struct RuleListResponse {
    items: Vec<Rule>,
    total: i64,
    offset: u32,
    limit: u32,
}

/// Request body for executing a rule.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRuleRequest {
    #[serde(default)]
    pub execute_actions: bool,
}

/// GET /api/rules
///
/// Query parameters `offset` (default 0) and `limit` (default 100, max 1000).
async fn list_rules(State(state): State<AppState>, Query(page): Query<Page>) -> impl IntoResponse {
    let page = Page::new(page.offset, page.limit);
    match state.engine.list_rules(page).await {
        Ok((items, total)) => (
            StatusCode::OK,
            Json(RuleListResponse {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            }),
        )
            .into_response(),
        Err(err) => engine_error_response("Failed to list rules", err),
    }
}

/// POST /api/rules
///
/// Nothing is stored unless every condition and action validates.
async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<NewRule>,
) -> impl IntoResponse {
    match state.engine.create_rule(request).await {
        Ok(rule) => (StatusCode::CREATED, Json(rule)).into_response(),
        Err(err) => engine_error_response("Failed to create rule", err),
    }
}

async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.get_rule(&id).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(err) => engine_error_response("Failed to get rule", err),
    }
}

async fn get_rule_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.engine.get_rule_by_name(&name).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(err) => engine_error_response("Failed to get rule", err),
    }
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.delete_rule(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => engine_error_response("Failed to delete rule", err),
    }
}

/// POST /api/rules/:id/execute
///
/// Returns the matched messages and, when `execute_actions` is set, one action
/// report per message.
async fn execute_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRuleRequest>,
) -> impl IntoResponse {
    run(&state, RuleRef::Id(id), request.execute_actions).await
}

async fn execute_rule_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ExecuteRuleRequest>,
) -> impl IntoResponse {
    run(&state, RuleRef::Name(name), request.execute_actions).await
}

async fn run(state: &AppState, rule_ref: RuleRef, execute_actions: bool) -> axum::response::Response {
    match state.engine.execute_rule(rule_ref, execute_actions).await {
        Ok(execution) => (StatusCode::OK, Json(execution)).into_response(),
        Err(err) => engine_error_response("Failed to execute rule", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use chrono::{Duration, Utc};
    use mailsift_core::messages::{MessageRepository, NewMessage};
    use serde_json::{Value, json};

    fn rule_body(name: &str) -> NewRule {
        serde_json::from_value(json!({
            "name": name,
            "predicate": "ANY",
            "details": [
                {"field_name": "subject", "operation": "CONTAINS", "value": "invoice"},
                {"field_name": "received_at", "operation": "LESS_THAN", "value": "2", "unit": "DAYS"}
            ],
            "actions": [
                {"action": "MOVE", "value": "Finance"},
                {"action": "MARK_AS_READ"}
            ]
        }))
        .expect("rule body")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body_bytes).expect("json body")
    }

    #[tokio::test]
    async fn create_rule_returns_created_rule() {
        let (state, _dir) = crate::test_support::state().await;

        let response = create_rule(State(state), Json(rule_body("Invoices")))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["name"], "Invoices");
        assert_eq!(body["combinator"], "any");
        assert_eq!(body["details"].as_array().expect("details").len(), 2);
        assert_eq!(body["actions"][1]["action"], "mark_read");
    }

    #[tokio::test]
    async fn create_rule_rejects_invalid_and_duplicate() {
        let (state, _dir) = crate::test_support::state().await;

        let mut invalid = rule_body("Broken");
        invalid.details[0].field_name = "priority".into();
        let response = create_rule(State(state.clone()), Json(invalid))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "bad_request");

        let mut unknown_label = rule_body("Elsewhere");
        unknown_label.actions[0].value = Some("Nowhere".into());
        let response = create_rule(State(state.clone()), Json(unknown_label))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let first = create_rule(State(state.clone()), Json(rule_body("Invoices")))
            .await
            .into_response();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = create_rule(State(state), Json(rule_body("Invoices")))
            .await
            .into_response();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_and_delete_rule() {
        let (state, _dir) = crate::test_support::state().await;
        let created = state
            .engine
            .create_rule(rule_body("Invoices"))
            .await
            .expect("create");

        let response = get_rule(State(state.clone()), Path(created.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = get_rule_by_name(State(state.clone()), Path("Invoices".into()))
            .await
            .into_response();
        assert_eq!(body_json(response).await["id"], created.id.as_str());

        let response = delete_rule(State(state.clone()), Path(created.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = get_rule(State(state.clone()), Path(created.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not_found");

        let response = delete_rule(State(state), Path(created.id))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_rules_pages_results() {
        let (state, _dir) = crate::test_support::state().await;
        for name in ["One", "Two", "Three"] {
            state.engine.create_rule(rule_body(name)).await.expect("create");
        }

        let response = list_rules(State(state), Query(Page::new(1, 1)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["items"].as_array().expect("items").len(), 1);
        assert_eq!(body["offset"], 1);
    }

    #[tokio::test]
    async fn execute_rule_reports_matches_and_actions() {
        let (state, _dir) = crate::test_support::state().await;
        let mut message = NewMessage::new("msg-1", Utc::now() - Duration::hours(5));
        message.subject = Some("Invoice attached".into());
        MessageRepository::new(state.db.clone())
            .upsert(message)
            .await
            .expect("message");
        state
            .engine
            .create_rule(rule_body("Invoices"))
            .await
            .expect("create");

        let response = execute_rule_by_name(
            State(state.clone()),
            Path("Invoices".into()),
            Json(ExecuteRuleRequest::default()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["matches"].as_array().expect("matches").len(), 1);
        assert!(body["action_reports"].is_null());

        let response = execute_rule_by_name(
            State(state.clone()),
            Path("Invoices".into()),
            Json(ExecuteRuleRequest {
                execute_actions: true,
            }),
        )
        .await
        .into_response();
        let body = body_json(response).await;
        let outcomes = body["action_reports"][0]["outcomes"]
            .as_array()
            .expect("outcomes");
        // Only INBOX and Finance are seeded; MARK_READ creates READ itself.
        assert!(outcomes[0]["error"].is_null());
        assert!(outcomes[1]["error"].is_null());
        assert_eq!(outcomes[1]["added"][0], "READ");

        let response = execute_rule(
            State(state),
            Path("missing".into()),
            Json(ExecuteRuleRequest::default()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
