use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::GmailConfig;
use crate::constants::LABEL_READ;
use crate::gmail::types::{ModifiedMessage, ModifyMessageRequest};
use crate::label_sync::{LabelSync, LabelSyncError};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

#[derive(Debug, Error)]
pub enum GmailClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gmail returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized")]
    Unauthorized,
}

impl From<GmailClientError> for LabelSyncError {
    fn from(err: GmailClientError) -> Self {
        match err {
            GmailClientError::Unauthorized => LabelSyncError::Unauthorized,
            GmailClientError::Status { status, body } => LabelSyncError::Rejected {
                status: status.as_u16(),
                body,
            },
            GmailClientError::Http(err) => LabelSyncError::Transport(err.to_string()),
            GmailClientError::Decode(err) => {
                LabelSyncError::Transport(format!("unreadable response: {err}"))
            }
        }
    }
}

/// Minimal Gmail REST client for label changes, authenticated with a bearer token
/// obtained elsewhere.
pub struct GmailClient {
    http: Client,
    api_base: String,
    user_id: String,
    access_token: String,
}

impl GmailClient {
    pub fn new(http: Client, user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }

    pub fn from_config(config: &GmailConfig) -> Result<Self, GmailClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::new(http, &config.user_id, &config.access_token).with_api_base(&config.api_base))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// `POST {base}/{user}/messages/{id}/modify`.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn modify_labels(
        &self,
        message_id: &str,
        add_label_ids: Vec<String>,
        remove_label_ids: Vec<String>,
    ) -> Result<ModifiedMessage, GmailClientError> {
        let url = format!(
            "{}/{}/messages/{}/modify",
            self.api_base, self.user_id, message_id
        );
        let body = ModifyMessageRequest {
            add_label_ids,
            remove_label_ids,
        };
        self.send_json(self.http.post(&url).json(&body)).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GmailClientError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(GmailClientError::Unauthorized);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GmailClientError::Status { status, body });
        }
        serde_json::from_str(&body).map_err(GmailClientError::Decode)
    }
}

/// Turns before/after label sets into the minimal Gmail modify call. READ only
/// exists locally, so it never reaches the provider.
fn label_diff(from_label_ids: &[String], to_label_ids: &[String]) -> (Vec<String>, Vec<String>) {
    let from: BTreeSet<&str> = from_label_ids
        .iter()
        .map(String::as_str)
        .filter(|id| *id != LABEL_READ)
        .collect();
    let to: BTreeSet<&str> = to_label_ids
        .iter()
        .map(String::as_str)
        .filter(|id| *id != LABEL_READ)
        .collect();

    let add = to.difference(&from).map(|id| id.to_string()).collect();
    let remove = from.difference(&to).map(|id| id.to_string()).collect();
    (add, remove)
}

#[async_trait]
impl LabelSync for GmailClient {
    async fn move_labels(
        &self,
        message_id: &str,
        from_label_ids: &[String],
        to_label_ids: &[String],
    ) -> Result<(), LabelSyncError> {
        let (add, remove) = label_diff(from_label_ids, to_label_ids);
        if add.is_empty() && remove.is_empty() {
            debug!(message_id, "no remote label change needed");
            return Ok(());
        }

        let modified = self.modify_labels(message_id, add, remove).await?;
        debug!(message_id, labels = ?modified.label_ids, "gmail labels updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_client(server: &MockServer) -> GmailClient {
        GmailClient::new(Client::new(), "me", "token")
            .with_api_base(format!("{}/gmail/v1/users/", server.uri()))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn move_labels_sends_diff_with_bearer_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/msg-1/modify"))
            .and(header("authorization", "Bearer token"))
            .and(body_json(json!({
                "addLabelIds": ["Label_7"],
                "removeLabelIds": ["INBOX"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg-1",
                "threadId": "t-1",
                "labelIds": ["Label_7", "UNREAD"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        client
            .move_labels(
                "msg-1",
                &ids(&["INBOX", "UNREAD"]),
                &ids(&["Label_7", "UNREAD"]),
            )
            .await
            .expect("sync succeeds");
    }

    #[tokio::test]
    async fn unchanged_sets_skip_the_request() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = make_client(&server);
        client
            .move_labels("msg-1", &ids(&["INBOX"]), &ids(&["INBOX"]))
            .await
            .expect("nothing to do");
        // READ never leaves the local store.
        client
            .move_labels("msg-1", &ids(&[]), &ids(&["READ"]))
            .await
            .expect("nothing to do");
    }

    #[tokio::test]
    async fn marking_read_only_removes_unread() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/msg-2/modify"))
            .and(body_json(json!({
                "addLabelIds": [],
                "removeLabelIds": ["UNREAD"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg-2"})))
            .expect(1)
            .mount(&server)
            .await;

        make_client(&server)
            .move_labels("msg-2", &ids(&["UNREAD"]), &ids(&["READ"]))
            .await
            .expect("sync succeeds");
    }

    #[tokio::test]
    async fn server_errors_surface_as_rejections() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/messages/missing/modify"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Requested entity was not found."))
            .expect(1)
            .mount(&server)
            .await;

        let err = make_client(&server)
            .move_labels("missing", &ids(&["INBOX"]), &ids(&["TRASH"]))
            .await
            .expect_err("should surface 404");

        match err {
            LabelSyncError::Rejected { status, body } => {
                assert_eq!(status, 404);
                assert!(body.contains("not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_is_reported_distinctly() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = make_client(&server)
            .modify_labels("msg-1", ids(&["TRASH"]), ids(&["INBOX"]))
            .await
            .expect_err("should be unauthorized");
        assert!(matches!(err, GmailClientError::Unauthorized));
    }

    #[test]
    fn diff_ignores_read_and_shared_labels() {
        let (add, remove) = label_diff(
            &ids(&["INBOX", "UNREAD", "Label_1"]),
            &ids(&["Label_1", "READ", "TRASH"]),
        );
        assert_eq!(add, ids(&["TRASH"]));
        assert_eq!(remove, ids(&["INBOX", "UNREAD"]));
    }
}
