//! Typed HTTP client for the Nexus backend.
//!
//! One configured `reqwest` client with bearer-token injection from the auth
//! context. Failures are normalized into [`ApiError`] using the server
//! envelope `{error, error_code, message}`, falling back to `detail`, then
//! to a generic per-status message, and routed through the toast policy:
//! 401 triggers the auth-expiration callback instead of a toast, documented
//! statuses toast their wording, network errors toast under one sticky id.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::toast::{Toaster, message_for_status};
use crate::auth::AuthContext;
use crate::config::NexusConfig;
use crate::errors::{ApiError, ApiErrorKind};

// ── Request/response payload types ───────────────────────────────────

/// One prior turn of an agent conversation, as the backend expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    agent_name: &'a str,
    message: &'a str,
    history: &'a [ChatTurn],
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRequest {
    /// 1..=5 star rating.
    pub rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCreated {
    pub project_id: String,
}

// ── Client ───────────────────────────────────────────────────────────

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<AuthContext>,
    toaster: Arc<Toaster>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiClient {
    pub fn new(config: &NexusConfig, auth: Arc<AuthContext>, toaster: Arc<Toaster>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("HTTP client construction");
        Self {
            http,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            auth,
            toaster,
        }
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// Direct chat with a named agent.
    pub async fn agent_chat(
        &self,
        agent_name: &str,
        message: &str,
        history: &[ChatTurn],
    ) -> Result<ChatReply, ApiError> {
        let body = ChatRequest {
            agent_name,
            message,
            history,
        };
        self.post("/agents/chat", &body).await
    }

    /// Submit feedback on a finished task.
    pub async fn send_task_feedback(
        &self,
        task_id: &str,
        feedback: &FeedbackRequest,
    ) -> Result<Value, ApiError> {
        self.post(&format!("/tasks/{task_id}/feedback"), feedback)
            .await
    }

    /// Create a multi-phase project.
    pub async fn create_project(
        &self,
        request: &CreateProjectRequest,
    ) -> Result<ProjectCreated, ApiError> {
        self.post("/projects/", request).await
    }

    pub async fn memory_conversations(&self) -> Result<Value, ApiError> {
        self.get("/memory/conversations").await
    }

    pub async fn memory_preferences(&self) -> Result<Value, ApiError> {
        self.get("/memory/preferences").await
    }

    pub async fn memory_analytics(&self) -> Result<Value, ApiError> {
        self.get("/memory/analytics").await
    }

    pub async fn memory_related_tasks(&self, task_id: &str) -> Result<Value, ApiError> {
        self.get(&format!("/memory/tasks/{task_id}/related")).await
    }

    // ── Transport ────────────────────────────────────────────────────

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.http.get(self.url(path));
        self.run(request).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.http.post(self.url(path)).json(body);
        self.run(request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn run<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let request = match self.auth.token() {
            Ok(token) => request.bearer_auth(token),
            Err(_) => request,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "request failed before a response arrived");
                self.toaster.network_error();
                return Err(ApiError::network(format!("Request failed: {e}")));
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            return response.json::<T>().await.map_err(|e| ApiError {
                kind: ApiErrorKind::Unknown,
                message: format!("Malformed response body: {e}"),
                error_code: None,
                status: Some(status),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let error = normalize_error(status, &body);
        self.surface(&error);
        Err(error)
    }

    /// Route a normalized failure to the right surface: 401 to the auth
    /// collaborator, everything else to the toast policy.
    fn surface(&self, error: &ApiError) {
        match error.status {
            Some(401) => self.auth.notify_expired(),
            Some(status) => self.toaster.http_error(status),
            None => {}
        }
    }
}

/// Build an [`ApiError`] from a failed response body.
pub(crate) fn normalize_error(status: u16, body: &str) -> ApiError {
    let envelope: Value = serde_json::from_str(body).unwrap_or(Value::Null);

    let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .or_else(|| {
            envelope
                .get("detail")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
        })
        .map(str::to_string)
        .or_else(|| message_for_status(status).map(str::to_string))
        .unwrap_or_else(|| format!("Request failed with status {status}"));

    let error_code = envelope
        .get("error_code")
        .and_then(Value::as_str)
        .map(str::to_string);

    ApiError {
        kind: ApiError::kind_for_status(status),
        message,
        error_code,
        status: Some(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_envelope_message() {
        let body = r#"{"error": true, "error_code": "task_missing", "message": "Task not found"}"#;
        let error = normalize_error(404, body);
        assert_eq!(error.message, "Task not found");
        assert_eq!(error.error_code.as_deref(), Some("task_missing"));
        assert_eq!(error.status, Some(404));
        assert_eq!(error.kind, ApiErrorKind::Rejected);
    }

    #[test]
    fn test_normalize_falls_back_to_detail() {
        let body = r#"{"detail": "Validation failed on field 'name'"}"#;
        let error = normalize_error(422, body);
        assert_eq!(error.message, "Validation failed on field 'name'");
        assert_eq!(error.kind, ApiErrorKind::Validation);
    }

    #[test]
    fn test_normalize_generic_for_empty_body() {
        let error = normalize_error(500, "");
        assert_eq!(
            error.message,
            "Something went wrong on the server. Please try again."
        );
        assert_eq!(error.kind, ApiErrorKind::Server);
    }

    #[test]
    fn test_normalize_unknown_status_without_wording() {
        let error = normalize_error(418, "not json at all");
        assert_eq!(error.message, "Request failed with status 418");
        assert_eq!(error.kind, ApiErrorKind::Unknown);
    }

    #[test]
    fn test_normalize_401_classified_as_auth_expired() {
        let error = normalize_error(401, r#"{"message": "token expired"}"#);
        assert_eq!(error.kind, ApiErrorKind::AuthExpired);
        assert_eq!(error.message, "token expired");
    }

    #[test]
    fn test_chat_request_wire_shape() {
        let history = vec![ChatTurn {
            role: "user".to_string(),
            content: "earlier".to_string(),
        }];
        let request = ChatRequest {
            agent_name: "ResearchAgent",
            message: "hi",
            history: &history,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["agent_name"], "ResearchAgent");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["history"][0]["role"], "user");
        assert_eq!(json["history"][0]["content"], "earlier");
    }

    #[test]
    fn test_feedback_omits_empty_comment() {
        let feedback = FeedbackRequest {
            rating: 4,
            comment: None,
        };
        let json = serde_json::to_string(&feedback).unwrap();
        assert!(!json.contains("comment"));
    }
}
