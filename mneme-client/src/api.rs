//! Request/response schemas for each backend endpoint, plus the typed
//! endpoint methods on [`ApiClient`].
//!
//! Field names mirror the backend's JSON exactly; nothing here is
//! client-side state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{ApiClient, BoxedStream};
use crate::error::ApiError;
use crate::events::StreamEvent;

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior turn sent along with a streaming query.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Body of `POST /chat/query-stream`.
#[derive(Clone, Debug, Serialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_ids_filter: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<ChatTurn>,
}

/// One entry of `GET /chat/sessions`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatSession {
    pub session_id: String,
    pub title: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatSessionListResponse {
    pub sessions: Vec<ChatSession>,
}

/// One persisted message from `GET /chat/history/{session_id}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatHistoryMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatHistoryResponse {
    pub messages: Vec<ChatHistoryMessage>,
}

/// `POST /attachments/upload` acknowledgement: the indexing job id and the
/// server-assigned attachment identity.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadAccepted {
    pub task_id: String,
    pub attachment_id: i64,
}

/// Background job state as reported by the job-status endpoint.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Success,
    Failure,
}

/// The job runner reports `result` either as a bare string or as an
/// object carrying a `message`; accept both.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JobResult {
    Text(String),
    Detail {
        #[serde(default)]
        message: Option<String>,
    },
}

impl JobResult {
    pub fn message(&self) -> Option<&str> {
        match self {
            JobResult::Text(text) => Some(text),
            JobResult::Detail { message } => message.as_deref(),
        }
    }
}

/// Response of `GET /tasks/status/{task_id}`.
#[derive(Clone, Debug, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    #[serde(default)]
    pub result: Option<JobResult>,
}

/// Body of `POST /attachments/{id}/promote`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromotionRequest {
    pub suggested_kb_doc_id: String,
    #[serde(default)]
    pub note_to_admin: String,
}

/// One entry of `GET /admin/attachments/pending`.
#[derive(Clone, Debug, Deserialize)]
pub struct PendingAttachment {
    pub attachment_id: i64,
    pub session_id: String,
    pub file_name: String,
    #[serde(default)]
    pub pending_review_metadata: Option<PromotionRequest>,
}

/// Body of `POST /admin/attachments/{id}/approve`.
#[derive(Clone, Debug, Serialize)]
pub struct ApproveRequest {
    pub kb_doc_id: String,
    pub permission_groups: Vec<String>,
}

/// Approval acknowledgement: the copy-to-knowledge-base job id.
#[derive(Clone, Debug, Deserialize)]
pub struct ApproveAccepted {
    pub task_id: String,
}

/// Body of `POST /scheduler/tasks`.
#[derive(Clone, Debug, Serialize)]
pub struct TaskCreate {
    pub task_name: String,
    /// Cron expression, validated server-side.
    pub schedule: String,
    pub task_kwargs: serde_json::Value,
}

/// One entry of `GET /scheduler/tasks`.
#[derive(Clone, Debug, Deserialize)]
pub struct ScheduledTask {
    pub task_id: i64,
    pub task_name: String,
    pub schedule: String,
    pub task_kwargs: serde_json::Value,
    pub is_active: bool,
}

/// One entry of `GET /notifications`.
#[derive(Clone, Debug, Deserialize)]
pub struct Notification {
    pub notification_id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct LoginForm<'a> {
    username: &'a str,
    password: &'a str,
}

/// Response of `POST /auth/token`.
#[derive(Clone, Debug, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Serialize)]
struct RepoIndexRequest<'a> {
    repo_url: &'a str,
    session_id: &'a str,
}

#[derive(Serialize)]
struct DeleteDocumentRequest<'a> {
    doc_id_or_prefix: &'a str,
}

impl ApiClient {
    /// Exchange credentials for a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<Token, ApiError> {
        self.post_form("/auth/token", &LoginForm { username, password })
            .await
    }

    /// Open the streaming query connection for a conversation.
    pub async fn query_stream(
        &self,
        request: &QueryRequest,
    ) -> Result<BoxedStream<StreamEvent>, ApiError> {
        self.post_stream("/chat/query-stream", request).await
    }

    /// List the user's persisted conversations, most recent first.
    pub async fn chat_sessions(&self) -> Result<Vec<ChatSession>, ApiError> {
        let response: ChatSessionListResponse = self.get("/chat/sessions").await?;
        Ok(response.sessions)
    }

    /// Fetch a conversation's persisted history in chronological order.
    pub async fn chat_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatHistoryMessage>, ApiError> {
        let response: ChatHistoryResponse =
            self.get(&format!("/chat/history/{}", session_id)).await?;
        Ok(response.messages)
    }

    /// Upload a file for session-scoped indexing.
    pub async fn upload_attachment(
        &self,
        session_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadAccepted, ApiError> {
        self.post_multipart(
            "/attachments/upload",
            file_name,
            bytes,
            &[("session_id", session_id.to_string())],
        )
        .await
    }

    /// Submit a GitHub repository for session-scoped indexing.
    pub async fn index_repo(
        &self,
        session_id: &str,
        repo_url: &str,
    ) -> Result<UploadAccepted, ApiError> {
        self.post(
            "/attachments/index-github-repo",
            &RepoIndexRequest {
                repo_url,
                session_id,
            },
        )
        .await
    }

    /// Indexed knowledge-base sources visible to the user, keyed by the
    /// filter id accepted in `QueryRequest::doc_ids_filter`, valued by a
    /// display name.
    pub async fn kb_documents(&self) -> Result<std::collections::BTreeMap<String, String>, ApiError> {
        self.get("/documents").await
    }

    /// Delete an indexed knowledge-base source by doc id or prefix.
    pub async fn delete_kb_document(&self, doc_id_or_prefix: &str) -> Result<(), ApiError> {
        self.delete_json("/documents", &DeleteDocumentRequest { doc_id_or_prefix })
            .await
    }

    /// Query a background job's status.
    pub async fn job_status(&self, task_id: &str) -> Result<JobStatus, ApiError> {
        self.get(&format!("/tasks/status/{}", task_id)).await
    }

    /// Ask for an attachment to be promoted into the knowledge base.
    pub async fn request_promotion(
        &self,
        attachment_id: i64,
        request: &PromotionRequest,
    ) -> Result<(), ApiError> {
        self.post_no_content(&format!("/attachments/{}/promote", attachment_id), request)
            .await
    }

    /// List attachments awaiting review (admin only).
    pub async fn pending_attachments(&self) -> Result<Vec<PendingAttachment>, ApiError> {
        self.get("/admin/attachments/pending").await
    }

    /// Approve a pending attachment; returns the copy job to track.
    pub async fn approve_attachment(
        &self,
        attachment_id: i64,
        request: &ApproveRequest,
    ) -> Result<ApproveAccepted, ApiError> {
        self.post(&format!("/admin/attachments/{}/approve", attachment_id), request)
            .await
    }

    /// Reject a pending attachment (admin only).
    pub async fn reject_attachment(&self, attachment_id: i64) -> Result<(), ApiError> {
        self.post_empty(&format!("/admin/attachments/{}/reject", attachment_id))
            .await
    }

    /// Register a recurring job.
    pub async fn create_scheduled_task(
        &self,
        task: &TaskCreate,
    ) -> Result<ScheduledTask, ApiError> {
        self.post("/scheduler/tasks", task).await
    }

    /// List the user's recurring jobs.
    pub async fn scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, ApiError> {
        self.get("/scheduler/tasks").await
    }

    /// Delete a recurring job.
    pub async fn delete_scheduled_task(&self, task_id: i64) -> Result<(), ApiError> {
        self.delete(&format!("/scheduler/tasks/{}", task_id)).await
    }

    /// Fetch unread notifications.
    pub async fn notifications(&self) -> Result<Vec<Notification>, ApiError> {
        self.get("/notifications").await
    }

    /// Mark a notification as read.
    pub async fn mark_notification_read(&self, notification_id: i64) -> Result<(), ApiError> {
        self.post_empty(&format!("/notifications/{}/read", notification_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_omits_empty_optionals() {
        let request = QueryRequest {
            query: "What is the PTO policy?".to_string(),
            session_id: None,
            top_k: 3,
            doc_ids_filter: None,
            chat_history: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"query": "What is the PTO policy?", "top_k": 3})
        );
    }

    #[test]
    fn test_job_status_accepts_string_result() {
        let status: JobStatus =
            serde_json::from_str(r#"{"status": "FAILURE", "result": "parse error"}"#).unwrap();
        assert_eq!(status.status, JobState::Failure);
        assert_eq!(status.result.unwrap().message(), Some("parse error"));
    }

    #[test]
    fn test_job_status_accepts_object_result() {
        let status: JobStatus =
            serde_json::from_str(r#"{"status": "SUCCESS", "result": {"message": "42 chunks"}}"#)
                .unwrap();
        assert_eq!(status.status, JobState::Success);
        assert_eq!(status.result.unwrap().message(), Some("42 chunks"));
    }

    #[test]
    fn test_job_status_without_result() {
        let status: JobStatus = serde_json::from_str(r#"{"status": "PENDING"}"#).unwrap();
        assert_eq!(status.status, JobState::Pending);
        assert!(status.result.is_none());
    }
}
