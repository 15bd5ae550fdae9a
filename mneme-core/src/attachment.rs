//! Attachment lifecycle state, kept as pure list transforms.
//!
//! An upload is shown optimistically under a placeholder task id, rekeyed
//! to the server-assigned id once the upload endpoint answers, then driven
//! through its status machine by the task poller. The transforms live here
//! so the shell's event loop stays thin and the transitions stay testable
//! without any I/O.

use mneme_client::PromotionRequest;
use serde::{Deserialize, Serialize};

/// Where an attachment sits in its ingest-and-review lifecycle.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    /// Upload accepted, background indexing job still running.
    Indexing,
    /// Indexed and queryable in this session only.
    Temporary,
    /// Promotion requested, waiting on an admin decision.
    PendingReview,
    /// Approved into the shared knowledge base.
    Promoted,
    /// An admin declined the promotion.
    Rejected,
    /// The indexing job failed; the attachment is unusable.
    Failed,
}

impl AttachmentStatus {
    /// Whether `from -> to` is a legal lifecycle move. Everything not
    /// listed here is refused, which makes stale poller results and
    /// replayed events harmless.
    pub fn can_transition(from: AttachmentStatus, to: AttachmentStatus) -> bool {
        use AttachmentStatus::*;
        matches!(
            (from, to),
            (Indexing, Temporary)
                | (Indexing, Failed)
                | (Temporary, PendingReview)
                | (PendingReview, Promoted)
                | (PendingReview, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttachmentStatus::Promoted | AttachmentStatus::Rejected | AttachmentStatus::Failed
        )
    }
}

/// A session-scoped attachment as the shell tracks it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Attachment {
    /// Server row id; 0 until the upload response rekeys the entry.
    pub attachment_id: i64,
    pub file_name: String,
    pub status: AttachmentStatus,
    /// Background job id, initially a `local-` placeholder.
    pub task_id: String,
    /// Set once the user has asked for promotion.
    #[serde(default)]
    pub pending_review_metadata: Option<PromotionRequest>,
}

/// Make a placeholder task id for an optimistic insert.
pub fn placeholder_task_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

/// Append an Indexing entry under a placeholder task id before the upload
/// request is even sent.
pub fn insert_optimistic(
    attachments: &[Attachment],
    file_name: &str,
    placeholder_task_id: &str,
) -> Vec<Attachment> {
    let mut next = attachments.to_vec();
    next.push(Attachment {
        attachment_id: 0,
        file_name: file_name.to_string(),
        status: AttachmentStatus::Indexing,
        task_id: placeholder_task_id.to_string(),
        pending_review_metadata: None,
    });
    next
}

/// Rekey the placeholder entry to the ids the upload endpoint returned.
/// The entry itself is updated in place, never removed and re-added, so
/// its position in the list is stable.
pub fn confirm_upload(
    attachments: &[Attachment],
    placeholder_task_id: &str,
    task_id: &str,
    attachment_id: i64,
) -> Vec<Attachment> {
    let mut next = attachments.to_vec();
    if let Some(entry) = next.iter_mut().find(|a| a.task_id == placeholder_task_id) {
        entry.task_id = task_id.to_string();
        entry.attachment_id = attachment_id;
    } else {
        tracing::warn!(placeholder_task_id, "upload confirmation for unknown entry");
    }
    next
}

/// Roll back an optimistic insert whose upload request failed.
pub fn remove_by_task(attachments: &[Attachment], task_id: &str) -> Vec<Attachment> {
    attachments
        .iter()
        .filter(|a| a.task_id != task_id)
        .cloned()
        .collect()
}

/// Apply a status observed for a task, subject to the transition table.
/// An illegal move leaves the list unchanged and logs.
pub fn apply_status(
    attachments: &[Attachment],
    task_id: &str,
    status: AttachmentStatus,
) -> Vec<Attachment> {
    let mut next = attachments.to_vec();
    if let Some(entry) = next.iter_mut().find(|a| a.task_id == task_id) {
        if AttachmentStatus::can_transition(entry.status, status) {
            entry.status = status;
        } else {
            tracing::warn!(
                task_id,
                from = ?entry.status,
                to = ?status,
                "refusing illegal attachment transition"
            );
        }
    }
    next
}

/// Record an accepted promotion request: Temporary -> PendingReview with
/// the request carried as review metadata.
pub fn apply_promotion(
    attachments: &[Attachment],
    attachment_id: i64,
    request: &PromotionRequest,
) -> Vec<Attachment> {
    let mut next = attachments.to_vec();
    if let Some(entry) = next.iter_mut().find(|a| a.attachment_id == attachment_id) {
        if AttachmentStatus::can_transition(entry.status, AttachmentStatus::PendingReview) {
            entry.status = AttachmentStatus::PendingReview;
            entry.pending_review_metadata = Some(request.clone());
        } else {
            tracing::warn!(
                attachment_id,
                from = ?entry.status,
                "refusing promotion request outside Temporary"
            );
        }
    }
    next
}
