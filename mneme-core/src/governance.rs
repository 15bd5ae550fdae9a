//! Admin review workflow: list, approve, and reject pending promotions.
//!
//! Approval is asynchronous server-side: the endpoint acknowledges with a
//! copy job id and the actual move into the knowledge base happens in the
//! background. `approve` therefore reports twice on the event channel,
//! once when the request is accepted and once when the copy job resolves.

use std::sync::Arc;

use anyhow::Context;
use mneme_client::{ApiClient, ApproveRequest, PendingAttachment};
use tokio::sync::mpsc;

use crate::poller::{PollOutcome, TaskPoller};

#[derive(Clone, Debug)]
pub enum GovernanceEvent {
    PendingListed(Vec<PendingAttachment>),
    /// The approval was accepted; the copy job is now being tracked.
    ApprovalSubmitted { attachment_id: i64, task_id: String },
    /// The copy job finished and the document is in the knowledge base.
    PromotionApproved { attachment_id: i64 },
    /// The copy job failed; the attachment stays pending review.
    ApprovalJobFailed { attachment_id: i64, message: String },
    /// The copy job was still running at the polling deadline.
    ApprovalJobTimedOut { attachment_id: i64 },
    PromotionRejected { attachment_id: i64 },
}

/// Client-side driver of the review workflow.
pub struct GovernanceClient {
    client: Arc<ApiClient>,
    event_tx: mpsc::UnboundedSender<GovernanceEvent>,
    poll_interval: std::time::Duration,
    poll_timeout: std::time::Duration,
}

impl GovernanceClient {
    pub fn new(
        client: Arc<ApiClient>,
        event_tx: mpsc::UnboundedSender<GovernanceEvent>,
        poll_interval: std::time::Duration,
        poll_timeout: std::time::Duration,
    ) -> Self {
        GovernanceClient {
            client,
            event_tx,
            poll_interval,
            poll_timeout,
        }
    }

    /// Fetch the review queue and announce it.
    pub async fn list_pending(&self) -> anyhow::Result<Vec<PendingAttachment>> {
        let pending = self
            .client
            .pending_attachments()
            .await
            .context("listing pending attachments")?;
        let _ = self
            .event_tx
            .send(GovernanceEvent::PendingListed(pending.clone()));
        Ok(pending)
    }

    /// Approve a pending attachment into the knowledge base and track the
    /// copy job until it resolves.
    pub async fn approve(
        &self,
        attachment_id: i64,
        kb_doc_id: String,
        permission_groups: Vec<String>,
    ) -> anyhow::Result<()> {
        let accepted = self
            .client
            .approve_attachment(
                attachment_id,
                &ApproveRequest {
                    kb_doc_id,
                    permission_groups,
                },
            )
            .await
            .with_context(|| format!("approving attachment {attachment_id}"))?;

        let _ = self.event_tx.send(GovernanceEvent::ApprovalSubmitted {
            attachment_id,
            task_id: accepted.task_id.clone(),
        });

        let (job_tx, mut job_rx) = mpsc::unbounded_channel();
        let poller = TaskPoller::spawn(
            self.client.clone(),
            accepted.task_id,
            self.poll_interval,
            self.poll_timeout,
            job_tx,
        );

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            // Keep the poller alive until its single report arrives.
            let _poller = poller;
            let Some((task_id, outcome)) = job_rx.recv().await else {
                return;
            };
            let event = match outcome {
                PollOutcome::Succeeded { .. } => {
                    GovernanceEvent::PromotionApproved { attachment_id }
                }
                PollOutcome::Failed { message } => GovernanceEvent::ApprovalJobFailed {
                    attachment_id,
                    message,
                },
                PollOutcome::TimedOut => GovernanceEvent::ApprovalJobTimedOut { attachment_id },
                PollOutcome::QueryFailed { message } => {
                    tracing::warn!(task_id, message, "lost track of approval job");
                    GovernanceEvent::ApprovalJobFailed {
                        attachment_id,
                        message: format!("status query failed: {message}"),
                    }
                }
            };
            let _ = event_tx.send(event);
        });

        Ok(())
    }

    /// Reject a pending attachment. Takes effect immediately server-side.
    pub async fn reject(&self, attachment_id: i64) -> anyhow::Result<()> {
        self.client
            .reject_attachment(attachment_id)
            .await
            .with_context(|| format!("rejecting attachment {attachment_id}"))?;
        let _ = self
            .event_tx
            .send(GovernanceEvent::PromotionRejected { attachment_id });
        Ok(())
    }
}
