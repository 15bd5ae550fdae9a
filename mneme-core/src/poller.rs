//! Background job polling.
//!
//! Uploads, repo indexing, and promotion approvals all hand back a job id
//! and finish server-side. `TaskPoller` owns one such job: it queries the
//! status endpoint on a fixed interval and reports exactly one outcome on
//! the shared channel before stopping. The first tick fires a full
//! interval after spawn, not immediately, because a job accepted a moment
//! ago is essentially never done yet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mneme_client::{ApiClient, ApiError, JobState, JobStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source of job status, abstracted so pollers are testable without a server.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn job_status(&self, task_id: &str) -> Result<JobStatus, ApiError>;
}

#[async_trait]
impl JobStatusSource for ApiClient {
    async fn job_status(&self, task_id: &str) -> Result<JobStatus, ApiError> {
        ApiClient::job_status(self, task_id).await
    }
}

/// The single terminal report a poller emits for its job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded { message: Option<String> },
    Failed { message: String },
    /// The deadline passed while the job was still pending. Says nothing
    /// about whether the job eventually finished server-side.
    TimedOut,
    /// The status query itself failed; polling stops rather than retrying
    /// against an endpoint that just errored.
    QueryFailed { message: String },
}

/// Handle to one spawned polling loop.
pub struct TaskPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskPoller {
    /// Spawn a poller for `task_id`. Exactly one `(task_id, outcome)` pair
    /// is sent on `tx` unless the poller is cancelled first.
    pub fn spawn<S: JobStatusSource + 'static>(
        source: Arc<S>,
        task_id: String,
        interval: Duration,
        timeout: Duration,
        tx: mpsc::UnboundedSender<(String, PollOutcome)>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticks =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let outcome = loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        tracing::debug!(task_id, "poller cancelled");
                        return;
                    }
                    _ = ticks.tick() => {}
                }

                match source.job_status(&task_id).await {
                    Ok(status) => match status.status {
                        JobState::Success => {
                            break PollOutcome::Succeeded {
                                message: status
                                    .result
                                    .as_ref()
                                    .and_then(|r| r.message())
                                    .map(str::to_string),
                            };
                        }
                        JobState::Failure => {
                            break PollOutcome::Failed {
                                message: status
                                    .result
                                    .as_ref()
                                    .and_then(|r| r.message())
                                    .unwrap_or("job failed")
                                    .to_string(),
                            };
                        }
                        JobState::Pending => {
                            // Deadline is checked after the query so a
                            // still-pending answer on the final tick is
                            // observed before giving up.
                            if started.elapsed() >= timeout {
                                tracing::warn!(task_id, "job still pending at deadline");
                                break PollOutcome::TimedOut;
                            }
                        }
                    },
                    Err(err) => {
                        tracing::warn!(task_id, error = %err, "job status query failed");
                        break PollOutcome::QueryFailed {
                            message: err.to_string(),
                        };
                    }
                }
            };

            let _ = tx.send((task_id, outcome));
        });

        TaskPoller { cancel, handle }
    }

    /// Stop the loop without a report. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl Drop for TaskPoller {
    fn drop(&mut self) {
        self.cancel();
    }
}
