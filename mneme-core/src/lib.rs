//! Client-side orchestration for the knowledge assistant
//!
//! This crate provides:
//! - **Reconciliation**: pure fold functions turning stream events into an
//!   ordered message timeline (`reconcile`)
//! - **Attachments**: the ephemeral attachment lifecycle state machine
//!   (`attachment`)
//! - **Polling**: `TaskPoller` for tracking background indexing/copy jobs
//! - **Streaming**: the single-active-stream session task (`stream`)
//! - **Governance**: promotion review operations for privileged users
//! - **Shell**: `SessionShell`, the per-conversation coordinator wiring all
//!   of the above behind command/event channels

pub mod attachment;
pub mod governance;
pub mod poller;
pub mod reconcile;
pub mod shell;
pub mod stream;

pub use attachment::{Attachment, AttachmentStatus};
pub use governance::{GovernanceClient, GovernanceEvent};
pub use poller::{JobStatusSource, PollOutcome, TaskPoller};
pub use reconcile::{Message, ToolCallState, ToolStatus};
pub use shell::{
    ConversationId, SessionEvent, SessionShell, SharedEventSender, ShellCommand, ShellConfig,
};
pub use stream::{StreamHandle, StreamSignal};
