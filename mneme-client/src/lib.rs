//! Typed HTTP/SSE client for the knowledge assistant backend
//!
//! This crate owns the wire layer only: request/response schemas for each
//! backend endpoint, a thin reqwest wrapper with bearer auth, and the
//! line-framed decoder for the streaming query endpoint. Everything
//! stateful (conversations, attachments, polling) lives in `mneme-core`.

pub mod api;
pub mod client;
pub mod error;
pub mod events;

pub use api::{
    ApproveAccepted, ApproveRequest, ChatHistoryMessage, ChatSession, ChatTurn, JobResult,
    JobState, JobStatus, Notification, PendingAttachment, PromotionRequest, QueryRequest, Role,
    ScheduledTask, TaskCreate, Token, UploadAccepted,
};
pub use client::{ApiClient, BoxedStream};
pub use error::ApiError;
pub use events::{SourceRef, StreamEvent};
