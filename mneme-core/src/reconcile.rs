//! Pure message-timeline reconciliation.
//!
//! Every function takes the current ordered message list and returns a new
//! one; the input is never mutated. The shell applies these while a stream
//! is live, so purity keeps a concurrent reader (the UI layer) consistent
//! mid-render. Only the last element of the list is ever replaced.

use mneme_client::{Role, SourceRef, StreamEvent};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum ToolStatus {
    Running,
    Completed,
}

/// A tool invocation rendered as its own bubble, distinct from free text.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ToolCallState {
    pub name: String,
    pub status: ToolStatus,
}

/// One entry of the conversation timeline.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    /// Locally unique id; history loaded from the server gets fresh ones.
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub tool_call: Option<ToolCallState>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            sources: Vec::new(),
            tool_call: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: content.into(),
            sources: Vec::new(),
            tool_call: None,
        }
    }

    fn tool(name: impl Into<String>) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            sources: Vec::new(),
            tool_call: Some(ToolCallState {
                name: name.into(),
                status: ToolStatus::Running,
            }),
        }
    }

    fn is_running_tool(&self) -> bool {
        matches!(
            self.tool_call,
            Some(ToolCallState {
                status: ToolStatus::Running,
                ..
            })
        )
    }
}

/// Append a user message (the start of a turn).
pub fn push_user(messages: &[Message], content: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    next.push(Message::user(content));
    next
}

/// Fold a token chunk into the timeline.
///
/// A new assistant bubble opens when the list is empty, the last message is
/// a user turn, the last message is a tool bubble, or the producer asserts
/// `new_message`. Otherwise the chunk extends the last message. A single
/// logical turn can interleave text and tool invocations, so text arriving
/// after a tool bubble must not be folded into it.
pub fn fold_token(messages: &[Message], chunk: &str, new_message: bool) -> Vec<Message> {
    let mut next = messages.to_vec();

    let needs_new_bubble = match next.last() {
        None => true,
        Some(last) => last.role == Role::User || last.tool_call.is_some() || new_message,
    };

    if needs_new_bubble {
        next.push(Message::assistant(chunk));
    } else if let Some(last) = next.last_mut() {
        last.content.push_str(chunk);
    }

    next
}

/// Fold a tool-invocation start into the timeline.
///
/// Back-to-back tool switches (no intervening end) rename the running
/// bubble in place instead of opening a second one.
pub fn fold_tool_start(messages: &[Message], name: &str) -> Vec<Message> {
    let mut next = messages.to_vec();

    match next.last_mut() {
        Some(last) if last.role == Role::Assistant && last.is_running_tool() => {
            if let Some(tool_call) = last.tool_call.as_mut() {
                tool_call.name = name.to_string();
            }
        }
        _ => next.push(Message::tool(name)),
    }

    next
}

/// Fold a tool-invocation end into the timeline.
///
/// No-op unless the last message's tool name matches: out-of-order or
/// duplicate end signals are ignored.
pub fn fold_tool_end(messages: &[Message], name: &str) -> Vec<Message> {
    let mut next = messages.to_vec();

    if let Some(last) = next.last_mut() {
        if let Some(tool_call) = last.tool_call.as_mut() {
            if tool_call.name == name {
                tool_call.status = ToolStatus::Completed;
            }
        }
    }

    next
}

/// Attach citations to the last message iff it is an assistant turn.
pub fn fold_sources(messages: &[Message], sources: &[SourceRef]) -> Vec<Message> {
    let mut next = messages.to_vec();

    if let Some(last) = next.last_mut() {
        if last.role == Role::Assistant {
            last.sources = sources.to_vec();
        }
    }

    next
}

/// Dispatch one decoded stream event into the matching fold.
/// `End` and `Error` carry no timeline change and return the input as-is.
pub fn apply_event(messages: &[Message], event: &StreamEvent) -> Vec<Message> {
    match event {
        StreamEvent::Token { chunk, new_message } => fold_token(messages, chunk, *new_message),
        StreamEvent::ToolStart { name } => fold_tool_start(messages, name),
        StreamEvent::ToolEnd { name } => fold_tool_end(messages, name),
        StreamEvent::Sources(sources) => fold_sources(messages, sources),
        StreamEvent::End | StreamEvent::Error(_) => messages.to_vec(),
    }
}
