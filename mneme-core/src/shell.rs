//! The session shell: one background loop owning all conversation state.
//!
//! Callers drive it with [`ShellCommand`]s and watch it through the shared
//! event channel; the loop owns the message timeline, the attachment list,
//! the live stream handle, and the job pollers. Everything slow (uploads,
//! promotion posts) runs in spawned tasks that report back over internal
//! channels, so the loop itself never blocks on the network except while
//! loading history during a switch, where blocking input is the point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mneme_client::{ApiClient, ApiError, ChatTurn, PromotionRequest, QueryRequest, UploadAccepted};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::attachment::{self, Attachment, AttachmentStatus};
use crate::poller::{PollOutcome, TaskPoller};
use crate::reconcile::{self, Message};
use crate::stream::{self, StreamHandle, StreamSignal};

pub type ConversationId = String;

/// The channel every state change is announced on.
pub type SharedEventSender = mpsc::UnboundedSender<(ConversationId, SessionEvent)>;

/// State changes the shell announces to its observer.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The active conversation changed; all prior state is void.
    ConversationSwitched,
    /// Persisted history for the active conversation, oldest first.
    HistoryLoaded(Vec<Message>),
    /// A query was sent and its answer stream is opening.
    StreamStarted,
    /// The message timeline changed; carries the full new timeline.
    MessagesChanged(Vec<Message>),
    /// The answer stream ended. `cancelled` means the user moved on;
    /// whatever was received stays in the timeline either way.
    StreamFinished { cancelled: bool },
    /// The attachment list changed; carries the full new list.
    AttachmentsChanged(Vec<Attachment>),
    /// A human-readable notice worth surfacing (failures, timeouts).
    Notice(String),
}

/// Instructions the owner sends the shell.
#[derive(Clone, Debug)]
pub enum ShellCommand {
    SendQuery(String),
    SwitchConversation(ConversationId),
    NewConversation,
    SubmitAttachment { file_name: String, bytes: Vec<u8> },
    SubmitRepo { url: String },
    RequestPromotion {
        attachment_id: i64,
        suggested_kb_doc_id: String,
        note_to_admin: String,
    },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ShellConfig {
    pub top_k: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            top_k: 3,
            poll_interval: Duration::from_secs(3),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

/// Results of spawned I/O tasks, reported back into the loop.
enum IoSignal {
    UploadDone {
        conversation_id: ConversationId,
        placeholder_task_id: String,
        result: Result<UploadAccepted, ApiError>,
    },
    PromotionDone {
        conversation_id: ConversationId,
        attachment_id: i64,
        request: PromotionRequest,
        result: Result<(), ApiError>,
    },
}

/// Handle to the spawned shell loop.
pub struct SessionShell {
    cmd_tx: mpsc::UnboundedSender<ShellCommand>,
    handle: JoinHandle<()>,
}

impl SessionShell {
    pub fn new(client: Arc<ApiClient>, config: ShellConfig, event_tx: SharedEventSender) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(client, config, event_tx, cmd_rx));
        SessionShell { cmd_tx, handle }
    }

    /// Enqueue a command. Errors only after shutdown.
    pub fn command(&self, command: ShellCommand) -> bool {
        self.cmd_tx.send(command).is_ok()
    }

    /// Ask the loop to stop and wait for it to drain.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(ShellCommand::Shutdown);
        let _ = self.handle.await;
    }
}

struct ShellState {
    client: Arc<ApiClient>,
    config: ShellConfig,
    event_tx: SharedEventSender,

    conversation_id: ConversationId,
    messages: Vec<Message>,
    attachments: Vec<Attachment>,

    stream: Option<StreamHandle>,
    /// Bumped on every stream start and cancellation; signals tagged with
    /// an older generation are from a stream already abandoned.
    generation: u64,

    pollers: HashMap<String, TaskPoller>,

    stream_tx: mpsc::UnboundedSender<(ConversationId, u64, StreamSignal)>,
    job_tx: mpsc::UnboundedSender<(String, PollOutcome)>,
    io_tx: mpsc::UnboundedSender<IoSignal>,
}

impl ShellState {
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send((self.conversation_id.clone(), event));
    }
}

async fn run_loop(
    client: Arc<ApiClient>,
    config: ShellConfig,
    event_tx: SharedEventSender,
    mut cmd_rx: mpsc::UnboundedReceiver<ShellCommand>,
) {
    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let (job_tx, mut job_rx) = mpsc::unbounded_channel();
    let (io_tx, mut io_rx) = mpsc::unbounded_channel();

    let mut state = ShellState {
        client,
        config,
        event_tx,
        conversation_id: uuid::Uuid::new_v4().to_string(),
        messages: Vec::new(),
        attachments: Vec::new(),
        stream: None,
        generation: 0,
        pollers: HashMap::new(),
        stream_tx,
        job_tx,
        io_tx,
    };

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(ShellCommand::Shutdown) | None => break,
                Some(command) => handle_command(&mut state, command).await,
            },
            Some((conversation_id, generation, signal)) = stream_rx.recv() => {
                handle_stream_signal(&mut state, conversation_id, generation, signal);
            }
            Some((task_id, outcome)) = job_rx.recv() => {
                handle_job_outcome(&mut state, task_id, outcome);
            }
            Some(signal) = io_rx.recv() => {
                handle_io_signal(&mut state, signal);
            }
        }
    }

    cancel_stream(&mut state, false);
    for (_, poller) in state.pollers.drain() {
        poller.cancel();
    }
    tracing::debug!("session shell stopped");
}

/// Stop any live stream. `announce` controls whether the observer is told;
/// on conversation switch the `ConversationSwitched` event subsumes it.
fn cancel_stream(state: &mut ShellState, announce: bool) {
    if let Some(handle) = state.stream.take() {
        handle.abort();
        state.generation += 1;
        if announce {
            state.emit(SessionEvent::StreamFinished { cancelled: true });
        }
    }
}

async fn handle_command(state: &mut ShellState, command: ShellCommand) {
    match command {
        ShellCommand::SendQuery(query) => send_query(state, query),
        ShellCommand::SwitchConversation(id) => switch_conversation(state, id).await,
        ShellCommand::NewConversation => {
            reset_conversation(state, uuid::Uuid::new_v4().to_string());
            state.emit(SessionEvent::HistoryLoaded(Vec::new()));
        }
        ShellCommand::SubmitAttachment { file_name, bytes } => {
            submit_attachment(state, file_name, bytes);
        }
        ShellCommand::SubmitRepo { url } => submit_repo(state, url),
        ShellCommand::RequestPromotion {
            attachment_id,
            suggested_kb_doc_id,
            note_to_admin,
        } => request_promotion(state, attachment_id, suggested_kb_doc_id, note_to_admin),
        // Intercepted by the loop before dispatch.
        ShellCommand::Shutdown => {}
    }
}

fn send_query(state: &mut ShellState, query: String) {
    // One stream at a time: starting a new query is the cancellation of
    // the old one, observed exactly once via this synchronous event. The
    // generation bump makes the old task's own Finished signal stale.
    cancel_stream(state, true);

    // Prior turns go up as context; tool bubbles carry no text and are
    // skipped.
    let chat_history: Vec<ChatTurn> = state
        .messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    state.messages = reconcile::push_user(&state.messages, &query);
    state.emit(SessionEvent::MessagesChanged(state.messages.clone()));
    state.emit(SessionEvent::StreamStarted);

    let request = QueryRequest {
        query,
        session_id: Some(state.conversation_id.clone()),
        top_k: state.config.top_k,
        doc_ids_filter: None,
        chat_history,
    };

    state.generation += 1;
    state.stream = Some(stream::open_stream(
        state.client.clone(),
        request,
        state.conversation_id.clone(),
        state.generation,
        state.stream_tx.clone(),
    ));
}

/// Drop everything tied to the old conversation and install the new id.
fn reset_conversation(state: &mut ShellState, id: ConversationId) {
    cancel_stream(state, false);
    for (_, poller) in state.pollers.drain() {
        poller.cancel();
    }
    state.conversation_id = id;
    state.messages.clear();
    state.attachments.clear();
    state.emit(SessionEvent::ConversationSwitched);
}

async fn switch_conversation(state: &mut ShellState, id: ConversationId) {
    reset_conversation(state, id.clone());

    // Loading inline keeps commands queued until history is in, which is
    // exactly the ordering the observer needs.
    match state.client.chat_history(&id).await {
        Ok(history) => {
            state.messages = history
                .into_iter()
                .map(|m| match m.role {
                    mneme_client::Role::User => Message::user(m.content),
                    mneme_client::Role::Assistant => Message::assistant(m.content),
                })
                .collect();
            state.emit(SessionEvent::HistoryLoaded(state.messages.clone()));
        }
        Err(err) => {
            tracing::warn!(conversation_id = %id, error = %err, "history load failed");
            state.emit(SessionEvent::Notice(format!("could not load history: {err}")));
            state.emit(SessionEvent::HistoryLoaded(Vec::new()));
        }
    }
}

fn handle_stream_signal(
    state: &mut ShellState,
    conversation_id: ConversationId,
    generation: u64,
    signal: StreamSignal,
) {
    if conversation_id != state.conversation_id || generation != state.generation {
        tracing::trace!(%conversation_id, generation, "dropping stale stream signal");
        return;
    }

    match signal {
        StreamSignal::Event(event) => {
            if let mneme_client::StreamEvent::Error(ref message) = event {
                state.emit(SessionEvent::Notice(format!("answer failed: {message}")));
            }
            state.messages = reconcile::apply_event(&state.messages, &event);
            state.emit(SessionEvent::MessagesChanged(state.messages.clone()));
        }
        StreamSignal::ConnectFailed(message) => {
            // Nothing was consumed; the question stands and can be retried.
            state.stream = None;
            state.emit(SessionEvent::Notice(format!("query failed: {message}")));
            state.emit(SessionEvent::StreamFinished { cancelled: false });
        }
        StreamSignal::Finished { cancelled } => {
            state.stream = None;
            state.emit(SessionEvent::StreamFinished { cancelled });
        }
    }
}

fn submit_attachment(state: &mut ShellState, file_name: String, bytes: Vec<u8>) {
    let placeholder = attachment::placeholder_task_id();
    state.attachments = attachment::insert_optimistic(&state.attachments, &file_name, &placeholder);
    state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));

    let client = state.client.clone();
    let conversation_id = state.conversation_id.clone();
    let io_tx = state.io_tx.clone();
    tokio::spawn(async move {
        let result = client
            .upload_attachment(&conversation_id, &file_name, bytes)
            .await;
        let _ = io_tx.send(IoSignal::UploadDone {
            conversation_id,
            placeholder_task_id: placeholder,
            result,
        });
    });
}

fn submit_repo(state: &mut ShellState, url: String) {
    let placeholder = attachment::placeholder_task_id();
    state.attachments = attachment::insert_optimistic(&state.attachments, &url, &placeholder);
    state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));

    let client = state.client.clone();
    let conversation_id = state.conversation_id.clone();
    let io_tx = state.io_tx.clone();
    tokio::spawn(async move {
        let result = client.index_repo(&conversation_id, &url).await;
        let _ = io_tx.send(IoSignal::UploadDone {
            conversation_id,
            placeholder_task_id: placeholder,
            result,
        });
    });
}

fn request_promotion(
    state: &mut ShellState,
    attachment_id: i64,
    suggested_kb_doc_id: String,
    note_to_admin: String,
) {
    let request = PromotionRequest {
        suggested_kb_doc_id,
        note_to_admin,
    };
    let client = state.client.clone();
    let conversation_id = state.conversation_id.clone();
    let io_tx = state.io_tx.clone();
    tokio::spawn(async move {
        let result = client.request_promotion(attachment_id, &request).await;
        let _ = io_tx.send(IoSignal::PromotionDone {
            conversation_id,
            attachment_id,
            request,
            result,
        });
    });
}

fn handle_io_signal(state: &mut ShellState, signal: IoSignal) {
    match signal {
        IoSignal::UploadDone {
            conversation_id,
            placeholder_task_id,
            result,
        } => {
            if conversation_id != state.conversation_id {
                tracing::debug!(%conversation_id, "dropping upload result for left conversation");
                return;
            }
            match result {
                Ok(accepted) => {
                    state.attachments = attachment::confirm_upload(
                        &state.attachments,
                        &placeholder_task_id,
                        &accepted.task_id,
                        accepted.attachment_id,
                    );
                    state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));
                    let poller = TaskPoller::spawn(
                        state.client.clone(),
                        accepted.task_id.clone(),
                        state.config.poll_interval,
                        state.config.poll_timeout,
                        state.job_tx.clone(),
                    );
                    state.pollers.insert(accepted.task_id, poller);
                }
                Err(err) => {
                    state.attachments =
                        attachment::remove_by_task(&state.attachments, &placeholder_task_id);
                    state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));
                    state.emit(SessionEvent::Notice(format!("upload failed: {err}")));
                }
            }
        }
        IoSignal::PromotionDone {
            conversation_id,
            attachment_id,
            request,
            result,
        } => {
            if conversation_id != state.conversation_id {
                return;
            }
            match result {
                Ok(()) => {
                    state.attachments =
                        attachment::apply_promotion(&state.attachments, attachment_id, &request);
                    state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));
                }
                Err(err) => {
                    state.emit(SessionEvent::Notice(format!(
                        "promotion request failed: {err}"
                    )));
                }
            }
        }
    }
}

fn handle_job_outcome(state: &mut ShellState, task_id: String, outcome: PollOutcome) {
    if state.pollers.remove(&task_id).is_none() {
        tracing::debug!(task_id, "outcome for unknown job");
        return;
    }

    let file_name = state
        .attachments
        .iter()
        .find(|a| a.task_id == task_id)
        .map(|a| a.file_name.clone())
        .unwrap_or_else(|| task_id.clone());

    match outcome {
        PollOutcome::Succeeded { .. } => {
            state.attachments =
                attachment::apply_status(&state.attachments, &task_id, AttachmentStatus::Temporary);
            state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));
        }
        PollOutcome::Failed { message } => {
            state.attachments =
                attachment::apply_status(&state.attachments, &task_id, AttachmentStatus::Failed);
            state.emit(SessionEvent::AttachmentsChanged(state.attachments.clone()));
            state.emit(SessionEvent::Notice(format!(
                "indexing {file_name} failed: {message}"
            )));
        }
        PollOutcome::TimedOut => {
            // Status stays as-is; the job may still finish server-side.
            state.emit(SessionEvent::Notice(format!(
                "indexing {file_name} is taking too long; check back later"
            )));
        }
        PollOutcome::QueryFailed { message } => {
            state.emit(SessionEvent::Notice(format!(
                "lost track of indexing {file_name}: {message}"
            )));
        }
    }
}
