//! One live answer stream, owned by a spawned task.
//!
//! The shell never touches the HTTP stream directly. It spawns the stream
//! into a task that forwards decoded events over the shared channel,
//! keeping a `StreamHandle` as its only way to stop it. Signals carry the
//! conversation id and a generation counter so the shell can drop anything
//! from a stream it has already moved past.

use std::sync::Arc;

use futures::StreamExt;
use mneme_client::{ApiClient, QueryRequest, StreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::shell::ConversationId;

/// What a stream task reports back to the shell.
#[derive(Clone, Debug)]
pub enum StreamSignal {
    /// A decoded event from the wire.
    Event(StreamEvent),
    /// The request never produced a stream; nothing was consumed.
    ConnectFailed(String),
    /// The stream is over, either drained or cancelled. Sent exactly once
    /// per task unless the connect itself failed.
    Finished { cancelled: bool },
}

/// Handle to a spawned stream task.
pub struct StreamHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StreamHandle {
    /// Stop consuming. The task sends `Finished { cancelled: true }` and
    /// exits; the connection is dropped, which aborts it server-side.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn abort(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Spawn the query as a background stream task.
pub fn open_stream(
    client: Arc<ApiClient>,
    request: QueryRequest,
    conversation_id: ConversationId,
    generation: u64,
    tx: mpsc::UnboundedSender<(ConversationId, u64, StreamSignal)>,
) -> StreamHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        let send = |signal: StreamSignal| {
            let _ = tx.send((conversation_id.clone(), generation, signal));
        };

        let mut stream = match client.query_stream(&request).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "query stream failed to open");
                send(StreamSignal::ConnectFailed(err.to_string()));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    tracing::debug!(%conversation_id, "stream cancelled");
                    send(StreamSignal::Finished { cancelled: true });
                    return;
                }
                event = stream.next() => match event {
                    Some(StreamEvent::End) => {
                        send(StreamSignal::Finished { cancelled: false });
                        return;
                    }
                    Some(StreamEvent::Error(message)) => {
                        tracing::warn!(%conversation_id, message, "server reported stream error");
                        send(StreamSignal::Event(StreamEvent::Error(message)));
                        send(StreamSignal::Finished { cancelled: false });
                        return;
                    }
                    Some(event) => send(StreamSignal::Event(event)),
                    None => {
                        // Connection dropped without a closing event.
                        tracing::warn!(%conversation_id, "stream ended without end event");
                        send(StreamSignal::Finished { cancelled: false });
                        return;
                    }
                }
            }
        }
    });

    StreamHandle { cancel, handle }
}
