//! End-to-end shell behavior against a mock backend.

use std::sync::Arc;
use std::time::Duration;

use mneme_client::{ApiClient, Role};
use mneme_core::{
    Attachment, AttachmentStatus, ConversationId, SessionEvent, SessionShell, ShellCommand,
    ShellConfig,
};
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn shell_config() -> ShellConfig {
    ShellConfig {
        top_k: 3,
        poll_interval: Duration::from_millis(25),
        poll_timeout: Duration::from_millis(500),
    }
}

fn spawn_shell(
    server: &MockServer,
) -> (
    SessionShell,
    mpsc::UnboundedReceiver<(ConversationId, SessionEvent)>,
) {
    spawn_shell_with(server, shell_config())
}

fn spawn_shell_with(
    server: &MockServer,
    config: ShellConfig,
) -> (
    SessionShell,
    mpsc::UnboundedReceiver<(ConversationId, SessionEvent)>,
) {
    let client = Arc::new(ApiClient::new(server.uri()).with_token("test-token"));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shell = SessionShell::new(client, config, event_tx);
    (shell, event_rx)
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(ConversationId, SessionEvent)>,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
        .1
}

/// Wait for the next event matched by `pick`, failing on channel close.
async fn wait_for<T>(
    rx: &mut mpsc::UnboundedReceiver<(ConversationId, SessionEvent)>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    loop {
        if let Some(value) = pick(next_event(rx).await) {
            return value;
        }
    }
}

fn sse_body(records: &[&str]) -> String {
    records
        .iter()
        .map(|r| format!("data: {r}\n"))
        .collect::<String>()
}

#[tokio::test]
async fn test_query_builds_tool_and_answer_bubbles() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"event": "tool_start", "data": {"name": "rag"}}"#,
        r#"{"event": "tool_end", "data": {"name": "rag"}}"#,
        r#"{"event": "token", "data": {"chunk": "The PTO policy ", "new_message": false}}"#,
        r#"{"event": "token", "data": {"chunk": "allows 25 days.", "new_message": false}}"#,
        r#"{"event": "sources", "data": [{"display_name": "hr-handbook.pdf"}]}"#,
        r#"{"event": "end", "data": null}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/query-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    assert!(shell.command(ShellCommand::SendQuery("What is the PTO policy?".into())));

    // The user bubble appears before the stream opens.
    let messages = wait_for(&mut rx, |ev| match ev {
        SessionEvent::MessagesChanged(m) => Some(m),
        _ => None,
    })
    .await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);

    // Drain until the stream finishes, keeping the last timeline seen.
    let mut timeline = messages;
    loop {
        match next_event(&mut rx).await {
            SessionEvent::MessagesChanged(m) => timeline = m,
            SessionEvent::StreamFinished { cancelled } => {
                assert!(!cancelled);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(timeline.len(), 3);
    assert_eq!(timeline[0].role, Role::User);
    let tool = timeline[1].tool_call.as_ref().expect("tool bubble");
    assert_eq!(tool.name, "rag");
    assert_eq!(timeline[2].content, "The PTO policy allows 25 days.");
    assert_eq!(timeline[2].sources[0].display_name, "hr-handbook.pdf");

    shell.shutdown().await;
}

#[tokio::test]
async fn test_plain_answer_accumulates_tokens_and_sources() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        r#"{"event": "token", "data": {"chunk": "PTO", "new_message": false}}"#,
        r#"{"event": "token", "data": {"chunk": " policy", "new_message": false}}"#,
        r#"{"event": "token", "data": {"chunk": " is...", "new_message": false}}"#,
        r#"{"event": "sources", "data": [{"display_name": "hr.pdf"}]}"#,
        r#"{"event": "end", "data": null}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/query-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SendQuery("What is the PTO policy?".into()));

    let mut timeline = Vec::new();
    loop {
        match next_event(&mut rx).await {
            SessionEvent::MessagesChanged(m) => timeline = m,
            SessionEvent::StreamFinished { cancelled } => {
                assert!(!cancelled);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0].role, Role::User);
    assert_eq!(timeline[0].content, "What is the PTO policy?");
    assert_eq!(timeline[1].role, Role::Assistant);
    assert_eq!(timeline[1].content, "PTO policy is...");
    assert_eq!(timeline[1].sources.len(), 1);
    assert_eq!(timeline[1].sources[0].display_name, "hr.pdf");

    shell.shutdown().await;
}

#[tokio::test]
async fn test_second_query_cancels_first_stream_exactly_once() {
    let server = MockServer::start().await;
    // Mounted first so it wins for the second request, whose chat history
    // also carries the first question's text.
    Mock::given(method("POST"))
        .and(path("/chat/query-stream"))
        .and(body_string_contains("second question"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse_body(&[
                r#"{"event": "token", "data": {"chunk": "fast answer", "new_message": false}}"#,
                r#"{"event": "end", "data": null}"#,
            ]),
            "text/event-stream",
        ))
        .mount(&server)
        .await;
    // The first answer stalls long enough that the second query lands
    // while it is still open.
    Mock::given(method("POST"))
        .and(path("/chat/query-stream"))
        .and(body_string_contains("first question"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    sse_body(&[r#"{"event": "token", "data": {"chunk": "slow...", "new_message": false}}"#]),
                    "text/event-stream",
                )
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SendQuery("first question".into()));
    wait_for(&mut rx, |ev| matches!(ev, SessionEvent::StreamStarted).then_some(()))
        .await;
    shell.command(ShellCommand::SendQuery("second question".into()));

    // The first stream is observed as cancelled exactly once, then the
    // second runs to completion.
    let mut finishes = Vec::new();
    loop {
        match next_event(&mut rx).await {
            SessionEvent::StreamFinished { cancelled } => {
                finishes.push(cancelled);
                if !cancelled {
                    break;
                }
            }
            _ => {}
        }
    }
    assert_eq!(finishes, vec![true, false]);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_upload_rekeys_then_resolves_temporary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/attachments/upload"))
        .respond_with(ResponseTemplate::new(202).set_body_json(
            serde_json::json!({"task_id": "celery-77", "attachment_id": 31}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/status/celery-77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"status": "SUCCESS", "result": "12 chunks indexed"}),
        ))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SubmitAttachment {
        file_name: "handbook.pdf".into(),
        bytes: b"%PDF-1.4 fake".to_vec(),
    });

    let pick_attachments = |ev: SessionEvent| match ev {
        SessionEvent::AttachmentsChanged(a) => Some(a),
        _ => None,
    };

    // Optimistic entry under a placeholder id.
    let optimistic: Vec<Attachment> = wait_for(&mut rx, pick_attachments).await;
    assert_eq!(optimistic.len(), 1);
    assert_eq!(optimistic[0].status, AttachmentStatus::Indexing);
    assert_eq!(optimistic[0].attachment_id, 0);
    assert!(optimistic[0].task_id.starts_with("local-"));

    // Rekeyed to the server identity, still Indexing.
    let confirmed = wait_for(&mut rx, pick_attachments).await;
    assert_eq!(confirmed[0].task_id, "celery-77");
    assert_eq!(confirmed[0].attachment_id, 31);
    assert_eq!(confirmed[0].status, AttachmentStatus::Indexing);

    // The poller resolves it.
    let resolved = wait_for(&mut rx, pick_attachments).await;
    assert_eq!(resolved[0].status, AttachmentStatus::Temporary);

    shell.shutdown().await;
}

#[tokio::test]
async fn test_failed_upload_rolls_back_optimistic_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/attachments/upload"))
        .respond_with(ResponseTemplate::new(413).set_body_string("file too large"))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SubmitAttachment {
        file_name: "huge.bin".into(),
        bytes: vec![0u8; 64],
    });

    let pick_attachments = |ev: SessionEvent| match ev {
        SessionEvent::AttachmentsChanged(a) => Some(a),
        _ => None,
    };

    let optimistic = wait_for(&mut rx, pick_attachments).await;
    assert_eq!(optimistic.len(), 1);

    let rolled_back = wait_for(&mut rx, pick_attachments).await;
    assert!(rolled_back.is_empty());

    let notice = wait_for(&mut rx, |ev| match ev {
        SessionEvent::Notice(text) => Some(text),
        _ => None,
    })
    .await;
    assert!(notice.contains("upload failed"));

    shell.shutdown().await;
}

#[tokio::test]
async fn test_stuck_indexing_notifies_without_flipping_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/attachments/upload"))
        .respond_with(ResponseTemplate::new(202).set_body_json(
            serde_json::json!({"task_id": "celery-11", "attachment_id": 6}),
        ))
        .mount(&server)
        .await;
    // The job never leaves PENDING, so the poll deadline is what ends it.
    Mock::given(method("GET"))
        .and(path("/tasks/status/celery-11"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"status": "PENDING", "result": null}),
        ))
        .mount(&server)
        .await;

    let config = ShellConfig {
        top_k: 3,
        poll_interval: Duration::from_millis(25),
        poll_timeout: Duration::from_millis(60),
    };
    let (shell, mut rx) = spawn_shell_with(&server, config);
    shell.command(ShellCommand::SubmitAttachment {
        file_name: "minutes.docx".into(),
        bytes: vec![7, 7, 7],
    });

    // Every timeline published before the deadline still shows Indexing.
    let notice = loop {
        match next_event(&mut rx).await {
            SessionEvent::AttachmentsChanged(a) => {
                assert!(a.iter().all(|x| x.status == AttachmentStatus::Indexing));
            }
            SessionEvent::Notice(text) => break text,
            _ => {}
        }
    };
    assert!(notice.contains("taking too long"), "unexpected notice: {notice}");
    assert!(notice.contains("minutes.docx"));

    // The deadline does not rewrite the attachment either.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(rx.try_recv().is_err());

    shell.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_status_endpoint_surfaces_notice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/attachments/upload"))
        .respond_with(ResponseTemplate::new(202).set_body_json(
            serde_json::json!({"task_id": "celery-13", "attachment_id": 8}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/status/celery-13"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SubmitAttachment {
        file_name: "notes.md".into(),
        bytes: b"# notes".to_vec(),
    });

    let notice = loop {
        match next_event(&mut rx).await {
            SessionEvent::AttachmentsChanged(a) => {
                assert!(a.iter().all(|x| x.status == AttachmentStatus::Indexing));
            }
            SessionEvent::Notice(text) => break text,
            _ => {}
        }
    };
    assert!(notice.contains("lost track"), "unexpected notice: {notice}");
    assert!(notice.contains("notes.md"));

    // Polling stopped; nothing further changes the attachment.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(rx.try_recv().is_err());

    shell.shutdown().await;
}

#[tokio::test]
async fn test_switch_clears_state_and_loads_history() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/chat/history/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [
                {"role": "user", "content": "old question", "created_at": "2026-08-01T10:00:00Z"},
                {"role": "assistant", "content": "old answer", "created_at": "2026-08-01T10:00:05Z"}
            ]
        })))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SwitchConversation("sess-42".into()));

    wait_for(&mut rx, |ev| {
        matches!(ev, SessionEvent::ConversationSwitched).then_some(())
    })
    .await;

    let history = wait_for(&mut rx, |ev| match ev {
        SessionEvent::HistoryLoaded(m) => Some(m),
        _ => None,
    })
    .await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "old question");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "old answer");

    shell.shutdown().await;
}

#[tokio::test]
async fn test_failed_indexing_marks_attachment_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/attachments/upload"))
        .respond_with(ResponseTemplate::new(202).set_body_json(
            serde_json::json!({"task_id": "celery-9", "attachment_id": 4}),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/status/celery-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"status": "FAILURE", "result": {"message": "unsupported file type"}}),
        ))
        .mount(&server)
        .await;

    let (shell, mut rx) = spawn_shell(&server);
    shell.command(ShellCommand::SubmitAttachment {
        file_name: "archive.xyz".into(),
        bytes: vec![1, 2, 3],
    });

    let failed = wait_for(&mut rx, |ev| match ev {
        SessionEvent::AttachmentsChanged(a)
            if a.first().is_some_and(|x| x.status == AttachmentStatus::Failed) =>
        {
            Some(a)
        }
        _ => None,
    })
    .await;
    assert_eq!(failed[0].task_id, "celery-9");

    let notice = wait_for(&mut rx, |ev| match ev {
        SessionEvent::Notice(text) => Some(text),
        _ => None,
    })
    .await;
    assert!(notice.contains("unsupported file type"));

    shell.shutdown().await;
}
