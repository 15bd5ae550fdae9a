use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use config::Settings;
use mneme_client::{ApiClient, Role};
use mneme_core::{
    GovernanceClient, GovernanceEvent, SessionEvent, SessionShell, ShellCommand, ShellConfig,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend base URL; overrides the one in settings.toml
    #[arg(long, env = "MNEME_BASE_URL")]
    base_url: Option<String>,

    /// Username for login when no token is stored
    #[arg(long, env = "MNEME_USERNAME")]
    username: Option<String>,

    /// Retrieval depth per query; overrides settings.toml
    #[arg(long)]
    top_k: Option<u32>,

    #[arg(long, short)]
    tracing: bool,
}

fn setup_tracing(enable: bool) {
    if enable {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::TRACE)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Setting default subscriber failed");
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::ERROR)
            .with_writer(|| std::io::sink())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Setting default subscriber failed");
    }
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Log in and persist the sealed token for next time.
async fn login(base_url: &str, username: Option<String>, settings: &mut Settings) -> anyhow::Result<String> {
    let username = match username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };
    let password = prompt("Password: ")?;

    let client = ApiClient::new(base_url);
    let token = client.login(&username, &password).await?;

    if let Err(err) = settings.set_api_token(&token.access_token) {
        eprintln!("Warning: could not store token: {err}");
    } else if let Err(err) = settings.save() {
        eprintln!("Warning: could not save settings: {err}");
    }

    Ok(token.access_token)
}

// Slash command parsing
mod commands {
    pub enum Command {
        Quit,
        Help,
        New,
        Switch(String),
        Sessions,
        Attach(String),
        Repo(String),
        Promote {
            attachment_id: i64,
            kb_doc_id: String,
            note: String,
        },
        Pending,
        Approve {
            attachment_id: i64,
            kb_doc_id: String,
            groups: Vec<String>,
        },
        Reject(i64),
        Docs,
        DocRemove(String),
        ScheduleList,
        ScheduleAdd {
            name: String,
            cron: String,
            query: String,
        },
        ScheduleRemove(i64),
        Notifications,
    }

    impl Command {
        pub fn parse(input: &str) -> Result<Self, String> {
            let parts: Vec<&str> = input[1..].split_whitespace().collect();
            if parts.is_empty() {
                return Err("Empty command".to_string());
            }

            match parts[0] {
                "quit" | "exit" => Ok(Command::Quit),
                "help" => Ok(Command::Help),
                "new" => Ok(Command::New),
                "switch" => match parts.get(1) {
                    Some(id) => Ok(Command::Switch(id.to_string())),
                    None => Err("Usage: /switch <session-id>".to_string()),
                },
                "sessions" => Ok(Command::Sessions),
                "attach" => match parts.get(1) {
                    Some(path) => Ok(Command::Attach(path.to_string())),
                    None => Err("Usage: /attach <file-path>".to_string()),
                },
                "repo" => match parts.get(1) {
                    Some(url) => Ok(Command::Repo(url.to_string())),
                    None => Err("Usage: /repo <github-url>".to_string()),
                },
                "promote" => {
                    if parts.len() < 3 {
                        return Err("Usage: /promote <attachment-id> <kb-doc-id> [note...]".to_string());
                    }
                    let attachment_id = parts[1]
                        .parse()
                        .map_err(|_| format!("Not an attachment id: {}", parts[1]))?;
                    Ok(Command::Promote {
                        attachment_id,
                        kb_doc_id: parts[2].to_string(),
                        note: parts[3..].join(" "),
                    })
                }
                "pending" => Ok(Command::Pending),
                "approve" => {
                    if parts.len() < 3 {
                        return Err(
                            "Usage: /approve <attachment-id> <kb-doc-id> [group...]".to_string()
                        );
                    }
                    let attachment_id = parts[1]
                        .parse()
                        .map_err(|_| format!("Not an attachment id: {}", parts[1]))?;
                    Ok(Command::Approve {
                        attachment_id,
                        kb_doc_id: parts[2].to_string(),
                        groups: parts[3..].iter().map(|s| s.to_string()).collect(),
                    })
                }
                "reject" => match parts.get(1).and_then(|s| s.parse().ok()) {
                    Some(id) => Ok(Command::Reject(id)),
                    None => Err("Usage: /reject <attachment-id>".to_string()),
                },
                "docs" => match parts.get(1) {
                    None | Some(&"list") => Ok(Command::Docs),
                    Some(&"rm") => match parts.get(2) {
                        Some(id) => Ok(Command::DocRemove(id.to_string())),
                        None => Err("Usage: /docs rm <doc-id-or-prefix>".to_string()),
                    },
                    Some(other) => Err(format!("Unknown subcommand: /docs {other}")),
                },
                "schedule" => match parts.get(1) {
                    Some(&"list") | None => Ok(Command::ScheduleList),
                    Some(&"add") => {
                        if parts.len() < 9 {
                            return Err(
                                "Usage: /schedule add <name> <m> <h> <dom> <mon> <dow> <query...>"
                                    .to_string(),
                            );
                        }
                        Ok(Command::ScheduleAdd {
                            name: parts[2].to_string(),
                            cron: parts[3..8].join(" "),
                            query: parts[8..].join(" "),
                        })
                    }
                    Some(&"rm") => match parts.get(2).and_then(|s| s.parse().ok()) {
                        Some(id) => Ok(Command::ScheduleRemove(id)),
                        None => Err("Usage: /schedule rm <task-id>".to_string()),
                    },
                    Some(other) => Err(format!("Unknown subcommand: /schedule {other}")),
                },
                "notifications" => Ok(Command::Notifications),
                _ => Err(format!(
                    "Unknown command: /{}. Type /help for available commands.",
                    parts[0]
                )),
            }
        }
    }

    pub fn print_help() {
        println!("Available commands:");
        println!("  /new                              - Start a fresh conversation");
        println!("  /switch <session-id>              - Load another conversation");
        println!("  /sessions                         - List saved conversations");
        println!("  /attach <file-path>               - Upload a file into this session");
        println!("  /repo <github-url>                - Index a GitHub repository");
        println!("  /promote <id> <kb-doc-id> [note]  - Ask for knowledge-base promotion");
        println!("  /pending                          - List promotions awaiting review (admin)");
        println!("  /approve <id> <kb-doc-id> [group] - Approve a promotion (admin)");
        println!("  /reject <id>                      - Reject a promotion (admin)");
        println!("  /docs [list|rm <doc-id>]          - List or delete knowledge-base sources");
        println!("  /schedule list|add|rm             - Manage recurring queries");
        println!("  /notifications                    - Show unread notifications");
        println!("  /quit, /exit, Ctrl+D              - Exit");
        println!("  Anything else is sent as a query.");
    }
}

/// Tracks which assistant bubble is on screen and how much of it has been
/// printed, keyed by message id so a fresh bubble always restarts the
/// offset even when its content happens to match the old length.
struct StreamPrinter {
    message_id: Option<String>,
    printed: usize,
    tool_shown: Option<String>,
}

impl StreamPrinter {
    fn new() -> Self {
        Self {
            message_id: None,
            printed: 0,
            tool_shown: None,
        }
    }

    fn reset(&mut self) {
        self.message_id = None;
        self.printed = 0;
        self.tool_shown = None;
    }

    /// Text to emit for the latest timeline, if the last bubble grew.
    fn take_output(&mut self, messages: &[mneme_core::Message]) -> Option<String> {
        let last = messages.last()?;
        if last.role != Role::Assistant {
            return None;
        }
        if self.message_id.as_deref() != Some(last.id.as_str()) {
            self.message_id = Some(last.id.clone());
            self.printed = 0;
            self.tool_shown = None;
        }
        if let Some(tool) = &last.tool_call {
            if self.tool_shown.as_deref() == Some(tool.name.as_str()) {
                return None;
            }
            self.tool_shown = Some(tool.name.clone());
            return Some(format!("[tool: {}]\n", tool.name));
        }
        if self.printed >= last.content.len() {
            return None;
        }
        let suffix = last.content[self.printed..].to_string();
        self.printed = last.content.len();
        Some(suffix)
    }
}

/// Prints shell events as they arrive. Token updates print as a growing
/// line instead of re-printing the whole timeline.
async fn print_session_events(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<(String, SessionEvent)>,
) {
    let mut printer = StreamPrinter::new();
    while let Some((_, event)) = rx.recv().await {
        match event {
            SessionEvent::ConversationSwitched => {
                printer.reset();
                println!("--- switched conversation ---");
            }
            SessionEvent::HistoryLoaded(messages) => {
                for message in &messages {
                    let who = match message.role {
                        Role::User => "you",
                        Role::Assistant => "assistant",
                    };
                    println!("{who}: {}", message.content);
                }
                printer.reset();
            }
            SessionEvent::StreamStarted => {
                printer.reset();
            }
            SessionEvent::MessagesChanged(messages) => {
                if let Some(text) = printer.take_output(&messages) {
                    print!("{text}");
                    let _ = io::stdout().flush();
                }
            }
            SessionEvent::StreamFinished { cancelled } => {
                if cancelled {
                    println!("\n[answer interrupted]");
                } else {
                    println!();
                }
                printer.reset();
            }
            SessionEvent::AttachmentsChanged(attachments) => {
                for attachment in &attachments {
                    println!("[attachment {} -> {:?}]", attachment.file_name, attachment.status);
                }
            }
            SessionEvent::Notice(text) => println!("[{text}]"),
        }
    }
}

async fn print_governance_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<GovernanceEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            GovernanceEvent::PendingListed(pending) => {
                if pending.is_empty() {
                    println!("No attachments awaiting review.");
                }
                for entry in pending {
                    let suggestion = entry
                        .pending_review_metadata
                        .map(|m| m.suggested_kb_doc_id)
                        .unwrap_or_default();
                    println!(
                        "  #{} {} (session {}) -> {}",
                        entry.attachment_id, entry.file_name, entry.session_id, suggestion
                    );
                }
            }
            GovernanceEvent::ApprovalSubmitted { attachment_id, .. } => {
                println!("[approval of #{attachment_id} submitted, copying...]");
            }
            GovernanceEvent::PromotionApproved { attachment_id } => {
                println!("[#{attachment_id} is now in the knowledge base]");
            }
            GovernanceEvent::ApprovalJobFailed {
                attachment_id,
                message,
            } => {
                println!("[approval of #{attachment_id} failed: {message}]");
            }
            GovernanceEvent::ApprovalJobTimedOut { attachment_id } => {
                println!("[approval of #{attachment_id} is taking too long; check back later]");
            }
            GovernanceEvent::PromotionRejected { attachment_id } => {
                println!("[#{attachment_id} rejected]");
            }
        }
    }
}

async fn run_command(
    command: commands::Command,
    shell: &SessionShell,
    client: &Arc<ApiClient>,
    governance: &GovernanceClient,
) -> anyhow::Result<bool> {
    use commands::Command;
    match command {
        Command::Quit => return Ok(true),
        Command::Help => commands::print_help(),
        Command::New => {
            shell.command(ShellCommand::NewConversation);
        }
        Command::Switch(id) => {
            shell.command(ShellCommand::SwitchConversation(id));
        }
        Command::Sessions => {
            for session in client.chat_sessions().await? {
                println!("  {}  {}  ({})", session.session_id, session.title, session.last_updated);
            }
        }
        Command::Attach(path) => {
            let file_name = std::path::Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            let bytes = std::fs::read(&path)?;
            shell.command(ShellCommand::SubmitAttachment { file_name, bytes });
        }
        Command::Repo(url) => {
            shell.command(ShellCommand::SubmitRepo { url });
        }
        Command::Promote {
            attachment_id,
            kb_doc_id,
            note,
        } => {
            shell.command(ShellCommand::RequestPromotion {
                attachment_id,
                suggested_kb_doc_id: kb_doc_id,
                note_to_admin: note,
            });
        }
        Command::Pending => {
            governance.list_pending().await?;
        }
        Command::Approve {
            attachment_id,
            kb_doc_id,
            groups,
        } => {
            governance.approve(attachment_id, kb_doc_id, groups).await?;
        }
        Command::Reject(id) => {
            governance.reject(id).await?;
        }
        Command::Docs => {
            for (doc_id, display_name) in client.kb_documents().await? {
                println!("  {doc_id}  {display_name}");
            }
        }
        Command::DocRemove(doc_id) => {
            client.delete_kb_document(&doc_id).await?;
            println!("Removed {doc_id}");
        }
        Command::ScheduleList => {
            for task in client.scheduled_tasks().await? {
                println!(
                    "  #{} {} [{}] active={}",
                    task.task_id, task.task_name, task.schedule, task.is_active
                );
            }
        }
        Command::ScheduleAdd { name, cron, query } => {
            let task = client
                .create_scheduled_task(&mneme_client::TaskCreate {
                    task_name: name,
                    schedule: cron,
                    task_kwargs: serde_json::json!({ "query": query }),
                })
                .await?;
            println!("Scheduled as #{}", task.task_id);
        }
        Command::ScheduleRemove(id) => {
            client.delete_scheduled_task(id).await?;
            println!("Removed #{id}");
        }
        Command::Notifications => {
            let notifications = client.notifications().await?;
            if notifications.is_empty() {
                println!("No unread notifications.");
            }
            for notification in notifications {
                println!("  [{}] {}", notification.created_at, notification.message);
                if let Err(err) = client.mark_notification_read(notification.notification_id).await
                {
                    tracing::warn!(error = %err, "could not mark notification read");
                }
            }
        }
    }
    Ok(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(args.tracing);

    let mut settings = Settings::load();
    let base_url = args
        .base_url
        .clone()
        .or_else(|| settings.base_url.clone())
        .unwrap_or_else(|| "http://localhost:8000".to_string());

    let token = match settings.get_api_token() {
        Some(token) => token,
        None => login(&base_url, args.username.clone(), &mut settings).await?,
    };

    let client = Arc::new(ApiClient::new(&base_url).with_token(token));

    let shell_config = ShellConfig {
        top_k: args.top_k.unwrap_or(settings.top_k),
        poll_interval: Duration::from_secs(settings.poll_interval_secs),
        poll_timeout: Duration::from_secs(settings.poll_timeout_secs),
    };

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let shell = SessionShell::new(client.clone(), shell_config, event_tx);
    tokio::spawn(print_session_events(event_rx));

    let (gov_tx, gov_rx) = tokio::sync::mpsc::unbounded_channel();
    let governance = GovernanceClient::new(
        client.clone(),
        gov_tx,
        Duration::from_secs(settings.poll_interval_secs),
        Duration::from_secs(settings.poll_timeout_secs),
    );
    tokio::spawn(print_governance_events(gov_rx));

    println!();
    println!("Connected to {base_url}. Type /help for commands, Ctrl+D or /quit to exit.");
    println!();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
            None => {
                println!();
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match commands::Command::parse(input) {
                Ok(command) => {
                    match run_command(command, &shell, &client, &governance).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => eprintln!("Error: {err}"),
                    }
                }
                Err(err) => println!("{err}"),
            }
            continue;
        }

        shell.command(ShellCommand::SendQuery(input.to_string()));
    }

    shell.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
