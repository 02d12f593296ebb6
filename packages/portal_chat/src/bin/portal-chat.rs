use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::prelude::*;

use portal_chat::{
    ChatSnapshot, ClientDirs, CoordinatorConfig, FileConfig, HttpChatService, Message,
    SessionCoordinator, SessionId, WebSocketConnector, load_config,
};

#[derive(Parser)]
#[command(name = "portal-chat")]
#[command(about = "Chat with the portal assistant from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom config directory (defaults to ~/.portal-chat)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List chat sessions
    Sessions {
        /// Print the raw session list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new chat session
    New {
        /// Session title
        title: String,
    },

    /// End a chat session
    End {
        /// Session id
        id: SessionId,
    },

    /// Open a session and chat interactively (`/quit` to leave)
    Chat {
        /// Session id
        id: SessionId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is the transcript.
    let default_directive = if cli.debug {
        "portal_chat=debug,info"
    } else {
        "portal_chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let dirs = ClientDirs::new(cli.config_dir.clone())?;
    let file_config: FileConfig = load_config(&dirs.config_dir)
        .extract()
        .with_context(|| format!("invalid config in {}", dirs.config_toml_path().display()))?;

    let server = &file_config.server;
    let service = Arc::new(HttpChatService::new(
        server.base_url.clone(),
        server.api_token.clone(),
    )?);
    let connector = Arc::new(WebSocketConnector::new(
        server.realtime_base_url(),
        server.api_token.clone(),
    ));
    let chat = SessionCoordinator::spawn(
        service,
        connector,
        CoordinatorConfig::from_file(&file_config.connection),
    );

    let result = match cli.command {
        Commands::Sessions { json } => sessions_command(&chat, json).await,
        Commands::New { title } => new_command(&chat, &title).await,
        Commands::End { id } => end_command(&chat, id).await,
        Commands::Chat { id } => chat_command(&chat, id).await,
    };
    chat.shutdown().await?;
    result
}

/// Turn a failure left on the error slot into a command error.
fn check(snapshot: &ChatSnapshot) -> Result<()> {
    match &snapshot.error {
        Some(error) => bail!("{error}"),
        None => Ok(()),
    }
}

async fn sessions_command(chat: &SessionCoordinator, json: bool) -> Result<()> {
    let sessions = chat.list_sessions().await?;
    check(&chat.snapshot())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No chat sessions.");
        return Ok(());
    }
    for session in &sessions {
        let status = if session.is_active { "active" } else { "ended" };
        let preview = session.preview().unwrap_or("");
        println!(
            "{:>6}  {:<7} {:<32} {}",
            session.id,
            status,
            session.title,
            truncate(preview, 48)
        );
    }
    Ok(())
}

async fn new_command(chat: &SessionCoordinator, title: &str) -> Result<()> {
    let created = chat.create_session(title).await?;
    check(&chat.snapshot())?;
    if let Some(session) = created {
        println!("Created session {} ({})", session.id, session.title);
    }
    Ok(())
}

async fn end_command(chat: &SessionCoordinator, id: SessionId) -> Result<()> {
    chat.end_session(id).await?;
    check(&chat.snapshot())?;
    println!("Ended session {id}");
    Ok(())
}

async fn chat_command(chat: &SessionCoordinator, id: SessionId) -> Result<()> {
    let mut updates = chat.subscribe();
    chat.select_session(id).await?;
    let snapshot = chat.snapshot();
    check(&snapshot)?;

    if let Some(session) = &snapshot.current_session {
        println!("── {} ──", session.title);
    }
    for message in &snapshot.messages {
        print_message(message);
    }
    let mut printed = snapshot.messages.len();
    let mut connected = snapshot.is_connected;
    let mut typing = snapshot.is_typing;
    updates.mark_unchanged();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if !line.is_empty() {
                    chat.send_message(line).await?;
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                // A shorter transcript means the session was switched or ended.
                if snapshot.messages.len() < printed {
                    printed = 0;
                }
                for message in &snapshot.messages[printed..] {
                    print_message(message);
                }
                printed = snapshot.messages.len();

                if snapshot.is_connected != connected {
                    connected = snapshot.is_connected;
                    info!(connected, "chat connection changed");
                    eprintln!("[{}]", if connected { "connected" } else { "disconnected" });
                }
                if snapshot.is_typing != typing {
                    typing = snapshot.is_typing;
                    if typing {
                        eprintln!("[assistant is typing...]");
                    }
                }
                if let Some(error) = &snapshot.error {
                    eprintln!("error: {error}");
                    chat.clear_error()?;
                }
                if snapshot.current_session.is_none() {
                    eprintln!("[session ended]");
                    break;
                }
            }
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.message_type.as_str(),
        message.content
    );
}

fn truncate(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}…")
}
