use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{load_settings, load_settings_from, SyncRuntime};
use shared::domain::{ContentPart, ConversationId, Message};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Inspect and drive conversation sync state")]
struct Cli {
    /// Settings file; defaults to ./sync_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    /// Use `none` to run without durable storage.
    #[arg(long)]
    storage_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Continuation token and buffered sequences for one conversation.
    Status { conversation: String },
    /// Runs one reconciliation cycle against the server.
    Sync { conversation: String },
    /// Loads the next older history page.
    Older { conversation: String },
    /// Treats every missing sequence up to `through` as permanently lost.
    Skip { conversation: String, through: u64 },
    Clear { conversation: String },
    ClearAll,
    /// Deletes buffered events older than the retention window.
    Purge {
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

fn render(message: &Message) -> String {
    let body = message
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text.clone(),
            ContentPart::Attachment { filename, .. } => format!("[attachment {filename}]"),
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{:>6} {} {}: {body}",
        message.sequence, message.message_id, message.sender_id
    )
}

fn print_messages(messages: &[Message]) {
    for message in messages {
        println!("{}", render(message));
    }
    println!("{} message(s)", messages.len());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(storage_url) = cli.storage_url {
        settings.storage_url = match storage_url.trim() {
            "" | "none" => None,
            url => Some(client_core::config::normalize_database_url(url)),
        };
    }

    let runtime = SyncRuntime::from_settings(settings).await?;
    let outcome = run(&runtime, cli.command).await;
    runtime.shutdown().await?;
    outcome
}

async fn run(runtime: &SyncRuntime, command: Command) -> Result<()> {
    match command {
        Command::Status { conversation } => {
            runtime.open_store().await?;
            let status = runtime
                .status(&ConversationId::new(conversation))
                .await?;
            println!("conversation: {}", status.conversation_id);
            println!("store mode:   {:?}", status.mode);
            match status.token {
                Some(token) => println!("token:        {token}"),
                None => println!("token:        (none)"),
            }
            println!("buffered:     {:?}", status.pending);
        }
        Command::Sync { conversation } => {
            runtime.start().await?;
            let messages = runtime.sync(&ConversationId::new(conversation)).await?;
            print_messages(&messages);
        }
        Command::Older { conversation } => {
            runtime.start().await?;
            let conversation_id = ConversationId::new(conversation);
            runtime.sync(&conversation_id).await?;
            let messages = runtime.load_older(&conversation_id).await?;
            print_messages(&messages);
        }
        Command::Skip {
            conversation,
            through,
        } => {
            runtime.open_store().await?;
            let messages = runtime
                .pager()
                .skip_missing(&ConversationId::new(conversation), through)
                .await?;
            print_messages(&messages);
        }
        Command::Clear { conversation } => {
            runtime.open_store().await?;
            runtime
                .pager()
                .forget(&ConversationId::new(conversation.clone()))
                .await?;
            println!("cleared sync state for {conversation}");
        }
        Command::ClearAll => {
            runtime.open_store().await?;
            runtime.store().clear_all().await?;
            println!("cleared all sync state");
        }
        Command::Purge { max_age_secs } => {
            runtime.open_store().await?;
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| runtime.settings().orphan_retention());
            let purged = runtime.store().purge_stale_orphans(max_age).await?;
            info!(purged, "synctl: purge finished");
            println!("purged {purged} buffered event(s)");
        }
    }
    Ok(())
}
