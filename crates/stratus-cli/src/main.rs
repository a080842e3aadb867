//! Demo driver for the sync core against the in-memory backend.
//!
//! Each subcommand runs a scripted scenario as user `alice` and prints the
//! core events it produces, so the reconciliation and unread behavior can be
//! inspected without a real server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stratus_core::backend::NewMessage;
use stratus_core::models::now_ms;
use stratus_core::{
    Backend, ConversationRef, CoreConfig, CoreEvent, CoreRuntime, MemoryBackend, ProfileSummary,
};

#[derive(Parser)]
#[command(name = "stratus-cli")]
#[command(about = "Scripted scenarios against the stratus sync core")]
struct Cli {
    /// Print message snapshots as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimistic send: provisional echo, push confirmation, final id
    Send {
        /// Message body
        #[arg(default_value = "Hello from stratus")]
        content: String,
    },

    /// Incoming direct message: unread badge rises, opening clears it
    Unread,

    /// Group membership change wiring a new subscription live
    Groups,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_core=info,stratus_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_profile(
        "alice",
        ProfileSummary {
            display_name: "Alice".to_string(),
            avatar_url: None,
            sector_id: Some("hq".to_string()),
        },
    );
    backend.set_profile(
        "bob",
        ProfileSummary {
            display_name: "Bob".to_string(),
            avatar_url: None,
            sector_id: Some("hq".to_string()),
        },
    );

    let runtime =
        CoreRuntime::start(backend.clone(), "alice".to_string(), CoreConfig::default()).await?;
    let events = runtime.events();
    let printer = tokio::spawn(print_events(events));

    match cli.command {
        Commands::Send { content } => scenario_send(&runtime, &content, cli.json).await?,
        Commands::Unread => scenario_unread(&backend, &runtime).await?,
        Commands::Groups => scenario_groups(&backend, &runtime).await?,
    }

    // Let trailing push deliveries drain before teardown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    runtime.shutdown();
    printer.abort();
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<CoreEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            CoreEvent::MessagesChanged(conversation) => {
                println!("event: messages changed in {conversation}");
            }
            CoreEvent::CountsChanged(summary) => {
                println!(
                    "event: unread direct={} group={} external={} total={}",
                    summary.direct, summary.group, summary.external, summary.total
                );
            }
            CoreEvent::SubscriptionState { surface, state } => {
                println!("event: subscription {surface} -> {state}");
            }
        }
    }
}

async fn scenario_send(runtime: &CoreRuntime, content: &str, json: bool) -> Result<()> {
    let conv = ConversationRef::direct("bob");
    runtime.open_conversation(conv.clone()).await?;

    let receipt = runtime.send(conv.clone(), content).await?;
    println!("acknowledged as {} at {}", receipt.id, receipt.created_at);

    // The push echo lands asynchronously and replaces the provisional id.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for message in runtime.messages(&conv) {
        if json {
            println!("{}", serde_json::to_string(&message)?);
        } else {
            println!(
                "[{}] {}: {} (pending: {})",
                message.id,
                message.display_name(),
                message.content,
                message.pending
            );
        }
    }
    Ok(())
}

async fn scenario_unread(backend: &MemoryBackend, runtime: &CoreRuntime) -> Result<()> {
    backend
        .insert_message(NewMessage {
            conversation: ConversationRef::direct("alice"),
            sender_id: "bob".to_string(),
            content: "lunch?".to_string(),
            created_at: now_ms(),
            client_tag: "cli-demo-1".to_string(),
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("before open: {:?}", runtime.unread_summary());

    runtime
        .open_conversation(ConversationRef::direct("bob"))
        .await?;
    println!("after open:  {:?}", runtime.unread_summary());
    Ok(())
}

async fn scenario_groups(backend: &MemoryBackend, runtime: &CoreRuntime) -> Result<()> {
    backend
        .insert_message(NewMessage {
            conversation: ConversationRef::group("eng"),
            sender_id: "bob".to_string(),
            content: "standup in 5".to_string(),
            created_at: now_ms(),
            client_tag: "cli-demo-2".to_string(),
        })
        .await?;

    // Joining the group primes its count and brings the subscription up.
    backend.set_groups("alice", vec!["eng".to_string()]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("after join: {:?}", runtime.unread_summary());

    backend
        .insert_message(NewMessage {
            conversation: ConversationRef::group("eng"),
            sender_id: "bob".to_string(),
            content: "now".to_string(),
            created_at: now_ms(),
            client_tag: "cli-demo-3".to_string(),
        })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("after push: {:?}", runtime.unread_summary());
    Ok(())
}
