//! Command implementations.

use anyhow::Context;
use chat_config_and_utils::{Config, Paths};
use chat_realtime_sync::{
    ChangeFilter, Collaborators, ConversationKey, DeliveryState, FileHistoryStore, MessageEvent,
    SubscriptionDescriptor, SubscriptionManager, SyncConfig, SyncStatus, TranscriptChange,
    UnreadSink,
};
use realtime_phoenix_transport::{PhoenixConfig, PhoenixConnector};
use std::sync::Arc;
use supabase_rest_client::SupabaseClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

pub struct WatchOptions {
    pub user: String,
    pub counterpart: String,
    pub assistant: bool,
    pub access_token: Option<String>,
}

/// Reports unread counters for conversations other than the open one.
struct ConsoleUnread;

impl UnreadSink for ConsoleUnread {
    fn on_unread_count_changed(&self, counterpart_id: &str, count: u32) {
        if count > 0 {
            eprintln!("· {count} unread from {counterpart_id}");
        }
    }
}

fn print_event(event: &MessageEvent) {
    let message = &event.message;
    let time = message.created_at.format("%H:%M:%S");
    match event.change {
        TranscriptChange::Inserted { .. } => {
            println!("[{time}] {}: {}", message.sender_id, message.content);
        }
        TranscriptChange::Pending { .. } => {
            println!("[{time}] {} (sending): {}", message.sender_id, message.content);
        }
        TranscriptChange::Confirmed { .. } => {
            println!("[{time}] ✓ delivered: {}", message.content);
        }
        TranscriptChange::Failed { .. } => {
            println!("[{time}] ✗ not sent: {}", message.content);
        }
        TranscriptChange::ReadStateChanged { .. } => {}
    }
}

fn status_line(status: &SyncStatus) -> String {
    let mut line = format!("· {:?}", status.state).to_lowercase();
    if status.retry_count > 0 {
        line.push_str(&format!(", retry {}", status.retry_count));
    }
    if status.polling {
        line.push_str(&format!(", polling every {}ms", status.poll_interval.as_millis()));
    }
    if status.consecutive_poll_failures > 0 {
        line.push_str(&format!(", {} failed polls", status.consecutive_poll_failures));
    }
    line
}

/// Follow one conversation until stdin closes or Ctrl-C.
pub async fn run_watch(config: Config, paths: Paths, options: WatchOptions) -> anyhow::Result<()> {
    paths.ensure_dirs()?;

    let conversation = if options.assistant {
        ConversationKey::with_assistant(&options.user, &options.counterpart)
    } else {
        ConversationKey::new(&options.user, &options.counterpart)
    };

    let mut rest = SupabaseClient::from_config(&config).context("Supabase is not configured")?;
    let mut phoenix = PhoenixConfig::from_config(&config);
    if let Some(token) = options.access_token {
        rest = rest.with_access_token(token.clone());
        phoenix.access_token = Some(token);
    }
    let rest = Arc::new(rest);

    let collaborators = Collaborators::new(
        rest.clone(),
        Arc::new(PhoenixConnector::new(phoenix)),
        rest.clone(),
    )
    .with_history(Arc::new(FileHistoryStore::new(paths.history_dir())))
    .with_unread_sink(Arc::new(ConsoleUnread))
    .with_read_receipts(rest);

    let sync_config = SyncConfig::from_config(&config);
    info!(
        conversation = %conversation,
        push_enabled = sync_config.push_enabled,
        "Starting watch"
    );
    let manager = SubscriptionManager::new(options.user.clone(), sync_config, collaborators);

    let mut status = manager.watch_state();
    let status_printer = tokio::spawn(async move {
        eprintln!("{}", status_line(&status.borrow_and_update()));
        while status.changed().await.is_ok() {
            eprintln!("{}", status_line(&status.borrow_and_update()));
        }
    });

    // Inbound messages for the local user, whoever sends them, drive the
    // unread counters of other conversations.
    let inbox = SubscriptionDescriptor::new(
        format!("inbox-{}", options.user),
        conversation.clone(),
        ChangeFilter::Receiver(options.user.clone()),
        |_event: &MessageEvent| {},
    );
    manager.subscribe(inbox).await;
    manager
        .open_conversation(SubscriptionDescriptor::for_conversation(
            conversation.clone(),
            print_event,
        ))
        .await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let content = line.trim();
                if content.is_empty() {
                    continue;
                }
                match manager.send_message(&conversation, content).await {
                    Ok(receipt) if receipt.delivery == DeliveryState::Failed => {
                        warn!(local_id = %receipt.local_id, "Message not sent");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Cannot send message"),
                }
            }
        }
    }

    manager.cleanup().await;
    status_printer.abort();
    Ok(())
}

/// Print the effective configuration with the anon key masked.
pub fn print_config(config: &Config, paths: &Paths) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if !shown.supabase_anon_key.is_empty() {
        shown.supabase_anon_key = "<set>".into();
    }
    println!("config file: {}", paths.config_file().display());
    println!("history dir: {}", paths.history_dir().display());
    println!("{}", serde_json::to_string_pretty(&shown)?);
    println!(
        "push transport: {}",
        if SyncConfig::from_config(config).push_enabled {
            "enabled"
        } else {
            "disabled (polling only)"
        }
    );
    Ok(())
}
