mod config;
mod logging;
mod state;

use std::{error::Error, sync::Arc, time::Duration};

use chat_core::{
    ConversationCommand, MentionCandidate, MentionIndexer, MentionRange, Message, MessageKind,
    MessageStatus, OutgoingMessage, new_client_txn_id,
};
use chat_platform::InMemoryChatService;
use chat_runtime::{
    ConversationHandle, ConversationServices, PresenceBroadcaster, SessionContext,
    spawn_conversation_runtime,
};
use chrono::{TimeDelta, Utc};
use config::BanterConfig;
use state::ConsoleState;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SETTLE_WINDOW: Duration = Duration::from_millis(250);

type DemoResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match BanterConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("Demo conversation failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: BanterConfig) -> DemoResult {
    let service = InMemoryChatService::new();
    seed_demo_conversation(&service, &config)?;

    let handle = spawn_conversation_runtime(
        SessionContext::new(config.user_id.clone(), config.user_name.clone()),
        ConversationServices::from_shared(service.clone()),
        config.runtime_options(),
    );
    let mut driver = Driver {
        events: handle.subscribe(),
        handle,
        state: ConsoleState::new(config.user_id.clone()),
    };

    info!(conversation_id = %config.conversation_id, user_id = %config.user_id, "opening demo conversation");
    driver
        .step(
            "open",
            ConversationCommand::Open {
                conversation_id: config.conversation_id.clone(),
            },
        )
        .await?;

    let bob_presence = PresenceBroadcaster::new(
        Arc::new(service.clone()),
        Duration::from_millis(config.runtime.typing_expiry_ms),
    );
    bob_presence
        .start_typing(&config.conversation_id, "bob", "Bob")
        .await?;
    driver.settle("bob starts typing").await;

    bob_presence
        .stop_typing(&config.conversation_id, "bob")
        .await?;
    service.inject_remote_message(OutgoingMessage {
        client_txn_id: Uuid::new_v4().to_string(),
        conversation_id: config.conversation_id.clone(),
        sender_id: "bob".to_owned(),
        content: "Deploy is green, shipping after lunch".to_owned(),
        reply_to_id: None,
        mentions: Vec::new(),
        kind: MessageKind::Text,
    })?;
    driver.settle("bob posts").await;

    let (content, mentions) = compose_reply();
    let client_txn_id = new_client_txn_id();
    driver.state.mark_send_requested(client_txn_id.clone());
    driver
        .step(
            "send reply",
            ConversationCommand::Send {
                client_txn_id,
                content,
                reply_to_id: None,
                mentions,
                kind: MessageKind::Text,
            },
        )
        .await?;

    if let Some(message_id) = driver.state.newest_message_id().map(str::to_owned) {
        driver
            .step("mark read", ConversationCommand::MarkRead { message_id })
            .await?;
    }

    driver
        .step(
            "load older",
            ConversationCommand::LoadOlder {
                limit: config.runtime.open_limit,
            },
        )
        .await?;

    driver.step("close", ConversationCommand::Close).await?;
    info!("demo conversation finished");
    Ok(())
}

struct Driver {
    handle: ConversationHandle,
    events: chat_core::EventStream,
    state: ConsoleState,
}

impl Driver {
    async fn step(&mut self, label: &str, command: ConversationCommand) -> DemoResult {
        debug!(step = label, "sending command");
        self.handle.send(command).await?;
        self.settle(label).await;
        Ok(())
    }

    /// Apply events until the runtime has been quiet for a short window,
    /// then print the view.
    async fn settle(&mut self, label: &str) {
        loop {
            match tokio::time::timeout(SETTLE_WINDOW, self.events.recv()).await {
                Ok(Ok(event)) => self.state.handle_event(event),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "console fell behind runtime events");
                }
                Ok(Err(RecvError::Closed)) | Err(_) => break,
            }
        }
        print_snapshot(label, &self.state);
    }
}

fn print_snapshot(label: &str, state: &ConsoleState) {
    let snapshot = state.snapshot();
    println!();
    println!(
        "== {label} | {} | unread {}{}",
        snapshot.status_text,
        snapshot.unread_count,
        if snapshot.has_unread_mention {
            " | mentioned"
        } else {
            ""
        }
    );
    // Rows arrive newest first; print oldest at the top.
    for row in snapshot.rows.iter().rev() {
        println!("{}", row.render_line());
    }
    if let Some(typing) = snapshot.typing_text {
        println!("  {typing}");
    }
    if snapshot.pending_send_count > 0 {
        println!("  ({} sends in flight)", snapshot.pending_send_count);
    }
    if let Some(error) = snapshot.error_text {
        println!("  ! {error}");
    }
}

fn compose_reply() -> (String, Vec<MentionRange>) {
    let mut indexer = MentionIndexer::new();
    let bob = MentionCandidate::new("bob", "@Bob");

    let text = indexer.insert_mention("thanks @b", &bob);
    let text = format!("{text}for the heads up");
    let mentions = indexer.extract_ranges(&text);
    (text, mentions)
}

fn seed_demo_conversation(service: &InMemoryChatService, config: &BanterConfig) -> DemoResult {
    service.create_conversation(
        &config.conversation_id,
        [config.user_id.as_str(), "bob", "carol"],
    )?;

    let now = Utc::now();
    let history = [
        ("carol", "Morning all", TimeDelta::hours(27)),
        (config.user_id.as_str(), "Morning!", TimeDelta::hours(26)),
        ("bob", "Release notes are in the doc", TimeDelta::hours(3)),
        ("carol", "Looks good to me", TimeDelta::minutes(90)),
    ];
    for (sender, content, age) in history {
        service.seed_message(Message {
            id: format!("msg-{}", Uuid::new_v4()),
            conversation_id: config.conversation_id.clone(),
            sender_id: sender.to_owned(),
            content: content.to_owned(),
            created_at: now - age,
            updated_at: None,
            reply_to_id: None,
            mentions: Vec::new(),
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
        })?;
    }

    let display = format!("@{}", config.user_name);
    let content = format!("{display} can you double check the changelog?");
    service.seed_message(Message {
        id: format!("msg-{}", Uuid::new_v4()),
        conversation_id: config.conversation_id.clone(),
        sender_id: "carol".to_owned(),
        mentions: vec![MentionRange {
            user_id: config.user_id.clone(),
            end: display.len(),
            display,
            start: 0,
        }],
        content,
        created_at: now - TimeDelta::minutes(45),
        updated_at: None,
        reply_to_id: None,
        kind: MessageKind::Text,
        status: MessageStatus::Sent,
    })?;

    Ok(())
}
