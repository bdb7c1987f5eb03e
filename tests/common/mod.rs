// Common test utilities for integration tests
// Builds an in-memory backend with one or two conversations and wraps the
// view channel with timeout-guarded waits.

use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, LevelFilter};
use tokio::sync::watch;
use tokio::time::timeout;

use chatdesk::backend::MemoryBackend;
use chatdesk::{
    Contact, Conversation, ConversationStatus, ConversationSync, ConversationView, Direction, MessageRecord,
    MessageStatus, SenderKind, SyncConfig,
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

pub const AGENT_ID: &str = "agent-1";

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        correlation_window: Duration::from_secs(10),
        pending_timeout: Duration::from_secs(30),
        queue_capacity: 100,
    }
}

pub fn conversation(id: &str) -> (Conversation, Contact) {
    let contact_id = format!("contact-{}", id);
    (
        Conversation {
            id: id.to_string(),
            contact_id: contact_id.clone(),
            status: ConversationStatus::Open,
            assigned_to: Some(AGENT_ID.to_string()),
            unread_count: 0,
            message_count: 0,
            last_message_at: None,
        },
        Contact {
            id: contact_id,
            name: Some(format!("Customer {}", id)),
            phone_number: "+15550100".to_string(),
            whatsapp_id: None,
        },
    )
}

/// Text row `secs_ago` seconds in the past.
pub fn text_record(id: &str, conversation_id: &str, text: &str, direction: Direction, secs_ago: i64) -> MessageRecord {
    let sender_type = match direction {
        Direction::Inbound => SenderKind::Contact,
        Direction::Outbound => SenderKind::Agent,
    };
    MessageRecord {
        id: Some(id.to_string()),
        conversation_id: conversation_id.to_string(),
        direction,
        sender_type,
        sender_id: None,
        message_type: "text".to_string(),
        content: Some(text.to_string()),
        media_url: None,
        media_caption: None,
        status: MessageStatus::Delivered,
        whatsapp_message_id: None,
        error_message: None,
        created_at: Some(ago(secs_ago)),
        sent_at: None,
        delivered_at: None,
        read_at: None,
        failed_at: None,
    }
}

pub fn ago(secs: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::seconds(secs)
}

/// Backend with conversations `c1` (two messages) and `c2` (one message).
pub fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    let (c1, k1) = conversation("c1");
    let (c2, k2) = conversation("c2");
    backend.add_conversation(c1, k1);
    backend.add_conversation(c2, k2);
    backend.seed_message(text_record("m1", "c1", "Hi, is my order shipped?", Direction::Inbound, 120));
    backend.seed_message(text_record("m2", "c1", "Let me check", Direction::Outbound, 60));
    backend.seed_message(text_record("m3", "c2", "Hello from c2", Direction::Inbound, 30));
    backend
}

pub fn spawn_sync(backend: &MemoryBackend, config: SyncConfig) -> ConversationSync {
    ConversationSync::spawn(backend.backend(Some(AGENT_ID)), config)
}

/// Wait until the view satisfies `predicate`, returning that view.
pub async fn wait_for_view(
    view: &mut watch::Receiver<ConversationView>,
    predicate: impl Fn(&ConversationView) -> bool,
    timeout_secs: u64,
) -> Result<ConversationView> {
    let waited = timeout(Duration::from_secs(timeout_secs), async {
        loop {
            {
                let current = view.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            if view.changed().await.is_err() {
                return Err(anyhow::anyhow!("View channel closed"));
            }
        }
    })
    .await;
    match waited {
        Ok(result) => result,
        Err(_) => {
            info!("Last view before timeout: {:?}", view.borrow());
            Err(anyhow::anyhow!("Timed out waiting for view"))
        }
    }
}

/// Select `conversation_id` and wait until it is loaded and live.
pub async fn select_and_wait(sync: &ConversationSync, conversation_id: &str) -> Result<ConversationView> {
    let mut view = sync.watch();
    sync.select(conversation_id).await?;
    wait_for_view(
        &mut view,
        |v| v.conversation_id.as_deref() == Some(conversation_id) && !v.loading && v.live,
        5,
    )
    .await
}

/// Poll `condition` until it holds or `timeout_secs` passes.
pub async fn eventually(condition: impl Fn() -> bool, timeout_secs: u64) -> bool {
    timeout(Duration::from_secs(timeout_secs), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
