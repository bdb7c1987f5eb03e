// Backend collaborators for the sync core
// The hosted platform is reached only through the traits below; the
// concrete adapters live in the submodules.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SyncError, SyncResult};
use crate::models::{Contact, Conversation, MessageContent, MessagePatch, MessageRecord};
use crate::settings::Settings;

pub mod memory;
pub mod realtime;
pub mod rest;

pub use memory::MemoryBackend;
pub use realtime::RealtimeFeed;
pub use rest::RestClient;

/// Persistent store query interface.
///
/// Access scoping (per organization) is enforced by the backend.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Messages of a conversation, oldest first
    async fn fetch_messages(&self, conversation_id: &str) -> SyncResult<Vec<MessageRecord>>;
    async fn fetch_conversation(&self, conversation_id: &str) -> SyncResult<Conversation>;
    async fn fetch_contact(&self, contact_id: &str) -> SyncResult<Contact>;
    /// Returns the row as persisted, including the id it was stored under
    async fn insert_message(&self, record: &MessageRecord) -> SyncResult<MessageRecord>;
    async fn update_message(&self, id: &str, patch: &MessagePatch) -> SyncResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One row change pushed by the live feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub record: MessageRecord,
}

impl Change {
    pub fn insert(record: MessageRecord) -> Self {
        Change {
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(record: MessageRecord) -> Self {
        Change {
            kind: ChangeKind::Update,
            record,
        }
    }
}

/// Live subscription to the changes of one conversation.
///
/// Dropping it (or calling [`Subscription::close`]) unsubscribes; the
/// producer side sees its cancel channel resolve and stops.
pub struct Subscription {
    conversation_id: String,
    changes: mpsc::Receiver<Change>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(conversation_id: impl Into<String>, changes: mpsc::Receiver<Change>, cancel: oneshot::Sender<()>) -> Self {
        Subscription {
            conversation_id: conversation_id.into(),
            changes,
            cancel: Some(cancel),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<Change> {
        self.changes.recv().await
    }

    pub fn close(mut self) {
        self.unsubscribe();
    }

    fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("Unsubscribing from conversation {}", self.conversation_id);
            let _ = cancel.send(());
        }
        self.changes.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Live change-feed interface. Delivery is at-least-once and not gap-free;
/// reconnection is the implementation's business.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, conversation_id: &str) -> SyncResult<Subscription>;
}

/// What the dispatch function needs to deliver one message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub recipient: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub provider_message_id: String,
}

/// Outbound message dispatch interface (third-party messaging API behind a
/// server-side function).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: &OutboundRequest) -> SyncResult<DispatchReceipt>;
}

/// Signed-in actor, used to stamp `sender_id` on outbound messages.
pub trait IdentityContext: Send + Sync {
    fn actor_id(&self) -> Option<String>;
}

pub struct StaticIdentity(Option<String>);

impl StaticIdentity {
    pub fn new(actor_id: Option<String>) -> Self {
        StaticIdentity(actor_id)
    }
}

impl IdentityContext for StaticIdentity {
    fn actor_id(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Client handle owned by the application root and passed to the sync core.
#[derive(Clone)]
pub struct Backend {
    pub repository: Arc<dyn MessageRepository>,
    pub feed: Arc<dyn ChangeFeed>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub identity: Arc<dyn IdentityContext>,
}

impl Backend {
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        feed: Arc<dyn ChangeFeed>,
        dispatcher: Arc<dyn Dispatcher>,
        identity: Arc<dyn IdentityContext>,
    ) -> Self {
        Backend {
            repository,
            feed,
            dispatcher,
            identity,
        }
    }

    /// Wire the HTTP repository/dispatcher and the realtime feed from settings.
    pub fn connect(settings: &Settings) -> SyncResult<Self> {
        if settings.project_url.trim().is_empty() {
            return Err(SyncError::Config("project URL is empty".to_string()));
        }
        let rest = Arc::new(RestClient::new(settings)?);
        let feed = Arc::new(RealtimeFeed::new(settings)?);
        let identity = Arc::new(StaticIdentity::new(settings.actor_id.clone()));
        Ok(Backend::new(rest.clone(), feed, rest, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closing_subscription_unsubscribes() {
        let memory = MemoryBackend::new();
        let first = memory.subscribe("c1").await.expect("subscribed");
        let second = memory.subscribe("c1").await.expect("subscribed");
        assert_eq!(first.conversation_id(), "c1");
        assert_eq!(memory.subscriber_count("c1"), 2);

        first.close();
        assert_eq!(memory.subscriber_count("c1"), 1);

        drop(second);
        assert_eq!(memory.subscriber_count("c1"), 0);
    }
}
