// In-process backend
// Keeps rows in memory and fans inserts/updates out to live subscribers.
// Behaviour can be scripted: hold a conversation's fetch until released,
// fail or delay dispatches, assign server-side ids, and echo inserts onto
// the feed the way the hosted database does.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

use super::{
    Backend, Change, ChangeFeed, DispatchReceipt, Dispatcher, MessageRepository, OutboundRequest, StaticIdentity,
    Subscription,
};
use crate::error::{SyncError, SyncResult};
use crate::models::{Contact, Conversation, MessagePatch, MessageRecord};

#[derive(Default)]
struct State {
    messages: HashMap<String, Vec<MessageRecord>>,
    conversations: HashMap<String, Conversation>,
    contacts: HashMap<String, Contact>,
    held_fetches: HashMap<String, Arc<Notify>>,
    failing_fetches: HashMap<String, String>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Change>>>,
    dispatch_failure: Option<(Option<String>, String)>,
    dispatch_delay: Option<Duration>,
    dispatched: Vec<OutboundRequest>,
    server_ids: bool,
    echo_writes: bool,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

/// Releases a fetch held by [`MemoryBackend::hold_fetch`].
pub struct FetchGate(Arc<Notify>);

impl FetchGate {
    pub fn release(&self) {
        self.0.notify_one();
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bundle this backend as every collaborator of a [`Backend`].
    pub fn backend(&self, actor_id: Option<&str>) -> Backend {
        let shared = Arc::new(self.clone());
        Backend::new(
            shared.clone(),
            shared.clone(),
            shared,
            Arc::new(StaticIdentity::new(actor_id.map(str::to_string))),
        )
    }

    pub fn add_conversation(&self, conversation: Conversation, contact: Contact) {
        let mut state = self.lock();
        state.contacts.insert(contact.id.clone(), contact);
        state.messages.entry(conversation.id.clone()).or_default();
        state.conversations.insert(conversation.id.clone(), conversation);
    }

    /// Store a row without notifying anyone, as if it predates the session.
    pub fn seed_message(&self, record: MessageRecord) {
        let mut state = self.lock();
        state
            .messages
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record);
    }

    pub fn hold_fetch(&self, conversation_id: &str) -> FetchGate {
        let notify = Arc::new(Notify::new());
        self.lock()
            .held_fetches
            .insert(conversation_id.to_string(), notify.clone());
        FetchGate(notify)
    }

    pub fn fail_fetch(&self, conversation_id: &str, reason: &str) {
        self.lock()
            .failing_fetches
            .insert(conversation_id.to_string(), reason.to_string());
    }

    pub fn clear_fetch_failure(&self, conversation_id: &str) {
        self.lock().failing_fetches.remove(conversation_id);
    }

    pub fn fail_dispatch(&self, code: Option<&str>, message: &str) {
        self.lock().dispatch_failure = Some((code.map(str::to_string), message.to_string()));
    }

    pub fn delay_dispatch(&self, delay: Duration) {
        self.lock().dispatch_delay = Some(delay);
    }

    /// Persist inserted rows under a fresh server id instead of the client's.
    pub fn assign_server_ids(&self, enabled: bool) {
        self.lock().server_ids = enabled;
    }

    /// Publish inserts/updates made through the repository onto the feed.
    pub fn echo_writes(&self, enabled: bool) {
        self.lock().echo_writes = enabled;
    }

    pub fn dispatched(&self) -> Vec<OutboundRequest> {
        self.lock().dispatched.clone()
    }

    pub fn stored_messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        let mut state = self.lock();
        match state.subscribers.get_mut(conversation_id) {
            Some(subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            None => 0,
        }
    }

    /// Push a change to the live subscribers of `conversation_id`.
    pub fn emit(&self, conversation_id: &str, change: Change) -> usize {
        let subscribers = {
            let mut state = self.lock();
            let subs = state.subscribers.entry(conversation_id.to_string()).or_default();
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };
        let mut delivered = 0;
        for tx in subscribers {
            if tx.try_send(change.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!("Emitted {:?} to {} subscriber(s) of {}", change.kind, delivered, conversation_id);
        delivered
    }
}

#[async_trait]
impl MessageRepository for MemoryBackend {
    async fn fetch_messages(&self, conversation_id: &str) -> SyncResult<Vec<MessageRecord>> {
        let gate = self.lock().held_fetches.remove(conversation_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.lock();
        if let Some(reason) = state.failing_fetches.get(conversation_id) {
            return Err(SyncError::Fetch(reason.clone()));
        }
        let mut rows = state.messages.get(conversation_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> SyncResult<Conversation> {
        self.lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SyncError::Fetch(format!("conversation {} not found", conversation_id)))
    }

    async fn fetch_contact(&self, contact_id: &str) -> SyncResult<Contact> {
        self.lock()
            .contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| SyncError::Fetch(format!("contact {} not found", contact_id)))
    }

    async fn insert_message(&self, record: &MessageRecord) -> SyncResult<MessageRecord> {
        let (stored, echo) = {
            let mut state = self.lock();
            let mut stored = record.clone();
            if state.server_ids || stored.id.is_none() {
                state.next_id += 1;
                stored.id = Some(format!("srv-{}", state.next_id));
            }
            stored.created_at = Some(stored.created_at.unwrap_or_else(Utc::now));
            state
                .messages
                .entry(stored.conversation_id.clone())
                .or_default()
                .push(stored.clone());
            (stored, state.echo_writes)
        };
        if echo {
            self.emit(&stored.conversation_id, Change::insert(stored.clone()));
        }
        Ok(stored)
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> SyncResult<()> {
        let (updated, echo) = {
            let mut state = self.lock();
            let echo = state.echo_writes;
            let row = state
                .messages
                .values_mut()
                .flat_map(|rows| rows.iter_mut())
                .find(|r| r.id.as_deref() == Some(id))
                .ok_or_else(|| SyncError::Store(format!("message {} not found", id)))?;
            patch.apply_to(row);
            (row.clone(), echo)
        };
        if echo {
            self.emit(&updated.conversation_id, Change::update(updated.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, conversation_id: &str) -> SyncResult<Subscription> {
        let (tx, rx) = mpsc::channel(100);
        let (cancel_tx, _cancel_rx) = oneshot::channel();
        self.lock()
            .subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(conversation_id, rx, cancel_tx))
    }
}

#[async_trait]
impl Dispatcher for MemoryBackend {
    async fn dispatch(&self, request: &OutboundRequest) -> SyncResult<DispatchReceipt> {
        let delay = {
            let mut state = self.lock();
            state.dispatched.push(request.clone());
            state.dispatch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.lock().dispatch_failure.clone();
        match failure {
            Some((code, message)) => Err(SyncError::Rejected { code, message }),
            None => Ok(DispatchReceipt {
                provider_message_id: format!("wamid.{}", uuid::Uuid::new_v4().simple()),
            }),
        }
    }
}
