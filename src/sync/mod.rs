// Conversation sync core
// One worker task owns the message store of the selected conversation.
// Everything that can change it (selection, fetch results, feed events,
// sends and their outcomes) arrives as a SyncEvent on a single queue and is
// applied in arrival order.

use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backend::{Backend, Change};
use crate::error::{SyncError, SyncResult};
use crate::models::{Contact, Conversation, Message, MessageContent, MessageRecord};
use crate::store::MessageStore;

mod reconciler;
mod subscription;

use reconciler::Delivered;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How far apart a provisional message and its confirmed twin may be created
    pub correlation_window: Duration,
    /// A send still pending after this long is marked failed
    pub pending_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            correlation_window: Duration::from_secs(10),
            pending_timeout: Duration::from_secs(30),
            queue_capacity: 100,
        }
    }
}

/// What the rendering layer sees of the selected conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub conversation_id: Option<String>,
    pub conversation: Option<Conversation>,
    pub contact: Option<Contact>,
    pub messages: Vec<Message>,
    /// Provisional id → id of the confirmed message that replaced it
    pub replaced: HashMap<String, String>,
    pub loading: bool,
    /// Live subscription is open
    pub live: bool,
    /// Retryable fetch error
    pub error: Option<String>,
}

impl ConversationView {
    /// Look a message up by id, following provisional replacements.
    pub fn message(&self, id: &str) -> Option<&Message> {
        let mut current = id;
        while let Some(next) = self.replaced.get(current) {
            current = next;
        }
        self.messages.iter().find(|m| m.id == current)
    }

    pub fn is_ready(&self) -> bool {
        self.conversation_id.is_some() && !self.loading && self.error.is_none()
    }
}

/// Identifies the selection a piece of async work was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Selection {
    pub epoch: u64,
    pub conversation_id: String,
}

pub(crate) enum SyncEvent {
    Select(String),
    Deselect,
    RetryFetch,
    Loaded {
        selection: Selection,
        messages: SyncResult<Vec<MessageRecord>>,
        conversation: Option<Conversation>,
        contact: Option<Contact>,
    },
    FeedOpened {
        selection: Selection,
    },
    Feed {
        selection: Selection,
        change: Change,
    },
    FeedEnded {
        selection: Selection,
        error: Option<String>,
    },
    Send {
        content: MessageContent,
        reply: oneshot::Sender<SyncResult<String>>,
    },
    Dispatched {
        selection: Selection,
        provisional_id: String,
        result: SyncResult<Delivered>,
    },
    PendingExpired {
        selection: Selection,
        provisional_id: String,
    },
}

/// Handle to a running sync worker. Dropping it stops the worker.
pub struct ConversationSync {
    events: mpsc::Sender<SyncEvent>,
    view: watch::Receiver<ConversationView>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

impl ConversationSync {
    pub fn spawn(backend: Backend, config: SyncConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(ConversationView::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = SyncWorker::new(backend, config, events_tx.clone(), view_tx);
        let handle = tokio::spawn(worker.run(events_rx, shutdown_rx));

        ConversationSync {
            events: events_tx,
            view: view_rx,
            shutdown: shutdown_tx,
            worker: handle,
        }
    }

    async fn enqueue(&self, event: SyncEvent) -> SyncResult<()> {
        self.events.send(event).await.map_err(|_| SyncError::EngineStopped)
    }

    /// Switch to `conversation_id`. The latest selection wins.
    pub async fn select(&self, conversation_id: impl Into<String>) -> SyncResult<()> {
        self.enqueue(SyncEvent::Select(conversation_id.into())).await
    }

    pub async fn deselect(&self) -> SyncResult<()> {
        self.enqueue(SyncEvent::Deselect).await
    }

    /// Re-run the initial fetch after it failed.
    pub async fn retry_fetch(&self) -> SyncResult<()> {
        self.enqueue(SyncEvent::RetryFetch).await
    }

    /// Append a provisional message and start delivering it.
    ///
    /// Returns the provisional id once the message is visible in the view.
    /// Fails without side effects when no conversation or contact is loaded.
    pub async fn send(&self, content: MessageContent) -> SyncResult<String> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(SyncEvent::Send { content, reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn send_text(&self, body: &str) -> SyncResult<String> {
        self.send(MessageContent::text(body)).await
    }

    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    pub async fn shutdown(self) {
        let ConversationSync { shutdown, worker, .. } = self;
        let _ = shutdown.send(());
        let _ = worker.await;
    }
}

pub(crate) struct SyncWorker {
    backend: Backend,
    config: SyncConfig,
    events: mpsc::Sender<SyncEvent>,
    view: watch::Sender<ConversationView>,
    store: MessageStore,
    selection: Option<Selection>,
    epoch: u64,
    conversation: Option<Conversation>,
    contact: Option<Contact>,
    loading: bool,
    live: bool,
    error: Option<String>,
    fetch_task: Option<JoinHandle<()>>,
    feed_task: Option<JoinHandle<()>>,
}

impl SyncWorker {
    fn new(
        backend: Backend,
        config: SyncConfig,
        events: mpsc::Sender<SyncEvent>,
        view: watch::Sender<ConversationView>,
    ) -> Self {
        SyncWorker {
            backend,
            config,
            events,
            view,
            store: MessageStore::new(),
            selection: None,
            epoch: 0,
            conversation: None,
            contact: None,
            loading: false,
            live: false,
            error: None,
            fetch_task: None,
            feed_task: None,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<SyncEvent>, mut shutdown: oneshot::Receiver<()>) {
        info!("Conversation sync worker started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event);
                        self.publish();
                    }
                    None => break,
                },
            }
        }
        self.release();
        info!("Conversation sync worker stopped");
    }

    fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Select(conversation_id) => self.select(conversation_id),
            SyncEvent::Deselect => self.deselect(),
            SyncEvent::RetryFetch => self.retry_fetch(),
            SyncEvent::Loaded {
                selection,
                messages,
                conversation,
                contact,
            } => self.on_loaded(selection, messages, conversation, contact),
            SyncEvent::FeedOpened { selection } => self.on_feed_opened(selection),
            SyncEvent::Feed { selection, change } => self.on_feed(selection, change),
            SyncEvent::FeedEnded { selection, error } => self.on_feed_ended(selection, error),
            SyncEvent::Send { content, reply } => {
                let result = self.send(content);
                match &result {
                    // Caller may look the id up as soon as send returns
                    Ok(_) => self.publish(),
                    Err(e) => debug!("Send rejected before dispatch: {}", e),
                }
                let _ = reply.send(result);
            }
            SyncEvent::Dispatched {
                selection,
                provisional_id,
                result,
            } => self.on_dispatched(selection, provisional_id, result),
            SyncEvent::PendingExpired {
                selection,
                provisional_id,
            } => self.on_pending_expired(selection, provisional_id),
        }
    }

    fn is_current(&self, selection: &Selection) -> bool {
        self.selection.as_ref() == Some(selection)
    }

    fn publish(&self) {
        let next = ConversationView {
            conversation_id: self.selection.as_ref().map(|s| s.conversation_id.clone()),
            conversation: self.conversation.clone(),
            contact: self.contact.clone(),
            messages: self.store.messages(),
            replaced: self.store.aliases().clone(),
            loading: self.loading,
            live: self.live,
            error: self.error.clone(),
        };
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::models::{ConversationStatus, Direction, MessageStatus, SenderKind};
    use chrono::Utc;

    fn contact(conversation_id: &str) -> Contact {
        Contact {
            id: format!("contact-{}", conversation_id),
            name: None,
            phone_number: "+15550100".to_string(),
            whatsapp_id: None,
        }
    }

    fn inbound(id: &str, conversation_id: &str) -> MessageRecord {
        MessageRecord {
            id: Some(id.to_string()),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Inbound,
            sender_type: SenderKind::Contact,
            sender_id: None,
            message_type: "text".to_string(),
            content: Some("hello".to_string()),
            media_url: None,
            media_caption: None,
            status: MessageStatus::Delivered,
            whatsapp_message_id: None,
            error_message: None,
            created_at: Some(Utc::now()),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
        }
    }

    fn worker() -> (SyncWorker, mpsc::Receiver<SyncEvent>) {
        let backend = MemoryBackend::new();
        for id in ["c1", "c2"] {
            let conversation = Conversation {
                id: id.to_string(),
                contact_id: format!("contact-{}", id),
                status: ConversationStatus::Open,
                assigned_to: None,
                unread_count: 0,
                message_count: 0,
                last_message_at: None,
            };
            backend.add_conversation(conversation, contact(id));
        }
        let (events_tx, events_rx) = mpsc::channel(100);
        let (view_tx, _) = watch::channel(ConversationView::default());
        let worker = SyncWorker::new(backend.backend(Some("agent-1")), SyncConfig::default(), events_tx, view_tx);
        (worker, events_rx)
    }

    #[tokio::test]
    async fn test_queued_events_of_earlier_selection_are_discarded() {
        // Events from background tasks stay queued and unprocessed here
        let (mut worker, _events) = worker();

        worker.handle(SyncEvent::Select("c1".to_string()));
        let stale = worker.selection.clone().expect("c1 selected");
        worker.handle(SyncEvent::Select("c2".to_string()));
        // Back to the same conversation under a new epoch
        worker.handle(SyncEvent::Select("c1".to_string()));
        let current = worker.selection.clone().expect("c1 selected again");
        assert_eq!(stale.conversation_id, current.conversation_id);
        assert_ne!(stale.epoch, current.epoch);

        worker.contact = Some(contact("c1"));
        let provisional_id = worker
            .send(MessageContent::text("on my way"))
            .expect("send accepted");

        worker.handle(SyncEvent::Feed {
            selection: stale.clone(),
            change: Change::insert(inbound("m9", "c1")),
        });
        worker.handle(SyncEvent::Loaded {
            selection: stale.clone(),
            messages: Ok(vec![inbound("m8", "c1")]),
            conversation: None,
            contact: None,
        });
        worker.handle(SyncEvent::PendingExpired {
            selection: stale.clone(),
            provisional_id: provisional_id.clone(),
        });
        worker.handle(SyncEvent::Dispatched {
            selection: stale,
            provisional_id: provisional_id.clone(),
            result: Err(SyncError::Transport("connection reset".to_string())),
        });

        assert_eq!(worker.store.len(), 1);
        assert!(worker.store.get("m9").is_none());
        assert!(worker.store.get("m8").is_none());
        assert!(worker.loading);
        assert_eq!(
            worker.store.get(&provisional_id).map(|m| m.status),
            Some(MessageStatus::Pending)
        );

        // The same events for the current selection do apply
        worker.handle(SyncEvent::Feed {
            selection: current.clone(),
            change: Change::insert(inbound("m9", "c1")),
        });
        worker.handle(SyncEvent::PendingExpired {
            selection: current,
            provisional_id: provisional_id.clone(),
        });

        assert_eq!(worker.store.len(), 2);
        assert!(worker.store.get("m9").is_some());
        assert_eq!(
            worker.store.get(&provisional_id).map(|m| m.status),
            Some(MessageStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_feed_end_of_earlier_selection_keeps_live_flag() {
        let (mut worker, _events) = worker();

        worker.handle(SyncEvent::Select("c1".to_string()));
        let stale = worker.selection.clone().expect("c1 selected");
        worker.handle(SyncEvent::Select("c2".to_string()));
        let current = worker.selection.clone().expect("c2 selected");

        worker.handle(SyncEvent::FeedOpened { selection: current });
        assert!(worker.live);

        worker.handle(SyncEvent::FeedEnded {
            selection: stale,
            error: Some("socket closed".to_string()),
        });
        assert!(worker.live);
    }
}
