// Conversation subscription manager
// Keeps exactly one live subscription for the selected conversation and
// applies fetched rows and feed changes to the store.

use log::{debug, error, info, warn};

use super::{Selection, SyncEvent, SyncWorker};
use crate::backend::{Change, ChangeKind, MessageRepository};
use crate::error::SyncResult;
use crate::models::{Contact, Conversation, Message, MessageRecord};

impl SyncWorker {
    pub(super) fn select(&mut self, conversation_id: String) {
        if conversation_id.trim().is_empty() {
            warn!("Ignoring selection of an empty conversation id");
            return;
        }

        self.release();
        self.epoch += 1;
        let selection = Selection {
            epoch: self.epoch,
            conversation_id,
        };
        info!(
            "Selecting conversation {} (epoch {})",
            selection.conversation_id, selection.epoch
        );
        self.selection = Some(selection.clone());
        self.loading = true;
        self.spawn_fetch(selection.clone());
        self.spawn_feed(selection);
    }

    pub(super) fn deselect(&mut self) {
        if let Some(selection) = &self.selection {
            info!("Deselecting conversation {}", selection.conversation_id);
        }
        self.release();
    }

    /// Drop the subscription and all state of the current selection.
    ///
    /// Work already in flight keeps running but its results no longer match
    /// the selection and are discarded when they arrive.
    pub(super) fn release(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        if let Some(task) = self.feed_task.take() {
            // Aborting drops the Subscription, which unsubscribes
            task.abort();
        }
        self.selection = None;
        self.store.clear();
        self.conversation = None;
        self.contact = None;
        self.loading = false;
        self.live = false;
        self.error = None;
    }

    pub(super) fn retry_fetch(&mut self) {
        let Some(selection) = self.selection.clone() else {
            debug!("Retry requested without a selection");
            return;
        };
        if self.loading {
            debug!("Fetch for {} already running", selection.conversation_id);
            return;
        }
        info!("Retrying fetch for conversation {}", selection.conversation_id);
        self.loading = true;
        self.error = None;
        self.spawn_fetch(selection);
    }

    fn spawn_fetch(&mut self, selection: Selection) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        let repository = self.backend.repository.clone();
        let events = self.events.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let id = selection.conversation_id.clone();
            let (messages, (conversation, contact)) = tokio::join!(
                repository.fetch_messages(&id),
                load_context(repository.as_ref(), &id)
            );
            let _ = events
                .send(SyncEvent::Loaded {
                    selection,
                    messages,
                    conversation,
                    contact,
                })
                .await;
        }));
    }

    fn spawn_feed(&mut self, selection: Selection) {
        let feed = self.backend.feed.clone();
        let events = self.events.clone();
        self.feed_task = Some(tokio::spawn(async move {
            let mut subscription = match feed.subscribe(&selection.conversation_id).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    let _ = events
                        .send(SyncEvent::FeedEnded {
                            selection,
                            error: Some(e.to_string()),
                        })
                        .await;
                    return;
                }
            };
            if events
                .send(SyncEvent::FeedOpened {
                    selection: selection.clone(),
                })
                .await
                .is_err()
            {
                return;
            }
            while let Some(change) = subscription.recv().await {
                let event = SyncEvent::Feed {
                    selection: selection.clone(),
                    change,
                };
                if events.send(event).await.is_err() {
                    debug!(
                        "Worker gone, closing feed for conversation {}",
                        subscription.conversation_id()
                    );
                    subscription.close();
                    return;
                }
            }
            let _ = events.send(SyncEvent::FeedEnded { selection, error: None }).await;
        }));
    }

    pub(super) fn on_loaded(
        &mut self,
        selection: Selection,
        messages: SyncResult<Vec<MessageRecord>>,
        conversation: Option<Conversation>,
        contact: Option<Contact>,
    ) {
        if !self.is_current(&selection) {
            debug!(
                "Discarding stale fetch for conversation {} (epoch {})",
                selection.conversation_id, selection.epoch
            );
            return;
        }

        self.fetch_task = None;
        self.loading = false;
        if conversation.is_some() {
            self.conversation = conversation;
        }
        if contact.is_some() {
            self.contact = contact;
        }

        match messages {
            Ok(records) => {
                self.error = None;
                let count = records.len();
                for record in records {
                    self.apply_record(record, "fetched");
                }
                info!(
                    "Loaded {} messages for conversation {}",
                    count, selection.conversation_id
                );
            }
            Err(e) => {
                error!("Failed to load conversation {}: {}", selection.conversation_id, e);
                self.error = Some(e.to_string());
            }
        }
    }

    pub(super) fn on_feed_opened(&mut self, selection: Selection) {
        if self.is_current(&selection) {
            debug!("Live feed open for conversation {}", selection.conversation_id);
            self.live = true;
        }
    }

    pub(super) fn on_feed(&mut self, selection: Selection, change: Change) {
        if !self.is_current(&selection) {
            debug!(
                "Dropping late {:?} event for conversation {}",
                change.kind, selection.conversation_id
            );
            return;
        }
        let origin = match change.kind {
            ChangeKind::Insert => "inserted",
            ChangeKind::Update => "updated",
        };
        self.apply_record(change.record, origin);
    }

    pub(super) fn on_feed_ended(&mut self, selection: Selection, error: Option<String>) {
        if !self.is_current(&selection) {
            return;
        }
        match error {
            Some(e) => error!("Live feed for {} unavailable: {}", selection.conversation_id, e),
            None => warn!("Live feed for {} ended", selection.conversation_id),
        }
        self.live = false;
    }

    fn apply_record(&mut self, record: MessageRecord, origin: &str) {
        let Some(selection) = &self.selection else {
            return;
        };
        if record.conversation_id != selection.conversation_id {
            debug!(
                "Ignoring {} row for conversation {} while {} is selected",
                origin, record.conversation_id, selection.conversation_id
            );
            return;
        }

        match Message::try_from(record) {
            Ok(message) => {
                let id = message.id.clone();
                let applied = self.store.apply_confirmed(message, self.config.correlation_window);
                debug!("Applied {} message {}: {:?}", origin, id, applied);
            }
            Err(e) => warn!("Skipping {} row: {}", origin, e),
        }
    }
}

async fn load_context(repository: &dyn MessageRepository, conversation_id: &str) -> (Option<Conversation>, Option<Contact>) {
    let conversation = match repository.fetch_conversation(conversation_id).await {
        Ok(conversation) => conversation,
        Err(e) => {
            warn!("Could not load conversation {}: {}", conversation_id, e);
            return (None, None);
        }
    };
    let contact = match repository.fetch_contact(&conversation.contact_id).await {
        Ok(contact) => Some(contact),
        Err(e) => {
            warn!("Could not load contact {}: {}", conversation.contact_id, e);
            None
        }
    };
    (Some(conversation), contact)
}
