// Optimistic send reconciler
// A send shows up immediately as a pending provisional message, then moves
// to sent or failed once the backend answers. If the change feed delivers the
// persisted row first, the store's correlation rule folds the two together.

use chrono::Utc;
use log::{debug, info, warn};

use super::{Selection, SyncEvent, SyncWorker};
use crate::backend::{Backend, DispatchReceipt, OutboundRequest};
use crate::error::{SyncError, SyncResult};
use crate::models::{Message, MessageContent, MessagePatch, MessageRecord, MessageStatus};

/// Successful outcome of persisting and dispatching one message.
#[derive(Debug, Clone)]
pub(crate) struct Delivered {
    pub receipt: DispatchReceipt,
    /// Id the backend stored the row under
    pub confirmed_id: Option<String>,
}

impl SyncWorker {
    pub(super) fn send(&mut self, content: MessageContent) -> SyncResult<String> {
        let selection = self.selection.clone().ok_or(SyncError::NoActiveConversation)?;
        let contact = self
            .contact
            .as_ref()
            .ok_or_else(|| SyncError::NoContact(selection.conversation_id.clone()))?;
        if content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let message = Message::provisional(
            &selection.conversation_id,
            self.backend.identity.actor_id(),
            content,
            Utc::now(),
        );
        let provisional_id = message.id.clone();
        let request = OutboundRequest {
            conversation_id: selection.conversation_id.clone(),
            message_id: provisional_id.clone(),
            recipient: contact.recipient().to_string(),
            content: message.content.clone(),
        };
        info!(
            "Sending {} to {} in conversation {}",
            provisional_id, request.recipient, selection.conversation_id
        );

        self.store.push_provisional(message.clone());
        self.spawn_delivery(selection.clone(), message, request);
        self.spawn_pending_timer(selection, provisional_id.clone());
        Ok(provisional_id)
    }

    fn spawn_delivery(&self, selection: Selection, message: Message, request: OutboundRequest) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let provisional_id = message.id.clone();
            let result = deliver(&backend, &message, request).await;
            let _ = events
                .send(SyncEvent::Dispatched {
                    selection,
                    provisional_id,
                    result,
                })
                .await;
        });
    }

    fn spawn_pending_timer(&self, selection: Selection, provisional_id: String) {
        let events = self.events.clone();
        let timeout = self.config.pending_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(SyncEvent::PendingExpired {
                    selection,
                    provisional_id,
                })
                .await;
        });
    }

    pub(super) fn on_dispatched(&mut self, selection: Selection, provisional_id: String, result: SyncResult<Delivered>) {
        if !self.is_current(&selection) {
            debug!(
                "Dropping send outcome of {} for conversation {} which is no longer selected",
                provisional_id, selection.conversation_id
            );
            return;
        }

        let now = Utc::now();
        match result {
            Ok(delivered) => {
                let provider_id = delivered.receipt.provider_message_id;
                if self
                    .store
                    .mark_sent(&provisional_id, Some(provider_id.clone()), delivered.confirmed_id, now)
                {
                    info!("Message {} sent ({})", provisional_id, provider_id);
                } else {
                    debug!("Message {} already past sent", provisional_id);
                }
            }
            Err(e) => {
                warn!("Message {} failed: {}", provisional_id, e);
                self.store.mark_failed(&provisional_id, &e.to_string(), now, false);
            }
        }
    }

    pub(super) fn on_pending_expired(&mut self, selection: Selection, provisional_id: String) {
        if !self.is_current(&selection) {
            return;
        }
        let still_pending = self
            .store
            .get(&provisional_id)
            .map_or(false, |m| m.status == MessageStatus::Pending);
        if !still_pending {
            return;
        }

        let reason = format!(
            "No confirmation received within {}s",
            self.config.pending_timeout.as_secs_f32()
        );
        warn!("Message {}: {}", provisional_id, reason);
        self.store.mark_failed(&provisional_id, &reason, Utc::now(), true);
    }
}

/// Persist the provisional row, dispatch it, then record the outcome on the row.
async fn deliver(backend: &Backend, message: &Message, request: OutboundRequest) -> SyncResult<Delivered> {
    let persisted = backend
        .repository
        .insert_message(&MessageRecord::from(message))
        .await?;
    let confirmed_id = persisted.id.clone();
    let request = OutboundRequest {
        message_id: confirmed_id.clone().unwrap_or(request.message_id),
        ..request
    };

    match backend.dispatcher.dispatch(&request).await {
        Ok(receipt) => {
            if let Some(id) = &confirmed_id {
                let patch = MessagePatch::sent(&receipt.provider_message_id, Utc::now());
                if let Err(e) = backend.repository.update_message(id, &patch).await {
                    warn!("Could not record sent status for {}: {}", id, e);
                }
            }
            Ok(Delivered { receipt, confirmed_id })
        }
        Err(e) => {
            if let Some(id) = &confirmed_id {
                let patch = MessagePatch::failed(&e.to_string(), Utc::now());
                if let Err(update_err) = backend.repository.update_message(id, &patch).await {
                    warn!("Could not record failure for {}: {}", id, update_err);
                }
            }
            Err(e)
        }
    }
}
