// Keyed message store for the selected conversation
// Messages live in a map keyed by id; `order` holds the ids in display
// order, sorted by creation time. Provisional (locally sent) entries are
// tracked separately so the correlation rule only scans them.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::models::{Message, MessageStatus};

struct Entry {
    message: Message,
    // Failed by the local pending timeout rather than by the backend
    timed_out: bool,
}

/// Outcome of applying a backend-confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Appended,
    /// Already known by id; fields merged
    Merged,
    /// Took the place of a provisional entry
    Replaced { provisional_id: String },
}

#[derive(Default)]
pub struct MessageStore {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    provisional: HashSet<String>,
    aliases: HashMap<String, String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.provisional.clear();
        self.aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Follow provisional → confirmed replacements to the current id.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        let mut current = id;
        while let Some(next) = self.aliases.get(current) {
            current = next;
        }
        current
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.get(self.resolve(id)).map(|e| &e.message)
    }

    pub fn is_provisional(&self, id: &str) -> bool {
        self.provisional.contains(id)
    }

    /// Ordered view
    pub fn messages(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    pub fn push_provisional(&mut self, message: Message) {
        self.provisional.insert(message.id.clone());
        self.insert_sorted(message);
    }

    /// Apply a message confirmed by the backend (fetch row or feed event).
    ///
    /// Known ids are merged, a matching provisional entry is replaced in
    /// place, anything else is inserted in creation-time order.
    pub fn apply_confirmed(&mut self, message: Message, window: Duration) -> Applied {
        if self.entries.contains_key(&message.id) {
            self.merge(message);
            return Applied::Merged;
        }

        if let Some(provisional_id) = self.correlate(&message, window) {
            self.replace(&provisional_id, message);
            return Applied::Replaced { provisional_id };
        }

        self.insert_sorted(message);
        Applied::Appended
    }

    /// The correlation rule: find the provisional entry that is the same
    /// logical message as `incoming`.
    ///
    /// Candidates share conversation, direction, sender and payload and were
    /// created within `window` of each other. Entries that have not failed are
    /// preferred, then the closest creation time.
    pub fn correlate(&self, incoming: &Message, window: Duration) -> Option<String> {
        self.provisional
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.message)
            .filter(|m| m.same_payload(incoming))
            .filter_map(|m| {
                let distance = distance(m.created_at, incoming.created_at);
                (distance <= window).then_some((m.status == MessageStatus::Failed, distance, &m.id))
            })
            .min()
            .map(|(_, _, id)| id.clone())
    }

    /// Local dispatch succeeded.
    ///
    /// `confirmed_id` is the id the backend persisted the row under; when it
    /// differs from the provisional id the entry is re-keyed in place.
    pub fn mark_sent(
        &mut self,
        id: &str,
        provider_message_id: Option<String>,
        confirmed_id: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        let current = self.resolve(id).to_string();
        let Some(entry) = self.entries.get_mut(&current) else {
            return false;
        };

        let advanced = if entry.message.status == MessageStatus::Failed && entry.timed_out {
            entry.message.force_status(MessageStatus::Sent, at);
            entry.message.error = None;
            entry.timed_out = false;
            true
        } else {
            entry.message.advance(MessageStatus::Sent, at)
        };
        if entry.message.provider_message_id.is_none() {
            entry.message.provider_message_id = provider_message_id;
        }

        if let Some(confirmed_id) = confirmed_id {
            if confirmed_id != current && self.provisional.contains(&current) {
                self.rekey(&current, confirmed_id);
            }
        }
        advanced
    }

    /// Local dispatch failed, or nothing confirmed it in time.
    pub fn mark_failed(&mut self, id: &str, reason: &str, at: DateTime<Utc>, timed_out: bool) -> bool {
        let current = self.resolve(id).to_string();
        let Some(entry) = self.entries.get_mut(&current) else {
            return false;
        };
        if !entry.message.advance(MessageStatus::Failed, at) {
            return false;
        }
        entry.message.error = Some(reason.to_string());
        entry.timed_out = timed_out;
        true
    }

    fn merge(&mut self, incoming: Message) {
        let Some(entry) = self.entries.get_mut(&incoming.id) else {
            return;
        };
        let status = reconcile_status(entry.message.status, incoming.status);
        let kept = entry.message.clone();
        let created_changed = kept.created_at != incoming.created_at;

        entry.message = incoming;
        if status != entry.message.status {
            debug!(
                "Keeping status {:?} for {} over stale {:?}",
                status, entry.message.id, entry.message.status
            );
            entry.message.status = status;
            entry.message.error = kept.error.clone();
        }
        fill_times(&mut entry.message, &kept);
        if entry.message.status != MessageStatus::Failed {
            entry.timed_out = false;
        }

        let id = entry.message.id.clone();
        self.provisional.remove(&id);
        if created_changed {
            if let Some(pos) = self.position(&id) {
                self.settle(pos);
            }
        }
    }

    fn replace(&mut self, provisional_id: &str, mut confirmed: Message) {
        let Some(pos) = self.position(provisional_id) else {
            return;
        };
        let Some(old) = self.entries.remove(provisional_id) else {
            return;
        };
        self.provisional.remove(provisional_id);

        let status = reconcile_status(old.message.status, confirmed.status);
        if status != confirmed.status {
            confirmed.status = status;
            confirmed.error = old.message.error.clone();
        }
        fill_times(&mut confirmed, &old.message);
        if confirmed.provider_message_id.is_none() {
            confirmed.provider_message_id = old.message.provider_message_id.clone();
        }

        // A timeout failure that survives the merge stays revivable
        let timed_out = old.timed_out && confirmed.status == MessageStatus::Failed;
        let confirmed_id = confirmed.id.clone();
        self.order[pos] = confirmed_id.clone();
        self.entries.insert(
            confirmed_id.clone(),
            Entry {
                message: confirmed,
                timed_out,
            },
        );
        self.aliases.insert(provisional_id.to_string(), confirmed_id);
        self.settle(pos);
    }

    fn rekey(&mut self, provisional_id: &str, confirmed_id: String) {
        if self.entries.contains_key(&confirmed_id) {
            // The confirmed row is already shown; fold the provisional one into it.
            if let Some(old) = self.entries.remove(provisional_id) {
                self.order.retain(|id| id != provisional_id);
                self.provisional.remove(provisional_id);
                if let Some(entry) = self.entries.get_mut(&confirmed_id) {
                    let status = reconcile_status(old.message.status, entry.message.status);
                    entry.message.status = status;
                    fill_times(&mut entry.message, &old.message);
                    if entry.message.provider_message_id.is_none() {
                        entry.message.provider_message_id = old.message.provider_message_id;
                    }
                }
                self.aliases.insert(provisional_id.to_string(), confirmed_id);
            }
            return;
        }

        let Some(pos) = self.position(provisional_id) else {
            return;
        };
        if let Some(mut entry) = self.entries.remove(provisional_id) {
            entry.message.id = confirmed_id.clone();
            self.provisional.remove(provisional_id);
            self.order[pos] = confirmed_id.clone();
            self.entries.insert(confirmed_id.clone(), entry);
            self.aliases.insert(provisional_id.to_string(), confirmed_id);
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|existing| existing == id)
    }

    fn created_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|e| e.message.created_at)
    }

    fn insert_sorted(&mut self, message: Message) {
        let created_at = message.created_at;
        let pos = self
            .order
            .partition_point(|id| self.created_at(id).map_or(true, |t| t <= created_at));
        self.order.insert(pos, message.id.clone());
        self.entries.insert(
            message.id.clone(),
            Entry {
                message,
                timed_out: false,
            },
        );
    }

    /// Keep the entry at `pos` unless it now breaks creation-time order.
    fn settle(&mut self, pos: usize) {
        let id = self.order[pos].clone();
        let Some(created_at) = self.created_at(&id) else {
            return;
        };
        let before_ok = pos == 0
            || self
                .created_at(&self.order[pos - 1])
                .map_or(true, |prev| prev <= created_at);
        let after_ok = pos + 1 >= self.order.len()
            || self
                .created_at(&self.order[pos + 1])
                .map_or(true, |next| created_at <= next);
        if before_ok && after_ok {
            return;
        }

        debug!("Moving {} to keep creation-time order", id);
        self.order.remove(pos);
        let new_pos = self
            .order
            .partition_point(|other| self.created_at(other).map_or(true, |t| t <= created_at));
        self.order.insert(new_pos, id);
    }
}

fn distance(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    let delta = if a > b { a - b } else { b - a };
    delta.to_std().unwrap_or(Duration::MAX)
}

/// Status to keep when a backend row meets the local one.
///
/// The backend is authoritative except that it never drags a message back
/// to `pending` or behind a status we already observed.
fn reconcile_status(local: MessageStatus, remote: MessageStatus) -> MessageStatus {
    if local == remote || local.can_advance_to(remote) {
        return remote;
    }
    if local == MessageStatus::Failed && remote != MessageStatus::Pending {
        return remote;
    }
    local
}

fn fill_times(target: &mut Message, source: &Message) {
    target.sent_at = target.sent_at.or(source.sent_at);
    target.delivered_at = target.delivered_at.or(source.delivered_at);
    target.read_at = target.read_at.or(source.read_at);
    if target.status == MessageStatus::Failed {
        target.failed_at = target.failed_at.or(source.failed_at);
    }
}
