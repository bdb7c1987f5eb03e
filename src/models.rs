use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub phone_number: String,
    #[serde(default)]
    pub whatsapp_id: Option<String>,
}

impl Contact {
    /// Address used by the dispatch function; the provider id wins over the raw number.
    pub fn recipient(&self) -> &str {
        self.whatsapp_id.as_deref().unwrap_or(&self.phone_number)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.phone_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Assigned,
    Pending,
    Resolved,
    Closed,
}

/// Owned by the backend; read-only here apart from display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub unread_count: i64,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    Contact,
    Agent,
    Bot,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

impl FromStr for MediaKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "document" => Ok(MediaKind::Document),
            "sticker" => Ok(MediaKind::Sticker),
            other => Err(SyncError::InvalidRecord(format!("unknown message type '{}'", other))),
        }
    }
}

/// Exactly one payload shape per message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    pub fn media(kind: MediaKind, url: impl Into<String>, caption: Option<String>) -> Self {
        MessageContent::Media {
            kind,
            url: url.into(),
            caption,
        }
    }

    /// Value of the `message_type` column
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Media { kind, .. } => kind.as_str(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text { body } => body.trim().is_empty(),
            MessageContent::Media { url, .. } => url.trim().is_empty(),
        }
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageContent::Text { body } => write!(f, "{}", body),
            MessageContent::Media { kind, url, caption } => match caption {
                Some(caption) => write!(f, "[{}] {} ({})", kind.as_str(), caption, url),
                None => write!(f, "[{}] {}", kind.as_str(), url),
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending = 0,   // Local only, before the write resolves
    Sent = 1,      // Accepted by the provider
    Delivered = 2, // Delivered to the contact's device
    Read = 3,      // Read by the contact
    Failed = 4,    // Send failed
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        self != MessageStatus::Pending
    }

    /// Forward-only transitions; `pending` is only ever left, never entered.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent | Delivered | Read | Failed)
                | (Sent, Delivered | Read | Failed)
                | (Delivered, Read)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub sender: SenderKind,
    pub sender_id: Option<String>,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl Message {
    /// Locally originated outbound message shown before the backend confirms it.
    pub fn provisional(
        conversation_id: impl Into<String>,
        sender_id: Option<String>,
        content: MessageContent,
        now: DateTime<Utc>,
    ) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            direction: Direction::Outbound,
            sender: SenderKind::Agent,
            sender_id,
            content,
            status: MessageStatus::Pending,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            provider_message_id: None,
            error: None,
        }
    }

    /// Move to `status` if the transition is allowed, stamping its time.
    pub fn advance(&mut self, status: MessageStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(status) {
            return false;
        }
        self.force_status(status, at);
        true
    }

    pub(crate) fn force_status(&mut self, status: MessageStatus, at: DateTime<Utc>) {
        self.status = status;
        let slot = match status {
            MessageStatus::Pending => return,
            MessageStatus::Sent => &mut self.sent_at,
            MessageStatus::Delivered => &mut self.delivered_at,
            MessageStatus::Read => &mut self.read_at,
            MessageStatus::Failed => &mut self.failed_at,
        };
        slot.get_or_insert(at);
    }

    /// Same conversation, direction, sender and payload.
    pub fn same_payload(&self, other: &Message) -> bool {
        self.conversation_id == other.conversation_id
            && self.direction == other.direction
            && self.sender == other.sender
            && self.content == other.content
    }
}

/// Flat `messages` row as stored by the backend and carried on the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    pub direction: Direction,
    pub sender_type: SenderKind,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_caption: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub whatsapp_message_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

fn default_message_type() -> String {
    "text".to_string()
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        let (content, media_url, media_caption) = match &message.content {
            MessageContent::Text { body } => (Some(body.clone()), None, None),
            MessageContent::Media { url, caption, .. } => (None, Some(url.clone()), caption.clone()),
        };
        MessageRecord {
            id: Some(message.id.clone()),
            conversation_id: message.conversation_id.clone(),
            direction: message.direction,
            sender_type: message.sender,
            sender_id: message.sender_id.clone(),
            message_type: message.content.message_type().to_string(),
            content,
            media_url,
            media_caption,
            status: message.status,
            whatsapp_message_id: message.provider_message_id.clone(),
            error_message: message.error.clone(),
            created_at: Some(message.created_at),
            sent_at: message.sent_at,
            delivered_at: message.delivered_at,
            read_at: message.read_at,
            failed_at: message.failed_at,
        }
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = SyncError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let id = record
            .id
            .ok_or_else(|| SyncError::InvalidRecord("message row without id".to_string()))?;
        let created_at = record
            .created_at
            .ok_or_else(|| SyncError::InvalidRecord(format!("message {} has no created_at", id)))?;

        let content = if record.message_type == "text" {
            MessageContent::Text {
                body: record.content.unwrap_or_default(),
            }
        } else {
            let kind: MediaKind = record.message_type.parse()?;
            let url = record
                .media_url
                .ok_or_else(|| SyncError::InvalidRecord(format!("media message {} has no url", id)))?;
            MessageContent::Media {
                kind,
                url,
                caption: record.media_caption.or(record.content),
            }
        };

        Ok(Message {
            id,
            conversation_id: record.conversation_id,
            direction: record.direction,
            sender: record.sender_type,
            sender_id: record.sender_id,
            content,
            status: record.status,
            created_at,
            sent_at: record.sent_at,
            delivered_at: record.delivered_at,
            read_at: record.read_at,
            failed_at: record.failed_at,
            provider_message_id: record.whatsapp_message_id,
            error: record.error_message,
        })
    }
}

/// Partial update written back after a dispatch resolves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whatsapp_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn sent(provider_message_id: &str, at: DateTime<Utc>) -> Self {
        MessagePatch {
            status: Some(MessageStatus::Sent),
            whatsapp_message_id: Some(provider_message_id.to_string()),
            sent_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(reason: &str, at: DateTime<Utc>) -> Self {
        MessagePatch {
            status: Some(MessageStatus::Failed),
            error_message: Some(reason.to_string()),
            failed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, record: &mut MessageRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(id) = &self.whatsapp_message_id {
            record.whatsapp_message_id = Some(id.clone());
        }
        if let Some(reason) = &self.error_message {
            record.error_message = Some(reason.clone());
        }
        if self.sent_at.is_some() {
            record.sent_at = self.sent_at;
        }
        if self.failed_at.is_some() {
            record.failed_at = self.failed_at;
        }
    }
}
