// HTTP adapter for the hosted backend
// Table access goes through the PostgREST endpoint, sends through the
// serverless dispatch function.

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::{DispatchReceipt, Dispatcher, MessageRepository, OutboundRequest};
use crate::error::{SyncError, SyncResult};
use crate::models::{Contact, Conversation, MessageContent, MessagePatch, MessageRecord};
use crate::settings::Settings;

pub struct RestClient {
    http: HttpClient,
    base_url: String,
    anon_key: String,
    bearer: String,
    dispatch_function: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchBody<'a> {
    conversation_id: &'a str,
    message_id: &'a str,
    to: &'a str,
    message_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DispatchReply {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    whatsapp_message_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl RestClient {
    pub fn new(settings: &Settings) -> SyncResult<Self> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: settings.project_url.trim_end_matches('/').to_string(),
            anon_key: settings.anon_key.clone(),
            bearer: settings.bearer(),
            dispatch_function: settings.dispatch_function.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn function_url(&self) -> String {
        format!("{}/functions/v1/{}", self.base_url, self.dispatch_function)
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer))
    }

    async fn check(resp: Response) -> SyncResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::Store(format!("HTTP {}: {}", status, body.trim())))
    }

    async fn select_one<T: DeserializeOwned>(&self, table: &str, id: &str) -> SyncResult<T> {
        let req = self
            .http
            .get(self.table_url(table))
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())]);
        let resp = self.with_auth(req).send().await?;
        let rows: Vec<T> = Self::check(resp)
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?
            .json()
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Fetch(format!("{} {} not found", table, id)))
    }
}

#[async_trait]
impl MessageRepository for RestClient {
    async fn fetch_messages(&self, conversation_id: &str) -> SyncResult<Vec<MessageRecord>> {
        let req = self.http.get(self.table_url("messages")).query(&[
            ("conversation_id", format!("eq.{}", conversation_id)),
            ("order", "created_at.asc".to_string()),
            ("select", "*".to_string()),
        ]);
        let resp = self
            .with_auth(req)
            .send()
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        let rows: Vec<MessageRecord> = Self::check(resp)
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        debug!("Fetched {} messages for conversation {}", rows.len(), conversation_id);
        Ok(rows)
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> SyncResult<Conversation> {
        self.select_one("conversations", conversation_id).await
    }

    async fn fetch_contact(&self, contact_id: &str) -> SyncResult<Contact> {
        self.select_one("contacts", contact_id).await
    }

    async fn insert_message(&self, record: &MessageRecord) -> SyncResult<MessageRecord> {
        let req = self
            .http
            .post(self.table_url("messages"))
            .header("Prefer", "return=representation")
            .json(record);
        let resp = self.with_auth(req).send().await?;
        let rows: Vec<MessageRecord> = Self::check(resp).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::Store("insert returned no row".to_string()))
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> SyncResult<()> {
        let req = self
            .http
            .patch(self.table_url("messages"))
            .query(&[("id", format!("eq.{}", id))])
            .json(patch);
        let resp = self.with_auth(req).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for RestClient {
    async fn dispatch(&self, request: &OutboundRequest) -> SyncResult<DispatchReceipt> {
        let (content, media_url, caption) = match &request.content {
            MessageContent::Text { body } => (Some(body.as_str()), None, None),
            MessageContent::Media { url, caption, .. } => (None, Some(url.as_str()), caption.as_deref()),
        };
        let body = DispatchBody {
            conversation_id: &request.conversation_id,
            message_id: &request.message_id,
            to: &request.recipient,
            message_type: request.content.message_type(),
            content,
            media_url,
            caption,
        };

        info!("Dispatching message {} to {}", request.message_id, request.recipient);
        let resp = self
            .with_auth(self.http.post(self.function_url()).json(&body))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        let reply: DispatchReply = serde_json::from_str(&text).unwrap_or_default();

        if !status.is_success() || reply.success == Some(false) {
            let message = reply
                .error
                .unwrap_or_else(|| if text.is_empty() { format!("HTTP {}", status) } else { text.clone() });
            error!("Dispatch of {} rejected: {}", request.message_id, message);
            return Err(SyncError::Rejected {
                code: reply.code.or_else(|| Some(status.as_u16().to_string())),
                message,
            });
        }

        reply
            .whatsapp_message_id
            .or(reply.message_id)
            .map(|provider_message_id| DispatchReceipt { provider_message_id })
            .ok_or_else(|| SyncError::Rejected {
                code: None,
                message: "dispatch reply carried no provider message id".to_string(),
            })
    }
}
