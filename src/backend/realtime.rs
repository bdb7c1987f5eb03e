// Realtime change feed over the platform's Phoenix-channel WebSocket
//
// One socket per subscription. The socket reconnects on its own with
// jittered exponential backoff; changes emitted while it was down are not
// replayed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Change, ChangeFeed, ChangeKind, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::models::MessageRecord;
use crate::settings::Settings;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 100;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

enum SessionEnd {
    Cancelled,
    Disconnected(String),
}

pub struct RealtimeFeed {
    socket_url: Url,
    access_token: String,
    heartbeat: Duration,
}

impl RealtimeFeed {
    pub fn new(settings: &Settings) -> SyncResult<Self> {
        Ok(Self {
            socket_url: socket_url(&settings.project_url, &settings.anon_key)?,
            access_token: settings.bearer(),
            heartbeat: settings.heartbeat(),
        })
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, conversation_id: &str) -> SyncResult<Subscription> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let channel = ChannelSpec {
            url: self.socket_url.clone(),
            topic: format!("realtime:messages:{}", conversation_id),
            join_payload: join_payload(conversation_id, &self.access_token),
            heartbeat: self.heartbeat,
        };
        info!("Opening realtime channel {}", channel.topic);
        tokio::spawn(run_channel(channel, tx, cancel_rx));
        Ok(Subscription::new(conversation_id, rx, cancel_tx))
    }
}

struct ChannelSpec {
    url: Url,
    topic: String,
    join_payload: Value,
    heartbeat: Duration,
}

/// Build `wss://<host>/realtime/v1/websocket?apikey=..&vsn=1.0.0` from the project URL.
pub fn socket_url(project_url: &str, api_key: &str) -> SyncResult<Url> {
    let mut url = Url::parse(project_url).map_err(|e| SyncError::Config(format!("invalid project URL: {}", e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(SyncError::Config(format!("unsupported URL scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot use scheme {} for {}", scheme, project_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

fn join_payload(conversation_id: &str, access_token: &str) -> Value {
    json!({
        "config": {
            "postgres_changes": [{
                "event": "*",
                "schema": "public",
                "table": "messages",
                "filter": format!("conversation_id=eq.{}", conversation_id),
            }]
        },
        "access_token": access_token,
    })
}

/// Turn a `postgres_changes` frame into a change; anything else yields `None`.
pub fn parse_change(text: &str) -> Option<Change> {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring unparseable realtime frame: {}", e);
            return None;
        }
    };

    match frame.event.as_str() {
        "postgres_changes" => {}
        "phx_reply" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                error!("Realtime channel {} refused: {}", frame.topic, frame.payload);
            }
            return None;
        }
        "phx_error" | "phx_close" => {
            warn!("Realtime channel {} reported {}", frame.topic, frame.event);
            return None;
        }
        _ => return None,
    }

    let data = frame.payload.get("data")?;
    let kind = match data.get("type").and_then(Value::as_str)? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        other => {
            debug!("Skipping {} change", other);
            return None;
        }
    };
    match serde_json::from_value::<MessageRecord>(data.get("record")?.clone()) {
        Ok(record) => Some(Change { kind, record }),
        Err(e) => {
            warn!("Realtime record did not match the messages shape: {}", e);
            None
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    exp.min(BACKOFF_MAX) + jitter
}

async fn run_channel(channel: ChannelSpec, tx: mpsc::Sender<Change>, mut cancel: oneshot::Receiver<()>) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(channel.url.as_str()).await {
            Ok((socket, _)) => {
                info!("Realtime socket connected for {}", channel.topic);
                attempt = 0;
                match session(socket, &channel, &tx, &mut cancel).await {
                    SessionEnd::Cancelled => {
                        debug!("Realtime channel {} closed", channel.topic);
                        return;
                    }
                    SessionEnd::Disconnected(reason) => {
                        warn!("Realtime socket for {} dropped: {}", channel.topic, reason);
                    }
                }
            }
            Err(e) => warn!("Realtime connect for {} failed: {}", channel.topic, e),
        }

        let delay = backoff(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Reconnecting {} in {:?}", channel.topic, delay);
        tokio::select! {
            _ = &mut cancel => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    socket: Socket,
    channel: &ChannelSpec,
    tx: &mpsc::Sender<Change>,
    cancel: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut next_ref: u64 = 1;
    let mut frame = |topic: &str, event: &str, payload: Value| {
        let reference = next_ref.to_string();
        next_ref += 1;
        let frame = PhoenixFrame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
        };
        WsMessage::Text(serde_json::to_string(&frame).unwrap_or_default())
    };

    if let Err(e) = sink
        .send(frame(&channel.topic, "phx_join", channel.join_payload.clone()))
        .await
    {
        return SessionEnd::Disconnected(e.to_string());
    }

    let mut ticker = tokio::time::interval(channel.heartbeat);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut *cancel => {
                let _ = sink.send(frame(&channel.topic, "phx_leave", json!({}))).await;
                let _ = sink.close().await;
                return SessionEnd::Cancelled;
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(frame("phoenix", "heartbeat", json!({}))).await {
                    return SessionEnd::Disconnected(e.to_string());
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(change) = parse_change(&text) {
                        if tx.send(change).await.is_err() {
                            // Subscriber is gone
                            return SessionEnd::Cancelled;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(reason))) => {
                    return SessionEnd::Disconnected(format!("closed by server: {:?}", reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                None => return SessionEnd::Disconnected("stream ended".to_string()),
            }
        }
    }
}
