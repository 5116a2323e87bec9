//! Change-notification transport for the family channel.
//!
//! [`PhoenixRealtimeTransport`] speaks the Phoenix channel protocol over a
//! websocket: it joins `realtime:family:{id}` with postgres-change filters,
//! keeps the socket alive with heartbeats and reconnects with exponential
//! backoff until the subscription is dropped.

use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_rows::RemoteTable;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const CHANNEL_CAPACITY: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Tables whose changes concern the family view.
pub const WATCHED_TABLES: [RemoteTable; 4] = [
    RemoteTable::Profiles,
    RemoteTable::Children,
    RemoteTable::Tasks,
    RemoteTable::Rewards,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotification {
    pub table: RemoteTable,
    pub kind: ChangeKind,
}

pub fn channel_topic(family_id: &str) -> String {
    format!("realtime:family:{family_id}")
}

/// Live subscription. Dropping it stops the background connection.
pub struct RealtimeSubscription {
    pub receiver: mpsc::Receiver<ChangeNotification>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeSubscription {
    pub fn new(receiver: mpsc::Receiver<ChangeNotification>, task: Option<JoinHandle<()>>) -> Self {
        Self { receiver, task }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub trait RealtimeTransport: Send + Sync {
    fn subscribe(&self, family_id: &str) -> Result<RealtimeSubscription, InfraError>;
}

#[derive(Debug, Clone)]
pub struct PhoenixRealtimeTransport {
    socket_url: Url,
    access_token: Option<String>,
}

impl PhoenixRealtimeTransport {
    pub fn new(realtime_url: &str, api_key: &str) -> Result<Self, InfraError> {
        let mut socket_url = Url::parse(realtime_url.trim()).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid realtime url: {error}"))
        })?;
        match socket_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(InfraError::InvalidConfig(format!(
                    "realtime url must use ws or wss, got {other}"
                )));
            }
        }
        {
            let mut segments = socket_url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("realtime url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("realtime");
            segments.push("v1");
            segments.push("websocket");
        }
        socket_url
            .query_pairs_mut()
            .append_pair("apikey", api_key.trim())
            .append_pair("vsn", "1.0.0");
        Ok(Self {
            socket_url,
            access_token: None,
        })
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into()).filter(|token| !token.trim().is_empty());
        self
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }
}

impl RealtimeTransport for PhoenixRealtimeTransport {
    fn subscribe(&self, family_id: &str) -> Result<RealtimeSubscription, InfraError> {
        let family_id = family_id.trim();
        if family_id.is_empty() {
            return Err(InfraError::Realtime(
                "family id must not be empty".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            InfraError::Realtime(format!("realtime subscription needs a tokio runtime: {error}"))
        })?;

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let join = join_message(family_id, self.access_token.as_deref());
        let url = self.socket_url.to_string();
        let task = runtime.spawn(async move {
            connection_loop(url, join, sender).await;
        });
        Ok(RealtimeSubscription::new(receiver, Some(task)))
    }
}

fn join_message(family_id: &str, access_token: Option<&str>) -> Value {
    let family_filter = format!("family_id=eq.{family_id}");
    let changes = WATCHED_TABLES
        .iter()
        .map(|table| match table {
            RemoteTable::Profiles | RemoteTable::Children => json!({
                "event": "*",
                "schema": "public",
                "table": table.as_str(),
                "filter": family_filter,
            }),
            _ => json!({
                "event": "*",
                "schema": "public",
                "table": table.as_str(),
            }),
        })
        .collect::<Vec<_>>();

    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": changes,
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": channel_topic(family_id),
        "event": "phx_join",
        "payload": payload,
        "ref": "1",
    })
}

fn heartbeat_message(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct PhoenixFrame {
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Extracts a change from an inbound frame; anything else is `None`.
fn parse_change(text: &str) -> Option<ChangeNotification> {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            debug!("ignoring unparseable realtime frame: {error}");
            return None;
        }
    };
    if frame.event == "phx_reply" {
        let status = frame.payload["status"].as_str().unwrap_or_default();
        if status != "ok" {
            warn!("realtime join replied with status '{status}'");
        }
        return None;
    }
    if frame.event != "postgres_changes" {
        return None;
    }
    let data = &frame.payload["data"];
    let table = data["table"].as_str().and_then(RemoteTable::parse)?;
    let kind = data["type"]
        .as_str()
        .or_else(|| data["eventType"].as_str())
        .and_then(ChangeKind::parse)?;
    Some(ChangeNotification { table, kind })
}

async fn connection_loop(url: String, join: Value, sender: mpsc::Sender<ChangeNotification>) {
    let mut attempt: u32 = 0;

    loop {
        match try_connect(&url, &join, &sender).await {
            Ok(()) => {
                debug!("realtime listener closed");
                break;
            }
            Err(error) => {
                if sender.is_closed() {
                    break;
                }
                warn!("realtime connection failed (attempt {attempt}): {error}");
                attempt = attempt.saturating_add(1);
                let delay = BASE_RECONNECT_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt.min(6)))
                    .min(MAX_RECONNECT_DELAY);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Single connection lifetime. `Ok(())` means the receiving side went away.
async fn try_connect(
    url: &str,
    join: &Value,
    sender: &mpsc::Sender<ChangeNotification>,
) -> Result<(), String> {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|error| format!("connect: {error}"))?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(join.to_string()))
        .await
        .map_err(|error| format!("send join: {error}"))?;
    info!("joined realtime channel {}", join["topic"]);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut reference: u64 = 1;

    loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(change) = parse_change(&text) {
                            match sender.try_send(change) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    debug!("realtime queue full; change folded into pending refresh");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err("connection closed by server".to_string());
                    }
                    Some(Err(error)) => return Err(format!("read error: {error}")),
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                reference = reference.wrapping_add(1);
                if let Err(error) = write.send(Message::Text(heartbeat_message(reference).to_string())).await {
                    return Err(format!("heartbeat error: {error}"));
                }
            }
            _ = sender.closed() => return Ok(()),
        }
    }
}

/// Transport double: tests push notifications with [`emit`](Self::emit).
#[derive(Default)]
pub struct InMemoryRealtimeTransport {
    subscribers: Mutex<Vec<(String, mpsc::Sender<ChangeNotification>)>>,
    subscribed_families: Mutex<Vec<String>>,
}

impl InMemoryRealtimeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers to every live subscriber of the family; returns how many got it.
    pub fn emit(&self, family_id: &str, change: ChangeNotification) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|(_, sender)| !sender.is_closed());
        subscribers
            .iter()
            .filter(|(id, _)| id == family_id)
            .filter(|(_, sender)| sender.try_send(change).is_ok())
            .count()
    }

    pub fn live_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, sender)| !sender.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn subscribed_families(&self) -> Vec<String> {
        self.subscribed_families
            .lock()
            .map(|families| families.clone())
            .unwrap_or_default()
    }
}

impl RealtimeTransport for InMemoryRealtimeTransport {
    fn subscribe(&self, family_id: &str) -> Result<RealtimeSubscription, InfraError> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .map_err(|error| InfraError::StateLock(format!("subscriber: {error}")))?
            .push((family_id.to_string(), sender));
        self.subscribed_families
            .lock()
            .map_err(|error| InfraError::StateLock(format!("subscriber: {error}")))?
            .push(family_id.to_string());
        Ok(RealtimeSubscription::new(receiver, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_carries_api_key_and_protocol_version() {
        let transport = PhoenixRealtimeTransport::new("wss://family.example.com", "anon")
            .expect("valid transport");
        assert_eq!(
            transport.socket_url().as_str(),
            "wss://family.example.com/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(PhoenixRealtimeTransport::new("https://family.example.com", "anon").is_err());
    }

    #[test]
    fn join_message_filters_family_tables_only() {
        let join = join_message("fam-9", Some("token"));
        assert_eq!(join["topic"], "realtime:family:fam-9");
        assert_eq!(join["event"], "phx_join");
        assert_eq!(join["payload"]["access_token"], "token");

        let changes = join["payload"]["config"]["postgres_changes"]
            .as_array()
            .expect("changes array");
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[1]["table"], "children");
        assert_eq!(changes[1]["filter"], "family_id=eq.fam-9");
        assert!(changes[2].get("filter").is_none());
    }

    #[test]
    fn parse_change_reads_postgres_change_frames() {
        let frame = r#"{"topic":"realtime:family:fam","event":"postgres_changes","payload":{"data":{"table":"tasks","type":"UPDATE","record":{}}},"ref":null}"#;
        assert_eq!(
            parse_change(frame),
            Some(ChangeNotification {
                table: RemoteTable::Tasks,
                kind: ChangeKind::Update,
            })
        );
        assert_eq!(
            parse_change(r#"{"event":"phx_reply","payload":{"status":"ok"}}"#),
            None
        );
        assert_eq!(parse_change("not json"), None);
    }

    #[tokio::test]
    async fn in_memory_transport_routes_by_family_and_forgets_dropped() {
        let transport = InMemoryRealtimeTransport::new();
        let mut first = transport.subscribe("fam-a").expect("subscribe");
        let second = transport.subscribe("fam-b").expect("subscribe");
        let change = ChangeNotification {
            table: RemoteTable::Children,
            kind: ChangeKind::Insert,
        };

        assert_eq!(transport.emit("fam-a", change), 1);
        assert_eq!(first.receiver.recv().await, Some(change));

        drop(second);
        assert_eq!(transport.emit("fam-b", change), 0);
        assert_eq!(transport.live_subscribers(), 1);
    }
}
