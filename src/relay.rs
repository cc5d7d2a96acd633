//! Multi-relay protocol client: pooled connections, merged subscriptions,
//! broadcast publishing, and event composition helpers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::event::{self, Event, Tag};
use crate::keys;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_RECONNECTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(30);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription filter sent in `REQ` frames.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kinds: Vec<u32>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    /// `#p` tag values.
    pub p_tags: Vec<String>,
}

impl Filter {
    /// Build the filter JSON object.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::from(*k)).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::from(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::from(limit));
        }
        if !self.p_tags.is_empty() {
            map.insert(
                "#p".into(),
                Value::Array(self.p_tags.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(map)
    }
}

/// A relay URL with its recommended purpose ("read", "write" or "").
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelayInfo {
    pub url: String,
    pub purpose: String,
}

/// Per-relay outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PublishStatus {
    /// Relay acknowledged the event.
    Accepted,
    /// Relay acknowledged with a rejection.
    Rejected,
    /// Frame was sent but no acknowledgement arrived in time.
    Sent,
    /// The frame could not be delivered at all.
    Failed,
}

/// Client over a fixed set of relays.
///
/// Connections are opened lazily. Subscriptions each own a dedicated
/// connection per relay (reconnected in place); publishes share pooled
/// connections guarded by a mutex.
#[derive(Clone)]
pub struct Client {
    urls: Vec<String>,
    pool: Arc<Mutex<HashMap<String, Ws>>>,
    reconnect_delay: Duration,
}

impl Client {
    /// Create a client for the given relay URLs.
    pub fn new(urls: Vec<String>) -> Self {
        Self::with_reconnect_delay(urls, RECONNECT_DELAY)
    }

    /// Create a client with a custom reconnect backoff.
    pub fn with_reconnect_delay(urls: Vec<String>, reconnect_delay: Duration) -> Self {
        Self {
            urls,
            pool: Arc::new(Mutex::new(HashMap::new())),
            reconnect_delay,
        }
    }

    /// Relay URLs this client talks to.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Open a subscription on every relay and merge the event streams.
    ///
    /// Dropping the receiver cancels every underlying subscription.
    pub fn subscribe(&self, filter: Filter) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        for url in &self.urls {
            spawn_producer(url.clone(), filter.clone(), tx.clone(), self.reconnect_delay);
        }
        rx
    }

    /// Open a subscription on a single relay.
    pub fn subscribe_url(&self, url: &str, filter: Filter) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_producer(url.to_string(), filter, tx, self.reconnect_delay);
        rx
    }

    /// Broadcast a signed event to every relay.
    ///
    /// Each relay gets at most one reconnect-and-resend on failure. Returns
    /// `Ok` when at least one relay accepted the event.
    pub async fn publish(&self, ev: &Event) -> Result<()> {
        let mut accepted = 0;
        for url in self.urls.clone() {
            let status = self.publish_to(&url, ev).await;
            match status {
                PublishStatus::Accepted => {
                    debug!(uri = %url, id = %ev.id, "published event to relay");
                    accepted += 1;
                }
                PublishStatus::Rejected => {
                    warn!(uri = %url, id = %ev.id, "relay rejected event");
                }
                PublishStatus::Sent => {
                    warn!(uri = %url, id = %ev.id, "event may or may not have reached relay");
                }
                PublishStatus::Failed => {
                    warn!(uri = %url, id = %ev.id, "failed to publish event to relay");
                }
            }
        }
        if accepted == 0 {
            return Err(anyhow!("no relay accepted event {}", ev.id));
        }
        Ok(())
    }

    async fn publish_to(&self, url: &str, ev: &Event) -> PublishStatus {
        let conn = self.take_conn(url);
        let mut conn = match conn {
            Some(c) => c,
            None => match connect(url).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(uri = %url, err = %e, "connect for publish failed");
                    return PublishStatus::Failed;
                }
            },
        };

        match publish_on(&mut conn, ev).await {
            Ok(status) => {
                self.put_conn(url, conn);
                return status;
            }
            Err(e) => {
                debug!(uri = %url, id = %ev.id, err = %e, "publish failed, reconnecting once");
            }
        }

        // One reconnect-and-resend per relay.
        let mut conn = match connect(url).await {
            Ok(c) => c,
            Err(e) => {
                debug!(uri = %url, err = %e, "reconnect for publish failed");
                return PublishStatus::Failed;
            }
        };
        match publish_on(&mut conn, ev).await {
            Ok(status) => {
                self.put_conn(url, conn);
                status
            }
            Err(e) => {
                debug!(uri = %url, id = %ev.id, err = %e, "resend failed");
                PublishStatus::Failed
            }
        }
    }

    fn take_conn(&self, url: &str) -> Option<Ws> {
        self.pool.lock().unwrap().remove(url)
    }

    fn put_conn(&self, url: &str, conn: Ws) {
        self.pool.lock().unwrap().insert(url.to_string(), conn);
    }

    /// Publish a kind-6 repost of an event, carrying the raw original as body.
    pub async fn repost(&self, sk: &str, event_id: &str, author_pub: &str, raw: &str) -> Result<()> {
        let note = keys::encode_note(event_id).unwrap_or_default();
        debug!(event_id, note, author_pub, "reposting event");
        let tags = vec![
            Tag::new(&["e", event_id, "", "mention"]),
            Tag::new(&["p", author_pub]),
        ];
        let ev = event::sign(sk, 6, tags, raw.to_string())?;
        self.publish(&ev).await
    }

    /// Publish a kind-1 quote: a comment plus short references to event ids.
    pub async fn quote(&self, sk: &str, comment: &str, event_ids: &[String]) -> Result<()> {
        let mut content = comment.to_string();
        let mut tags = Vec::new();
        for id in event_ids {
            content.push_str("\nnostr:");
            content.push_str(&keys::encode_note(id)?);
            tags.push(Tag::new(&["e", id.as_str(), "", "mention"]));
        }
        let ev = event::sign(sk, 1, tags, content)?;
        self.publish(&ev).await
    }

    /// Publish a kind-1 note mentioning the given public keys.
    pub async fn mention(&self, sk: &str, msg: &str, mentions: &[String]) -> Result<()> {
        let tags = mentions
            .iter()
            .map(|m| Tag::new(&["p", m.as_str(), "", "mention"]))
            .collect();
        let ev = event::sign(sk, 1, tags, msg.to_string())?;
        self.publish(&ev).await
    }

    /// Publish a kind-0 profile for the key, with a recommended relay list.
    pub async fn metadata(
        &self,
        sk: &str,
        name: &str,
        about: &str,
        picture: &str,
        nip05: &str,
        relays: &[RelayInfo],
    ) -> Result<()> {
        let mut content = serde_json::Map::new();
        content.insert("name".into(), Value::String(name.into()));
        content.insert("username".into(), Value::String(name.into()));
        content.insert("display_name".into(), Value::String(name.into()));
        content.insert("about".into(), Value::String(about.into()));
        content.insert("picture".into(), Value::String(picture.into()));
        if !nip05.is_empty() {
            content.insert("nip05".into(), Value::String(nip05.into()));
        }
        if !relays.is_empty() {
            content.insert("relays".into(), serde_json::to_value(relays)?);
        }
        let body = serde_json::to_string(&Value::Object(content))?;
        let ev = event::sign(sk, 0, vec![], body)?;
        self.publish(&ev).await
    }

    /// Send a kind-4 encrypted direct message.
    pub async fn send_message(&self, sk: &str, receiver_pub: &str, msg: &str) -> Result<()> {
        let content = keys::nip04_encrypt(sk, receiver_pub, msg)?;
        let tags = vec![Tag::new(&["p", receiver_pub])];
        let ev = event::sign(sk, 4, tags, content)?;
        self.publish(&ev).await
    }
}

/// Connect to a relay over ws or wss.
async fn connect(url: &str) -> Result<Ws> {
    let (ws, _) = connect_async(url).await?;
    Ok(ws)
}

/// Connect and send the subscription request.
async fn open_subscription(url: &str, filter: &Filter) -> Result<Ws> {
    let mut ws = connect(url).await?;
    let req = json!(["REQ", "curatr", filter.to_value()]);
    ws.send(Message::Text(req.to_string())).await?;
    Ok(ws)
}

/// Spawn the producer task feeding one relay's events into the merged channel.
///
/// The task reconnects and resubscribes on failure, giving up on this relay
/// after `MAX_RECONNECTS` consecutive failed attempts. It exits silently when
/// the receiving side is gone.
fn spawn_producer(
    url: String,
    filter: Filter,
    tx: mpsc::UnboundedSender<Event>,
    reconnect_delay: Duration,
) {
    tokio::spawn(async move {
        'relay: loop {
            let mut ws = {
                let mut attempt = 0;
                loop {
                    if tx.is_closed() {
                        return;
                    }
                    match open_subscription(&url, &filter).await {
                        Ok(ws) => break ws,
                        Err(e) => {
                            attempt += 1;
                            if attempt >= MAX_RECONNECTS {
                                warn!(uri = %url, err = %e, "failed to reconnect to relay, dropping");
                                return;
                            }
                            debug!(uri = %url, err = %e, attempt, "failed to connect to relay, retrying");
                            tokio::time::sleep(reconnect_delay).await;
                        }
                    }
                }
            };
            info!(uri = %url, "subscribed to relay");

            loop {
                let msg = tokio::select! {
                    msg = ws.next() => msg,
                    // Consumer cancelled the subscription; drop the socket.
                    _ = tx.closed() => return,
                };
                match msg {
                    Some(Ok(Message::Text(txt))) => {
                        if let Some(ev) = parse_event_frame(&txt, &url) {
                            if tx.send(ev).is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(uri = %url, "relay closed connection");
                        continue 'relay;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(uri = %url, err = %e, "relay connection error, reconnecting");
                        continue 'relay;
                    }
                    None => {
                        debug!(uri = %url, "relay stream ended, reconnecting");
                        continue 'relay;
                    }
                }
            }
        }
    });
}

/// Extract an event from an incoming relay frame; notices are logged and
/// dropped, anything else is ignored.
fn parse_event_frame(txt: &str, url: &str) -> Option<Event> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => serde_json::from_value(arr[2].clone()).ok(),
        Some("NOTICE") => {
            warn!(uri = %url, notice = %arr.get(1).cloned().unwrap_or_default(), "relay notice");
            None
        }
        _ => None,
    }
}

/// Send an event frame and wait for the relay's acknowledgement.
async fn publish_on(conn: &mut Ws, ev: &Event) -> Result<PublishStatus> {
    let frame = json!(["EVENT", ev]).to_string();
    conn.send(Message::Text(frame)).await?;

    let ack = tokio::time::timeout(ACK_TIMEOUT, async {
        while let Some(msg) = conn.next().await {
            match msg? {
                Message::Text(txt) => {
                    if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                        if let Some(arr) = val.as_array() {
                            if arr.first().and_then(|v| v.as_str()) == Some("OK")
                                && arr.get(1).and_then(|v| v.as_str()) == Some(ev.id.as_str())
                            {
                                let ok = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                                return Ok(if ok {
                                    PublishStatus::Accepted
                                } else {
                                    PublishStatus::Rejected
                                });
                            }
                        }
                    }
                }
                Message::Close(_) => return Err(anyhow!("connection closed")),
                _ => {}
            }
        }
        Err(anyhow!("stream ended before acknowledgement"))
    })
    .await;

    match ack {
        Ok(result) => result,
        Err(_) => Ok(PublishStatus::Sent),
    }
}
