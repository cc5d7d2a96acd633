//! Shared test doubles: in-memory subscriber store, canned scorers, and
//! recording mock relays.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

use crate::feed::{ScoredPost, Scorer};
use crate::registry::{Subscriber, SubscriberStore};

/// In-memory subscriber store with the registry's ordering and paging
/// semantics.
#[derive(Default)]
pub struct MemoryStore {
    pub subscribers: Mutex<Vec<Subscriber>>,
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn get(&self, pubkey: &str) -> Result<Option<Subscriber>> {
        Ok(self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.pubkey == pubkey)
            .cloned())
    }

    async fn create(&self, pubkey: &str, channel_secret: &str, subscribed_at: u64) -> Result<()> {
        let mut subs = self.subscribers.lock().unwrap();
        if !subs.iter().any(|s| s.pubkey == pubkey) {
            subs.push(Subscriber {
                pubkey: pubkey.into(),
                channel_secret: channel_secret.into(),
                subscribed_at,
                unsubscribed_at: None,
            });
        }
        Ok(())
    }

    async fn delete(&self, pubkey: &str, unsubscribed_at: u64) -> Result<()> {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(s) = subs.iter_mut().find(|s| s.pubkey == pubkey) {
            s.unsubscribed_at = Some(unsubscribed_at);
        }
        Ok(())
    }

    async fn restore(&self, pubkey: &str, subscribed_at: u64) -> Result<bool> {
        let mut subs = self.subscribers.lock().unwrap();
        match subs.iter_mut().find(|s| s.pubkey == pubkey) {
            Some(s) if s.unsubscribed_at.is_some() => {
                s.unsubscribed_at = None;
                s.subscribed_at = subscribed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, limit: u64, skip: u64) -> Result<Vec<Subscriber>> {
        let mut subs = self.subscribers.lock().unwrap().clone();
        subs.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        Ok(subs
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .collect())
    }
}

/// Scorer that always returns an empty feed.
pub struct EmptyScorer;

#[async_trait]
impl Scorer for EmptyScorer {
    async fn get_feed(
        &self,
        _subscriber_pub: &str,
        _start: u64,
        _end: u64,
        _limit: u64,
    ) -> Result<Vec<ScoredPost>> {
        Ok(vec![])
    }
}

/// Relay that ACKs every published event and records the event payloads.
pub async fn recording_relay() -> (std::net::SocketAddr, Arc<Mutex<Vec<Value>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let frames_srv = frames.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let frames = frames_srv.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let val: Value = serde_json::from_str(&txt).unwrap();
                    if val[0] == "EVENT" {
                        let id = val[1]["id"].as_str().unwrap().to_string();
                        ws.send(TMsg::Text(json!(["OK", id, true, ""]).to_string()))
                            .await
                            .unwrap();
                        frames.lock().unwrap().push(val[1].clone());
                    }
                }
            });
        }
    });
    (addr, frames)
}
