//! Multi-relay ingest engine.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::CrawlerSettings;
use crate::event::{self, Event};
use crate::mapper::Mapper;
use crate::relay::{Client, Filter};

/// Event kinds the curator ingests.
pub const INGEST_KINDS: [u32; 5] = [1, 3, 6, 7, 9735];

/// Interval after which a relay subscription is torn down and re-opened to
/// defend against silent socket-level stalls.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3600);

/// Backfill cap applied on periodic re-opens.
const RESUBSCRIBE_LIMIT: u64 = 100;

/// Destination for ingested events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn store_event(&self, ev: &Event) -> Result<()>;
}

#[async_trait]
impl EventSink for Mapper {
    async fn store_event(&self, ev: &Event) -> Result<()> {
        Mapper::store_event(self, ev).await
    }
}

/// Drives one ingest subscription per configured relay.
#[derive(Clone)]
pub struct Crawler {
    client: Client,
    sink: Arc<dyn EventSink>,
    settings: CrawlerSettings,
}

impl Crawler {
    pub fn new(client: Client, sink: Arc<dyn EventSink>, settings: CrawlerSettings) -> Self {
        Self {
            client,
            sink,
            settings,
        }
    }

    /// Spawn an independent ingest task for each configured relay.
    pub fn run(&self) {
        for url in self.client.urls().to_vec() {
            let client = self.client.clone();
            let sink = self.sink.clone();
            let since_offset = self.settings.since_offset;
            let limit = self.settings.limit;
            tokio::spawn(async move {
                ingest_relay(client, sink, url, since_offset, limit, RECONNECT_INTERVAL).await;
            });
        }
    }
}

/// Backfill filter for the first subscription on a relay.
fn initial_filter(since_offset: u64, limit: u64) -> Filter {
    Filter {
        kinds: INGEST_KINDS.to_vec(),
        since: Some(event::now().saturating_sub(since_offset)),
        limit: if limit > 0 { Some(limit) } else { None },
        ..Default::default()
    }
}

/// Filter used on periodic re-opens: from now, with a small cap.
fn reopen_filter() -> Filter {
    Filter {
        kinds: INGEST_KINDS.to_vec(),
        since: Some(event::now()),
        limit: Some(RESUBSCRIBE_LIMIT),
        ..Default::default()
    }
}

/// Consume one relay's subscription, handing every event to the sink.
///
/// Errors from the sink are logged and the stream continues. The
/// subscription is re-opened every `reconnect_interval` with `since = now`.
async fn ingest_relay(
    client: Client,
    sink: Arc<dyn EventSink>,
    url: String,
    since_offset: u64,
    limit: u64,
    reconnect_interval: Duration,
) {
    let mut first = true;
    loop {
        let filter = if first {
            initial_filter(since_offset, limit)
        } else {
            reopen_filter()
        };
        first = false;

        info!(uri = %url, "opening ingest subscription");
        let mut rx = client.subscribe_url(&url, filter);
        let deadline = tokio::time::sleep(reconnect_interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(ev) => {
                        debug!(id = %ev.id, kind = ev.kind, created_at = ev.created_at,
                               "received event");
                        if let Err(e) = sink.store_event(&ev).await {
                            error!(id = %ev.id, err = %e, "error storing event");
                        }
                    }
                    // The producer gave up on this relay; wait out the
                    // interval before trying a fresh subscription.
                    None => {
                        deadline.as_mut().await;
                        break;
                    }
                },
                _ = &mut deadline => break,
            }
        }
        // Dropping the receiver closes the underlying subscription.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn store_event(&self, ev: &Event) -> Result<()> {
            self.0.lock().unwrap().push(ev.clone());
            Ok(())
        }
    }

    /// A sink that fails on every event.
    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn store_event(&self, _ev: &Event) -> Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    fn sample_event(id: &str, kind: u32) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind,
            created_at: 1,
            tags: vec![Tag::new(&["t", "x"])],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn initial_filter_carries_backfill_window() {
        let f = initial_filter(3600, 100);
        assert_eq!(f.kinds, INGEST_KINDS.to_vec());
        let since = f.since.unwrap();
        let expect = event::now() - 3600;
        assert!(since >= expect - 2 && since <= expect + 2);
        assert_eq!(f.limit, Some(100));
        // Zero limit means uncapped.
        assert_eq!(initial_filter(0, 0).limit, None);
    }

    #[test]
    fn reopen_filter_starts_from_now() {
        let f = reopen_filter();
        let since = f.since.unwrap();
        assert!(since + 2 >= event::now());
        assert_eq!(f.limit, Some(RESUBSCRIBE_LIMIT));
    }

    #[tokio::test]
    async fn ingest_stores_received_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // The REQ must restrict kinds to the ingest set.
            if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                let v: Value = serde_json::from_str(&txt).unwrap();
                assert_eq!(v[2]["kinds"], json!([1, 3, 6, 7, 9735]));
                assert!(v[2]["since"].is_number());
            }
            for ev in [sample_event("aa11", 1), sample_event("bb22", 7)] {
                ws.send(TMsg::Text(json!(["EVENT", "curatr", ev]).to_string()))
                    .await
                    .unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let client = Client::new(vec![]);
        let sink = Arc::new(RecordingSink::default());
        let url = format!("ws://{}", addr);
        let task = {
            let sink = sink.clone();
            tokio::spawn(async move {
                ingest_relay(client, sink, url, 60, 10, Duration::from_secs(600)).await;
            })
        };

        // Wait for both events to land.
        for _ in 0..100 {
            if sink.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();
        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "aa11");
        assert_eq!(events[1].id, "bb22");
    }

    #[tokio::test]
    async fn ingest_continues_after_sink_errors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            for ev in [sample_event("aa11", 1), sample_event("bb22", 1)] {
                ws.send(TMsg::Text(json!(["EVENT", "curatr", ev]).to_string()))
                    .await
                    .unwrap();
            }
            let _ = done_tx.send(());
            while ws.next().await.is_some() {}
        });

        let client = Client::new(vec![]);
        let url = format!("ws://{}", addr);
        let task = tokio::spawn(async move {
            ingest_relay(
                client,
                Arc::new(FailingSink),
                url,
                60,
                0,
                Duration::from_secs(600),
            )
            .await;
        });
        // The loop must survive both failing events without panicking.
        done_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn ingest_reopens_subscription_after_interval() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (reqs_tx, mut reqs_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let reqs_tx = reqs_tx.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                        let v: Value = serde_json::from_str(&txt).unwrap();
                        let _ = reqs_tx.send(v);
                    }
                    while ws.next().await.is_some() {}
                });
            }
        });

        let client = Client::new(vec![]);
        let sink = Arc::new(RecordingSink::default());
        let url = format!("ws://{}", addr);
        let task = tokio::spawn(async move {
            ingest_relay(client, sink, url, 3600, 500, Duration::from_millis(100)).await;
        });

        let first = reqs_rx.recv().await.unwrap();
        let second = reqs_rx.recv().await.unwrap();
        task.abort();
        // Initial subscription backfills with the configured cap; the re-open
        // starts from now with the small fixed cap.
        assert_eq!(first[2]["limit"], 500);
        assert_eq!(second[2]["limit"], RESUBSCRIBE_LIMIT);
        let first_since = first[2]["since"].as_u64().unwrap();
        let second_since = second[2]["since"].as_u64().unwrap();
        assert!(second_since >= first_since + 3000);
    }
}
