//! Push worker pool: hourly batch cycles fanning out over subscribers.

use std::{sync::Arc, thread, time::Duration};

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event;
use crate::feed::FeedService;
use crate::keys;
use crate::registry::{Subscriber, SubscriberStore};
use crate::relay::Client;

/// Time window covered by each push.
pub const PUSH_INTERVAL: Duration = Duration::from_secs(3600);
/// Number of items per push.
pub const PUSH_SIZE: u64 = 5;

const PAGE_SIZE: u64 = 10;

/// Computes and publishes curated feeds for the main channel and every
/// active subscriber.
#[derive(Clone)]
pub struct Worker {
    client: Client,
    feed: FeedService,
    registry: Arc<dyn SubscriberStore>,
    bot_sk: String,
}

impl Worker {
    pub fn new(
        client: Client,
        feed: FeedService,
        registry: Arc<dyn SubscriberStore>,
        bot_sk: String,
    ) -> Self {
        Self {
            client,
            feed,
            registry,
            bot_sk,
        }
    }

    /// Start the hourly cron. Each tick runs a batch cycle as its own task,
    /// so a slow cycle may overlap the next tick rather than delay it.
    pub fn start(&self) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            info!("registered worker cron job at the top of every hour");
            loop {
                let wait = secs_until_next_hour(event::now() as i64);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                let w = worker.clone();
                tokio::spawn(async move {
                    info!("running cron job");
                    if let Err(e) = w.run().await {
                        error!(err = %e, "batch cycle failed");
                    }
                });
            }
        })
    }

    /// One batch cycle: update the main channel, then page through all
    /// subscribers, fanning each page out across the worker pool.
    pub async fn run(&self) -> Result<()> {
        if let Err(e) = self.update_main().await {
            error!(err = %e, "error occurs in main update");
        }

        let pool_size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let (tx, rx) = mpsc::channel::<Subscriber>(pool_size);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let rx = rx.clone();
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let subscriber = rx.lock().await.recv().await;
                    match subscriber {
                        Some(s) => {
                            if let Err(e) = worker
                                .push(&s.pubkey, &s.channel_secret, PUSH_INTERVAL, PUSH_SIZE, false)
                                .await
                            {
                                warn!(pubkey = %s.pubkey, err = %e,
                                      "failed to run worker for subscriber");
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        let mut skip = 0;
        loop {
            let page = match self.registry.list(PAGE_SIZE, skip).await {
                Ok(p) => p,
                Err(e) => {
                    error!(err = %e, "error occurs during batch execution");
                    break;
                }
            };
            let has_next = page.len() as u64 >= PAGE_SIZE;
            for subscriber in page {
                if !subscriber.is_active() {
                    info!(pubkey = %subscriber.pubkey, "skipping non subscriber");
                    continue;
                }
                if tx.send(subscriber).await.is_err() {
                    break;
                }
            }
            if !has_next {
                break;
            }
            skip += PAGE_SIZE;
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }

        info!("run finished");
        Ok(())
    }

    /// One subscriber page, pushed serially. Returns whether a further page
    /// may exist.
    pub async fn batch(&self, limit: u64, skip: u64) -> Result<bool> {
        info!(limit, skip, "running batch");
        let page = self.registry.list(limit, skip).await?;
        let has_next = page.len() as u64 >= limit;
        for subscriber in page {
            if !subscriber.is_active() {
                info!(pubkey = %subscriber.pubkey, "skipping non subscriber");
                continue;
            }
            if let Err(e) = self
                .push(
                    &subscriber.pubkey,
                    &subscriber.channel_secret,
                    PUSH_INTERVAL,
                    PUSH_SIZE,
                    false,
                )
                .await
            {
                warn!(pubkey = %subscriber.pubkey, err = %e, "failed to run worker for subscriber");
            }
        }
        Ok(has_next)
    }

    /// Refresh the main channel with the global trending feed, as reposts
    /// under the bot's own key.
    pub async fn update_main(&self) -> Result<()> {
        info!("updating main channel");
        self.push("", &self.bot_sk, PUSH_INTERVAL, PUSH_SIZE, true)
            .await
    }

    /// Compute one feed and publish it under the channel secret: either one
    /// repost per item, or a single quote event referencing every item.
    ///
    /// An empty feed is a success with a warning.
    pub async fn push(
        &self,
        subscriber_pub: &str,
        channel_sk: &str,
        range: Duration,
        limit: u64,
        use_repost: bool,
    ) -> Result<()> {
        let end = event::now();
        let start = end.saturating_sub(range.as_secs());
        debug!(subscriber_pub, start, end, limit, "computing feed for push");
        let feed = self.feed.get_feed(subscriber_pub, start, end, limit).await?;
        if feed.is_empty() {
            warn!(subscriber_pub, "got empty feed");
            return Ok(());
        }

        let channel_pub = keys::derive_pubkey(channel_sk)?;
        let event_ids: Vec<String> = feed.iter().map(|e| e.id.clone()).collect();

        if use_repost {
            for entry in &feed {
                if let Err(e) = self
                    .client
                    .repost(channel_sk, &entry.id, &entry.pubkey, &entry.raw)
                    .await
                {
                    warn!(channel_pub = %channel_pub, id = %entry.id, err = %e,
                          "failed to repost event");
                }
            }
        } else {
            let comment = format!("Here are the Top {} events curated for You", feed.len());
            if let Err(e) = self.client.quote(channel_sk, &comment, &event_ids).await {
                warn!(channel_pub = %channel_pub, err = %e, "failed to quote events");
            }
        }

        info!(subscriber_pub, channel_pub = %channel_pub, count = event_ids.len(), use_repost,
              "pushed feed");
        Ok(())
    }
}

/// Seconds from `now_ts` until the next top of the hour.
fn secs_until_next_hour(now_ts: i64) -> u64 {
    (3600 - now_ts.rem_euclid(3600)) as u64
}
