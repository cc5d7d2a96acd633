//! Command listener: routes `#subscribe` / `#unsubscribe` mentions into
//! subscription lifecycle transitions.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::BotSettings;
use crate::event::{self, Event};
use crate::keys;
use crate::registry::SubscriberStore;
use crate::relay::{Client, Filter, RelayInfo};
use crate::worker::{Worker, PUSH_INTERVAL, PUSH_SIZE};

const WELCOME_MESSAGE: &str =
    "Hello, #[0]! Your curator is ready, follow: #[1] to fetch your own feed.";

/// The bot identity: listens for commands under its own key and issues
/// channel identities to subscribers.
#[derive(Clone)]
pub struct Bot {
    client: Client,
    registry: Arc<dyn SubscriberStore>,
    worker: Worker,
    settings: BotSettings,
    crawler_relays: Vec<String>,
    pubkey: String,
}

impl Bot {
    pub fn new(
        client: Client,
        registry: Arc<dyn SubscriberStore>,
        worker: Worker,
        settings: BotSettings,
        crawler_relays: Vec<String>,
    ) -> Result<Self> {
        let pubkey = keys::derive_pubkey(&settings.sk)?;
        Ok(Self {
            client,
            registry,
            worker,
            settings,
            crawler_relays,
            pubkey,
        })
    }

    /// Hex public key of the bot identity.
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Publish the bot profile under its own key.
    pub async fn publish_profile(&self) -> Result<()> {
        info!(pubkey = %self.pubkey, "publishing account metadata");
        let relays = self.recommended_relay_list();
        self.client
            .metadata(
                &self.settings.sk,
                &self.settings.name,
                &self.settings.about,
                &self.settings.picture,
                &self.settings.nip05,
                &relays,
            )
            .await
    }

    /// Publish the profile and open the command subscription: kind-1 events
    /// mentioning the bot, from now on.
    pub async fn listen(&self) -> mpsc::UnboundedReceiver<Event> {
        if let Err(e) = self.publish_profile().await {
            error!(err = %e, "failed to set account metadata");
        }
        info!(pubkey = %self.pubkey, "listening for subscription commands");
        self.client.subscribe(Filter {
            kinds: vec![1],
            since: Some(event::now()),
            p_tags: vec![self.pubkey.clone()],
            ..Default::default()
        })
    }

    /// Consume the command stream until it closes.
    pub async fn run(&self) {
        let mut rx = self.listen().await;
        while let Some(ev) = rx.recv().await {
            self.handle_command(&ev).await;
        }
        info!("bot exiting");
    }

    /// Scan a mentioning event for command tokens.
    pub async fn handle_command(&self, ev: &Event) {
        info!(content = %ev.content, pubkey = %ev.pubkey, "received mentioning event");
        if ev.content.contains("#subscribe") {
            self.handle_subscribe(&ev.pubkey).await;
        } else if ev.content.contains("#unsubscribe") {
            warn!(pubkey = %ev.pubkey, "unsubscribing");
            if let Err(e) = self.terminate_subscription(&ev.pubkey).await {
                warn!(pubkey = %ev.pubkey, err = %e, "failed to terminate subscription");
            }
        }
    }

    async fn handle_subscribe(&self, subscriber_pub: &str) {
        info!(pubkey = subscriber_pub, "preparing channel");
        let (channel_sk, is_new) = match self.get_or_create_subscription(subscriber_pub).await {
            Ok(v) => v,
            Err(e) => {
                warn!(pubkey = subscriber_pub, err = %e, "failed to create channel");
                return;
            }
        };

        if is_new {
            match self.send_welcome(&channel_sk, subscriber_pub).await {
                Ok(()) => info!(pubkey = subscriber_pub, "sent welcome message to new subscriber"),
                Err(e) => {
                    error!(pubkey = subscriber_pub, err = %e, "failed to send welcome message")
                }
            }
        } else {
            match self.restore_subscription(subscriber_pub).await {
                Ok(true) => {
                    info!(pubkey = subscriber_pub, "sending welcome message to returning subscriber");
                    if let Err(e) = self.send_welcome(&channel_sk, subscriber_pub).await {
                        warn!(pubkey = subscriber_pub, err = %e,
                              "failed to send welcome message to returning subscriber");
                    }
                }
                Ok(false) => {
                    info!(pubkey = subscriber_pub, "skip welcome message for existing subscriber")
                }
                Err(e) => warn!(pubkey = subscriber_pub, err = %e, "failed to restore subscription"),
            }
        }

        // Prime the subscriber's feed regardless of how they arrived.
        if let Err(e) = self
            .worker
            .push(subscriber_pub, &channel_sk, PUSH_INTERVAL, PUSH_SIZE, false)
            .await
        {
            error!(pubkey = subscriber_pub, err = %e, "failed to prepare initial content");
        }
    }

    /// Look up the subscriber's channel secret, issuing a fresh channel
    /// identity when the subscriber is unknown. Returns the secret and
    /// whether it was newly issued.
    pub async fn get_or_create_subscription(&self, subscriber_pub: &str) -> Result<(String, bool)> {
        if let Some(subscriber) = self.registry.get(subscriber_pub).await? {
            info!(pubkey = subscriber_pub, "found existing subscriber");
            return Ok((subscriber.channel_secret, false));
        }
        info!(pubkey = subscriber_pub, "creating new subscriber");
        let channel_sk = self.create_subscription(subscriber_pub).await?;
        Ok((channel_sk, true))
    }

    async fn create_subscription(&self, subscriber_pub: &str) -> Result<String> {
        let channel_sk = keys::generate_secret_key();
        self.registry
            .create(subscriber_pub, &channel_sk, event::now())
            .await?;

        // Give the channel identity a profile of its own.
        let npub = keys::encode_npub(subscriber_pub).unwrap_or_default();
        let main_npub = keys::encode_npub(&self.pubkey).unwrap_or_default();
        let about = fill_template(&self.settings.channel_about, &npub, &main_npub);
        let relays = self.recommended_relay_list();
        self.client
            .metadata(
                &channel_sk,
                &self.settings.channel_name,
                &about,
                &self.settings.channel_picture,
                "",
                &relays,
            )
            .await?;

        Ok(channel_sk)
    }

    pub async fn terminate_subscription(&self, subscriber_pub: &str) -> Result<()> {
        self.registry.delete(subscriber_pub, event::now()).await
    }

    pub async fn restore_subscription(&self, subscriber_pub: &str) -> Result<bool> {
        self.registry.restore(subscriber_pub, event::now()).await
    }

    /// Mention the subscriber and their new channel from the bot identity.
    pub async fn send_welcome(&self, channel_sk: &str, receiver_pub: &str) -> Result<()> {
        let channel_pub = keys::derive_pubkey(channel_sk)?;
        self.client
            .mention(
                &self.settings.sk,
                WELCOME_MESSAGE,
                &[receiver_pub.to_string(), channel_pub],
            )
            .await
    }

    /// Union of bot and crawl relays, tagged by which lists they appear in:
    /// both lists means no specific purpose, bot-only is "write", crawl-only
    /// is "read".
    pub fn recommended_relay_list(&self) -> Vec<RelayInfo> {
        let mut relays = Vec::new();
        for r in &self.settings.relays {
            let purpose = if self.crawler_relays.contains(r) {
                ""
            } else {
                "write"
            };
            relays.push(RelayInfo {
                url: r.clone(),
                purpose: purpose.into(),
            });
        }
        for r in &self.crawler_relays {
            if !self.settings.relays.contains(r) {
                relays.push(RelayInfo {
                    url: r.clone(),
                    purpose: "read".into(),
                });
            }
        }
        relays
    }
}

/// Fill the first two `%s` slots of a template.
fn fill_template(template: &str, first: &str, second: &str) -> String {
    template.replacen("%s", first, 1).replacen("%s", second, 1)
}
