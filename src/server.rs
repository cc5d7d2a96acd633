//! Administration HTTP surface and `.well-known` name lookup.

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::bot::Bot;
use crate::event;
use crate::feed::FeedService;
use crate::registry::SubscriberStore;
use crate::worker::{Worker, PUSH_INTERVAL};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub feed: FeedService,
    pub worker: Worker,
    pub bot: Bot,
    pub registry: Arc<dyn SubscriberStore>,
    /// NIP-05 local part served by the name lookup endpoint.
    pub bot_name: String,
}

impl AppState {
    pub fn new(
        feed: FeedService,
        worker: Worker,
        bot: Bot,
        registry: Arc<dyn SubscriberStore>,
        bot_name: &str,
    ) -> Self {
        // "name@domain" profiles expose only the local part.
        let bot_name = bot_name.split('@').next().unwrap_or_default().to_string();
        Self {
            feed,
            worker,
            bot,
            registry,
            bot_name,
        }
    }
}

/// `{success, data}` envelope used by the operational endpoints.
#[derive(Serialize, Deserialize)]
struct Envelope {
    success: bool,
    data: Value,
}

fn respond(success: bool, data: impl Serialize) -> Json<Envelope> {
    Json(Envelope {
        success,
        data: serde_json::to_value(data).unwrap_or_default(),
    })
}

/// `{status, data}` envelope used by the public recommendations API.
#[derive(Serialize, Deserialize)]
struct ApiEnvelope {
    status: String,
    data: Value,
}

fn api_respond(success: bool, data: impl Serialize) -> Json<ApiEnvelope> {
    Json(ApiEnvelope {
        status: if success { "success" } else { "error" }.into(),
        data: serde_json::to_value(data).unwrap_or_default(),
    })
}

/// Start the administration HTTP server.
pub async fn serve_http(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/feed", get(feed))
        .route("/push", get(push))
        .route("/batch", get(batch))
        .route("/run", get(run))
        .route("/subscribe", get(subscribe))
        .route("/api/v1/recommendations/trends", get(trends))
        .route("/.well-known/nostr.json", get(nostr_json))
        .with_state(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Deserialize)]
struct FeedParams {
    #[serde(default)]
    pubkey: String,
}

/// Last-hour feed for a pubkey (or the global feed when absent).
async fn feed(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FeedParams>,
) -> impl IntoResponse {
    let end = event::now();
    let start = end.saturating_sub(PUSH_INTERVAL.as_secs());
    match state.feed.get_feed(&params.pubkey, start, end, 10).await {
        Ok(entries) => respond(true, entries),
        Err(e) => respond(false, e.to_string()),
    }
}

#[derive(Deserialize)]
struct PushParams {
    #[serde(default)]
    pubkey: String,
    #[serde(rename = "useRepost")]
    use_repost: Option<bool>,
}

/// Trigger one push for one subscriber.
async fn push(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<PushParams>,
) -> impl IntoResponse {
    let subscriber = match state.registry.get(&params.pubkey).await {
        Ok(Some(s)) => s,
        Ok(None) => return respond(false, "subscriber not found"),
        Err(e) => return respond(false, e.to_string()),
    };
    let use_repost = params.use_repost.unwrap_or(true);
    match state
        .worker
        .push(
            &params.pubkey,
            &subscriber.channel_secret,
            PUSH_INTERVAL,
            10,
            use_repost,
        )
        .await
    {
        Ok(()) => respond(true, "pushed"),
        Err(e) => respond(false, e.to_string()),
    }
}

#[derive(Deserialize)]
struct BatchParams {
    limit: Option<u64>,
    skip: Option<u64>,
}

/// Run one subscriber page batch.
async fn batch(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<BatchParams>,
) -> impl IntoResponse {
    match state
        .worker
        .batch(params.limit.unwrap_or(10), params.skip.unwrap_or(0))
        .await
    {
        Ok(_) => respond(true, "dispatched"),
        Err(e) => respond(false, e.to_string()),
    }
}

/// Run one full batch cycle.
async fn run(State(state): State<AppState>) -> impl IntoResponse {
    match state.worker.run().await {
        Ok(()) => respond(true, "dispatched"),
        Err(e) => respond(false, e.to_string()),
    }
}

#[derive(Deserialize)]
struct SubscribeParams {
    #[serde(default)]
    pubkey: String,
}

/// Manually subscribe a pubkey, mirroring the `#subscribe` command.
async fn subscribe(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<SubscribeParams>,
) -> impl IntoResponse {
    let (channel_sk, is_new) = match state.bot.get_or_create_subscription(&params.pubkey).await {
        Ok(v) => v,
        Err(e) => {
            warn!(pubkey = %params.pubkey, err = %e, "failed to create channel");
            return respond(false, e.to_string());
        }
    };
    if is_new {
        if let Err(e) = state.bot.send_welcome(&channel_sk, &params.pubkey).await {
            warn!(pubkey = %params.pubkey, err = %e, "failed to send welcome message");
        }
    }
    if let Err(e) = state
        .worker
        .push(
            &params.pubkey,
            &channel_sk,
            PUSH_INTERVAL,
            crate::worker::PUSH_SIZE,
            false,
        )
        .await
    {
        warn!(pubkey = %params.pubkey, err = %e, "failed to prepare initial content");
    }
    respond(true, format!("subscribed as pubkey {}", params.pubkey))
}

#[derive(Deserialize)]
struct TrendsParams {
    #[serde(rename = "startDateTime", default)]
    start: String,
    #[serde(rename = "endDateTime", default)]
    end: String,
    limit: Option<String>,
}

/// Global trending window with strict parameter validation.
async fn trends(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<TrendsParams>,
) -> impl IntoResponse {
    let start = match chrono::DateTime::parse_from_rfc3339(&params.start) {
        Ok(t) => t,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                api_respond(false, "startDateTime must be a valid ISO8601 string"),
            )
        }
    };
    let end = match chrono::DateTime::parse_from_rfc3339(&params.end) {
        Ok(t) => t,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                api_respond(false, "endDateTime must be a valid ISO8601 string"),
            )
        }
    };
    let window = end.timestamp() - start.timestamp();
    if window < 1 || window > 24 * 3600 {
        return (
            StatusCode::BAD_REQUEST,
            api_respond(
                false,
                "startDateTime and endDateTime must have difference between 1 second and 1 day",
            ),
        );
    }

    let mut limit = 10;
    if let Some(raw) = &params.limit {
        match raw.parse::<i64>() {
            Ok(v) if (1..=100).contains(&v) => limit = v as u64,
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    api_respond(false, "limit must be a number between 1 and 100"),
                )
            }
        }
    }

    match state
        .feed
        .trends(start.timestamp() as u64, end.timestamp() as u64, limit)
        .await
    {
        Ok(events) => (StatusCode::OK, api_respond(true, events)),
        Err(e) => (StatusCode::OK, api_respond(false, e.to_string())),
    }
}

#[derive(Deserialize)]
struct NameParams {
    #[serde(default)]
    name: String,
}

#[derive(Serialize, Deserialize)]
struct NameResponse {
    names: HashMap<String, String>,
}

/// NIP-05 name lookup for the bot identity.
async fn nostr_json(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<NameParams>,
) -> Json<NameResponse> {
    let mut names = HashMap::new();
    if !params.name.is_empty() {
        if params.name == state.bot_name {
            names.insert(params.name, state.bot.pubkey().to_string());
        } else {
            warn!(name = %params.name, "name not found");
        }
    }
    Json(NameResponse { names })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotSettings;
    use crate::objects::ObjectStore;
    use crate::relay::Client;
    use crate::testutil::{recording_relay, EmptyScorer, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::task;

    async fn test_state() -> (AppState, Arc<MemoryStore>, TempDir) {
        let (relay_addr, _frames) = recording_relay().await;
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let client = Client::new(vec![format!("ws://{}", relay_addr)]);
        let feed = FeedService::new(
            Arc::new(EmptyScorer),
            ObjectStore::new(dir.path().to_path_buf()),
        );
        let sk = hex::encode([1u8; 32]);
        let worker = Worker::new(client.clone(), feed.clone(), store.clone(), sk.clone());
        let bot = Bot::new(
            client,
            store.clone(),
            worker.clone(),
            BotSettings {
                sk,
                relays: vec![],
                name: "curatr@example.com".into(),
                about: String::new(),
                picture: String::new(),
                nip05: String::new(),
                channel_name: "curatr feed".into(),
                channel_about: "curated content for %s powered by %s".into(),
                channel_picture: String::new(),
            },
            vec![],
        )
        .unwrap();
        let state = AppState::new(feed, worker, bot, store.clone(), "curatr@example.com");
        (state, store, dir)
    }

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        task::spawn(async move {
            serve_http(addr, state, std::future::pending()).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        addr
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (state, _, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let resp = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap();
        let body: Health = resp.json().await.unwrap();
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn feed_endpoint_wraps_envelope() {
        let (state, _, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let resp = reqwest::get(format!("http://{}/feed?pubkey=abc", addr))
            .await
            .unwrap();
        let body: Envelope = resp.json().await.unwrap();
        assert!(body.success);
        assert_eq!(body.data, json!([]));
    }

    #[tokio::test]
    async fn push_unknown_subscriber_fails() {
        let (state, _, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let resp = reqwest::get(format!("http://{}/push?pubkey=deadbeef", addr))
            .await
            .unwrap();
        let body: Envelope = resp.json().await.unwrap();
        assert!(!body.success);
        assert_eq!(body.data, json!("subscriber not found"));
    }

    #[tokio::test]
    async fn push_known_subscriber_succeeds() {
        let (state, store, _dir) = test_state().await;
        use crate::registry::SubscriberStore as _;
        store
            .create("deadbeef", &hex::encode([2u8; 32]), 100)
            .await
            .unwrap();
        let addr = spawn_server(state).await;
        let resp = reqwest::get(format!(
            "http://{}/push?pubkey=deadbeef&useRepost=false",
            addr
        ))
        .await
        .unwrap();
        let body: Envelope = resp.json().await.unwrap();
        assert!(body.success);
        assert_eq!(body.data, json!("pushed"));
    }

    #[tokio::test]
    async fn batch_and_run_dispatch() {
        let (state, _, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let body: Envelope = reqwest::get(format!("http://{}/batch?limit=5&skip=0", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.success);
        let body: Envelope = reqwest::get(format!("http://{}/run", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.success);
    }

    #[tokio::test]
    async fn subscribe_endpoint_creates_subscriber() {
        let (state, store, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let pubkey = hex::encode([5u8; 32]);
        let body: Envelope = reqwest::get(format!("http://{}/subscribe?pubkey={}", addr, pubkey))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body.success);
        use crate::registry::SubscriberStore as _;
        let subscriber = store.get(&pubkey).await.unwrap().unwrap();
        assert!(subscriber.is_active());
    }

    #[tokio::test]
    async fn trends_validates_window_and_limit() {
        let (state, _, _dir) = test_state().await;
        let addr = spawn_server(state).await;
        let base = format!("http://{}/api/v1/recommendations/trends", addr);

        // Garbage timestamps.
        let resp = reqwest::get(format!("{}?startDateTime=nope&endDateTime=nope", base))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Window above one day.
        let resp = reqwest::get(format!(
            "{}?startDateTime=2023-05-01T00:00:00Z&endDateTime=2023-05-03T00:00:00Z",
            base
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);

        // Limit out of bounds.
        let resp = reqwest::get(format!(
            "{}?startDateTime=2023-05-01T00:00:00Z&endDateTime=2023-05-01T12:00:00Z&limit=500",
            base
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);

        // Valid request.
        let resp = reqwest::get(format!(
            "{}?startDateTime=2023-05-01T00:00:00Z&endDateTime=2023-05-01T12:00:00Z&limit=5",
            base
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        let body: ApiEnvelope = resp.json().await.unwrap();
        assert_eq!(body.status, "success");
        assert_eq!(body.data, json!([]));
    }

    #[tokio::test]
    async fn nostr_json_maps_known_name() {
        let (state, _, _dir) = test_state().await;
        let expected_pub = state.bot.pubkey().to_string();
        let addr = spawn_server(state).await;

        let body: NameResponse =
            reqwest::get(format!("http://{}/.well-known/nostr.json?name=curatr", addr))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body.names.get("curatr"), Some(&expected_pub));

        let body: NameResponse =
            reqwest::get(format!("http://{}/.well-known/nostr.json?name=other", addr))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert!(body.names.is_empty());
    }
}
