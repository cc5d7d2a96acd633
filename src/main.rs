mod bot;
mod config;
mod crawler;
mod event;
mod feed;
mod graph;
mod keys;
mod maintenance;
mod mapper;
mod objects;
mod registry;
mod relay;
mod server;
#[cfg(test)]
mod testutil;
mod worker;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use bot::Bot;
use config::{LogSettings, Settings};
use crawler::Crawler;
use feed::{FeedService, GraphScorer};
use graph::GraphStore;
use maintenance::Maintenance;
use mapper::Mapper;
use objects::ObjectStore;
use registry::{Registry, SubscriberStore};
use relay::Client;
use worker::{Worker, PUSH_INTERVAL, PUSH_SIZE};

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "curatr", author, version, about = "Personal content curator for Nostr")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run the full stack: crawler, bot, push cron, maintenance, admin HTTP.
    Serve,
    /// Execute one batch cycle and exit.
    Run,
    /// Push the feed once for one subscriber.
    Push {
        /// Subscriber public key (hex).
        #[arg(long)]
        pubkey: String,
        /// Repost each item instead of quoting the list.
        #[arg(long)]
        use_repost: bool,
    },
    /// Republish the bot profile metadata.
    Metadata,
}

/// Wired application components.
struct App {
    settings: Settings,
    feed: FeedService,
    registry: Arc<dyn SubscriberStore>,
    worker: Worker,
    bot: Bot,
    graph: GraphStore,
    objects: ObjectStore,
}

/// Connect to the graph store, declare constraints, and wire components.
/// Failure anywhere in here terminates the process.
async fn build_app(mut settings: Settings) -> Result<App> {
    // The bot key may be given in either hex or nsec form.
    if settings.bot.sk.starts_with("nsec1") {
        settings.bot.sk = keys::decode_nsec(&settings.bot.sk)?;
    }

    let graph = GraphStore::connect(
        &settings.neo4j.url,
        &settings.neo4j.username,
        &settings.neo4j.password,
    )
    .await?;
    graph.init_constraints().await?;

    let objects = ObjectStore::new(settings.objects_root.clone());
    let registry: Arc<dyn SubscriberStore> = Arc::new(Registry::new(graph.clone()));
    let scorer = Arc::new(GraphScorer::new(graph.clone()));
    let feed = FeedService::new(scorer, objects.clone());

    let bot_client = Client::new(settings.bot.relays.clone());
    let worker = Worker::new(
        bot_client.clone(),
        feed.clone(),
        registry.clone(),
        settings.bot.sk.clone(),
    );
    let bot = Bot::new(
        bot_client,
        registry.clone(),
        worker.clone(),
        settings.bot.clone(),
        settings.crawler.relays.clone(),
    )?;

    Ok(App {
        settings,
        feed,
        registry,
        worker,
        bot,
        graph,
        objects,
    })
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env(&cli.env)?;
    init_logging(&settings.log)?;
    let app = build_app(settings).await?;

    match cli.command {
        Commands::Serve => {
            // Ingest pipeline over the crawl relays.
            let crawl_client = Client::new(app.settings.crawler.relays.clone());
            let mapper = Mapper::new(app.graph.clone(), app.objects.clone());
            let crawler = Crawler::new(crawl_client, Arc::new(mapper), app.settings.crawler.clone());
            crawler.run();

            Maintenance::new(app.graph.clone(), app.objects.clone()).start();
            app.worker.start();

            let command_loop = {
                let bot = app.bot.clone();
                tokio::spawn(async move { bot.run().await })
            };

            let addr: SocketAddr = app.settings.bind_http.parse()?;
            let state = server::AppState::new(
                app.feed,
                app.worker,
                app.bot,
                app.registry,
                &app.settings.bot.name,
            );
            server::serve_http(addr, state, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await?;
            command_loop.abort();
        }
        Commands::Run => {
            app.worker.run().await?;
        }
        Commands::Push { pubkey, use_repost } => {
            let subscriber = app
                .registry
                .get(&pubkey)
                .await?
                .ok_or_else(|| anyhow!("subscriber not found: {}", pubkey))?;
            app.worker
                .push(
                    &pubkey,
                    &subscriber.channel_secret,
                    PUSH_INTERVAL,
                    PUSH_SIZE,
                    use_repost,
                )
                .await?;
        }
        Commands::Metadata => {
            app.bot.publish_profile().await?;
        }
    }
    Ok(())
}

/// Route logs to stderr or the configured file, filtered by level.
fn init_logging(log: &LogSettings) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log.path == "console" {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.path)?;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .try_init();
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
