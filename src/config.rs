//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot: BotSettings,
    pub crawler: CrawlerSettings,
    pub neo4j: Neo4jSettings,
    /// Root directory of the raw-event object store.
    pub objects_root: PathBuf,
    /// Bind address for the administration HTTP surface.
    pub bind_http: String,
    pub log: LogSettings,
}

/// Bot identity and profile fields.
#[derive(Debug, Clone)]
pub struct BotSettings {
    /// Bot secret key (hex).
    pub sk: String,
    /// Relays the bot publishes to and listens on.
    pub relays: Vec<String>,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub nip05: String,
    pub channel_name: String,
    /// Two-slot `%s` template: subscriber npub, then bot npub.
    pub channel_about: String,
    pub channel_picture: String,
}

/// Ingestion settings.
#[derive(Debug, Clone)]
pub struct CrawlerSettings {
    /// Relays to crawl.
    pub relays: Vec<String>,
    /// Backfill offset in seconds, parsed from a shorthand like `-1h`.
    pub since_offset: u64,
    /// Initial backfill cap per relay; zero means no cap.
    pub limit: u64,
}

/// Graph store credentials.
#[derive(Debug, Clone)]
pub struct Neo4jSettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Log sink selection.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    /// `console` or a file path.
    pub path: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bot = BotSettings {
            sk: env::var("BOT_SK").context("BOT_SK")?,
            relays: csv_strings(env::var("BOT_RELAYS").context("BOT_RELAYS")?),
            name: env::var("BOT_NAME").unwrap_or_else(|_| "curatr".into()),
            about: env::var("BOT_ABOUT").unwrap_or_else(|_| {
                "A recommender engine for nostr. Follow this account and post \
                 '#subscribe' mentioning it to get your own feed!"
                    .into()
            }),
            picture: env::var("BOT_PICTURE").unwrap_or_default(),
            nip05: env::var("BOT_NIP05").unwrap_or_default(),
            channel_name: env::var("CHANNEL_NAME").unwrap_or_else(|_| "curatr feed".into()),
            channel_about: env::var("CHANNEL_ABOUT")
                .unwrap_or_else(|_| "curated content for %s powered by %s".into()),
            channel_picture: env::var("CHANNEL_PICTURE").unwrap_or_default(),
        };
        let crawler = CrawlerSettings {
            relays: csv_strings(env::var("CRAWLER_RELAYS").context("CRAWLER_RELAYS")?),
            since_offset: parse_since(&env::var("CRAWLER_SINCE").unwrap_or_else(|_| "-1h".into())),
            limit: env::var("CRAWLER_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        };
        let neo4j = Neo4jSettings {
            url: env::var("NEO4J_URL").context("NEO4J_URL")?,
            username: env::var("NEO4J_USERNAME").context("NEO4J_USERNAME")?,
            password: env::var("NEO4J_PASSWORD").context("NEO4J_PASSWORD")?,
        };
        let objects_root = PathBuf::from(env::var("OBJECTS_ROOT").context("OBJECTS_ROOT")?);
        let bind_http = env::var("BIND_HTTP").unwrap_or_else(|_| "127.0.0.1:8080".into());
        let log = LogSettings {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            path: env::var("LOG_PATH").unwrap_or_else(|_| "console".into()),
        };
        Ok(Self {
            bot,
            crawler,
            neo4j,
            objects_root,
            bind_http,
            log,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Parse a duration shorthand like `-1h`, `30m` or `7d` into seconds.
///
/// The sign is ignored (the value is always an offset into the past).
/// Anything unparseable yields zero.
pub fn parse_since(input: &str) -> u64 {
    let s = input.trim().trim_start_matches('-');
    if s.is_empty() {
        return 0;
    }
    let (num, suffix) = s.split_at(s.len() - 1);
    let value: u64 = match num.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(input, "unparseable since shorthand, treating as zero");
            return 0;
        }
    };
    match suffix {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => {
            warn!(input, "unknown since suffix, treating as zero");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    const ALL_VARS: [&str; 19] = [
        "BOT_SK",
        "BOT_RELAYS",
        "BOT_NAME",
        "BOT_ABOUT",
        "BOT_PICTURE",
        "BOT_NIP05",
        "CHANNEL_NAME",
        "CHANNEL_ABOUT",
        "CHANNEL_PICTURE",
        "CRAWLER_RELAYS",
        "CRAWLER_SINCE",
        "CRAWLER_LIMIT",
        "NEO4J_URL",
        "NEO4J_USERNAME",
        "NEO4J_PASSWORD",
        "OBJECTS_ROOT",
        "BIND_HTTP",
        "LOG_LEVEL",
        "LOG_PATH",
    ];

    fn clear_env() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BOT_SK=abcd\n",
                "BOT_RELAYS=wss://r1,wss://r2\n",
                "CRAWLER_RELAYS=\"wss://r2, wss://r3\"\n",
                "CRAWLER_SINCE=-2h\n",
                "CRAWLER_LIMIT=100\n",
                "NEO4J_URL=bolt://localhost:7687\n",
                "NEO4J_USERNAME=neo4j\n",
                "NEO4J_PASSWORD=secret\n",
                "OBJECTS_ROOT=/tmp/objects\n",
                "LOG_LEVEL=debug\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bot.sk, "abcd");
        assert_eq!(cfg.bot.relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(cfg.crawler.relays, vec!["wss://r2", "wss://r3"]);
        assert_eq!(cfg.crawler.since_offset, 7200);
        assert_eq!(cfg.crawler.limit, 100);
        assert_eq!(cfg.neo4j.url, "bolt://localhost:7687");
        assert_eq!(cfg.objects_root, PathBuf::from("/tmp/objects"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.log.path, "console");
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BOT_SK=abcd\n",
                "BOT_RELAYS=wss://r1\n",
                "CRAWLER_RELAYS=wss://r1\n",
                "NEO4J_URL=bolt://localhost:7687\n",
                "NEO4J_USERNAME=neo4j\n",
                "NEO4J_PASSWORD=secret\n",
                "OBJECTS_ROOT=/tmp/objects\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bot.name, "curatr");
        assert_eq!(cfg.bot.channel_name, "curatr feed");
        assert!(cfg.bot.channel_about.contains("%s"));
        assert_eq!(cfg.crawler.since_offset, 3600);
        assert_eq!(cfg.crawler.limit, 0);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BOT_SK=abcd\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }

    #[test]
    fn since_shorthand() {
        assert_eq!(parse_since("-1h"), 3600);
        assert_eq!(parse_since("30m"), 1800);
        assert_eq!(parse_since("7d"), 604800);
        assert_eq!(parse_since("45s"), 45);
        assert_eq!(parse_since("10x"), 0);
        assert_eq!(parse_since("abc"), 0);
        assert_eq!(parse_since(""), 0);
        assert_eq!(parse_since("-"), 0);
    }
}
