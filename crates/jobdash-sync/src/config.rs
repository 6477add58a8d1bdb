use crate::channel::FeedConfig;
use crate::store::StoreConfig;
use jobdash_core::feed::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PENDING_LIMIT: u32 = 20;
pub const NOTIFICATION_TTL: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid url in {var} '{value}': {reason}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid number in {var}: '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub api_base_url: Url,
    pub feed_url: Url,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub liveness_interval: Duration,
    pub notification_ttl: Duration,
    pub pending_limit: u32,
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_raw =
            non_blank("JOBDASH_API_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let api_base_url = parse_url("JOBDASH_API_URL", &api_raw)?;
        let feed_url = match non_blank("JOBDASH_WS_URL") {
            Some(raw) => parse_url("JOBDASH_WS_URL", &raw)?,
            None => derive_feed_url(&api_base_url)?,
        };

        let millis = |var: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_millis(parse_number(
                var,
                non_blank(var),
                default,
            )?))
        };

        Ok(Self {
            api_base_url,
            feed_url,
            reconnect_delay: millis("JOBDASH_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS)?,
            max_reconnect_attempts: parse_number(
                "JOBDASH_MAX_RECONNECT_ATTEMPTS",
                non_blank("JOBDASH_MAX_RECONNECT_ATTEMPTS"),
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            )?,
            connect_timeout: millis("JOBDASH_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?,
            liveness_interval: millis(
                "JOBDASH_LIVENESS_INTERVAL_MS",
                DEFAULT_LIVENESS_INTERVAL_MS,
            )?,
            notification_ttl: NOTIFICATION_TTL,
            pending_limit: parse_number(
                "JOBDASH_PENDING_LIMIT",
                non_blank("JOBDASH_PENDING_LIMIT"),
                DEFAULT_PENDING_LIMIT,
            )?,
            request_timeout: millis("JOBDASH_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?,
        })
    }

    pub fn feed(&self) -> FeedConfig {
        FeedConfig {
            url: self.feed_url.clone(),
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: self.connect_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            pending_limit: self.pending_limit,
            liveness_interval: self.liveness_interval,
            notification_ttl: self.notification_ttl,
        }
    }
}

/// `http(s)://host:port/anything` becomes `ws(s)://host:port/ws`.
pub fn derive_feed_url(api_base_url: &Url) -> Result<Url, ConfigError> {
    let mut feed = api_base_url.clone();
    let scheme = match api_base_url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    feed.set_scheme(scheme)
        .map_err(|_| ConfigError::InvalidUrl {
            var: "JOBDASH_API_URL",
            value: api_base_url.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
    feed.set_path("/ws");
    feed.set_query(None);
    feed.set_fragment(None);
    Ok(feed)
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidUrl {
        var,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_number<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}
