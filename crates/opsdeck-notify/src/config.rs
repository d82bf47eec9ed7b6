use std::env;
use std::time::Duration;

use url::Url;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Longest accepted heartbeat interval. The watchdog allows twice this.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Settings for the persistent notification channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Base url the channel address is derived from.
    pub server_url: String,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Maximum notifications kept in the feed.
    pub feed_capacity: usize,
    /// Buffered interrupts per slow subscriber before it starts lagging.
    pub interrupt_capacity: usize,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the server to confirm a close.
    pub close_grace: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            feed_capacity: 50,
            interrupt_capacity: 64,
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(2),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from `OPSDECK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let backoff = BackoffPolicy {
            base_delay: millis(&lookup, "OPSDECK_BACKOFF_BASE_MS")
                .unwrap_or(defaults.backoff.base_delay),
            max_delay: millis(&lookup, "OPSDECK_BACKOFF_MAX_MS")
                .unwrap_or(defaults.backoff.max_delay),
            jitter_fraction: parsed(&lookup, "OPSDECK_BACKOFF_JITTER")
                .unwrap_or(defaults.backoff.jitter_fraction),
        };
        Self {
            server_url: lookup("OPSDECK_SERVER_URL").unwrap_or(defaults.server_url),
            heartbeat_interval: seconds(&lookup, "OPSDECK_HEARTBEAT_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            backoff,
            feed_capacity: parsed(&lookup, "OPSDECK_FEED_CAPACITY")
                .unwrap_or(defaults.feed_capacity),
            interrupt_capacity: parsed(&lookup, "OPSDECK_INTERRUPT_CAPACITY")
                .unwrap_or(defaults.interrupt_capacity),
            connect_timeout: seconds(&lookup, "OPSDECK_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            close_grace: millis(&lookup, "OPSDECK_CLOSE_GRACE_MS").unwrap_or(defaults.close_grace),
        }
    }

    pub fn server_url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.server_url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server_url()?;
        if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: self.server_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        non_zero("heartbeat_interval", self.heartbeat_interval)?;
        if self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: format!("must be at most {}s", MAX_HEARTBEAT_INTERVAL.as_secs()),
            });
        }
        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero("close_grace", self.close_grace)?;
        if self.feed_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "feed_capacity",
                reason: "must hold at least one notification".into(),
            });
        }
        if self.interrupt_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "interrupt_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        self.backoff.validate()
    }
}

/// Settings for the one-shot status poll fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub api_url: String,
    pub max_attempts: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            max_attempts: 5,
            interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl PollConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            api_url: lookup("OPSDECK_API_URL").unwrap_or(defaults.api_url),
            max_attempts: parsed(&lookup, "OPSDECK_POLL_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts),
            interval: millis(&lookup, "OPSDECK_POLL_INTERVAL_MS").unwrap_or(defaults.interval),
            request_timeout: seconds(&lookup, "OPSDECK_POLL_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
        }
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.api_url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.api_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: self.api_url.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must allow at least one request".into(),
            });
        }
        non_zero("interval", self.interval)?;
        non_zero("request_timeout", self.request_timeout)
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "cannot be a base url".into(),
        });
    }
    Ok(url)
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parsed::<u64>(lookup, key).map(Duration::from_secs)
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parsed::<u64>(lookup, key).map(Duration::from_millis)
}
