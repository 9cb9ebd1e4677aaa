use std::time::Duration;

use nightfall_core::DEFAULT_MAX_FRAME_BYTES;
use thiserror::Error;
use url::Url;

use crate::backoff::{ReconnectPolicy, DEFAULT_BACKOFF_MAX, DEFAULT_RECONNECT_INTERVAL};

/// Access point address of the rear board.
pub const DEFAULT_ENDPOINT: &str = "ws://192.168.4.1:8888";
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_PREDICTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

pub const ENV_WS_URL: &str = "NIGHTFALL_WS_URL";
pub const ENV_RECONNECT_MS: &str = "NIGHTFALL_RECONNECT_MS";
pub const ENV_BACKOFF: &str = "NIGHTFALL_BACKOFF";
pub const ENV_BACKOFF_MAX_MS: &str = "NIGHTFALL_BACKOFF_MAX_MS";
pub const ENV_RATE_WINDOW_MS: &str = "NIGHTFALL_RATE_WINDOW_MS";
pub const ENV_PREDICTION_TIMEOUT_MS: &str = "NIGHTFALL_PREDICTION_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "NIGHTFALL_CONNECT_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid endpoint url `{value}`: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("unsupported endpoint scheme `{0}`; expected ws or wss")]
    UnsupportedScheme(String),
    #[error("invalid value for {key}: `{value}`")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    pub rate_window: Duration,
    pub max_frame_bytes: usize,
    /// `None` keeps an unconfirmed prediction until it is overwritten.
    pub prediction_timeout: Option<Duration>,
    /// Bound on the TCP connect plus websocket handshake of one attempt.
    pub connect_timeout: Duration,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl LinkConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectPolicy::default(),
            rate_window: DEFAULT_RATE_WINDOW,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            prediction_timeout: Some(DEFAULT_PREDICTION_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Layers environment-style values over the defaults. Blank values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let url = parse_endpoint(get(ENV_WS_URL).as_deref().unwrap_or(DEFAULT_ENDPOINT))?;
        let mut config = Self::new(url);

        let interval = match get(ENV_RECONNECT_MS) {
            Some(value) => parse_millis(ENV_RECONNECT_MS, &value)?,
            None => DEFAULT_RECONNECT_INTERVAL,
        };
        let max = match get(ENV_BACKOFF_MAX_MS) {
            Some(value) => parse_millis(ENV_BACKOFF_MAX_MS, &value)?,
            None => DEFAULT_BACKOFF_MAX,
        };
        let kind = get(ENV_BACKOFF).unwrap_or_else(|| "fixed".to_string());
        config.reconnect = build_policy(ENV_BACKOFF, &kind, interval, max)?;

        if let Some(value) = get(ENV_RATE_WINDOW_MS) {
            let window = parse_millis(ENV_RATE_WINDOW_MS, &value)?;
            if window.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_RATE_WINDOW_MS,
                    value,
                });
            }
            config.rate_window = window;
        }
        if let Some(value) = get(ENV_PREDICTION_TIMEOUT_MS) {
            let timeout = parse_millis(ENV_PREDICTION_TIMEOUT_MS, &value)?;
            config.prediction_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(value) = get(ENV_CONNECT_TIMEOUT_MS) {
            let timeout = parse_millis(ENV_CONNECT_TIMEOUT_MS, &value)?;
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_CONNECT_TIMEOUT_MS,
                    value,
                });
            }
            config.connect_timeout = timeout;
        }
        Ok(config)
    }
}

/// Accepts a full `ws://` / `wss://` url or a bare `host:port`.
pub fn parse_endpoint(value: &str) -> Result<Url, ConfigError> {
    let trimmed = value.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

pub fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

/// `interval` is the fixed delay, or the first delay of an exponential policy.
pub fn build_policy(
    key: &'static str,
    kind: &str,
    interval: Duration,
    max: Duration,
) -> Result<ReconnectPolicy, ConfigError> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(ReconnectPolicy::Fixed(interval)),
        "exponential" | "exp" => Ok(ReconnectPolicy::Exponential {
            initial: interval,
            max: max.max(interval),
        }),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: kind.to_string(),
        }),
    }
}
