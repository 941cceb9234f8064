//! 定义了客户端连接的可配置参数。
//! Defines configurable parameters for the messaging client.

use crate::error::{Error, Result};
use std::time::Duration;

/// Environment variable holding the broker's HTTP(S) base URL.
pub const BASE_URL_ENV: &str = "KESTREL_LINK_BASE_URL";
/// Environment variable overriding the base reconnect delay, in milliseconds.
pub const RECONNECT_DELAY_ENV: &str = "KESTREL_LINK_RECONNECT_DELAY_MS";
/// Environment variable overriding the reconnect attempt ceiling.
pub const MAX_RECONNECT_ATTEMPTS_ENV: &str = "KESTREL_LINK_MAX_RECONNECT_ATTEMPTS";
/// Environment variable overriding both heart-beat intervals, in milliseconds.
pub const HEARTBEAT_ENV: &str = "KESTREL_LINK_HEARTBEAT_MS";

const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws";
const ENDPOINT_PATH: &str = "/ws";

/// A structure containing all configurable parameters for the client.
///
/// 包含客户端所有可配置参数的结构体。
#[derive(Debug, Clone)]
pub struct Config {
    /// The WebSocket endpoint every session is opened against.
    /// 每个会话连接的 WebSocket 端点。
    pub endpoint: String,

    /// Reconnection policy parameters.
    /// 重连策略参数。
    pub reconnect: ReconnectConfig,

    /// Keep-alive parameters.
    /// 保活参数。
    pub heartbeat: HeartbeatConfig,

    /// Prefix used to address per-user destinations.
    /// 用于寻址按用户路由目的地的前缀。
    pub user_destination_prefix: String,
}

/// Reconnection policy parameters.
///
/// 重连策略参数。
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// The delay before the first automatic retry. Attempt `n` waits `n` times this.
    /// 第一次自动重试前的延迟。第 `n` 次尝试等待该值的 `n` 倍。
    pub base_delay: Duration,
    /// The number of automatic retries after which the client stops trying.
    /// 客户端停止尝试之前的自动重试次数。
    pub max_attempts: u32,
}

/// Keep-alive parameters, proposed to the broker in the `heart-beat` header.
///
/// 保活参数，通过 `heart-beat` 头部向代理提出。
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often we expect to hear from the broker.
    /// 我们期望从代理接收数据的频率。
    pub incoming: Duration,
    /// How often we promise to send something to the broker.
    /// 我们承诺向代理发送数据的频率。
    pub outgoing: Duration,
}

impl ReconnectConfig {
    /// Linear backoff: `base_delay × attempt` for a 1-indexed attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    ///
    /// 从进程环境变量构建配置。
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Missing keys fall
    /// back to the defaults; present but malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(base_url) = lookup(BASE_URL_ENV) {
            config.endpoint = endpoint_from_base_url(&base_url)?;
        }
        if let Some(ms) = parse_number(&lookup, RECONNECT_DELAY_ENV)? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_number(&lookup, MAX_RECONNECT_ATTEMPTS_ENV)? {
            config.reconnect.max_attempts = u32::try_from(attempts)
                .map_err(|_| Error::Config(format!("{MAX_RECONNECT_ATTEMPTS_ENV} out of range")))?;
        }
        if let Some(ms) = parse_number(&lookup, HEARTBEAT_ENV)? {
            config.heartbeat.incoming = Duration::from_millis(ms);
            config.heartbeat.outgoing = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}

/// Derives the WebSocket endpoint from an HTTP(S) base URL.
/// `ws://` and `wss://` URLs are accepted as-is apart from the path suffix.
fn endpoint_from_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let endpoint = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(Error::InvalidEndpoint(format!(
            "unsupported scheme in base URL {base_url:?}"
        )));
    };

    if endpoint.ends_with(ENDPOINT_PATH) {
        Ok(endpoint)
    } else {
        Ok(format!("{endpoint}{ENDPOINT_PATH}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            user_destination_prefix: "/user".to_string(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            incoming: Duration::from_millis(4000),
            outgoing: Duration::from_millis(4000),
        }
    }
}
