use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use stream_protocol::{Dialect, OutboundFormat};

use crate::connection::ReconnectPolicy;

// =============================================================================
// File config (figment-deserialized from defaults / agent-stream.toml / env)
// =============================================================================
//
//   agent-stream.toml:   [connection]
//                        url = "ws://review.internal:8000/api/v1/ws"
//
//   env var:             AGENT_STREAM_CONNECTION__URL=ws://...
//
//   (double underscore = nesting, single underscore stays in the field name)

pub const CONFIG_FILE_NAME: &str = "agent-stream.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid connection url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown reconnect backoff {0:?} (expected fixed or exponential)")]
    UnknownBackoff(String),
}

/// Top-level tunable configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub protocol: ProtocolFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub watchdog: WatchdogFileConfig,
    #[serde(default)]
    pub execution: ExecutionFileConfig,
}

/// `[connection]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Sent as the `api_key` query parameter
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[protocol]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProtocolFileConfig {
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub outbound: OutboundFormat,
}

/// `[reconnect]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    /// `fixed` or `exponential`
    #[serde(default = "default_backoff")]
    pub backoff: String,
    /// Fixed delay, or the first delay for exponential backoff
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            delay_ms: default_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// `[watchdog]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WatchdogFileConfig {
    /// Close a streaming message after this long without tokens (0 = off)
    #[serde(default)]
    pub stream_idle_timeout_secs: u64,
}

/// `[execution]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionFileConfig {
    #[serde(default = "default_execution_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutionFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_execution_endpoint(),
            timeout_secs: default_execution_timeout_secs(),
        }
    }
}

fn default_url() -> String {
    "ws://localhost:8000/api/v1/ws".to_string()
}
fn default_outbound_queue() -> usize {
    100
}
fn default_backoff() -> String {
    "fixed".to_string()
}
fn default_delay_ms() -> u64 {
    3000
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_execution_endpoint() -> String {
    "https://emkc.org/api/v2/piston".to_string()
}
fn default_execution_timeout_secs() -> u64 {
    30
}

/// Layer: defaults → `<config_dir>/agent-stream.toml` → `AGENT_STREAM_*` env vars.
///
///   `AGENT_STREAM_RECONNECT__BACKOFF=exponential` → `reconnect.backoff`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed("AGENT_STREAM_").split("__"))
}

/// `~/.config/agent-stream` (or the platform equivalent), falling back to the
/// working directory when the platform has no config dir.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("agent-stream"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Everything a session needs, resolved from `FileConfig`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Full URL including the `api_key` query parameter
    pub url: String,
    pub dialect: Dialect,
    pub outbound: OutboundFormat,
    pub reconnect: ReconnectPolicy,
    pub outbound_queue: usize,
    /// `None` disables the stream idle watchdog
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            dialect: Dialect::default(),
            outbound: OutboundFormat::default(),
            reconnect: ReconnectPolicy::default(),
            outbound_queue: default_outbound_queue(),
            stream_idle_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            url: connection_url(&fc.connection.url, fc.connection.api_key.as_deref())?,
            dialect: fc.protocol.dialect,
            outbound: fc.protocol.outbound,
            reconnect: reconnect_policy(&fc.reconnect)?,
            outbound_queue: fc.connection.outbound_queue.max(1),
            stream_idle_timeout: match fc.watchdog.stream_idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }
}

fn reconnect_policy(fc: &ReconnectFileConfig) -> Result<ReconnectPolicy, ConfigError> {
    let delay = Duration::from_millis(fc.delay_ms);
    match fc.backoff.to_ascii_lowercase().as_str() {
        "fixed" => Ok(ReconnectPolicy::Fixed { delay }),
        "exponential" => Ok(ReconnectPolicy::Exponential {
            base: delay,
            max: Duration::from_secs(fc.max_delay_secs),
        }),
        other => Err(ConfigError::UnknownBackoff(other.to_string())),
    }
}

/// Validate a `ws://`/`wss://` base URL and attach the API key, if any.
pub fn connection_url(base: &str, api_key: Option<&str>) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: base.to_string(),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        url.query_pairs_mut().append_pair("api_key", key);
    }
    Ok(url.into())
}

/// Resolved settings for the code-execution collaborator.
#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl ExecutionConfig {
    pub fn from_file(fc: &ExecutionFileConfig) -> Self {
        Self {
            endpoint: fc.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(fc.timeout_secs.max(1)),
        }
    }
}
