//! Runtime configuration for the streamable HTTP transport.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::size::parse_size;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint must start with '/', got {0:?}")]
    InvalidEndpoint(String),
    #[error("invalid session header name {0:?}")]
    InvalidSessionHeader(String),
}

/// How POST requests containing JSON-RPC requests are answered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Collect every response and reply with one `application/json` array.
    #[default]
    Batch,
    /// Open a `text/event-stream` scoped to the POST and stream responses.
    Stream,
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "batch" => Ok(ResponseMode::Batch),
            "stream" => Ok(ResponseMode::Stream),
            other => Err(format!("unknown response mode {other:?}")),
        }
    }
}

/// Where outbound message history is kept for `Last-Event-ID` replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResumabilityMode {
    #[default]
    Off,
    /// History lives on each SSE connection.
    Connection,
    /// History is additionally indexed per session and swept periodically.
    Global,
}

impl ResumabilityMode {
    pub fn is_enabled(self) -> bool {
        self != ResumabilityMode::Off
    }
}

impl FromStr for ResumabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "false" | "none" => Ok(ResumabilityMode::Off),
            "connection" | "connection-scoped" => Ok(ResumabilityMode::Connection),
            "global" => Ok(ResumabilityMode::Global),
            other => Err(format!("unknown resumability mode {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub enabled: bool,
    pub header_name: String,
    /// Whether clients may end their session with `DELETE`.
    pub allow_client_termination: bool,
    /// Evict sessions without activity for this long. `None` keeps them until
    /// explicitly terminated.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header_name: "Mcp-Session-Id".to_string(),
            allow_client_termination: true,
            idle_timeout: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResumabilityConfig {
    pub mode: ResumabilityMode,
    /// Retention window for message history.
    pub history_duration: Duration,
}

impl Default for ResumabilityConfig {
    fn default() -> Self {
        Self {
            mode: ResumabilityMode::Off,
            history_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub max_age: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, DELETE, OPTIONS".to_string(),
            allow_headers:
                "Content-Type, Accept, Authorization, x-api-key, Mcp-Session-Id, Last-Event-ID"
                    .to_string(),
            expose_headers: "Content-Type, Authorization, x-api-key, Mcp-Session-Id".to_string(),
            max_age: "86400".to_string(),
        }
    }
}

/// Transport configuration.
///
/// [`TransportConfig::from_env`] reads environment variables with these defaults:
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `MCP_HOST` | `127.0.0.1` | Bind address |
/// | `MCP_PORT` | `8080` | Port |
/// | `MCP_ENDPOINT` | `/mcp` | Endpoint path |
/// | `MCP_MAX_MESSAGE_SIZE` | `4mb` | Maximum POST body |
/// | `MCP_RESPONSE_MODE` | `batch` | `batch` or `stream` |
/// | `MCP_BATCH_TIMEOUT_MS` | `30000` | Batch aggregation timeout |
/// | `MCP_SESSIONS` | `true` | Session management on/off |
/// | `MCP_SESSION_HEADER` | `Mcp-Session-Id` | Session header name |
/// | `MCP_RESUMABILITY` | `off` | `off`, `connection` or `global` |
/// | `MCP_HISTORY_DURATION_MS` | `300000` | History retention window |
///
/// # Example
///
/// ```rust
/// use mcp_http_stream::config::{ResponseMode, TransportConfig};
///
/// let config = TransportConfig {
///     response_mode: ResponseMode::Stream,
///     ..TransportConfig::default()
/// };
/// assert_eq!(config.endpoint, "/mcp");
/// ```
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    /// Maximum accepted POST body in bytes.
    pub max_message_size: usize,
    pub response_mode: ResponseMode,
    pub batch_timeout: Duration,
    /// Keepalive comment interval on open streams.
    pub ping_interval: Duration,
    /// Extra headers added to every response.
    pub headers: HashMap<String, String>,
    pub cors: CorsConfig,
    pub session: SessionConfig,
    pub resumability: ResumabilityConfig,
    /// Park responses whose stream disappeared for this long, delivering them to
    /// the next stream opened for the same session. `None` drops them.
    pub dropped_response_grace: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            endpoint: "/mcp".to_string(),
            max_message_size: 4 * 1024 * 1024,
            response_mode: ResponseMode::Batch,
            batch_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            headers: HashMap::new(),
            cors: CorsConfig::default(),
            session: SessionConfig::default(),
            resumability: ResumabilityConfig::default(),
            dropped_response_grace: None,
        }
    }
}

impl TransportConfig {
    /// Create a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            host: lookup("MCP_HOST").unwrap_or(defaults.host),
            port: lookup("MCP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            endpoint: lookup("MCP_ENDPOINT").unwrap_or(defaults.endpoint),
            max_message_size: lookup("MCP_MAX_MESSAGE_SIZE")
                .and_then(|s| parse_size(&s))
                .unwrap_or(defaults.max_message_size),
            response_mode: lookup("MCP_RESPONSE_MODE")
                .and_then(|m| m.parse().ok())
                .unwrap_or(defaults.response_mode),
            batch_timeout: parsed("MCP_BATCH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_timeout),
            session: SessionConfig {
                enabled: lookup("MCP_SESSIONS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.session.enabled),
                header_name: lookup("MCP_SESSION_HEADER").unwrap_or(defaults.session.header_name),
                ..defaults.session
            },
            resumability: ResumabilityConfig {
                mode: lookup("MCP_RESUMABILITY")
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(defaults.resumability.mode),
                history_duration: parsed("MCP_HISTORY_DURATION_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.resumability.history_duration),
            },
            ..defaults
        }
    }

    /// Get the socket address for binding.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.starts_with('/') {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        if axum::http::HeaderName::from_bytes(self.session.header_name.as_bytes()).is_err() {
            return Err(ConfigError::InvalidSessionHeader(
                self.session.header_name.clone(),
            ));
        }
        Ok(())
    }

    /// Interval of the background history/session sweep.
    pub fn sweep_interval(&self) -> Duration {
        (self.resumability.history_duration / 4).max(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = TransportConfig::from_lookup(|_| None);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.endpoint, "/mcp");
        assert_eq!(config.max_message_size, 4 * 1024 * 1024);
        assert_eq!(config.response_mode, ResponseMode::Batch);
        assert_eq!(config.batch_timeout, Duration::from_secs(30));
        assert!(config.session.enabled);
        assert_eq!(config.session.header_name, "Mcp-Session-Id");
        assert_eq!(config.resumability.mode, ResumabilityMode::Off);
    }

    #[test]
    fn test_env_overrides() {
        let config = TransportConfig::from_lookup(lookup_from(&[
            ("MCP_PORT", "9000"),
            ("MCP_ENDPOINT", "/rpc"),
            ("MCP_MAX_MESSAGE_SIZE", "512kb"),
            ("MCP_RESPONSE_MODE", "stream"),
            ("MCP_BATCH_TIMEOUT_MS", "1500"),
            ("MCP_SESSIONS", "false"),
            ("MCP_RESUMABILITY", "global"),
            ("MCP_HISTORY_DURATION_MS", "60000"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.endpoint, "/rpc");
        assert_eq!(config.max_message_size, 512 * 1024);
        assert_eq!(config.response_mode, ResponseMode::Stream);
        assert_eq!(config.batch_timeout, Duration::from_millis(1500));
        assert!(!config.session.enabled);
        assert_eq!(config.resumability.mode, ResumabilityMode::Global);
        assert_eq!(config.sweep_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = TransportConfig::from_lookup(lookup_from(&[
            ("MCP_PORT", "not-a-port"),
            ("MCP_RESPONSE_MODE", "carrier-pigeon"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.response_mode, ResponseMode::Batch);
    }

    #[test]
    fn test_socket_addr() {
        let config = TransportConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ..TransportConfig::default()
        };
        assert_eq!(config.socket_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::default().validate().is_ok());

        let mut config = TransportConfig::default();
        config.endpoint = "mcp".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint("mcp".to_string()))
        );

        let mut config = TransportConfig::default();
        config.session.header_name = "bad header".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSessionHeader(_))
        ));
    }

    #[test]
    fn test_sweep_interval_has_floor() {
        let mut config = TransportConfig::default();
        config.resumability.history_duration = Duration::from_millis(400);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
