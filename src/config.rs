//! Session configuration
//!
//! Defaults match the public demo deployment; `from_env` overrides them
//! from `SIGNALING_URL` and `ICE_SERVERS`.

use thiserror::Error;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080/socket";
pub const DEFAULT_CHANNEL_LABEL: &str = "canvasData";

/// Google STUN servers
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ]
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL '{0}': {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("Unsupported signaling URL scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub signaling_url: Url,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: Url::parse(DEFAULT_SIGNALING_URL).expect("default URL is valid"),
            ice_servers: default_ice_servers(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Reads `SIGNALING_URL` and `ICE_SERVERS` from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = var("SIGNALING_URL").filter(|v| !v.trim().is_empty()) {
            config.signaling_url = parse_signaling_url(url.trim())?;
        }

        if let Some(servers) = var("ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(config)
    }

    pub fn with_signaling_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.signaling_url = parse_signaling_url(url)?;
        Ok(self)
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }
}

/// Accepts ws(s) URLs, rewriting http(s) to the matching WebSocket scheme
pub fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e))?;

    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}
