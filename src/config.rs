use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::rules::validate_identifier;
use crate::regions::RegionDef;
use crate::EntityId;

/// Path of the remote endpoint the websocket connects to
pub const SUPPLIER_PATH: &str = "/supplier";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub tracking: TrackingConfig,
    /// Logical audio tracks by id
    pub audio_tracks: BTreeMap<String, TrackSettings>,
    pub regions: Vec<RegionDef>,
}

/// Credentials and endpoint of the remote audio service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConnectionConfig {
    pub user_id: Option<Uuid>,
    pub user_password: Option<String>,
    pub server_id: Option<Uuid>,
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointConfig {
    /// Use wss/https
    pub secure: bool,
    pub host: String,
    pub websocket_port: u16,
    pub webapp_port: u16,
    pub webapp_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            secure: false,
            host: "localhost".to_string(),
            websocket_port: 8080,
            webapp_port: 80,
            webapp_path: "/".to_string(),
        }
    }
}

/// Reconnect backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReconnectConfig {
    /// Base delay in milliseconds
    pub interval: u64,
    /// Upper bound of the delay in milliseconds
    pub max_interval: u64,
    /// Growth rate applied per attempt
    pub delay: f64,
    /// Attempts before giving up (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: 5_000,
            max_interval: 300_000,
            delay: 1.5,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackingConfig {
    /// Minimum time between two region checks of a player, in milliseconds
    pub check_delay: u64,
    /// Ticks between two runs of the same scheduler bucket
    pub tick_frequency: u64,
    /// Upper bound on scheduler buckets
    pub max_buckets: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            check_delay: 3_000,
            tick_frequency: 20,
            max_buckets: 20,
        }
    }
}

/// Playback settings of one logical track, forwarded to the remote service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackSettings {
    pub default: bool,
    pub repeating: bool,
    pub random: bool,
    pub fading: bool,
}

impl ClientConfig {
    /// Load config from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ZONE_AUDIO_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("ZONE_AUDIO_USER_ID") {
            match value.parse() {
                Ok(parsed) => self.connection.user_id = Some(parsed),
                Err(_) => tracing::warn!("Invalid ZONE_AUDIO_USER_ID '{}', ignoring", value),
            }
        }

        if let Some(value) = var("ZONE_AUDIO_USER_PASSWORD") {
            self.connection.user_password = Some(value);
        }

        if let Some(value) = var("ZONE_AUDIO_SERVER_ID") {
            match value.parse() {
                Ok(parsed) => self.connection.server_id = Some(parsed),
                Err(_) => tracing::warn!("Invalid ZONE_AUDIO_SERVER_ID '{}', ignoring", value),
            }
        }

        if let Some(value) = var("ZONE_AUDIO_HOST") {
            if value.is_empty() {
                tracing::warn!("ZONE_AUDIO_HOST must not be empty, ignoring");
            } else {
                self.connection.endpoint.host = value;
            }
        }

        if let Some(value) = var("ZONE_AUDIO_SECURE") {
            match value.parse() {
                Ok(parsed) => self.connection.endpoint.secure = parsed,
                Err(_) => tracing::warn!("Invalid ZONE_AUDIO_SECURE '{}', ignoring", value),
            }
        }

        if let Some(value) = var("ZONE_AUDIO_WEBSOCKET_PORT") {
            match value.parse::<u16>() {
                Ok(parsed) if parsed > 0 => self.connection.endpoint.websocket_port = parsed,
                Ok(_) => tracing::warn!("ZONE_AUDIO_WEBSOCKET_PORT must be > 0, ignoring"),
                Err(_) => tracing::warn!("Invalid ZONE_AUDIO_WEBSOCKET_PORT '{}', ignoring", value),
            }
        }

        if let Some(value) = var("ZONE_AUDIO_MAX_ATTEMPTS") {
            match value.parse() {
                Ok(parsed) => self.reconnect.max_attempts = parsed,
                Err(_) => tracing::warn!("Invalid ZONE_AUDIO_MAX_ATTEMPTS '{}', ignoring", value),
            }
        }
    }

    /// Validate configuration before the first connect attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.connection.user_id.is_none() {
            return invalid("connection.user-id is required");
        }
        if self.connection.user_password.as_deref().map_or(true, str::is_empty) {
            return invalid("connection.user-password is required");
        }
        if self.connection.server_id.is_none() {
            return invalid("connection.server-id is required");
        }
        if self.connection.endpoint.host.is_empty() {
            return invalid("connection.endpoint.host must not be empty");
        }
        if self.audio_tracks.is_empty() {
            return invalid("at least one audio track must be configured");
        }
        for id in self.audio_tracks.keys() {
            validate_identifier(id)
                .map_err(|e| ConfigError::Invalid(format!("audio-tracks: {e}")))?;
        }
        if self.audio_tracks.values().filter(|t| t.default).count() > 1 {
            return invalid("only one audio track may be flagged default");
        }
        if self.reconnect.interval == 0 {
            return invalid("reconnect.interval must be > 0");
        }
        if self.reconnect.max_interval < self.reconnect.interval {
            return invalid("reconnect.max-interval cannot be less than reconnect.interval");
        }
        if !(self.reconnect.delay >= 1.0) {
            return invalid("reconnect.delay must be >= 1.0");
        }
        if self.tracking.tick_frequency == 0 {
            return invalid("tracking.tick-frequency must be at least 1");
        }
        if self.tracking.max_buckets == 0 {
            return invalid("tracking.max-buckets must be at least 1");
        }
        Ok(())
    }

    /// `ws[s]://host:port/supplier`
    pub fn websocket_uri(&self) -> String {
        let endpoint = &self.connection.endpoint;
        let scheme = if endpoint.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{SUPPLIER_PATH}", endpoint.host, endpoint.websocket_port)
    }

    /// Base URL of the web application players open
    pub fn webapp_url(&self) -> String {
        let endpoint = &self.connection.endpoint;
        let scheme = if endpoint.secure { "https" } else { "http" };
        let port = if endpoint.webapp_port == 80 {
            String::new()
        } else {
            format!(":{}", endpoint.webapp_port)
        };
        let path = endpoint.webapp_path.trim_matches('/');
        if path.is_empty() {
            format!("{scheme}://{}{port}", endpoint.host)
        } else {
            format!("{scheme}://{}{port}/{path}", endpoint.host)
        }
    }

    /// Link a player opens to attach their audio session
    pub fn player_connect_url(&self, player: EntityId) -> Option<String> {
        let server_id = self.connection.server_id?;
        Some(format!(
            "{}/connect?s={}&u={}",
            self.webapp_url(),
            URL_SAFE_NO_PAD.encode(server_id.as_bytes()),
            URL_SAFE_NO_PAD.encode(player.as_bytes())
        ))
    }

    /// Track flagged `default`, else the first track by id
    pub fn default_track_id(&self) -> Option<&str> {
        self.audio_tracks
            .iter()
            .find(|(_, settings)| settings.default)
            .or_else(|| self.audio_tracks.iter().next())
            .map(|(id, _)| id.as_str())
    }

    pub fn check_delay(&self) -> Duration {
        Duration::from_millis(self.tracking.check_delay)
    }
}
