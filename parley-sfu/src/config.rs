use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub meeting: MeetingConfig,
    pub rtc: RtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingConfig {
    /// Maximum number of connections admitted to one meeting
    pub max_connections: usize,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            max_connections: 255,
        }
    }
}

/// One ICE server entry (STUN, or TURN with credentials)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Peer connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// How long a fresh peer connection may stay unconnected
    pub connect_timeout_ms: u64,
    /// How long a disconnected peer connection may take to recover
    pub reconnect_timeout_ms: u64,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.ekiga.net".to_string()],
                username: None,
                credential: None,
            }],
            connect_timeout_ms: 10_000,
            reconnect_timeout_ms: 1_000,
        }
    }
}

impl RtcConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PARLEY_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PARLEY")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get the address the HTTP/WebSocket listener binds to
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.meeting.max_connections == 0 {
            errors.push("meeting.max_connections must be at least 1".to_string());
        }
        if self.rtc.connect_timeout_ms == 0 {
            errors.push("rtc.connect_timeout_ms must be non-zero".to_string());
        }
        if self.rtc.reconnect_timeout_ms == 0 {
            errors.push("rtc.reconnect_timeout_ms must be non-zero".to_string());
        }
        if self.rtc.ice_servers.iter().any(|s| s.urls.is_empty()) {
            errors.push("rtc.ice_servers entries must list at least one url".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.meeting.max_connections, 255);
        assert_eq!(config.rtc.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.rtc.reconnect_timeout(), Duration::from_secs(1));
        assert_eq!(config.rtc.ice_servers[0].urls[0], "stun:stun.ekiga.net");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            logging: LoggingConfig::default(),
            meeting: MeetingConfig::default(),
            rtc: RtcConfig::default(),
        };

        assert_eq!(config.http_address(), "127.0.0.1:5000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.meeting.max_connections = 0;
        config.rtc.ice_servers = vec![IceServerConfig {
            urls: Vec::new(),
            username: None,
            credential: None,
        }];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
