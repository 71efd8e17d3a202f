//! Configuration management

use crate::tunnel::{SessionSettings, DEFAULT_MTU, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Session timing, shared by both ends
    #[serde(default)]
    pub session: SessionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.session.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// TLS certificate path (PEM); TLS is off unless both cert and key are set
    pub tls_cert: Option<String>,
    /// TLS private key path (PEM)
    pub tls_key: Option<String>,
    /// Issued client credentials (TOML)
    pub credentials_file: String,
    /// Local endpoint each session's traffic is relayed to
    pub adapter_target: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Seconds a new connection has to present its credentials
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            tls_cert: None,
            tls_key: None,
            credentials_file: "clients.toml".to_string(),
            adapter_target: "127.0.0.1:8080".to_string(),
            max_connections: 1000,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Client identity (hex), as issued by the server admin
    pub identity: String,
    /// Client secret (hex)
    pub secret: String,
    /// Client key (base64)
    pub key: String,
    /// Local endpoint whose traffic is tunnelled
    pub adapter_target: String,
    /// TLS server name; plain TCP when unset
    pub tls_sni: Option<String>,
    /// CA bundle used to verify the server instead of the web PKI roots
    pub tls_ca: Option<String>,
    /// Connect and handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            identity: String::new(),
            secret: String::new(),
            key: String::new(),
            adapter_target: "127.0.0.1:9000".to_string(),
            tls_sni: None,
            tls_ca: None,
            connect_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Session timing and buffer sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between keepalive pings
    pub keepalive_interval_secs: u64,
    /// Seconds of peer silence before the session is closed
    pub liveness_timeout_secs: u64,
    /// Largest packet read from the adapter
    pub mtu: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            keepalive_interval_secs: defaults.keepalive_interval.as_secs(),
            liveness_timeout_secs: defaults.liveness_timeout.as_secs(),
            mtu: DEFAULT_MTU,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.keepalive_interval_secs == 0 {
            return Err(crate::Error::Config(
                "session.keepalive_interval_secs must be positive".to_string(),
            ));
        }
        if self.liveness_timeout_secs < self.keepalive_interval_secs {
            return Err(crate::Error::Config(
                "session.liveness_timeout_secs must be at least the keepalive interval".to_string(),
            ));
        }
        if self.mtu == 0 || self.mtu > MAX_PAYLOAD_SIZE {
            return Err(crate::Error::Config(format!(
                "session.mtu must be between 1 and {}",
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            mtu: self.mtu,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        session: SessionConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrip() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed = Config::parse(&text).unwrap();

        assert_eq!(parsed.session, SessionConfig::default());
        assert_eq!(parsed.server.unwrap().max_connections, 1000);
        assert_eq!(parsed.client.unwrap().adapter_target, "127.0.0.1:9000");
    }

    #[test]
    fn test_default_addresses_use_default_port() {
        assert_eq!(ServerConfig::default().listen, "0.0.0.0:7443");
        assert_eq!(ClientConfig::default().server, "127.0.0.1:7443");
        assert_eq!(crate::DEFAULT_PORT, 7443);
    }

    #[test]
    fn test_session_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.server.is_none());
        assert_eq!(config.session.settings(), SessionSettings::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_session_section() {
        let config = Config::parse("[session]\nliveness_timeout_secs = 60\n").unwrap();
        let settings = config.session.settings();
        assert_eq!(settings.keepalive_interval, Duration::from_secs(15));
        assert_eq!(settings.liveness_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_session_rejected() {
        for text in [
            "[session]\nkeepalive_interval_secs = 0\n",
            "[session]\nkeepalive_interval_secs = 20\nliveness_timeout_secs = 10\n",
            "[session]\nmtu = 0\n",
            "[session]\nmtu = 70000\n",
        ] {
            assert!(
                matches!(Config::parse(text), Err(crate::Error::Config(_))),
                "{:?} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("sluice-config-{}.toml", std::process::id()));
        let mut config = generate_example_config();
        config.logging.level = "debug".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.logging.level, "debug");
    }
}
