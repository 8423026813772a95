//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ESPCONNECT_CONFIG)
//! 3. Environment variables

use crate::connection::{basic_credentials, ConnectionConfig, TlsClientConfig};
use crate::eventsource::SourceOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    /// Subscriptions and publishing done by the demo binary.
    pub demo: DemoConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ESPCONNECT_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.server.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.url not set".to_string(),
            ));
        }
        self.auth.validate()?;
        self.tls.validate()?;
        if let Some(ref publish) = self.demo.publish {
            if publish.window.is_empty() {
                return Err(ConfigError::ValidationError(
                    "demo.publish.window not set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the connection settings described by this configuration.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;
        let mut config = ConnectionConfig::from_url(&self.server.url)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if let Some(ref token) = self.server.access_token {
            config = config.with_access_token(token.clone());
        }
        if let Some((incoming, outgoing)) = self.server.threads {
            config = config.with_threads(incoming, outgoing);
        }
        config = config
            .with_reconnect_interval(self.server.reconnect_interval())
            .with_connect_timeout(self.server.connect_timeout())
            .with_request_timeout(self.server.request_timeout());

        if let Some(ref token) = self.auth.bearer {
            config = config.with_bearer(token);
        } else if let Some(ref user) = self.auth.user {
            let password = self.auth.password.as_deref().unwrap_or("");
            config = config.with_basic(&basic_credentials(user, password));
        }

        if config.secure {
            config = config.with_tls(self.tls.client_config());
        }
        Ok(config)
    }
}

/// Server endpoint and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `ws(s)://`, `http(s)://` or `esp(s)://` URL of the server.
    pub url: String,
    pub access_token: Option<String>,
    /// Incoming and outgoing server threads for this connection.
    pub threads: Option<(u32, u32)>,
    /// Delay before reconnecting; 0 disables reconnection.
    pub reconnect_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:31415".to_string(),
            access_token: None,
            threads: None,
            reconnect_interval_ms: 1000,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ESPCONNECT_URL") {
            if !url.is_empty() {
                self.url = url;
            }
        }
        if let Ok(ms) = std::env::var("ESPCONNECT_RECONNECT") {
            if let Ok(ms) = ms.parse() {
                self.reconnect_interval_ms = ms;
            }
        }
        if let Ok(secs) = std::env::var("ESPCONNECT_CONNECT_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.connect_timeout_secs = secs;
            }
        }
        if let Ok(secs) = std::env::var("ESPCONNECT_REQUEST_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.request_timeout_secs = secs;
            }
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Credentials sent when the server answers the handshake with 401.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub bearer: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("ESPCONNECT_TOKEN") {
            if !token.is_empty() {
                self.bearer = Some(token);
            }
        }
        // user:password
        if let Ok(basic) = std::env::var("ESPCONNECT_BASIC") {
            if let Some((user, password)) = basic.split_once(':') {
                self.user = Some(user.to_string());
                self.password = Some(password.to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bearer.is_some() && self.user.is_some() {
            return Err(ConfigError::ValidationError(
                "auth.bearer and auth.user are mutually exclusive".to_string(),
            ));
        }
        if self.password.is_some() && self.user.is_none() {
            return Err(ConfigError::ValidationError(
                "auth.password set without auth.user".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS configuration for `wss://` servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM CA bundle; the webpki roots are used when unset.
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (development only).
    pub insecure: bool,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(insecure) = std::env::var("ESPCONNECT_TLS_INSECURE") {
            self.insecure = insecure == "1" || insecure.to_lowercase() == "true";
        }
        if let Ok(path) = std::env::var("ESPCONNECT_CA_CERT") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "tls.client_cert_path and tls.client_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn client_config(&self) -> TlsClientConfig {
        let mut tls = TlsClientConfig::new();
        if let Some(ref path) = self.ca_cert_path {
            tls = tls.with_ca_cert(path.clone());
        }
        if let (Some(cert), Some(key)) = (&self.client_cert_path, &self.client_key_path) {
            tls = tls.with_client_cert(cert.clone(), key.clone());
        }
        if self.insecure {
            tls = tls.with_insecure();
        }
        tls
    }
}

/// What the demo binary subscribes to and publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// `project/contquery/window` keys opened as event streams.
    pub streams: Vec<String>,
    /// Keys opened as event collections.
    pub collections: Vec<String>,
    pub maxevents: usize,
    /// Print engine stats every interval when set.
    pub stats: bool,
    pub publish: Option<DemoPublishConfig>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            collections: Vec::new(),
            maxevents: espconnect_protocol::DEFAULT_MAX_EVENTS,
            stats: false,
            publish: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoPublishConfig {
    /// Source window receiving the generated events.
    pub window: String,
    pub binary: bool,
    #[serde(flatten)]
    pub source: SourceOptions,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventsource::FieldGenerator;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.url, "ws://localhost:31415");
        assert_eq!(config.server.reconnect_interval(), Duration::from_secs(1));
        assert_eq!(config.server.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.demo.maxevents, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_config() {
        let mut config = Config::default();
        config.server.url = "https://esp.example.com/SASESP".to_string();
        config.server.threads = Some((2, 3));
        config.auth.user = Some("alice".to_string());
        config.auth.password = Some("secret".to_string());
        config.tls.insecure = true;

        let conn = config.connection_config().unwrap();
        assert!(conn.secure);
        assert!(conn.tls.insecure);
        assert_eq!(conn.effective_port(), 443);
        assert_eq!(
            conn.authorization.as_deref(),
            Some(format!("Basic {}", basic_credentials("alice", "secret")).as_str())
        );
        assert_eq!(
            conn.connect_url().unwrap().as_str(),
            "wss://esp.example.com/SASESP/eventStreamProcessing/v1/connect?_threads=2%2C3"
        );
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.auth.bearer = Some("t".to_string());
        config.auth.user = Some("u".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.tls.client_cert_path = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.url = String::new();
        assert!(config.connection_config().is_err());
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("espconnect.yaml");
        std::fs::write(
            &path,
            r#"
server:
  url: ws://esp:8080
  reconnect_interval_ms: 0
demo:
  streams: [trades/cq/src]
  publish:
    window: trades/cq/src
    batch: 10
    fields:
      - name: id
        kind: sequence
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.url, "ws://esp:8080");
        assert_eq!(config.server.reconnect_interval(), Duration::ZERO);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.demo.streams, vec!["trades/cq/src"]);
        let publish = config.demo.publish.as_ref().unwrap();
        assert_eq!(publish.source.batch, 10);
        assert_eq!(
            publish.source.fields[0].generator,
            FieldGenerator::Sequence { start: 1 }
        );

        let copy = dir.path().join("copy.yaml");
        config.save(&copy).unwrap();
        let reloaded = Config::from_file(&copy).unwrap();
        assert_eq!(reloaded.server.url, config.server.url);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/espconnect.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
        assert!(err.to_string().contains("/nonexistent/espconnect.yaml"));
    }
}
