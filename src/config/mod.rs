//! Configuration module
//!
//! Handles loading and saving statewire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{DEFAULT_PORT, DEFAULT_ROUTE};
use crate::state::{map_from_json, Map};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid initial state: {0}")]
    State(#[from] serde_json::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Initial state of the served tree
    #[serde(default)]
    pub state: toml::Table,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Where the manager listens for socket upgrades
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path prefix for upgrades and signaling
    #[serde(default = "default_route")]
    pub route: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_route() -> String {
    DEFAULT_ROUTE.to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            route: default_route(),
        }
    }
}

impl ManagerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server id used in socket paths (auto-generated if not set)
    pub id: Option<String>,
    /// Inbound messages allowed per second before disconnecting
    #[serde(default = "default_max_messages")]
    pub max_messages_per_second: u32,
    /// Silence tolerated before a client is dropped, in ms
    #[serde(default = "default_client_timeout")]
    pub client_timeout_ms: u64,
    /// Added to the client timeout, in ms
    #[serde(default = "default_timeout_grace")]
    pub timeout_grace_ms: u64,
    /// Delay between the disconnection reason and teardown, in ms
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
    /// Data channel negotiation limit, in ms
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,
}

fn default_max_messages() -> u32 {
    75
}

fn default_client_timeout() -> u64 {
    20_000
}

fn default_timeout_grace() -> u64 {
    1_000
}

fn default_disconnect_grace() -> u64 {
    100
}

fn default_negotiation_timeout() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: None,
            max_messages_per_second: default_max_messages(),
            client_timeout_ms: default_client_timeout(),
            timeout_grace_ms: default_timeout_grace(),
            disconnect_grace_ms: default_disconnect_grace(),
            negotiation_timeout_ms: default_negotiation_timeout(),
        }
    }
}

impl ServerConfig {
    /// Get the server ID, generating one if not set
    pub fn server_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Origin of the manager, `ws://` or `wss://`
    #[serde(default = "default_url")]
    pub url: String,
    /// Path prefix the manager serves under
    #[serde(default = "default_route")]
    pub route: String,
    /// Server to join
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Ping interval in ms
    #[serde(default = "default_client_timeout")]
    pub heartbeat_interval_ms: u64,
    /// Socket connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Data channel negotiation limit, in ms
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,
    /// Skip the data channel attempt
    #[serde(default)]
    pub force_socket: bool,
}

fn default_url() -> String {
    format!("ws://127.0.0.1:{}", DEFAULT_PORT)
}

fn default_server_id() -> String {
    "main".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            route: default_route(),
            server_id: default_server_id(),
            heartbeat_interval_ms: default_client_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            negotiation_timeout_ms: default_negotiation_timeout(),
            force_socket: false,
        }
    }
}

impl ClientConfig {
    /// `{url}{route}/ether_{server_id}`
    pub fn socket_url(&self) -> String {
        format!(
            "{}{}/ether_{}",
            self.url.trim_end_matches('/'),
            self.route,
            self.server_id
        )
    }

    /// HTTP origin plus route, for signaling calls
    pub fn signaling_url(&self) -> String {
        let origin = self.url.trim_end_matches('/');
        let origin = if let Some(rest) = origin.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = origin.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            origin.to_string()
        };
        format!("{}{}", origin, self.route)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("statewire/config.toml")),
            Some(PathBuf::from("./statewire.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The `[state]` table as a state tree
    pub fn initial_state(&self) -> ConfigResult<Map> {
        let json = serde_json::to_value(&self.state)?;
        Ok(map_from_json(json))
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let mut state = toml::Table::new();
    state.insert("counter".to_string(), toml::Value::Integer(0));
    state.insert("clients".to_string(), toml::Value::Table(toml::Table::new()));

    let config = Config {
        server: ServerConfig {
            id: Some("main".to_string()),
            ..Default::default()
        },
        state,
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Value;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.manager.port, DEFAULT_PORT);
        assert_eq!(config.server.max_messages_per_second, 75);
        assert_eq!(config.client.heartbeat_interval_ms, 20_000);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.id = Some("lobby".to_string());
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.manager.port, config.manager.port);
        assert_eq!(loaded.server.server_id(), "lobby");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            max_messages_per_second = 10

            [state]
            counter = 3
            players = { alice = { score = 1 } }
            "#,
        )
        .unwrap();

        assert_eq!(config.server.max_messages_per_second, 10);
        assert_eq!(config.server.client_timeout_ms, 20_000);

        let state = config.initial_state().unwrap();
        assert_eq!(state.get("counter"), Some(&Value::from(3)));
        let alice = state
            .get("players")
            .and_then(|p| p.get("alice"))
            .and_then(|a| a.get("score"));
        assert_eq!(alice, Some(&Value::from(1)));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.server.id.as_deref(), Some("main"));
        assert!(parsed.state.contains_key("counter"));
    }

    #[test]
    fn test_client_urls() {
        let client = ClientConfig {
            url: "wss://example.com/".to_string(),
            server_id: "lobby".to_string(),
            ..Default::default()
        };
        assert_eq!(client.socket_url(), "wss://example.com/statewire/ether_lobby");
        assert_eq!(client.signaling_url(), "https://example.com/statewire");
    }
}
