//! Network module - Handles state synchronization between a server and its clients
//!
//! Provides:
//! - Hub and server for accepting connections and broadcasting state
//! - Client for connecting to a server and mirroring its state
//! - Manager routing socket upgrades and signaling to several servers
//! - Connection limits, request correlation and transports

mod client;
mod connection;
mod hub;
mod manager;
mod request;
mod server;
mod transport;

pub use client::*;
pub use connection::*;
pub use hub::*;
pub use manager::*;
pub use request::*;
pub use server::*;
pub use transport::*;

use std::time::Duration;

use crate::config::ServerConfig;

/// Limits applied to every connection of a server
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Inbound messages allowed per one-second window
    pub max_messages_per_second: u32,
    /// Silence tolerated before a client is considered dead
    pub client_timeout: Duration,
    /// Added to `client_timeout` to absorb network jitter
    pub timeout_grace: Duration,
    /// Time between the disconnection reason and teardown
    pub disconnect_grace: Duration,
    /// How long a data channel may take to negotiate and open
    pub negotiation_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_messages_per_second: 75,
            client_timeout: Duration::from_millis(20_000),
            timeout_grace: Duration::from_millis(1_000),
            disconnect_grace: Duration::from_millis(100),
            negotiation_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ConnectionLimits {
    /// Total silence allowed between two inbound messages
    pub fn heartbeat_window(&self) -> Duration {
        self.client_timeout + self.timeout_grace
    }
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_messages_per_second: config.max_messages_per_second,
            client_timeout: Duration::from_millis(config.client_timeout_ms),
            timeout_grace: Duration::from_millis(config.timeout_grace_ms),
            disconnect_grace: Duration::from_millis(config.disconnect_grace_ms),
            negotiation_timeout: Duration::from_millis(config.negotiation_timeout_ms),
        }
    }
}
