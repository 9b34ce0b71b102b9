//! statewire Server
//!
//! The server owns one authoritative state tree, accepts client
//! connections and keeps every activated client in sync with it.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::connection::{ConnectionHandle, ConnectionId};
use super::hub::{Admission, Hub, PerClientTransform, ServerEvent};
use super::transport::BoxTransport;
use super::ConnectionLimits;
use crate::config::ServerConfig;
use crate::negotiation::{IceCandidate, NegotiationResult, PeerConnector, SessionDescription};
use crate::state::{apply_update, Map, MergeMode, Value};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("A server with id '{0}' is already attached")]
    DuplicateId(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// How a state update is merged and fanned out
#[derive(Clone, Default)]
pub struct SetStateOptions {
    pub mode: MergeMode,
    pub per_client: Option<PerClientTransform>,
}

impl SetStateOptions {
    /// Replace top-level keys instead of merging into them
    pub fn shallow(mut self) -> Self {
        self.mode = MergeMode::Shallow;
        self
    }

    /// Send each client its own view of the diff; empty views are skipped
    pub fn per_client<F>(mut self, transform: F) -> Self
    where
        F: Fn(&ConnectionHandle, &Map) -> Map + Send + Sync + 'static,
    {
        self.per_client = Some(Arc::new(transform));
        self
    }
}

/// statewire Server
#[derive(Clone)]
pub struct Server {
    id: Arc<str>,
    hub: Arc<Hub>,
}

impl Server {
    /// Create a new server
    pub fn new(config: &ServerConfig, initial_state: Map) -> Self {
        Self::with_limits(config.server_id(), ConnectionLimits::from(config), initial_state)
    }

    pub fn with_limits(id: impl Into<String>, limits: ConnectionLimits, initial_state: Map) -> Self {
        Self {
            id: Arc::from(id.into()),
            hub: Hub::new(limits, initial_state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.hub.take_event_receiver()
    }

    /// Listen for an application event from any client
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hub.on(name, handler);
    }

    /// Answer requests named `name`; replaces an earlier responder
    pub fn respond<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.hub.responders().insert(name, handler);
    }

    /// Decide on every connect request from its metadata
    pub fn set_gatekeeper<F>(&self, gatekeeper: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> Admission + Send + Sync + 'static,
    {
        self.hub.set_gatekeeper(gatekeeper);
    }

    /// Enable data channels
    pub fn set_peer_connector(&self, connector: Arc<dyn PeerConnector>) {
        self.hub.set_peer_connector(connector);
    }

    /// Current state snapshot
    pub async fn state(&self) -> Arc<Map> {
        self.hub.store().snapshot().await
    }

    /// Deep-merge `partial` into the state and broadcast what changed
    pub async fn set_state(&self, partial: Map) -> Arc<Map> {
        self.set_state_with(move |_| partial, SetStateOptions::default())
            .await
    }

    /// Like `set_state`, computing the partial from the current state
    pub async fn update_state<F>(&self, producer: F) -> Arc<Map>
    where
        F: FnOnce(&Map) -> Map + Send,
    {
        self.set_state_with(producer, SetStateOptions::default()).await
    }

    /// Apply an update and broadcast its diff.
    ///
    /// The state lock is held until every client has the diff queued, so
    /// concurrent updates reach all clients in the order they were applied.
    pub async fn set_state_with<F>(&self, producer: F, options: SetStateOptions) -> Arc<Map>
    where
        F: FnOnce(&Map) -> Map + Send,
    {
        let mut tree = self.hub.store().lock().await;
        let partial = producer(&tree);
        let changes = apply_update(&mut tree, &partial, options.mode);

        if changes.is_empty() {
            tracing::trace!("State update changed nothing");
        } else {
            tracing::debug!("Broadcasting {} changed keys", changes.len());
            self.hub
                .broadcast_state(changes, options.per_client.as_ref())
                .await;
        }

        Arc::clone(&*tree)
    }

    /// Send an application event to every activated client
    pub async fn emit_all(&self, name: impl Into<String>, args: Vec<Value>) {
        self.hub.emit_all(name, args).await;
    }

    pub async fn client(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.hub.connection(id).await
    }

    /// Get a list of connected clients
    pub async fn clients(&self) -> Vec<ConnectionHandle> {
        self.hub.connections().await
    }

    /// Adopt an already upgraded transport
    pub async fn accept(&self, transport: BoxTransport) -> ConnectionId {
        self.hub.accept(transport).await
    }

    /// Answer a client's data-channel offer, returning its id and our answer
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> NegotiationResult<(ConnectionId, SessionDescription)> {
        self.hub.accept_offer(offer).await
    }

    pub async fn exchange_ice_candidate(
        &self,
        client_id: ConnectionId,
        candidate: IceCandidate,
    ) -> NegotiationResult<IceCandidate> {
        self.hub.exchange_ice_candidate(client_id, candidate).await
    }

    /// Close every client connection
    pub async fn disconnect_all(&self, text: &str) {
        self.hub.disconnect_all(text).await;
    }
}
