//! Server manager
//!
//! Holds several servers by id and routes to them:
//! - WebSocket upgrades on `{route}/ether_{server_id}`
//! - `/signal` and `/ice_candidate` bodies from the HTTP layer

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use super::server::{Server, ServerError, ServerResult};
use super::transport::WebSocketTransport;
use crate::config::{ManagerConfig, ServerConfig};
use crate::negotiation::{
    IceCandidate, IceRequest, NegotiationError, NegotiationResult, SignalAnswer, SignalReply,
    SignalRequest,
};
use crate::state::Map;

const SERVER_PREFIX: &str = "/ether_";

pub struct Manager {
    route: String,
    servers: RwLock<HashMap<String, Server>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Manager {
    pub fn new(route: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            route: route.into(),
            servers: RwLock::new(HashMap::new()),
            shutdown_tx: Mutex::new(None),
        })
    }

    pub fn from_config(config: &ManagerConfig) -> Arc<Self> {
        Self::new(config.route.clone())
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Create a server and attach it
    pub fn create_server(&self, config: &ServerConfig, initial_state: Map) -> ServerResult<Server> {
        let server = Server::new(config, initial_state);
        self.attach(server.clone())?;
        Ok(server)
    }

    pub fn attach(&self, server: Server) -> ServerResult<()> {
        let mut servers = self.servers.write();
        if servers.contains_key(server.id()) {
            return Err(ServerError::DuplicateId(server.id().to_string()));
        }

        tracing::info!("Attached server {}", server.id());
        servers.insert(server.id().to_string(), server);
        Ok(())
    }

    pub fn detach(&self, id: &str) -> Option<Server> {
        self.servers.write().remove(id)
    }

    pub fn server(&self, id: &str) -> Option<Server> {
        self.servers.read().get(id).cloned()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// Extract the server id from an upgrade path
    pub fn server_id_from_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let id = path.strip_prefix(self.route.as_str())?.strip_prefix(SERVER_PREFIX)?;
        (!id.is_empty()).then_some(id)
    }

    /// Bind and serve in the background until `stop`
    pub async fn listen(self: &Arc<Self>, addr: &str) -> ServerResult<SocketAddr> {
        if self.shutdown_tx.lock().is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Manager listening on {}{}", local_addr, self.route);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.serve(listener) => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!("Manager shutdown requested");
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop listening and close every client of every server
    pub async fn stop(&self) -> ServerResult<()> {
        let shutdown_tx = self.shutdown_tx.lock().take().ok_or(ServerError::NotRunning)?;
        let _ = shutdown_tx.send(()).await;

        let servers: Vec<Server> = self.servers.read().values().cloned().collect();
        for server in servers {
            server.disconnect_all("Server shutting down").await;
        }
        Ok(())
    }

    /// Accept connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    tokio::spawn(Arc::clone(&self).upgrade(stream, addr));
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn upgrade(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut target: Option<Server> = None;

        let resolve = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path();
            match self.server_id_from_path(path).and_then(|id| self.server(id)) {
                Some(server) => {
                    target = Some(server);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some(format!("No server at {}", path)));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        };

        let stream = match tokio_tungstenite::accept_hdr_async(stream, resolve).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
        };

        if let Some(server) = target {
            let id = server.accept(Box::new(WebSocketTransport::new(stream))).await;
            tracing::info!("{} joined server {} as connection {}", addr, server.id(), id);
        }
    }

    /// `POST {route}/signal`
    pub async fn handle_signal(&self, body: &str) -> SignalReply<SignalAnswer> {
        let result = self.signal(body).await;
        if let Err(e) = &result {
            tracing::warn!("Signaling failed: {}", e);
        }
        result.into()
    }

    async fn signal(&self, body: &str) -> NegotiationResult<SignalAnswer> {
        let request: SignalRequest = serde_json::from_str(body)?;
        let server = self
            .server(&request.server_id)
            .ok_or(NegotiationError::UnknownServer(request.server_id))?;

        let (client_id, description) = server.accept_offer(request.description).await?;
        Ok(SignalAnswer {
            client_id,
            description,
        })
    }

    /// `POST {route}/ice_candidate`
    pub async fn handle_ice_candidate(&self, body: &str) -> SignalReply<IceCandidate> {
        let result = self.ice_candidate(body).await;
        if let Err(e) = &result {
            tracing::warn!("ICE candidate exchange failed: {}", e);
        }
        result.into()
    }

    async fn ice_candidate(&self, body: &str) -> NegotiationResult<IceCandidate> {
        let request: IceRequest = serde_json::from_str(body)?;
        let server = self
            .server(&request.server_id)
            .ok_or(NegotiationError::UnknownServer(request.server_id))?;

        server
            .exchange_ice_candidate(request.client_id, request.candidate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::negotiation::{error_codes, PeerDialer, PeerLink, SessionDescription, Signaling};
    use crate::network::{Client, ClientError, ClientEvent, ConnectionLimits};
    use crate::state::{map_from_json, Value};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn manager_with_main() -> Arc<Manager> {
        let manager = Manager::new("/statewire");
        let server = Server::with_limits(
            "main",
            ConnectionLimits::default(),
            map_from_json(json!({"counter": 7})),
        );
        manager.attach(server).unwrap();
        manager
    }

    fn client_config(addr: SocketAddr, server_id: &str) -> ClientConfig {
        ClientConfig {
            url: format!("ws://{}", addr),
            server_id: server_id.to_string(),
            force_socket: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_server_id_from_path() {
        let manager = Manager::new("/statewire");
        assert_eq!(manager.server_id_from_path("/statewire/ether_main"), Some("main"));
        assert_eq!(manager.server_id_from_path("/statewire/ether_"), None);
        assert_eq!(manager.server_id_from_path("/other/ether_main"), None);
        assert_eq!(manager.server_id_from_path("/statewire/main"), None);
    }

    #[test]
    fn test_duplicate_server_ids() {
        let manager = manager_with_main();
        let again = Server::with_limits("main", ConnectionLimits::default(), Map::new());
        assert!(matches!(manager.attach(again), Err(ServerError::DuplicateId(_))));
        assert_eq!(manager.server_ids(), vec!["main".to_string()]);
    }

    #[tokio::test]
    async fn test_signal_error_codes() {
        let manager = manager_with_main();

        let malformed = manager.handle_signal("{not json").await;
        assert_eq!(malformed, SignalReply::failed(error_codes::MALFORMED_BODY));

        let unknown = manager
            .handle_signal(r#"{"serverID":"nope","description":{"type":"offer","sdp":""}}"#)
            .await;
        assert_eq!(unknown, SignalReply::failed(error_codes::UNKNOWN_SERVER));

        let unsupported = manager
            .handle_signal(r#"{"serverID":"main","description":{"type":"offer","sdp":""}}"#)
            .await;
        assert_eq!(unsupported, SignalReply::failed(error_codes::NEGOTIATION_FAILED));

        let candidate = manager
            .handle_ice_candidate(r#"{"serverID":"main","clientID":42,"candidate":{"candidate":"x"}}"#)
            .await;
        assert_eq!(candidate, SignalReply::failed(error_codes::NEGOTIATION_FAILED));
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let manager = manager_with_main();
        let addr = manager.listen("127.0.0.1:0").await.unwrap();

        let mut client = Client::new(client_config(addr, "main"));
        let mut events = client.take_event_receiver().unwrap();
        client.connect(Value::Null).await.unwrap();

        match events.recv().await.unwrap() {
            ClientEvent::Connected { state, .. } => {
                assert_eq!(state.get("counter"), Some(&Value::from(7)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let server = manager.server("main").unwrap();
        server.set_state(map_from_json(json!({"counter": 8}))).await;
        assert!(matches!(events.recv().await, Some(ClientEvent::StateUpdate { .. })));

        manager.stop().await.unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Disconnected { .. })));
        assert!(matches!(manager.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_unknown_server_is_refused() {
        let manager = manager_with_main();
        let addr = manager.listen("127.0.0.1:0").await.unwrap();

        let client = Client::new(client_config(addr, "elsewhere"));
        let result = client.connect(Value::Null).await;
        assert!(matches!(result, Err(ClientError::WebSocket(_))));
        assert!(!client.is_connected().await);
    }

    struct BrokenDialer;

    #[async_trait]
    impl PeerDialer for BrokenDialer {
        async fn create_offer(&self) -> NegotiationResult<(SessionDescription, Box<dyn PeerLink>)> {
            Err(NegotiationError::Peer("no WebRTC stack".to_string()))
        }
    }

    struct LocalSignaling(Arc<Manager>);

    #[async_trait]
    impl Signaling for LocalSignaling {
        async fn signal(&self, request: &SignalRequest) -> NegotiationResult<SignalAnswer> {
            let body = serde_json::to_string(request)?;
            self.0.handle_signal(&body).await.into_result()
        }

        async fn exchange_candidate(&self, request: &IceRequest) -> NegotiationResult<IceCandidate> {
            let body = serde_json::to_string(request)?;
            self.0.handle_ice_candidate(&body).await.into_result()
        }
    }

    #[tokio::test]
    async fn test_failed_negotiation_falls_back_to_socket() {
        let manager = manager_with_main();
        let addr = manager.listen("127.0.0.1:0").await.unwrap();

        let config = ClientConfig {
            force_socket: false,
            negotiation_timeout_ms: 500,
            ..client_config(addr, "main")
        };
        let mut client = Client::new(config)
            .with_peer_dialer(Arc::new(BrokenDialer), Arc::new(LocalSignaling(Arc::clone(&manager))));
        let mut events = client.take_event_receiver().unwrap();

        tokio::time::timeout(Duration::from_secs(5), client.connect(Value::Null))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));
        assert!(client.id().await.is_none());
    }
}
