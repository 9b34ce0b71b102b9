//! statewire Client
//!
//! Connects to a statewire server, keeps a local mirror of its state and
//! exchanges events and requests with it.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;

use super::connection::{ConnectionId, Outbound};
use super::request::{await_response, Correlator, RequestError, Responders};
use super::transport::{BoxTransport, WebSocketTransport};
use crate::config::ClientConfig;
use crate::negotiation::{HttpSignaling, NegotiationError, Negotiator, PeerDialer, Signaling};
use crate::protocol::{decode, encode, CodecError, DisconnectCode, DisconnectReason, NetworkEvent};
use crate::state::{merge, Map, Value};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server accepted us and sent its state
    Connected { state: Arc<Map>, welcome: Value },
    /// A diff was merged into the local mirror
    StateUpdate {
        state: Arc<Map>,
        diff: Arc<Map>,
        previous: Arc<Map>,
    },
    /// Application event from the server
    Message { name: String, args: Vec<Value> },
    /// The connection ended
    Disconnected { reason: DisconnectReason },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// State shared between the client and its connection task
struct Shared {
    state: RwLock<ClientState>,
    mirror: RwLock<Arc<Map>>,
    id: RwLock<Option<ConnectionId>>,
    outbound: RwLock<Option<mpsc::UnboundedSender<Outbound>>>,
    requests: Arc<Correlator>,
    responders: Responders<()>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl Shared {
    fn notify(&self, event: ClientEvent) {
        if self.event_rx.lock().is_some() {
            // receiver never taken
            return;
        }
        if self.event_tx.send(event).is_err() {
            tracing::trace!("Client event receiver dropped");
        }
    }

    async fn send_event(&self, event: NetworkEvent) -> ClientResult<()> {
        let frame = encode(event)?;
        let outbound = self.outbound.read().await;
        let sender = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        sender
            .send(Outbound::Frame(frame))
            .map_err(|_| ClientError::NotConnected)
    }

    async fn handle_inbound(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::InitialData { state, welcome } => {
                *self.mirror.write().await = Arc::clone(&state);
                tracing::info!("Received initial state ({} keys)", state.len());
                self.notify(ClientEvent::Connected { state, welcome });
            }
            NetworkEvent::StateUpdate { diff } => {
                let mut mirror = self.mirror.write().await;
                let previous = Arc::clone(&*mirror);
                merge(Arc::make_mut(&mut *mirror), &diff);
                let state = Arc::clone(&*mirror);
                drop(mirror);

                self.notify(ClientEvent::StateUpdate {
                    state,
                    diff,
                    previous,
                });
            }
            NetworkEvent::Request { name, id, args } => {
                let Some(responder) = self.responders.get(&name) else {
                    tracing::debug!("No responder for '{}'", name);
                    return;
                };

                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let result = responder((), args).await;
                    if let Err(e) = shared.send_event(NetworkEvent::Response { id, result }).await {
                        tracing::debug!("Dropping response {}: {}", id, e);
                    }
                });
            }
            NetworkEvent::Response { id, result } => {
                if !self.requests.fulfill(id, result) {
                    tracing::debug!("Discarding response for unknown request {}", id);
                }
            }
            NetworkEvent::App { name, args } => {
                self.notify(ClientEvent::Message { name, args });
            }
            other => {
                tracing::debug!("Ignoring client-bound {}", other.label());
            }
        }
    }
}

/// statewire Client
pub struct Client {
    /// Client configuration
    config: ClientConfig,
    shared: Arc<Shared>,
    negotiator: Option<Negotiator>,
}

impl Client {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ClientState::Disconnected),
                mirror: RwLock::new(Arc::new(Map::new())),
                id: RwLock::new(None),
                outbound: RwLock::new(None),
                requests: Arc::new(Correlator::new()),
                responders: Responders::new(),
                event_tx,
                event_rx: parking_lot::Mutex::new(Some(event_rx)),
            }),
            negotiator: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.shared.event_rx.lock().take()
    }

    /// Try a data channel before falling back to the WebSocket
    pub fn with_peer_dialer(mut self, dialer: Arc<dyn PeerDialer>, signaling: Arc<dyn Signaling>) -> Self {
        self.negotiator = Some(Negotiator::new(dialer, signaling));
        self
    }

    /// Like `with_peer_dialer`, signaling over HTTP to the configured origin
    pub fn with_http_signaling(self, dialer: Arc<dyn PeerDialer>) -> ClientResult<Self> {
        let signaling = HttpSignaling::new(
            self.config.signaling_url(),
            Duration::from_millis(self.config.negotiation_timeout_ms),
        )?;
        Ok(self.with_peer_dialer(dialer, Arc::new(signaling)))
    }

    /// Connect to the configured server and send the connect request
    pub async fn connect(&self, metadata: Value) -> ClientResult<()> {
        let hello = encode(NetworkEvent::ConnectRequest { metadata })?;
        self.begin_connecting().await?;

        match self.open_transport().await {
            Ok(transport) => {
                self.start(transport, hello).await;
                Ok(())
            }
            Err(e) => {
                *self.shared.state.write().await = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    /// Run the protocol over an already open transport
    pub async fn connect_with(&self, transport: BoxTransport, metadata: Value) -> ClientResult<()> {
        let hello = encode(NetworkEvent::ConnectRequest { metadata })?;
        self.begin_connecting().await?;
        self.start(transport, hello).await;
        Ok(())
    }

    async fn begin_connecting(&self) -> ClientResult<()> {
        let mut state = self.shared.state.write().await;
        if *state != ClientState::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }
        *state = ClientState::Connecting;
        Ok(())
    }

    async fn open_transport(&self) -> ClientResult<BoxTransport> {
        if let Some(negotiator) = self.negotiator.as_ref().filter(|_| !self.config.force_socket) {
            let limit = Duration::from_millis(self.config.negotiation_timeout_ms);
            match negotiator.negotiate(&self.config.server_id, limit).await {
                Ok((id, transport)) => {
                    *self.shared.id.write().await = Some(id);
                    return Ok(transport);
                }
                Err(e) => tracing::warn!("Data channel negotiation failed: {}", e),
            }
            tracing::info!("Falling back to WebSocket");
        }

        self.open_socket().await
    }

    async fn open_socket(&self) -> ClientResult<BoxTransport> {
        let url = self.config.socket_url();
        tracing::info!("Connecting to {}", url);

        let connecting = tokio_tungstenite::connect_async(url.as_str());
        let (stream, _) = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        Ok(Box::new(WebSocketTransport::new(stream)))
    }

    async fn start(&self, transport: BoxTransport, hello: Bytes) {
        let (sender, outbound) = mpsc::unbounded_channel();
        // queued first so it is the first message on the wire
        let _ = sender.send(Outbound::Frame(hello));

        *self.shared.outbound.write().await = Some(sender);
        *self.shared.state.write().await = ClientState::Connected;

        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        tokio::spawn(run_client(Arc::clone(&self.shared), transport, outbound, heartbeat));
    }

    /// Send an application event to the server
    pub async fn emit(&self, name: impl Into<String>, args: Vec<Value>) -> ClientResult<()> {
        self.shared.send_event(NetworkEvent::app(name, args)).await
    }

    /// Ask the server's responder for `name` and wait for the answer
    pub async fn request(&self, name: impl Into<String>, args: Vec<Value>) -> ClientResult<Value> {
        self.send_request(name.into(), args, None).await
    }

    /// Like `request`, but gives up after `timeout`
    pub async fn request_timeout(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
        timeout: Duration,
    ) -> ClientResult<Value> {
        self.send_request(name.into(), args, Some(timeout)).await
    }

    async fn send_request(&self, name: String, args: Vec<Value>, timeout: Option<Duration>) -> ClientResult<Value> {
        let pending = self.shared.requests.register();
        self.shared
            .send_event(NetworkEvent::Request {
                name,
                id: pending.id(),
                args,
            })
            .await?;

        Ok(await_response(pending, timeout).await?)
    }

    /// Answer server requests named `name`; replaces an earlier responder
    pub fn respond<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.shared
            .responders
            .insert(name, move |_: (), args| handler(args));
    }

    /// Local mirror of the server state
    pub async fn state(&self) -> Arc<Map> {
        Arc::clone(&*self.shared.mirror.read().await)
    }

    pub async fn connection_state(&self) -> ClientState {
        *self.shared.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ClientState::Connected
    }

    /// Id assigned by the server during data channel signaling
    pub async fn id(&self) -> Option<ConnectionId> {
        *self.shared.id.read().await
    }

    /// Disconnect from the server
    pub async fn disconnect(&self) -> ClientResult<()> {
        let outbound = self.shared.outbound.read().await;
        let sender = outbound.as_ref().ok_or(ClientError::NotConnected)?;
        sender
            .send(Outbound::Close(DisconnectReason::manual("Client disconnected")))
            .map_err(|_| ClientError::NotConnected)
    }
}

async fn run_client(
    shared: Arc<Shared>,
    mut transport: BoxTransport,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut server_reason: Option<DisconnectReason> = None;

    let local_reason = loop {
        tokio::select! {
            inbound = transport.recv() => match inbound {
                Ok(Some(frame)) => match decode(&frame) {
                    Ok(NetworkEvent::DisconnectionReason(reason)) => {
                        tracing::info!("Server is closing the connection: {}", reason);
                        server_reason = Some(reason);
                    }
                    Ok(event) => shared.handle_inbound(event).await,
                    Err(e) => {
                        tracing::warn!("Protocol violation from server: {}", e);
                        break DisconnectReason::new(DisconnectCode::ConnectionFailure, "Protocol violation");
                    }
                },
                Ok(None) => {
                    break DisconnectReason::new(DisconnectCode::ConnectionFailure, "Connection closed");
                }
                Err(e) => {
                    tracing::warn!("Transport failure: {}", e);
                    break DisconnectReason::new(DisconnectCode::ConnectionFailure, "Socket failure");
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        tracing::warn!("Transport failure: {}", e);
                        break DisconnectReason::new(DisconnectCode::ConnectionFailure, "Socket failure");
                    }
                }
                Some(Outbound::Close(reason)) => break reason,
                None => break DisconnectReason::manual("Client dropped"),
            },
            _ = ping.tick() => {
                let sent = match encode(NetworkEvent::Ping) {
                    Ok(frame) => transport.send(frame).await,
                    Err(e) => {
                        tracing::error!("Failed to encode ping: {}", e);
                        Ok(())
                    }
                };
                if let Err(e) = sent {
                    tracing::warn!("Transport failure: {}", e);
                    break DisconnectReason::new(DisconnectCode::ConnectionFailure, "Socket failure");
                }
            }
        }
    };

    *shared.outbound.write().await = None;
    *shared.state.write().await = ClientState::Disconnected;
    shared.requests.cancel_all();
    transport.close().await;

    let reason = server_reason.unwrap_or(local_reason);
    tracing::info!("Disconnected: {}", reason);
    shared.notify(ClientEvent::Disconnected { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ChannelTransport, ConnectionLimits, Server, Transport, TransportKind};
    use crate::state::map_from_json;
    use serde_json::json;
    use tokio::time::sleep;

    async fn linked(server: &Server) -> (ConnectionId, ChannelTransport) {
        let (local, remote) = ChannelTransport::pair(TransportKind::Socket);
        (server.accept(Box::new(local)).await, remote)
    }

    fn demo_server() -> Server {
        Server::with_limits(
            "main",
            ConnectionLimits::default(),
            map_from_json(json!({"counter": 0, "clients": {}})),
        )
    }

    #[test]
    fn test_client_creation() {
        let mut client = Client::new(ClientConfig::default());
        assert!(client.take_event_receiver().is_some());
        assert!(client.take_event_receiver().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_follows_server() {
        let server = demo_server();
        let (_, transport) = linked(&server).await;

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client
            .connect_with(Box::new(transport), Value::from("alice"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ClientEvent::Connected { state, .. } => {
                assert_eq!(state.get("counter"), Some(&Value::from(0)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        server
            .set_state(map_from_json(json!({"counter": 1, "clients": {"1": "alice"}})))
            .await;

        match events.recv().await.unwrap() {
            ClientEvent::StateUpdate {
                state,
                diff,
                previous,
            } => {
                assert_eq!(previous.get("counter"), Some(&Value::from(0)));
                assert_eq!(diff.get("counter"), Some(&Value::from(1)));
                assert_eq!(*state, *server.state().await);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(*client.state().await, *server.state().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_updates_is_not_dropped() {
        let server = demo_server();
        let (_, transport) = linked(&server).await;

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client
            .connect_with(Box::new(transport), Value::Null)
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));

        for i in 1..=300 {
            server.set_state(map_from_json(json!({ "counter": i }))).await;
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*client.state().await, *server.state().await);

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, ClientEvent::StateUpdate { .. }));
            updates += 1;
        }
        assert_eq!(updates, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_both_ways() {
        let server = demo_server();
        server.respond("double", |_, args: Vec<Value>| async move {
            Value::from(args.first().and_then(Value::as_i64).unwrap_or(0) * 2)
        });
        let (id, transport) = linked(&server).await;

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client.respond("whoami", |_| async { Value::from("alice") });
        client
            .connect_with(Box::new(transport), Value::Null)
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));

        let doubled = client.request("double", vec![Value::from(21)]).await.unwrap();
        assert_eq!(doubled, Value::from(42));

        let handle = server.client(id).await.unwrap();
        assert_eq!(handle.request("whoami", vec![]).await.unwrap(), Value::from("alice"));

        let missing = client
            .request_timeout("missing", vec![], Duration::from_secs(2))
            .await;
        assert!(matches!(missing, Err(ClientError::Request(RequestError::Timeout(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_events_and_disconnect() {
        let server = demo_server();
        let (id, transport) = linked(&server).await;

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client
            .connect_with(Box::new(transport), Value::Null)
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));

        server.emit_all("chat", vec![Value::from("hello")]).await;
        match events.recv().await.unwrap() {
            ClientEvent::Message { name, args } => {
                assert_eq!(name, "chat");
                assert_eq!(args, vec![Value::from("hello")]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        server.client(id).await.unwrap().disconnect("kicked").unwrap();
        match events.recv().await.unwrap() {
            ClientEvent::Disconnected { reason } => {
                assert_eq!(reason, DisconnectReason::manual("kicked"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!client.is_connected().await);
        assert!(matches!(client.emit("late", vec![]).await, Err(ClientError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_connection_alive() {
        let server = demo_server();
        let (_, transport) = linked(&server).await;

        let mut client = Client::new(ClientConfig::default());
        let mut events = client.take_event_receiver().unwrap();
        client
            .connect_with(Box::new(transport), Value::Null)
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(ClientEvent::Connected { .. })));

        sleep(Duration::from_secs(90)).await;
        assert!(client.is_connected().await);
        assert_eq!(server.clients().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_message_is_connect_request() {
        let (local, mut remote) = ChannelTransport::pair(TransportKind::Socket);
        let client = Client::new(ClientConfig::default());
        client
            .connect_with(Box::new(local), Value::from("meta"))
            .await
            .unwrap();

        let frame = remote.recv().await.unwrap().unwrap();
        match decode(&frame).unwrap() {
            NetworkEvent::ConnectRequest { metadata } => assert_eq!(metadata, Value::from("meta")),
            other => panic!("unexpected event {:?}", other),
        }

        let frame = remote.recv().await.unwrap().unwrap();
        assert!(matches!(decode(&frame).unwrap(), NetworkEvent::Ping));

        assert!(matches!(
            client.connect_with(Box::new(ChannelTransport::pair(TransportKind::Socket).0), Value::Null).await,
            Err(ClientError::AlreadyConnected)
        ));
    }
}
