//! Connection hub
//!
//! Owns the connection index of one server and:
//! - Runs an I/O task (inbound, outbound, heartbeat) and a listener task
//!   per connection
//! - Intercepts system events and dispatches application events
//! - Multicasts state updates and application events
//! - Parks data-channel links while they negotiate

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionId, ConnectionResult, Outbound};
use super::request::Responders;
use super::transport::{BoxTransport, TransportKind};
use super::ConnectionLimits;
use crate::negotiation::{
    first_selectable_candidate, IceCandidate, NegotiationError, NegotiationResult, PeerConnector,
    PeerLink, SessionDescription,
};
use crate::protocol::{encode, DisconnectCode, DisconnectReason, NetworkEvent, RequestId};
use crate::state::{Map, StateStore, Value};

/// Verdict of the gatekeeper on a connect request
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Activate the client and send it this welcome payload
    Accept(Value),
    /// Close with `INVALID_INITIAL_DATA`
    Reject,
}

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client finished the handshake
    Connected {
        client: ConnectionHandle,
        metadata: Value,
    },
    /// A client connection ended
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
}

/// Handler for one application event name
pub type Listener = Arc<dyn Fn(ConnectionHandle, Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Derives what one client is sent from a state diff
pub type PerClientTransform = Arc<dyn Fn(&ConnectionHandle, &Map) -> Map + Send + Sync>;

type Gatekeeper = Arc<dyn Fn(&ConnectionHandle, &Value) -> Admission + Send + Sync>;

pub struct Hub {
    limits: ConnectionLimits,
    store: StateStore,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
    listeners: parking_lot::RwLock<HashMap<String, Vec<Listener>>>,
    responders: Responders<ConnectionHandle>,
    gatekeeper: parking_lot::RwLock<Gatekeeper>,
    connector: parking_lot::RwLock<Option<Arc<dyn PeerConnector>>>,
    negotiating: parking_lot::Mutex<HashMap<ConnectionId, Box<dyn PeerLink>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
}

/// An application event waiting for its listeners
type Inbox = mpsc::UnboundedSender<(String, Vec<Value>)>;

impl Hub {
    pub fn new(limits: ConnectionLimits, initial_state: Map) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let gatekeeper: Gatekeeper = Arc::new(|_, _| Admission::Accept(Value::Null));

        Arc::new(Self {
            limits,
            store: StateStore::new(initial_state),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            listeners: parking_lot::RwLock::new(HashMap::new()),
            responders: Responders::new(),
            gatekeeper: parking_lot::RwLock::new(gatekeeper),
            connector: parking_lot::RwLock::new(None),
            negotiating: parking_lot::Mutex::new(HashMap::new()),
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
        })
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.lock().take()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    /// Add a listener for an application event.
    ///
    /// Listeners of one connection run one at a time in arrival order, on a
    /// task of their own; the connection keeps serving I/O meanwhile.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(ConnectionHandle, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |client, args| handler(client, args).boxed());
        self.listeners
            .write()
            .entry(name.into())
            .or_default()
            .push(listener);
    }

    pub fn responders(&self) -> &Responders<ConnectionHandle> {
        &self.responders
    }

    pub fn set_gatekeeper<F>(&self, gatekeeper: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> Admission + Send + Sync + 'static,
    {
        *self.gatekeeper.write() = Arc::new(gatekeeper);
    }

    pub fn set_peer_connector(&self, connector: Arc<dyn PeerConnector>) {
        *self.connector.write() = Some(connector);
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    fn allocate_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Adopt an open transport as a new connection
    pub async fn accept(self: &Arc<Self>, transport: BoxTransport) -> ConnectionId {
        let id = self.allocate_id();
        self.start_connection(id, transport).await;
        id
    }

    async fn start_connection(self: &Arc<Self>, id: ConnectionId, transport: BoxTransport) {
        let kind = transport.kind();
        let (sender, outbound) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(id, kind, sender);
        let conn = Connection::new(id, transport, &self.limits);

        let (inbox, pending) = mpsc::unbounded_channel();

        self.connections.write().await.insert(id, handle.clone());
        tracing::info!("Connection {} opened over {:?}", id, kind);

        tokio::spawn(Arc::clone(self).run_listeners(handle.clone(), pending));
        tokio::spawn(Arc::clone(self).run_connection(conn, handle, outbound, inbox));
    }

    /// Drain one connection's application events; ends once its inbox closes
    async fn run_listeners(
        self: Arc<Self>,
        handle: ConnectionHandle,
        mut pending: mpsc::UnboundedReceiver<(String, Vec<Value>)>,
    ) {
        while let Some((name, args)) = pending.recv().await {
            self.dispatch(&handle, name, args).await;
        }
    }

    async fn run_connection(
        self: Arc<Self>,
        mut conn: Connection,
        handle: ConnectionHandle,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        inbox: Inbox,
    ) {
        let id = conn.id();

        let reason = loop {
            let deadline = conn.deadline();

            tokio::select! {
                inbound = conn.recv() => match inbound {
                    Ok(Some(event)) => {
                        if let Err(e) = self.route(&handle, event, &inbox).await {
                            tracing::info!("Connection {} rejected: {}", id, e);
                            break e.disconnect_reason();
                        }
                        if handle.is_activated() {
                            conn.mark_activated();
                        }
                    }
                    Ok(None) => {
                        break DisconnectReason::new(
                            DisconnectCode::ConnectionFailure,
                            "Connection closed by peer",
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Connection {}: {}", id, e);
                        break e.disconnect_reason();
                    }
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = conn.send_frame(frame).await {
                            tracing::warn!("Connection {}: {}", id, e);
                            break e.disconnect_reason();
                        }
                    }
                    Some(Outbound::Close(reason)) => break reason,
                    None => break DisconnectReason::manual("Server shut down"),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("Connection {} timed out", id);
                    break ConnectionError::HeartbeatTimeout.disconnect_reason();
                }
            }
        };

        handle.mark_disconnected();
        conn.close(&reason, self.limits.disconnect_grace).await;

        self.connections.write().await.remove(&id);
        handle.requests().cancel_all();

        tracing::info!(
            "Connection {} closed: {} ({} messages in, {} out)",
            id,
            reason,
            conn.stats().messages_received,
            conn.stats().messages_sent
        );
        self.notify(ServerEvent::Disconnected { id, reason });
    }

    async fn route(
        &self,
        handle: &ConnectionHandle,
        event: NetworkEvent,
        inbox: &Inbox,
    ) -> ConnectionResult<()> {
        match event {
            NetworkEvent::Ping => Ok(()),
            NetworkEvent::ConnectRequest { metadata } => self.handshake(handle, metadata).await,
            event if !handle.is_activated() => {
                tracing::debug!(
                    "Ignoring {} from connection {} before activation",
                    event.label(),
                    handle.id()
                );
                Ok(())
            }
            NetworkEvent::Request { name, id, args } => {
                self.answer(handle, name, id, args);
                Ok(())
            }
            NetworkEvent::Response { id, result } => {
                if !handle.requests().fulfill(id, result) {
                    tracing::debug!("Discarding response {} from connection {}", id, handle.id());
                }
                Ok(())
            }
            NetworkEvent::App { name, args } => {
                if inbox.send((name, args)).is_err() {
                    tracing::debug!("Listeners of connection {} have stopped", handle.id());
                }
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring server-bound {} from connection {}", other.label(), handle.id());
                Ok(())
            }
        }
    }

    async fn handshake(&self, handle: &ConnectionHandle, metadata: Value) -> ConnectionResult<()> {
        if handle.is_activated() {
            tracing::debug!("Connection {} sent a second connect request", handle.id());
            return Ok(());
        }

        let gatekeeper = Arc::clone(&*self.gatekeeper.read());
        let welcome = match gatekeeper(handle, &metadata) {
            Admission::Accept(welcome) => welcome,
            Admission::Reject => return Err(ConnectionError::HandshakeRejected),
        };

        {
            // activation and snapshot under the state lock: no update falls between them
            let tree = self.store.lock().await;
            handle.activate();
            handle.send_event(NetworkEvent::InitialData {
                state: Arc::clone(&*tree),
                welcome,
            })?;
        }

        tracing::info!("Connection {} activated", handle.id());
        self.notify(ServerEvent::Connected {
            client: handle.clone(),
            metadata,
        });
        Ok(())
    }

    fn answer(&self, handle: &ConnectionHandle, name: String, id: RequestId, args: Vec<Value>) {
        let Some(responder) = self.responders.get(&name) else {
            tracing::debug!("No responder for '{}' (connection {})", name, handle.id());
            return;
        };

        let client = handle.clone();
        tokio::spawn(async move {
            let result = responder(client.clone(), args).await;
            if let Err(e) = client.send_event(NetworkEvent::Response { id, result }) {
                tracing::debug!("Dropping response {} for connection {}: {}", id, client.id(), e);
            }
        });
    }

    async fn dispatch(&self, handle: &ConnectionHandle, name: String, args: Vec<Value>) {
        let listeners = self.listeners.read().get(&name).cloned().unwrap_or_default();
        if listeners.is_empty() {
            tracing::debug!("No listener for '{}' (connection {})", name, handle.id());
            return;
        }

        for listener in listeners {
            listener(handle.clone(), args.clone()).await;
        }
    }

    /// Send a state diff to every activated connection
    pub(crate) async fn broadcast_state(&self, changes: Map, transform: Option<&PerClientTransform>) {
        let connections = self.connections.read().await;
        let changes = Arc::new(changes);

        let shared = match transform {
            Some(_) => None,
            None => match encode(NetworkEvent::StateUpdate {
                diff: Arc::clone(&changes),
            }) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::error!("Failed to encode state update: {}", e);
                    return;
                }
            },
        };

        for handle in connections.values().filter(|h| h.is_activated()) {
            let frame = match (&shared, transform) {
                (Some(frame), _) => frame.clone(),
                (None, Some(transform)) => {
                    let personal = transform(handle, &changes);
                    if personal.is_empty() {
                        continue;
                    }
                    match encode(NetworkEvent::StateUpdate {
                        diff: Arc::new(personal),
                    }) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!("Failed to encode update for connection {}: {}", handle.id(), e);
                            continue;
                        }
                    }
                }
                (None, None) => continue,
            };

            if let Err(e) = handle.send_frame(frame) {
                tracing::debug!("Skipping connection {}: {}", handle.id(), e);
            }
        }
    }

    /// Send an application event to every activated connection
    pub async fn emit_all(&self, name: impl Into<String>, args: Vec<Value>) {
        let frame = match encode(NetworkEvent::app(name, args)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode event: {}", e);
                return;
            }
        };

        let connections = self.connections.read().await;
        for handle in connections.values().filter(|h| h.is_activated()) {
            if let Err(e) = handle.send_frame(frame.clone()) {
                tracing::debug!("Skipping connection {}: {}", handle.id(), e);
            }
        }
    }

    /// Close every connection with a manual reason
    pub async fn disconnect_all(&self, text: &str) {
        let connections = self.connections.read().await;
        for handle in connections.values() {
            if let Err(e) = handle.disconnect(text) {
                tracing::debug!("Connection {} already closing: {}", handle.id(), e);
            }
        }
    }

    fn notify(&self, event: ServerEvent) {
        if self.event_rx.lock().is_some() {
            // nobody has taken the receiver, so nobody will read this
            return;
        }
        if self.event_tx.send(event).is_err() {
            tracing::trace!("Server event receiver dropped");
        }
    }

    /// Answer a data-channel offer and park the link until candidates arrive
    pub async fn accept_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
    ) -> NegotiationResult<(ConnectionId, SessionDescription)> {
        let connector = self
            .connector
            .read()
            .clone()
            .ok_or(NegotiationError::Unsupported)?;

        let (answer, link) = connector.accept_offer(offer).await?;
        let id = self.allocate_id();
        self.negotiating.lock().insert(id, link);
        tracing::info!("Negotiating data channel for connection {}", id);

        let hub = Arc::downgrade(self);
        let limit = self.limits.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(hub) = hub.upgrade() else {
                return;
            };
            let expired = hub.negotiating.lock().remove(&id);
            if let Some(mut link) = expired {
                tracing::info!("Negotiation for connection {} expired", id);
                link.close().await;
            }
        });

        Ok((id, answer))
    }

    /// Hand the client's candidate to its parked link and return ours.
    ///
    /// The connection starts once the data channel opens.
    pub async fn exchange_ice_candidate(
        self: &Arc<Self>,
        client_id: ConnectionId,
        candidate: IceCandidate,
    ) -> NegotiationResult<IceCandidate> {
        let parked = self.negotiating.lock().remove(&client_id);
        let mut link = match parked {
            Some(link) => link,
            None => {
                let is_socket = self
                    .connections
                    .read()
                    .await
                    .get(&client_id)
                    .map_or(false, |h| h.kind() == TransportKind::Socket);
                return Err(if is_socket {
                    NegotiationError::SocketClient(client_id)
                } else {
                    NegotiationError::UnknownClient(client_id)
                });
            }
        };

        let limit = self.limits.negotiation_timeout;
        let exchanged = tokio::time::timeout(limit, trade_candidates(link.as_mut(), candidate))
            .await
            .unwrap_or(Err(NegotiationError::Timeout));

        let local = match exchanged {
            Ok(local) => local,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let opened = tokio::time::timeout(limit, link.open_channel())
                .await
                .unwrap_or(Err(NegotiationError::Timeout));
            match opened {
                Ok(transport) => hub.start_connection(client_id, transport).await,
                Err(e) => {
                    tracing::warn!("Data channel for connection {} failed: {}", client_id, e);
                    link.close().await;
                }
            }
        });

        Ok(local)
    }
}

async fn trade_candidates(link: &mut dyn PeerLink, remote: IceCandidate) -> NegotiationResult<IceCandidate> {
    link.add_ice_candidate(remote).await?;
    first_selectable_candidate(link)
        .await
        .ok_or(NegotiationError::NoCandidate)
}
