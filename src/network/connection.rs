//! Connection handling for statewire
//!
//! Manages individual client connections on the server side, including:
//! - Event encoding/decoding
//! - Per-second message throttling
//! - Heartbeat deadline
//! - Graceful close with a disconnection reason

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::request::{await_response, Correlator, RequestError, RequestResult};
use super::transport::{BoxTransport, TransportKind};
use super::ConnectionLimits;
use crate::protocol::{encode, decode, CodecError, DisconnectCode, DisconnectReason, NetworkEvent};
use crate::state::Value;

/// Server-assigned connection id, unique for the life of a server
pub type ConnectionId = u64;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] CodecError),

    #[error("Message threshold broken ({0} per second)")]
    ThrottleExceeded(u32),

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    #[error("Initial data rejected")]
    HandshakeRejected,

    #[error("Transport failure: {0}")]
    TransportFailure(#[from] io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Connection not activated")]
    NotActivated,
}

impl ConnectionError {
    /// The reason reported to the peer when this error ends a connection
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnectionError::ProtocolViolation(_) => {
                DisconnectReason::new(DisconnectCode::ConnectionFailure, "Protocol violation")
            }
            ConnectionError::ThrottleExceeded(_) => {
                DisconnectReason::new(DisconnectCode::Throttler, "Message threshold broken")
            }
            ConnectionError::HeartbeatTimeout => {
                DisconnectReason::new(DisconnectCode::Timeout, "Timed out")
            }
            ConnectionError::HandshakeRejected => {
                DisconnectReason::new(DisconnectCode::InvalidInitialData, "Invalid initial data")
            }
            ConnectionError::TransportFailure(_) => {
                DisconnectReason::new(DisconnectCode::ConnectionFailure, "Socket failure")
            }
            ConnectionError::Closed | ConnectionError::NotActivated => {
                DisconnectReason::new(DisconnectCode::NoReason, self.to_string())
            }
        }
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, waiting for the connect request
    Open,
    /// Initial data sent, takes part in broadcasts
    Activated,
    /// Disconnection reason sent, waiting out the grace period
    Closing,
    /// Transport torn down
    Closed,
}

const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

/// Fixed one-second window message counter
#[derive(Debug, Clone)]
pub struct Throttle {
    max_per_second: u32,
    count: u32,
    window_end: Instant,
}

impl Throttle {
    pub fn new(max_per_second: u32, now: Instant) -> Self {
        Self {
            max_per_second,
            count: 0,
            window_end: now + THROTTLE_WINDOW,
        }
    }

    /// Count one inbound message. Returns false when the ceiling is broken.
    pub fn record(&mut self, now: Instant) -> bool {
        if now >= self.window_end {
            self.window_end = now + THROTTLE_WINDOW;
            self.count = 1;
            return true;
        }

        self.count += 1;
        self.count <= self.max_per_second
    }

    pub fn max_per_second(&self) -> u32 {
        self.max_per_second
    }
}

/// Deadline pushed back by every inbound message
#[derive(Debug, Clone)]
pub struct Heartbeat {
    window: Duration,
    deadline: Instant,
}

impl Heartbeat {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            deadline: now + window,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.window;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// The transport side of one client connection, owned by its task
pub struct Connection {
    /// Server-assigned id
    id: ConnectionId,
    /// Underlying message channel
    transport: BoxTransport,
    /// Connection state
    state: ConnectionState,
    throttle: Throttle,
    heartbeat: Heartbeat,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: BoxTransport, limits: &ConnectionLimits) -> Self {
        let now = Instant::now();
        Self {
            id,
            transport,
            state: ConnectionState::Open,
            throttle: Throttle::new(limits.max_messages_per_second, now),
            heartbeat: Heartbeat::new(limits.heartbeat_window(), now),
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn mark_activated(&mut self) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Activated;
        }
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// When the connection times out unless a message arrives
    pub fn deadline(&self) -> Instant {
        self.heartbeat.deadline()
    }

    /// Receive the next event; `Ok(None)` once the peer has closed.
    ///
    /// Cancel safe as long as the transport's `recv` is.
    pub async fn recv(&mut self) -> ConnectionResult<Option<NetworkEvent>> {
        let frame = match self.transport.recv().await? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let now = Instant::now();
        self.stats.messages_received += 1;
        self.stats.bytes_received += frame.len() as u64;

        if !self.throttle.record(now) {
            return Err(ConnectionError::ThrottleExceeded(
                self.throttle.max_per_second(),
            ));
        }
        self.heartbeat.reset(now);

        Ok(Some(decode(&frame)?))
    }

    /// Send an already encoded frame
    pub async fn send_frame(&mut self, frame: Bytes) -> ConnectionResult<()> {
        let len = frame.len() as u64;
        self.transport.send(frame).await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    /// Send an event
    pub async fn send(&mut self, event: NetworkEvent) -> ConnectionResult<()> {
        let frame = encode(event)?;
        self.send_frame(frame).await
    }

    /// Tell the peer why, wait out the grace period, then tear down
    pub async fn close(&mut self, reason: &DisconnectReason, grace: Duration) {
        self.state = ConnectionState::Closing;

        if let Err(e) = self
            .send(NetworkEvent::DisconnectionReason(reason.clone()))
            .await
        {
            tracing::debug!("Connection {}: could not send disconnection reason: {}", self.id, e);
        }
        tokio::time::sleep(grace).await;

        self.transport.close().await;
        self.state = ConnectionState::Closed;
    }
}

/// Commands queued for a connection's task
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    Close(DisconnectReason),
}

/// A handle for talking to a connection from anywhere
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    kind: TransportKind,
    sender: mpsc::UnboundedSender<Outbound>,
    activated: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    requests: Arc<Correlator>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        kind: TransportKind,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            kind,
            sender,
            activated: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(true)),
            requests: Arc::new(Correlator::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Whether the initial data has been sent
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn activate(&self) {
        self.activated.store(true, Ordering::SeqCst);
    }

    /// Mark the connection as disconnected
    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.activated.store(false, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> &Arc<Correlator> {
        &self.requests
    }

    pub(crate) fn send_frame(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::Closed)
    }

    pub(crate) fn send_event(&self, event: NetworkEvent) -> ConnectionResult<()> {
        self.send_frame(encode(event)?)
    }

    /// Send an application event to this client
    pub fn emit(&self, name: impl Into<String>, args: Vec<Value>) -> ConnectionResult<()> {
        if !self.is_activated() {
            return Err(ConnectionError::NotActivated);
        }
        self.send_event(NetworkEvent::app(name, args))
    }

    /// Ask the client's responder for `name` and wait for the answer
    pub async fn request(&self, name: impl Into<String>, args: Vec<Value>) -> RequestResult<Value> {
        self.send_request(name.into(), args, None).await
    }

    /// Like `request`, but gives up after `timeout`
    pub async fn request_timeout(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
        timeout: Duration,
    ) -> RequestResult<Value> {
        self.send_request(name.into(), args, Some(timeout)).await
    }

    async fn send_request(
        &self,
        name: String,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> RequestResult<Value> {
        if !self.is_activated() {
            return Err(RequestError::NotConnected);
        }

        let pending = self.requests.register();
        let event = NetworkEvent::Request {
            name,
            id: pending.id(),
            args,
        };
        self.send_event(event).map_err(|e| match e {
            ConnectionError::ProtocolViolation(codec) => RequestError::Protocol(codec),
            _ => RequestError::NotConnected,
        })?;

        await_response(pending, timeout).await
    }

    /// Close the connection with a manual reason
    pub fn disconnect(&self, text: impl Into<String>) -> ConnectionResult<()> {
        self.close_with(DisconnectReason::manual(text))
    }

    pub(crate) fn close_with(&self, reason: DisconnectReason) -> ConnectionResult<()> {
        self.sender
            .send(Outbound::Close(reason))
            .map_err(|_| ConnectionError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ChannelTransport;

    #[test]
    fn test_throttle_allows_ceiling() {
        let start = Instant::now();
        let mut throttle = Throttle::new(3, start);

        assert!(throttle.record(start));
        assert!(throttle.record(start));
        assert!(throttle.record(start));
        assert!(!throttle.record(start + Duration::from_millis(500)));
    }

    #[test]
    fn test_throttle_window_resets() {
        let start = Instant::now();
        let mut throttle = Throttle::new(2, start);

        assert!(throttle.record(start));
        assert!(throttle.record(start));
        assert!(throttle.record(start + Duration::from_secs(1)));
        assert!(throttle.record(start + Duration::from_millis(1500)));
        assert!(!throttle.record(start + Duration::from_millis(1600)));
    }

    #[test]
    fn test_heartbeat_reset_moves_deadline() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_secs(21), start);

        assert!(!heartbeat.is_expired(start + Duration::from_secs(20)));
        heartbeat.reset(start + Duration::from_secs(20));
        assert!(!heartbeat.is_expired(start + Duration::from_secs(40)));
        assert!(heartbeat.is_expired(start + Duration::from_secs(41)));
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(
            ConnectionError::HeartbeatTimeout.disconnect_reason().code,
            DisconnectCode::Timeout
        );
        assert_eq!(
            ConnectionError::ThrottleExceeded(75).disconnect_reason().code,
            DisconnectCode::Throttler
        );
        assert_eq!(
            ConnectionError::HandshakeRejected.disconnect_reason().code,
            DisconnectCode::InvalidInitialData
        );
        assert_eq!(
            ConnectionError::ProtocolViolation(CodecError::InvalidMagic)
                .disconnect_reason()
                .code,
            DisconnectCode::ConnectionFailure
        );
    }

    #[tokio::test]
    async fn test_recv_rejects_garbage() {
        let (local, mut remote) = ChannelTransport::pair(TransportKind::Socket);
        let mut conn = Connection::new(1, Box::new(local), &ConnectionLimits::default());

        use crate::network::Transport;
        remote.send(Bytes::from_static(b"nope")).await.unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(ConnectionError::ProtocolViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_reason_first() {
        use crate::network::Transport;

        let (local, mut remote) = ChannelTransport::pair(TransportKind::Socket);
        let mut conn = Connection::new(1, Box::new(local), &ConnectionLimits::default());

        conn.close(&DisconnectReason::manual("bye"), Duration::from_millis(100))
            .await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        let frame = remote.recv().await.unwrap().unwrap();
        match decode(&frame).unwrap() {
            NetworkEvent::DisconnectionReason(reason) => {
                assert_eq!(reason.code, DisconnectCode::NoReason);
                assert_eq!(reason.text, "bye");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(remote.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_handle_emit_requires_activation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(1, TransportKind::Socket, tx);

        assert!(matches!(
            handle.emit("chat", vec![]),
            Err(ConnectionError::NotActivated)
        ));

        handle.activate();
        handle.emit("chat", vec![Value::from("hi")]).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));

        handle.mark_disconnected();
        assert!(!handle.is_activated());
        assert!(handle.send_event(NetworkEvent::Ping).is_err());
    }
}
