//! Message-oriented transports
//!
//! A transport moves whole messages, never partial frames. The hub and the
//! client only see `Box<dyn Transport>`; the WebSocket implementation and
//! the in-process pipe live here, data-channel implementations are supplied
//! by the WebRTC stack through the negotiation traits.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Which kind of channel a connection runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Socket,
    DataChannel,
}

/// A bidirectional message channel
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Send one message
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;

    /// Receive the next message; `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel safe, it is polled inside `select!`.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;

    /// Tear the channel down
    async fn close(&mut self);
}

pub type BoxTransport = Box<dyn Transport>;

/// Transport over an upgraded WebSocket
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

fn ws_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.stream
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(ws_error)
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}

/// In-process message pipe.
///
/// Useful for embedding a client and server in one process and as the
/// adapter shape for data channels that deliver messages through callbacks.
pub struct ChannelTransport {
    kind: TransportKind,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelTransport {
    /// Two connected ends of a pipe
    pub fn pair(kind: TransportKind) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        (
            Self {
                kind,
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                kind,
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    /// Wrap existing channel halves
    pub fn from_channels(
        kind: TransportKind,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            kind,
            tx: Some(tx),
            rx,
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        tx.send(frame)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_delivers_in_order() {
        let (mut a, mut b) = ChannelTransport::pair(TransportKind::DataChannel);
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(b.kind(), TransportKind::DataChannel);
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (mut a, mut b) = ChannelTransport::pair(TransportKind::Socket);
        a.close().await;
        assert!(b.recv().await.unwrap().is_none());
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());
    }
}
