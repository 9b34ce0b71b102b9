//! Negotiation module - Data channel setup and socket fallback
//!
//! The WebRTC stack itself is not part of this crate. It is consumed through
//! three traits:
//! - `PeerConnector` answers remote offers on the server
//! - `PeerDialer` creates local offers on the client
//! - `PeerLink` is one peer connection in progress (candidates, channel)
//!
//! Only one ICE candidate is exchanged per side: the first UDP candidate
//! for the RTP component.

mod signaling;

pub use signaling::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::network::{BoxTransport, ConnectionId};

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Malformed signaling body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid client id: {0}")]
    UnknownClient(ConnectionId),

    #[error("Client {0} is using WebSockets")]
    SocketClient(ConnectionId),

    #[error("Data channels are not enabled on this server")]
    Unsupported,

    #[error("Signaling server returned error code {0}")]
    Signaling(u8),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("No usable ICE candidate was gathered")]
    NoCandidate,

    #[error("Negotiation timed out")]
    Timeout,
}

impl NegotiationError {
    /// Error code reported to signaling clients
    pub fn code(&self) -> u8 {
        match self {
            NegotiationError::Malformed(_) => error_codes::MALFORMED_BODY,
            NegotiationError::UnknownServer(_) => error_codes::UNKNOWN_SERVER,
            NegotiationError::Signaling(code) => *code,
            _ => error_codes::NEGOTIATION_FAILED,
        }
    }
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;

/// Error codes of the signaling endpoints
pub mod error_codes {
    pub const MALFORMED_BODY: u8 = 1;
    pub const UNKNOWN_SERVER: u8 = 2;
    pub const NEGOTIATION_FAILED: u8 = 3;
}

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate as browsers serialize it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            protocol: None,
            component: None,
        }
    }

    /// Transport protocol, from the field or the candidate line
    pub fn protocol(&self) -> Option<String> {
        self.protocol
            .clone()
            .or_else(|| self.field(2).map(str::to_string))
            .map(|p| p.to_ascii_lowercase())
    }

    /// Component name, from the field or the candidate line
    pub fn component(&self) -> Option<String> {
        self.component.clone().or_else(|| {
            self.field(1).and_then(|id| match id {
                "1" => Some("rtp".to_string()),
                "2" => Some("rtcp".to_string()),
                _ => None,
            })
        })
    }

    /// `candidate:<foundation> <component> <protocol> <priority> ...`
    fn field(&self, index: usize) -> Option<&str> {
        let line = self.candidate.strip_prefix("candidate:")?;
        line.split_whitespace().nth(index)
    }

    /// Whether this is the one candidate worth exchanging
    pub fn is_selectable(&self) -> bool {
        self.protocol().as_deref() == Some("udp") && self.component().as_deref() == Some("rtp")
    }
}

/// One peer connection while it is being negotiated
#[async_trait]
pub trait PeerLink: Send {
    /// Apply the remote answer (client side)
    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> NegotiationResult<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> NegotiationResult<()>;

    /// Next locally gathered candidate; `None` once gathering is complete
    async fn next_local_candidate(&mut self) -> Option<IceCandidate>;

    /// Wait for the data channel to open and hand it over
    async fn open_channel(&mut self) -> NegotiationResult<BoxTransport>;

    /// Abandon the attempt and release the peer connection
    async fn close(&mut self);
}

/// Server side factory answering remote offers
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> NegotiationResult<(SessionDescription, Box<dyn PeerLink>)>;
}

/// Client side factory creating local offers
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn create_offer(&self) -> NegotiationResult<(SessionDescription, Box<dyn PeerLink>)>;
}

/// Drain local candidates until one passes the selection policy
pub async fn first_selectable_candidate(link: &mut dyn PeerLink) -> Option<IceCandidate> {
    while let Some(candidate) = link.next_local_candidate().await {
        if candidate.is_selectable() {
            return Some(candidate);
        }
        tracing::debug!("Skipping ICE candidate {}", candidate.candidate);
    }
    None
}

/// Client side driver of the offer/answer/ICE exchange
#[derive(Clone)]
pub struct Negotiator {
    dialer: Arc<dyn PeerDialer>,
    signaling: Arc<dyn Signaling>,
}

impl Negotiator {
    pub fn new(dialer: Arc<dyn PeerDialer>, signaling: Arc<dyn Signaling>) -> Self {
        Self { dialer, signaling }
    }

    /// Run the whole exchange within `limit` and return the assigned id
    /// with the open channel. The link is closed on any failure.
    pub async fn negotiate(
        &self,
        server_id: &str,
        limit: Duration,
    ) -> NegotiationResult<(ConnectionId, BoxTransport)> {
        let deadline = Instant::now() + limit;
        let (offer, mut link) = tokio::time::timeout_at(deadline, self.dialer.create_offer())
            .await
            .map_err(|_| NegotiationError::Timeout)??;

        let attempt = tokio::time::timeout_at(deadline, self.attempt(server_id, offer, link.as_mut()))
            .await
            .unwrap_or(Err(NegotiationError::Timeout));

        match attempt {
            Ok((client_id, transport)) => {
                tracing::info!("Data channel open as client {}", client_id);
                Ok((client_id, transport))
            }
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        server_id: &str,
        offer: SessionDescription,
        link: &mut dyn PeerLink,
    ) -> NegotiationResult<(ConnectionId, BoxTransport)> {
        let client_id = self.exchange(server_id, offer, link).await?;
        let transport = link.open_channel().await?;
        Ok((client_id, transport))
    }

    async fn exchange(
        &self,
        server_id: &str,
        offer: SessionDescription,
        link: &mut dyn PeerLink,
    ) -> NegotiationResult<ConnectionId> {
        let answer = self
            .signaling
            .signal(&SignalRequest {
                server_id: server_id.to_string(),
                description: offer,
            })
            .await?;
        link.set_remote_description(answer.description).await?;

        let local = first_selectable_candidate(link)
            .await
            .ok_or(NegotiationError::NoCandidate)?;

        let remote = self
            .signaling
            .exchange_candidate(&IceRequest {
                server_id: server_id.to_string(),
                client_id: answer.client_id,
                candidate: local,
            })
            .await?;
        link.add_ice_candidate(remote).await?;

        Ok(answer.client_id)
    }
}
