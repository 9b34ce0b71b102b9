//! Signaling bodies and the HTTP signaling client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{IceCandidate, NegotiationError, NegotiationResult, SessionDescription};
use crate::network::ConnectionId;

/// Path of the offer/answer endpoint below the route
pub const SIGNAL_PATH: &str = "/signal";

/// Path of the candidate exchange endpoint below the route
pub const ICE_CANDIDATE_PATH: &str = "/ice_candidate";

/// `POST {route}/signal` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "serverID")]
    pub server_id: String,
    pub description: SessionDescription,
}

/// Successful `/signal` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalAnswer {
    #[serde(rename = "clientID")]
    pub client_id: ConnectionId,
    pub description: SessionDescription,
}

/// `POST {route}/ice_candidate` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceRequest {
    #[serde(rename = "serverID")]
    pub server_id: String,
    #[serde(rename = "clientID")]
    pub client_id: ConnectionId,
    pub candidate: IceCandidate,
}

/// Failed signaling reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalError {
    pub err: u8,
}

/// Either the payload or `{"err": code}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalReply<T> {
    Err(SignalError),
    Ok(T),
}

impl<T> SignalReply<T> {
    pub fn failed(code: u8) -> Self {
        SignalReply::Err(SignalError { err: code })
    }

    pub fn into_result(self) -> NegotiationResult<T> {
        match self {
            SignalReply::Ok(value) => Ok(value),
            SignalReply::Err(e) => Err(NegotiationError::Signaling(e.err)),
        }
    }
}

impl<T> From<NegotiationResult<T>> for SignalReply<T> {
    fn from(result: NegotiationResult<T>) -> Self {
        match result {
            Ok(value) => SignalReply::Ok(value),
            Err(e) => SignalReply::failed(e.code()),
        }
    }
}

/// Carrier for the two signaling calls
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn signal(&self, request: &SignalRequest) -> NegotiationResult<SignalAnswer>;

    async fn exchange_candidate(&self, request: &IceRequest) -> NegotiationResult<IceCandidate>;
}

/// Signaling over plain HTTP POSTs
pub struct HttpSignaling {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSignaling {
    /// `base_url` is the origin plus route, e.g. `http://127.0.0.1:3000/statewire`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> NegotiationResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> NegotiationResult<T>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let reply: SignalReply<T> = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.into_result()
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn signal(&self, request: &SignalRequest) -> NegotiationResult<SignalAnswer> {
        self.post(SIGNAL_PATH, request).await
    }

    async fn exchange_candidate(&self, request: &IceRequest) -> NegotiationResult<IceCandidate> {
        self.post(ICE_CANDIDATE_PATH, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_request_field_names() {
        let json = r#"{"serverID":"main","description":{"type":"offer","sdp":"v=0"}}"#;
        let request: SignalRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.server_id, "main");
        assert_eq!(request.description, SessionDescription::offer("v=0"));
    }

    #[test]
    fn test_reply_error_shape() {
        let reply: SignalReply<SignalAnswer> = SignalReply::failed(2);
        assert_eq!(serde_json::to_string(&reply).unwrap(), r#"{"err":2}"#);

        let parsed: SignalReply<IceCandidate> = serde_json::from_str(r#"{"err": 3}"#).unwrap();
        assert!(matches!(
            parsed.into_result(),
            Err(NegotiationError::Signaling(3))
        ));
    }

    #[test]
    fn test_reply_success_shape() {
        let json = r#"{"clientID":4,"description":{"type":"answer","sdp":"v=0"}}"#;
        let reply: SignalReply<SignalAnswer> = serde_json::from_str(json).unwrap();
        let answer = reply.into_result().unwrap();
        assert_eq!(answer.client_id, 4);
        assert_eq!(answer.description.kind, "answer");
    }
}
