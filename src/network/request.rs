//! Request/response correlation
//!
//! Requests ride on `REQUEST(name, id, args...)` events and are answered
//! with `RESPONSE(id, result)`. Ids come from a per-table counter and are
//! never handed out twice while still pending.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::{CodecError, RequestId};
use crate::state::Value;

/// Request errors
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Connection closed before a response arrived")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
}

pub type RequestResult<T> = Result<T, RequestError>;

/// Outstanding requests of one endpoint
#[derive(Debug, Default)]
pub struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Value>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id and the slot its response will land in
    pub fn register(self: &Arc<Self>) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();

        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(id, tx);

        PendingResponse {
            id,
            rx,
            table: Arc::clone(self),
        }
    }

    /// Hand a response to its waiter. Returns false for unknown ids.
    pub fn fulfill(&self, id: RequestId, result: Value) -> bool {
        match self.pending.lock().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request with `RequestError::Closed`
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A request waiting for its response.
///
/// Dropping it withdraws the request; a late response is then discarded.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Value>,
    table: Arc<Correlator>,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn wait(mut self) -> RequestResult<Value> {
        (&mut self.rx).await.map_err(|_| RequestError::Closed)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.rx.close();
        let mut pending = self.table.pending.lock();
        // the id may already belong to a newer request
        if pending.get(&self.id).map_or(false, |tx| tx.is_closed()) {
            pending.remove(&self.id);
        }
    }
}

/// Await a pending response, optionally bounded
pub async fn await_response(
    pending: PendingResponse,
    timeout: Option<Duration>,
) -> RequestResult<Value> {
    match timeout {
        None => pending.wait().await,
        Some(limit) => tokio::time::timeout(limit, pending.wait())
            .await
            .map_err(|_| RequestError::Timeout(limit))?,
    }
}

/// Handler answering one named request
pub type Responder<Ctx> = Arc<dyn Fn(Ctx, Vec<Value>) -> BoxFuture<'static, Value> + Send + Sync>;

/// Responders by name, at most one per name
pub struct Responders<Ctx> {
    table: RwLock<HashMap<String, Responder<Ctx>>>,
}

impl<Ctx> Default for Responders<Ctx> {
    fn default() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }
}

impl<Ctx: Send + 'static> Responders<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a responder; replaces any previous one with the same name
    pub fn insert<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Ctx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let responder: Responder<Ctx> = Arc::new(move |ctx, args| handler(ctx, args).boxed());
        self.table.write().insert(name.into(), responder);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.table.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Responder<Ctx>> {
        self.table.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fulfill_resolves_waiter() {
        let table = Arc::new(Correlator::new());
        let pending = table.register();
        let id = pending.id();

        assert!(table.fulfill(id, Value::from("x")));
        assert_eq!(assert_ok!(pending.wait().await), Value::from("x"));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_is_consumed_once() {
        let table = Arc::new(Correlator::new());
        let pending = table.register();
        let id = pending.id();

        assert!(table.fulfill(id, Value::from(1)));
        assert!(!table.fulfill(id, Value::from(2)));
        assert_eq!(pending.wait().await.unwrap(), Value::from(1));
    }

    #[test]
    fn test_unknown_id_discarded() {
        let table = Arc::new(Correlator::new());
        assert!(!table.fulfill(1234, Value::Null));
    }

    #[test]
    fn test_ids_are_distinct() {
        let table = Arc::new(Correlator::new());
        let a = table.register();
        let b = table.register();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_drop_withdraws_request() {
        let table = Arc::new(Correlator::new());
        let pending = table.register();
        let id = pending.id();
        drop(pending);

        assert_eq!(table.pending_count(), 0);
        assert!(!table.fulfill(id, Value::Null));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters() {
        let table = Arc::new(Correlator::new());
        let pending = table.register();
        table.cancel_all();
        assert!(matches!(pending.wait().await, Err(RequestError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_response_timeout() {
        let table = Arc::new(Correlator::new());
        let pending = table.register();
        let result = await_response(pending, Some(Duration::from_secs(1))).await;
        assert_err!(&result);
        assert!(matches!(result, Err(RequestError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_last_responder_wins() {
        let responders: Responders<()> = Responders::new();
        responders.insert("echo", |_, _| async { Value::from("first") });
        responders.insert("echo", |_, args: Vec<Value>| async move {
            args.into_iter().next().unwrap_or_default()
        });

        let responder = responders.get("echo").unwrap();
        assert_eq!(responder((), vec![Value::from("x")]).await, Value::from("x"));
        assert!(responders.get("missing").is_none());
    }
}
