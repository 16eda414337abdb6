//! Relay request/response correlation
//!
//! Requests go out as JSON-RPC frames on the current socket and wait for the
//! response with the same id. A request issued while the socket is down waits
//! for the next connection, bounded by the request timeout.

use super::metrics;
use super::socket::SocketFrame;
use crate::core_rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::errors::RelayError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RelayError>>>;

pub struct RelayRequester {
    outbound: Mutex<Option<mpsc::UnboundedSender<SocketFrame>>>,
    pending: Mutex<PendingMap>,
    state: watch::Sender<ConnectionState>,
    request_timeout: Duration,
}

impl RelayRequester {
    pub fn new(request_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            state,
            request_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Route outbound frames to a freshly opened socket
    pub(crate) fn attach(&self, outbound: mpsc::UnboundedSender<SocketFrame>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = Some(outbound);
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Drop the socket writer and fail every in-flight request
    pub(crate) fn detach(&self) {
        if let Ok(mut slot) = self.outbound.lock() {
            slot.take();
        }
        self.set_state(ConnectionState::Disconnected);

        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (id, tx) in drained {
            trace!(id, "failing in-flight relay request");
            let _ = tx.send(Err(RelayError::Disconnected));
        }
    }

    pub fn send_frame(&self, frame: SocketFrame) -> Result<(), RelayError> {
        let slot = self.outbound.lock().map_err(|_| RelayError::Closed)?;
        match slot.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| RelayError::Disconnected),
            None => Err(RelayError::Disconnected),
        }
    }

    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), RelayError> {
        let text =
            serde_json::to_string(value).map_err(|e| RelayError::InvalidFrame(e.to_string()))?;
        self.send_frame(SocketFrame::Text(text))
    }

    async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let connected = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, connected).await.unwrap_or(false)
    }

    /// Send `method` with the given id and wait for the relay's answer
    pub async fn request(&self, id: u64, method: &str, params: Value) -> Result<Value, RelayError> {
        let started = Instant::now();
        if !self.wait_connected(self.request_timeout).await {
            return Err(RelayError::Timeout { method: method.to_string() });
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| RelayError::Closed)?
            .insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.send_json(&request) {
            self.forget(id);
            return Err(e);
        }

        let remaining = self.request_timeout.saturating_sub(started.elapsed());
        let outcome = match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => {
                self.forget(id);
                debug!(id, method, "relay request timed out");
                Err(RelayError::Timeout { method: method.to_string() })
            }
        };
        metrics::record_request_duration(method, started.elapsed().as_secs_f64());
        outcome
    }

    /// Complete the matching in-flight request; false when nobody was waiting
    pub fn on_response(&self, response: JsonRpcResponse) -> bool {
        let tx = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&response.id()),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            return false;
        };
        let outcome = match response {
            JsonRpcResponse::Result(r) => Ok(r.result),
            JsonRpcResponse::Error(e) => Err(RelayError::Rpc {
                code: e.error.code,
                message: e.error.message,
            }),
        };
        tx.send(outcome).is_ok()
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}
