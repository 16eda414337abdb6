//! Callers awaiting a JSON-RPC response
//!
//! Each waiter owns a timer task. Whichever comes first, the response or the
//! timer, removes the entry; the loser finds nothing and does nothing.

use crate::errors::{EngineError, EngineResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

struct PendingResponse {
    response_tx: oneshot::Sender<EngineResult<Value>>,
    timeout_handle: AbortHandle,
}

#[derive(Clone, Default)]
pub struct ResponseWaiters {
    pending: Arc<Mutex<HashMap<u64, PendingResponse>>>,
}

impl ResponseWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the response to `id`; resolves with `Expired` after `timeout`
    pub fn register(&self, id: u64, timeout: Duration) -> oneshot::Receiver<EngineResult<Value>> {
        let (response_tx, response_rx) = oneshot::channel();

        // held until the entry is in place so a zero timeout cannot miss it
        let mut guard = self.lock();
        let pending = self.pending.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let entry = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            if let Some(entry) = entry {
                debug!(id, "request timed out");
                let _ = entry.response_tx.send(Err(EngineError::Expired(format!(
                    "request {} got no response within {:?}",
                    id, timeout
                ))));
            }
        });

        guard.insert(
            id,
            PendingResponse {
                response_tx,
                timeout_handle: timer.abort_handle(),
            },
        );
        response_rx
    }

    /// Hand the outcome to the waiter. Returns `false` if nobody was waiting.
    pub fn complete(&self, id: u64, outcome: EngineResult<Value>) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };
        entry.timeout_handle.abort();
        let _ = entry.response_tx.send(outcome);
        true
    }

    pub fn cancel(&self, id: u64) {
        if let Some(entry) = self.lock().remove(&id) {
            entry.timeout_handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingResponse>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
