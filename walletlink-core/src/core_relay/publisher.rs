//! Publish queue
//!
//! Every publish is queued until the relay acknowledges it. The first attempt
//! runs inline; failed entries are retried on each heartbeat pulse and on every
//! reconnect until their deadline passes.

use super::messages::PublishParams;
use super::metrics;
use super::requester::RelayRequester;
use crate::errors::RelayError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub ttl: u64,
    pub tag: u32,
    pub prompt: bool,
    /// Relay request id; defaults to a fresh payload id
    pub id: Option<u64>,
    /// Return the first attempt's error instead of waiting for redelivery
    pub throw_on_failed_publish: bool,
    /// Overrides the configured publish timeout
    pub timeout: Option<Duration>,
}

impl PublishOptions {
    pub fn new(ttl: u64, tag: u32, prompt: bool) -> Self {
        Self {
            ttl,
            tag,
            prompt,
            id: None,
            throw_on_failed_publish: false,
            timeout: None,
        }
    }
}

struct QueuedPublish {
    params: PublishParams,
    deadline: Instant,
    in_flight: bool,
    waiter: Option<oneshot::Sender<Result<(), RelayError>>>,
}

pub(crate) struct Publisher {
    method: String,
    queue: Mutex<HashMap<u64, QueuedPublish>>,
}

impl Publisher {
    pub fn new(method: String) -> Self {
        Self {
            method,
            queue: Mutex::new(HashMap::new()),
        }
    }

    pub async fn publish(
        &self,
        requester: &RelayRequester,
        id: u64,
        params: PublishParams,
        timeout: Duration,
        throw_on_failed_publish: bool,
    ) -> Result<(), RelayError> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.queue.lock().map_err(|_| RelayError::Closed)?.insert(
            id,
            QueuedPublish {
                params,
                deadline,
                in_flight: false,
                waiter: Some(tx),
            },
        );

        match self.attempt(requester, id).await {
            Ok(()) => Ok(()),
            Err(e) if throw_on_failed_publish => Err(e),
            Err(e) => {
                debug!(id, error = %e, "publish queued for redelivery");
                match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(RelayError::Closed),
                    Err(_) => {
                        self.remove(id);
                        metrics::record_publish("timeout");
                        Err(RelayError::PublishTimeout { id })
                    }
                }
            }
        }
    }

    async fn attempt(&self, requester: &RelayRequester, id: u64) -> Result<(), RelayError> {
        let params = {
            let mut queue = self.queue.lock().map_err(|_| RelayError::Closed)?;
            match queue.get_mut(&id) {
                Some(entry) if !entry.in_flight => {
                    entry.in_flight = true;
                    entry.params.clone()
                }
                // acked already, or another attempt is running
                _ => return Ok(()),
            }
        };
        let params = serde_json::to_value(params)
            .map_err(|e| RelayError::InvalidFrame(e.to_string()))?;

        match requester.request(id, &self.method, params).await {
            Ok(_) => {
                if let Some(entry) = self.remove(id) {
                    if let Some(waiter) = entry.waiter {
                        let _ = waiter.send(Ok(()));
                    }
                }
                metrics::record_publish("acked");
                Ok(())
            }
            Err(e) => {
                if let Ok(mut queue) = self.queue.lock() {
                    if let Some(entry) = queue.get_mut(&id) {
                        entry.in_flight = false;
                    }
                }
                metrics::record_publish("failed");
                Err(e)
            }
        }
    }

    fn remove(&self, id: u64) -> Option<QueuedPublish> {
        self.queue.lock().ok().and_then(|mut q| q.remove(&id))
    }

    /// Expire overdue entries and retry the rest in the background
    pub fn redeliver(self: &Arc<Self>, requester: &Arc<RelayRequester>) {
        let now = Instant::now();
        let (expired, retry): (Vec<_>, Vec<_>) = match self.queue.lock() {
            Ok(mut queue) => {
                let expired: Vec<u64> = queue
                    .iter()
                    .filter(|(_, e)| e.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                let expired = expired
                    .into_iter()
                    .filter_map(|id| queue.remove(&id).map(|e| (id, e)))
                    .collect();
                let retry = queue
                    .iter()
                    .filter(|(_, e)| !e.in_flight)
                    .map(|(id, _)| *id)
                    .collect();
                (expired, retry)
            }
            Err(_) => return,
        };

        for (id, entry) in expired {
            warn!(id, topic = %entry.params.topic, "publish deadline passed");
            metrics::record_publish("timeout");
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(RelayError::PublishTimeout { id }));
            }
        }

        for id in retry {
            metrics::record_redelivery();
            let publisher = self.clone();
            let requester = requester.clone();
            tokio::spawn(async move {
                if let Err(e) = publisher.attempt(&requester, id).await {
                    debug!(id, error = %e, "redelivery failed");
                }
            });
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}
