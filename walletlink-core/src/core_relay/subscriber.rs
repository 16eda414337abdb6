//! Topic subscriptions
//!
//! Maps each subscribed topic to the relay's subscription id and persists the
//! map so a restarted client resubscribes everything on its first connect.
//! Concurrent subscribe/unsubscribe calls for one topic are serialized by a
//! per-topic lock.

use super::messages::{RelayMethods, SubscribeParams, UnsubscribeParams};
use super::metrics;
use super::requester::RelayRequester;
use crate::core_rpc::payload_id;
use crate::core_store::KeyValueStorage;
use crate::errors::{EngineError, EngineResult, RelayError, StorageError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Subscriber {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    methods: RelayMethods,
    subscriptions: Mutex<HashMap<String, String>>,
    /// Topics with a subscribe request in flight; inbound messages for them are accepted
    pending: std::sync::Mutex<HashSet<String>>,
    topic_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Subscriber {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String, methods: RelayMethods) -> Self {
        Self {
            storage,
            storage_key,
            methods,
            subscriptions: Mutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashSet::new()),
            topic_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        let Some(value) = self.storage.get_item(&self.storage_key).await? else {
            return Ok(());
        };
        let restored: Vec<(String, String)> =
            serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                key: self.storage_key.clone(),
                reason: e.to_string(),
            })?;

        let mut subs = self.subscriptions.lock().await;
        if !subs.is_empty() {
            return Err(EngineError::RestoreWillOverride("subscriptions".into()));
        }
        subs.extend(restored);
        metrics::set_subscriptions(subs.len());
        debug!(count = subs.len(), "restored subscriptions");
        Ok(())
    }

    fn topic_lock(&self, topic: &str) -> EngineResult<Arc<Mutex<()>>> {
        let mut locks = self
            .topic_locks
            .lock()
            .map_err(|_| EngineError::Internal("topic lock poisoned".into()))?;
        Ok(locks.entry(topic.to_string()).or_default().clone())
    }

    /// Forget the lock for `topic` once no other caller holds or awaits it
    fn release_lock(&self, topic: &str, lock: Arc<Mutex<()>>) {
        if let Ok(mut locks) = self.topic_locks.lock() {
            // one reference in the map, one here
            if Arc::strong_count(&lock) == 2 {
                locks.remove(topic);
            }
        }
    }

    fn mark_pending(&self, topic: &str, pending: bool) {
        if let Ok(mut set) = self.pending.lock() {
            if pending {
                set.insert(topic.to_string());
            } else {
                set.remove(topic);
            }
        }
    }

    async fn persist(&self, subs: &HashMap<String, String>) -> EngineResult<()> {
        let entries: Vec<(&String, &String)> = subs.iter().collect();
        let value = serde_json::to_value(entries)?;
        self.storage.set_item(&self.storage_key, value).await?;
        metrics::set_subscriptions(subs.len());
        Ok(())
    }

    /// Subscribe to `topic`; a second call for a subscribed topic returns the existing id
    pub async fn subscribe(&self, requester: &RelayRequester, topic: &str) -> EngineResult<String> {
        let lock = self.topic_lock(topic)?;
        let result = {
            let _guard = lock.lock().await;
            self.subscribe_locked(requester, topic).await
        };
        if result.is_err() {
            self.release_lock(topic, lock);
        }
        result
    }

    async fn subscribe_locked(&self, requester: &RelayRequester, topic: &str) -> EngineResult<String> {
        if let Some(id) = self.subscriptions.lock().await.get(topic) {
            return Ok(id.clone());
        }

        self.mark_pending(topic, true);
        let params = serde_json::to_value(SubscribeParams { topic: topic.to_string() })?;
        let result = requester
            .request(payload_id(), &self.methods.subscribe, params)
            .await;
        self.mark_pending(topic, false);

        let id = subscription_id(result?)?;
        let mut subs = self.subscriptions.lock().await;
        subs.insert(topic.to_string(), id.clone());
        self.persist(&subs).await?;
        info!(topic, "subscribed");
        Ok(id)
    }

    /// Drop the subscription locally and tell the relay; relay failures are logged, not returned
    pub async fn unsubscribe(&self, requester: &RelayRequester, topic: &str) -> EngineResult<()> {
        let lock = self.topic_lock(topic)?;
        let result = {
            let _guard = lock.lock().await;
            self.unsubscribe_locked(requester, topic).await
        };
        self.release_lock(topic, lock);
        result
    }

    async fn unsubscribe_locked(&self, requester: &RelayRequester, topic: &str) -> EngineResult<()> {
        let removed = {
            let mut subs = self.subscriptions.lock().await;
            let removed = subs.remove(topic);
            if removed.is_some() {
                self.persist(&subs).await?;
            }
            removed
        };
        let Some(id) = removed else {
            return Ok(());
        };

        let params = serde_json::to_value(UnsubscribeParams {
            topic: topic.to_string(),
            id,
        })?;
        if let Err(e) = requester
            .request(payload_id(), &self.methods.unsubscribe, params)
            .await
        {
            warn!(topic, error = %e, "relay unsubscribe failed");
        }
        info!(topic, "unsubscribed");
        Ok(())
    }

    /// Re-issue every known subscription on a new socket
    pub async fn resubscribe_all(&self, requester: &RelayRequester) {
        let topics = self.topics().await;
        if topics.is_empty() {
            return;
        }
        debug!(count = topics.len(), "resubscribing");
        for topic in topics {
            let lock = match self.topic_lock(&topic) {
                Ok(lock) => lock,
                Err(e) => {
                    warn!(error = %e, "resubscribe skipped");
                    continue;
                }
            };
            let _guard = lock.lock().await;
            if !self.subscriptions.lock().await.contains_key(&topic) {
                continue;
            }
            let params = match serde_json::to_value(SubscribeParams { topic: topic.clone() }) {
                Ok(params) => params,
                Err(_) => continue,
            };
            match requester.request(payload_id(), &self.methods.subscribe, params).await {
                Ok(result) => match subscription_id(result) {
                    Ok(id) => {
                        let mut subs = self.subscriptions.lock().await;
                        if subs.get(&topic) != Some(&id) {
                            subs.insert(topic.clone(), id);
                            if let Err(e) = self.persist(&subs).await {
                                warn!(error = %e, "failed to persist subscription");
                            }
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "resubscribe returned no id"),
                },
                Err(e) => warn!(topic = %topic, error = %e, "resubscribe failed"),
            }
        }
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        if self
            .pending
            .lock()
            .map(|p| p.contains(topic))
            .unwrap_or(false)
        {
            return true;
        }
        self.subscriptions.lock().await.contains_key(topic)
    }

    pub async fn topics(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

fn subscription_id(result: Value) -> EngineResult<String> {
    match result {
        Value::String(id) => Ok(id),
        other => Err(RelayError::InvalidFrame(format!("subscription id: {}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_relay::socket::SocketFrame;
    use crate::core_rpc::{JsonRpcRequest, JsonRpcResponse};
    use crate::core_store::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Answers every subscribe with `sub-<topic>` and every unsubscribe with `true`
    fn auto_relay(requester: Arc<RelayRequester>) -> Arc<std::sync::Mutex<Vec<String>>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        requester.attach(tx);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Some(SocketFrame::Text(text)) = rx.recv().await {
                let req: JsonRpcRequest = serde_json::from_str(&text).unwrap();
                log.lock().unwrap().push(req.method.clone());
                let result = if req.method.ends_with("_subscribe") {
                    json!(format!("sub-{}", req.params["topic"].as_str().unwrap()))
                } else {
                    json!(true)
                };
                requester.on_response(JsonRpcResponse::result(req.id, result));
            }
        });
        seen
    }

    fn subscriber(storage: Arc<MemoryStorage>) -> Subscriber {
        Subscriber::new(storage, "test:core//subscription".into(), RelayMethods::new("irn"))
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let requester = Arc::new(RelayRequester::new(Duration::from_secs(1)));
        let seen = auto_relay(requester.clone());
        let sub = subscriber(Arc::new(MemoryStorage::new()));

        assert_eq!(sub.subscribe(&requester, "abc").await.unwrap(), "sub-abc");
        assert_eq!(sub.subscribe(&requester, "abc").await.unwrap(), "sub-abc");
        assert!(sub.is_subscribed("abc").await);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic_is_noop() {
        let requester = Arc::new(RelayRequester::new(Duration::from_secs(1)));
        let seen = auto_relay(requester.clone());
        let sub = subscriber(Arc::new(MemoryStorage::new()));

        sub.unsubscribe(&requester, "nope").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topic_locks_are_released() {
        let requester = Arc::new(RelayRequester::new(Duration::from_secs(1)));
        let _seen = auto_relay(requester.clone());
        let sub = subscriber(Arc::new(MemoryStorage::new()));

        for i in 0..10 {
            let topic = format!("t{}", i);
            sub.subscribe(&requester, &topic).await.unwrap();
            sub.unsubscribe(&requester, &topic).await.unwrap();
        }
        sub.unsubscribe(&requester, "never").await.unwrap();
        assert!(sub.topic_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_subscribe_releases_lock() {
        let requester = RelayRequester::new(Duration::from_millis(30));
        let sub = subscriber(Arc::new(MemoryStorage::new()));
        assert!(sub.subscribe(&requester, "t").await.is_err());
        assert!(sub.topic_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_survive_restore() {
        let storage = Arc::new(MemoryStorage::new());
        let requester = Arc::new(RelayRequester::new(Duration::from_secs(1)));
        let _seen = auto_relay(requester.clone());

        let first = subscriber(storage.clone());
        first.subscribe(&requester, "one").await.unwrap();
        first.subscribe(&requester, "two").await.unwrap();
        first.unsubscribe(&requester, "one").await.unwrap();

        let second = subscriber(storage);
        second.restore().await.unwrap();
        assert_eq!(second.topics().await, vec!["two".to_string()]);
    }

    #[tokio::test]
    async fn test_resubscribe_all_reissues_requests() {
        let requester = Arc::new(RelayRequester::new(Duration::from_secs(1)));
        let seen = auto_relay(requester.clone());
        let sub = subscriber(Arc::new(MemoryStorage::new()));
        sub.subscribe(&requester, "a").await.unwrap();
        sub.subscribe(&requester, "b").await.unwrap();

        sub.resubscribe_all(&requester).await;
        let count = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == "irn_subscribe")
            .count();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_subscribe_fails_when_offline() {
        let requester = RelayRequester::new(Duration::from_millis(30));
        let sub = subscriber(Arc::new(MemoryStorage::new()));
        let err = sub.subscribe(&requester, "t").await.unwrap_err();
        assert!(matches!(err, EngineError::Relay(RelayError::Timeout { .. })));
        assert!(!sub.is_subscribed("t").await);
    }
}
