//! Expirer: one registry of deadlines for topics and request ids
//!
//! ```text
//!  set(target, expiry) ──► entries ◄── del(target)
//!                            │
//!  heartbeat pulse ──► sweep_at(now): expiry <= now ──► ExpirerEvent::Expired
//! ```
//!
//! Each entry fires at most once; it is removed before the event goes out.

use crate::core_store::KeyValueStorage;
use crate::errors::{EngineError, EngineResult, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// What an expiry belongs to; serialized as `topic:<topic>` or `id:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ExpiryTarget {
    Topic(String),
    Id(u64),
}

impl fmt::Display for ExpiryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryTarget::Topic(topic) => write!(f, "topic:{}", topic),
            ExpiryTarget::Id(id) => write!(f, "id:{}", id),
        }
    }
}

impl FromStr for ExpiryTarget {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("topic", topic)) if !topic.is_empty() => Ok(ExpiryTarget::Topic(topic.to_string())),
            Some(("id", id)) => id
                .parse()
                .map(ExpiryTarget::Id)
                .map_err(|_| EngineError::MissingOrInvalid(format!("expiry target {}", s))),
            _ => Err(EngineError::MissingOrInvalid(format!("expiry target {}", s))),
        }
    }
}

impl From<ExpiryTarget> for String {
    fn from(target: ExpiryTarget) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for ExpiryTarget {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created { target: ExpiryTarget, expiry: u64 },
    Deleted { target: ExpiryTarget },
    Expired { target: ExpiryTarget, expiry: u64 },
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    target: ExpiryTarget,
    expiry: u64,
}

pub struct Expirer {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    entries: Mutex<HashMap<ExpiryTarget, u64>>,
    events: broadcast::Sender<ExpirerEvent>,
}

impl Expirer {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            storage,
            storage_key,
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExpirerEvent> {
        self.events.subscribe()
    }

    pub async fn restore(&self) -> EngineResult<()> {
        let mut entries = self.entries.lock().await;
        if !entries.is_empty() {
            return Err(EngineError::RestoreWillOverride(format!(
                "expirer already tracks {} targets",
                entries.len()
            )));
        }

        if let Some(value) = self.storage.get_item(&self.storage_key).await? {
            let persisted: Vec<PersistedEntry> =
                serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                    key: self.storage_key.clone(),
                    reason: e.to_string(),
                })?;
            entries.extend(persisted.into_iter().map(|e| (e.target, e.expiry)));
        }
        debug!(count = entries.len(), "expirer restored");
        Ok(())
    }

    /// Track `target` until `expiry` (unix seconds); replaces any previous expiry
    pub async fn set(&self, target: ExpiryTarget, expiry: u64) -> EngineResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(target.clone(), expiry);
        self.persist(&entries).await?;
        drop(entries);

        let _ = self.events.send(ExpirerEvent::Created { target, expiry });
        Ok(())
    }

    pub async fn get(&self, target: &ExpiryTarget) -> EngineResult<u64> {
        self.entries
            .lock()
            .await
            .get(target)
            .copied()
            .ok_or_else(|| EngineError::NoMatchingKey(format!("expiry for {}", target)))
    }

    pub async fn has(&self, target: &ExpiryTarget) -> bool {
        self.entries.lock().await.contains_key(target)
    }

    /// Stop tracking `target`; absent targets are a no-op
    pub async fn del(&self, target: &ExpiryTarget) -> EngineResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(target).is_none() {
            return Ok(());
        }
        self.persist(&entries).await?;
        drop(entries);

        let _ = self.events.send(ExpirerEvent::Deleted {
            target: target.clone(),
        });
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn sweep(&self) -> EngineResult<Vec<ExpiryTarget>> {
        self.sweep_at(crate::time::now_secs()).await
    }

    /// Remove and announce every entry with `expiry <= now`
    pub async fn sweep_at(&self, now: u64) -> EngineResult<Vec<ExpiryTarget>> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<(ExpiryTarget, u64)> = entries
            .iter()
            .filter(|(_, &expiry)| now >= expiry)
            .map(|(target, &expiry)| (target.clone(), expiry))
            .collect();
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        for (target, _) in &expired {
            entries.remove(target);
        }
        self.persist(&entries).await?;
        drop(entries);

        let mut targets = Vec::with_capacity(expired.len());
        for (target, expiry) in expired {
            debug!(%target, expiry, "expired");
            let _ = self.events.send(ExpirerEvent::Expired {
                target: target.clone(),
                expiry,
            });
            targets.push(target);
        }
        Ok(targets)
    }

    async fn persist(&self, entries: &HashMap<ExpiryTarget, u64>) -> EngineResult<()> {
        let snapshot: Vec<PersistedEntry> = entries
            .iter()
            .map(|(target, &expiry)| PersistedEntry {
                target: target.clone(),
                expiry,
            })
            .collect();
        self.storage
            .set_item(&self.storage_key, serde_json::to_value(snapshot)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStorage;

    fn expirer(storage: &MemoryStorage) -> Expirer {
        Expirer::new(Arc::new(storage.clone()), "test//expirer".into(), 64)
    }

    fn topic(t: &str) -> ExpiryTarget {
        ExpiryTarget::Topic(t.to_string())
    }

    #[test]
    fn test_target_string_form() {
        assert_eq!(topic("abc").to_string(), "topic:abc");
        assert_eq!("id:42".parse::<ExpiryTarget>().unwrap(), ExpiryTarget::Id(42));
        assert!("id:x".parse::<ExpiryTarget>().is_err());
        assert!("session:abc".parse::<ExpiryTarget>().is_err());
    }

    #[tokio::test]
    async fn test_pairing_ttl_fires_at_deadline_not_before() {
        let e = expirer(&MemoryStorage::new());
        let created = 1_000_000;
        e.set(topic("pairing"), created + 300).await.unwrap();

        assert!(e.sweep_at(created + 299).await.unwrap().is_empty());
        assert!(e.has(&topic("pairing")).await);

        let fired = e.sweep_at(created + 300).await.unwrap();
        assert_eq!(fired, vec![topic("pairing")]);
        assert!(!e.has(&topic("pairing")).await);

        // one-shot
        assert!(e.sweep_at(created + 10_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let e = expirer(&MemoryStorage::new());
        e.set(ExpiryTarget::Id(1), 100).await.unwrap();
        e.set(ExpiryTarget::Id(1), 500).await.unwrap();
        assert_eq!(e.get(&ExpiryTarget::Id(1)).await.unwrap(), 500);
        assert!(e.sweep_at(200).await.unwrap().is_empty());
        assert_eq!(e.len().await, 1);
    }

    #[tokio::test]
    async fn test_events() {
        let e = expirer(&MemoryStorage::new());
        let mut rx = e.subscribe();

        e.set(topic("a"), 10).await.unwrap();
        e.set(topic("b"), 10).await.unwrap();
        e.del(&topic("b")).await.unwrap();
        e.del(&topic("missing")).await.unwrap();
        e.sweep_at(10).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ExpirerEvent::Created { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ExpirerEvent::Created { .. }));
        assert_eq!(rx.recv().await.unwrap(), ExpirerEvent::Deleted { target: topic("b") });
        assert_eq!(
            rx.recv().await.unwrap(),
            ExpirerEvent::Expired {
                target: topic("a"),
                expiry: 10
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_missing_and_restore() {
        let storage = MemoryStorage::new();
        let e = expirer(&storage);
        assert!(matches!(
            e.get(&ExpiryTarget::Id(9)).await,
            Err(EngineError::NoMatchingKey(_))
        ));
        e.set(ExpiryTarget::Id(9), 77).await.unwrap();
        e.set(topic("x"), 88).await.unwrap();

        let restored = expirer(&storage);
        restored.restore().await.unwrap();
        assert_eq!(restored.get(&ExpiryTarget::Id(9)).await.unwrap(), 77);
        assert_eq!(restored.get(&topic("x")).await.unwrap(), 88);
        assert!(restored.restore().await.is_err());
    }
}
