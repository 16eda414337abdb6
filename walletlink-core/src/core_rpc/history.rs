//! JSON-RPC history
//!
//! Records every request sent or received, keyed by id. Inbound requests
//! whose id is already recorded are duplicates; a response is attached at
//! most once, so replays of a response are ignored.

use super::{JsonRpcRequest, JsonRpcResponse, RpcMethod};
use crate::core_store::KeyValueStorage;
use crate::errors::{EngineError, EngineResult, StorageError};
use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRecord {
    pub id: u64,
    pub topic: String,
    pub request: RecordRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonRpcResponse>,
    /// Retention deadline, unix seconds
    pub expiry: u64,
}

impl JsonRpcRecord {
    pub fn method(&self) -> EngineResult<RpcMethod> {
        self.request.method.parse()
    }

    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

pub struct JsonRpcHistory {
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    retention: Duration,
    records: Mutex<LinkedHashMap<u64, JsonRpcRecord>>,
}

impl JsonRpcHistory {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String, retention: Duration) -> Self {
        Self {
            storage,
            storage_key,
            retention,
            records: Mutex::new(LinkedHashMap::new()),
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        let mut records = self.records.lock().await;
        if !records.is_empty() {
            return Err(EngineError::RestoreWillOverride(format!(
                "history already holds {} records",
                records.len()
            )));
        }

        if let Some(value) = self.storage.get_item(&self.storage_key).await? {
            let persisted: Vec<JsonRpcRecord> =
                serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                    key: self.storage_key.clone(),
                    reason: e.to_string(),
                })?;
            for record in persisted {
                records.insert(record.id, record);
            }
        }
        debug!(count = records.len(), "history restored");
        Ok(())
    }

    /// Record a request. Returns `false` when the id was already recorded.
    pub async fn set(
        &self,
        topic: &str,
        request: &JsonRpcRequest,
        chain_id: Option<String>,
    ) -> EngineResult<bool> {
        let mut records = self.records.lock().await;
        if records.contains_key(&request.id) {
            trace!(id = request.id, topic, "request already recorded");
            return Ok(false);
        }

        records.insert(
            request.id,
            JsonRpcRecord {
                id: request.id,
                topic: topic.to_string(),
                request: RecordRequest {
                    method: request.method.clone(),
                    params: request.params.clone(),
                },
                chain_id,
                response: None,
                expiry: crate::time::expiry_in(self.retention.as_secs()),
            },
        );
        self.persist(&records).await?;
        Ok(true)
    }

    /// Attach a response. No-op (returns `None`) when the record is unknown
    /// or already resolved.
    pub async fn resolve(&self, response: &JsonRpcResponse) -> EngineResult<Option<JsonRpcRecord>> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&response.id()) else {
            trace!(id = response.id(), "response for unknown request");
            return Ok(None);
        };
        if record.is_resolved() {
            trace!(id = response.id(), "request already resolved");
            return Ok(None);
        }

        record.response = Some(response.clone());
        let resolved = record.clone();
        self.persist(&records).await?;
        Ok(Some(resolved))
    }

    pub async fn get(&self, topic: &str, id: u64) -> EngineResult<JsonRpcRecord> {
        let records = self.records.lock().await;
        let record = records
            .get(&id)
            .ok_or_else(|| EngineError::NoMatchingKey(format!("history record {}", id)))?;
        if record.topic != topic {
            return Err(EngineError::MissingOrInvalid(format!(
                "record {} belongs to another topic",
                id
            )));
        }
        Ok(record.clone())
    }

    pub async fn exists(&self, topic: &str, id: u64) -> bool {
        self.records
            .lock()
            .await
            .get(&id)
            .is_some_and(|r| r.topic == topic)
    }

    /// Delete one record, or every record on the topic when `id` is `None`
    pub async fn delete(&self, topic: &str, id: Option<u64>) -> EngineResult<()> {
        let mut records = self.records.lock().await;
        let doomed: Vec<u64> = records
            .values()
            .filter(|r| r.topic == topic && id.map_or(true, |id| r.id == id))
            .map(|r| r.id)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        for id in doomed {
            records.remove(&id);
        }
        self.persist(&records).await
    }

    /// Unanswered inbound `session_request` records
    pub async fn pending_requests(&self) -> Vec<JsonRpcRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| !r.is_resolved() && r.request.method == RpcMethod::SessionRequest.as_str())
            .cloned()
            .collect()
    }

    /// Drop records whose retention passed; returns how many were removed
    pub async fn prune_at(&self, now: u64) -> EngineResult<usize> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.expiry > now);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, "pruned history");
            self.persist(&records).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    async fn persist(&self, records: &LinkedHashMap<u64, JsonRpcRecord>) -> EngineResult<()> {
        let snapshot: Vec<&JsonRpcRecord> = records.values().collect();
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
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(86_400);

    fn history(storage: &MemoryStorage) -> JsonRpcHistory {
        JsonRpcHistory::new(Arc::new(storage.clone()), "test//history".into(), DAY)
    }

    fn request(id: u64, method: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method, json!({}))
    }

    #[tokio::test]
    async fn test_set_deduplicates() {
        let h = history(&MemoryStorage::new());
        assert!(h.set("t", &request(1, "session_ping"), None).await.unwrap());
        assert!(!h.set("t", &request(1, "session_ping"), None).await.unwrap());
        assert_eq!(h.len().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let h = history(&MemoryStorage::new());
        h.set("t", &request(1, "session_ping"), None).await.unwrap();

        let resp = JsonRpcResponse::result(1, json!(true));
        let first = h.resolve(&resp).await.unwrap();
        assert!(first.is_some());
        assert!(h.resolve(&resp).await.unwrap().is_none());

        let late_error = JsonRpcResponse::error(1, crate::core_rpc::ErrorPayload::new(1, "x"));
        assert!(h.resolve(&late_error).await.unwrap().is_none());
        assert_eq!(h.get("t", 1).await.unwrap().response, Some(resp));
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_noop() {
        let h = history(&MemoryStorage::new());
        let resp = JsonRpcResponse::result(99, json!(true));
        assert!(h.resolve(&resp).await.unwrap().is_none());
        assert_eq!(h.len().await, 0);
    }

    #[tokio::test]
    async fn test_get_errors() {
        let h = history(&MemoryStorage::new());
        assert!(matches!(h.get("t", 1).await, Err(EngineError::NoMatchingKey(_))));
        h.set("t", &request(1, "session_ping"), None).await.unwrap();
        assert!(matches!(h.get("other", 1).await, Err(EngineError::MissingOrInvalid(_))));
        assert!(h.exists("t", 1).await);
        assert!(!h.exists("other", 1).await);
    }

    #[tokio::test]
    async fn test_pending_requests_and_delete() {
        let h = history(&MemoryStorage::new());
        h.set("t", &request(1, "session_request"), Some("eip155:1".into())).await.unwrap();
        h.set("t", &request(2, "session_ping"), None).await.unwrap();
        h.set("u", &request(3, "session_request"), None).await.unwrap();
        assert_eq!(h.pending_requests().await.len(), 2);

        h.resolve(&JsonRpcResponse::result(3, json!("0x"))).await.unwrap();
        let pending = h.pending_requests().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chain_id.as_deref(), Some("eip155:1"));

        h.delete("t", None).await.unwrap();
        assert_eq!(h.len().await, 1);
    }

    #[tokio::test]
    async fn test_prune_and_restore() {
        let storage = MemoryStorage::new();
        let h = history(&storage);
        h.set("t", &request(1, "session_ping"), None).await.unwrap();
        h.set("t", &request(2, "session_ping"), None).await.unwrap();

        let restored = history(&storage);
        restored.restore().await.unwrap();
        assert_eq!(restored.len().await, 2);

        let now = crate::time::now_secs();
        assert_eq!(restored.prune_at(now).await.unwrap(), 0);
        assert_eq!(restored.prune_at(now + DAY.as_secs() + 1).await.unwrap(), 2);
    }
}
