//! In-process relay
//!
//! Speaks the same `irn_*` JSON-RPC as the real relay over channel-backed
//! sockets. Published messages are kept in a mailbox until their TTL runs
//! out, so a client that subscribes late still receives them. Each connector
//! is one client identity: a message reaches an identity at most once, even
//! across reconnects, and is never echoed back to its publisher.

use crate::core_relay::messages::{
    PublishParams, RelayMethods, SubscribeParams, SubscriptionData, SubscriptionParams,
    UnsubscribeParams,
};
use crate::core_relay::{Connector, SocketConnection, SocketEvent, SocketFrame};
use crate::core_rpc::{payload_id, ErrorPayload, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse};
use crate::errors::RelayError;
use crate::time::now_millis;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::trace;

struct Connection {
    client: u64,
    tx: mpsc::UnboundedSender<SocketEvent>,
    subscriptions: HashMap<String, String>,
}

struct StoredMessage {
    topic: String,
    message: String,
    tag: u32,
    published_at: u64,
    expires_at: Instant,
    delivered_to: HashSet<u64>,
}

#[derive(Default)]
struct RelayState {
    offline: bool,
    next_client: u64,
    next_connection: u64,
    connections: HashMap<u64, Connection>,
    mailbox: Vec<StoredMessage>,
    published: usize,
}

#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    methods: RelayMethods,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            methods: RelayMethods::new(crate::config::DEFAULT_RELAY_PROTOCOL),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A connector with its own client identity
    pub fn connector(&self) -> MemoryConnector {
        let client = {
            let mut state = self.lock();
            state.next_client += 1;
            state.next_client
        };
        MemoryConnector {
            relay: self.clone(),
            client,
        }
    }

    /// Toggle reachability; going offline drops every socket
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
        if !online {
            self.disconnect_all();
        }
    }

    pub fn disconnect_all(&self) {
        let dropped: Vec<Connection> = self.lock().connections.drain().map(|(_, c)| c).collect();
        for conn in dropped {
            let _ = conn.tx.send(SocketEvent::Closed {
                code: 1001,
                reason: "relay restarting".to_string(),
            });
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn published_count(&self) -> usize {
        self.lock().published
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.subscriptions.contains_key(topic))
            .count()
    }

    fn open(&self, client: u64) -> Result<SocketConnection, RelayError> {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SocketFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<SocketEvent>();

        let conn_id = {
            let mut state = self.lock();
            if state.offline {
                return Err(RelayError::ConnectionFailed("relay unreachable".to_string()));
            }
            state.next_connection += 1;
            let conn_id = state.next_connection;
            state.connections.insert(
                conn_id,
                Connection {
                    client,
                    tx: inbound_tx,
                    subscriptions: HashMap::new(),
                },
            );
            conn_id
        };

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                relay.handle_frame(conn_id, frame);
            }
            relay.lock().connections.remove(&conn_id);
        });

        Ok(SocketConnection { outbound, inbound })
    }

    fn handle_frame(&self, conn_id: u64, frame: SocketFrame) {
        let mut state = self.lock();
        let Some(conn) = state.connections.get(&conn_id) else {
            return;
        };
        let text = match frame {
            SocketFrame::Ping => {
                let _ = conn.tx.send(SocketEvent::Activity);
                return;
            }
            SocketFrame::Text(text) => text,
        };

        let request = match serde_json::from_str::<JsonRpcPayload>(&text) {
            Ok(JsonRpcPayload::Request(request)) => request,
            // acks for delivered subscription messages
            Ok(JsonRpcPayload::Response(_)) => return,
            Err(_) => return,
        };
        trace!(conn_id, method = %request.method, "memory relay request");

        let outcome = if request.method == self.methods.publish {
            serde_json::from_value::<PublishParams>(request.params.clone())
                .map(|params| Self::publish(&mut state, &self.methods, conn_id, params))
        } else if request.method == self.methods.subscribe {
            serde_json::from_value::<SubscribeParams>(request.params.clone())
                .map(|params| self.subscribe(&mut state, conn_id, params))
        } else if request.method == self.methods.unsubscribe {
            serde_json::from_value::<UnsubscribeParams>(request.params.clone())
                .map(|params| Self::unsubscribe(&mut state, conn_id, params))
        } else {
            Self::reply(
                &state,
                conn_id,
                JsonRpcResponse::error(request.id, ErrorPayload::new(-32601, "unknown method")),
            );
            return;
        };

        let response = match outcome {
            Ok(result) => JsonRpcResponse::result(request.id, result),
            Err(e) => JsonRpcResponse::error(request.id, ErrorPayload::new(-32602, e.to_string())),
        };
        Self::reply(&state, conn_id, response);

        if request.method == self.methods.subscribe {
            Self::flush_mailbox(&mut state, &self.methods, conn_id);
        }
    }

    fn reply(state: &RelayState, conn_id: u64, response: JsonRpcResponse) {
        if let (Some(conn), Ok(text)) = (
            state.connections.get(&conn_id),
            serde_json::to_string(&response),
        ) {
            let _ = conn.tx.send(SocketEvent::Text(text));
        }
    }

    fn publish(state: &mut RelayState, methods: &RelayMethods, conn_id: u64, params: PublishParams) -> Value {
        let now = Instant::now();
        state.mailbox.retain(|m| m.expires_at > now);
        state.published += 1;

        let publisher = state.connections.get(&conn_id).map(|c| c.client).unwrap_or_default();
        let mut delivered_to = HashSet::from([publisher]);
        let stored = StoredMessage {
            topic: params.topic,
            message: params.message,
            tag: params.tag,
            published_at: now_millis(),
            expires_at: now + Duration::from_secs(params.ttl),
            delivered_to: HashSet::new(),
        };

        for conn in state.connections.values() {
            if delivered_to.contains(&conn.client) {
                continue;
            }
            if let Some(sub_id) = conn.subscriptions.get(&stored.topic) {
                if Self::deliver(methods, conn, sub_id, &stored) {
                    delivered_to.insert(conn.client);
                }
            }
        }

        state.mailbox.push(StoredMessage { delivered_to, ..stored });
        Value::Bool(true)
    }

    fn subscribe(&self, state: &mut RelayState, conn_id: u64, params: SubscribeParams) -> Value {
        let sub_id = hex::encode(crate::core_crypto::random_key());
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.subscriptions.insert(params.topic, sub_id.clone());
        }
        json!(sub_id)
    }

    fn unsubscribe(state: &mut RelayState, conn_id: u64, params: UnsubscribeParams) -> Value {
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.subscriptions.remove(&params.topic);
        }
        Value::Bool(true)
    }

    /// Deliver stored messages on the connection's topics that its client has not seen
    fn flush_mailbox(state: &mut RelayState, methods: &RelayMethods, conn_id: u64) {
        let RelayState { connections, mailbox, .. } = state;
        let Some(conn) = connections.get(&conn_id) else {
            return;
        };
        let now = Instant::now();
        for stored in mailbox.iter_mut() {
            if stored.expires_at <= now || stored.delivered_to.contains(&conn.client) {
                continue;
            }
            if let Some(sub_id) = conn.subscriptions.get(&stored.topic) {
                if Self::deliver(methods, conn, sub_id, stored) {
                    stored.delivered_to.insert(conn.client);
                }
            }
        }
    }

    fn deliver(methods: &RelayMethods, conn: &Connection, sub_id: &str, stored: &StoredMessage) -> bool {
        let params = SubscriptionParams {
            id: sub_id.to_string(),
            data: SubscriptionData {
                topic: stored.topic.clone(),
                message: stored.message.clone(),
                published_at: stored.published_at,
                tag: stored.tag,
            },
        };
        let Ok(params) = serde_json::to_value(params) else {
            return false;
        };
        let request = JsonRpcRequest::new(payload_id(), methods.subscription.clone(), params);
        match serde_json::to_string(&request) {
            Ok(text) => conn.tx.send(SocketEvent::Text(text)).is_ok(),
            Err(_) => false,
        }
    }
}

pub struct MemoryConnector {
    relay: MemoryRelay,
    client: u64,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<SocketConnection, RelayError> {
        self.relay.open(self.client)
    }

    async fn is_online(&self) -> bool {
        !self.relay.lock().offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_text(conn: &mut SocketConnection) -> JsonRpcPayload {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), conn.inbound.recv())
                .await
                .unwrap()
                .unwrap();
            if let SocketEvent::Text(text) = event {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn send(conn: &SocketConnection, id: u64, method: &str, params: Value) {
        let request = JsonRpcRequest::new(id, method, params);
        conn.outbound
            .send(SocketFrame::Text(serde_json::to_string(&request).unwrap()))
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_is_not_echoed_to_publisher() {
        let relay = MemoryRelay::new();
        let mut a = relay.connector().connect("memory").await.unwrap();

        send(&a, 1, "irn_subscribe", json!({"topic": "t"}));
        assert!(matches!(next_text(&mut a).await, JsonRpcPayload::Response(_)));

        send(&a, 2, "irn_publish", json!({"topic": "t", "message": "m", "ttl": 60, "tag": 1}));
        match next_text(&mut a).await {
            JsonRpcPayload::Response(r) => assert_eq!(r.id(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(relay.published_count(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_mailbox_once() {
        let relay = MemoryRelay::new();
        let a = relay.connector().connect("memory").await.unwrap();
        let bob = relay.connector();
        let mut b = bob.connect("memory").await.unwrap();

        send(&a, 1, "irn_publish", json!({"topic": "t", "message": "m", "ttl": 60, "tag": 1}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        send(&b, 2, "irn_subscribe", json!({"topic": "t"}));
        assert!(matches!(next_text(&mut b).await, JsonRpcPayload::Response(_)));
        match next_text(&mut b).await {
            JsonRpcPayload::Request(r) => {
                assert_eq!(r.method, "irn_subscription");
                assert_eq!(r.params["data"]["message"], "m");
            }
            other => panic!("unexpected {:?}", other),
        }

        // same identity, new socket: nothing is replayed
        drop(b);
        let mut b2 = bob.connect("memory").await.unwrap();
        send(&b2, 3, "irn_subscribe", json!({"topic": "t"}));
        assert!(matches!(next_text(&mut b2).await, JsonRpcPayload::Response(_)));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), b2.inbound.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_offline_relay_refuses_connections() {
        let relay = MemoryRelay::new();
        let connector = relay.connector();
        relay.set_online(false);
        assert!(!connector.is_online().await);
        assert!(connector.connect("memory").await.is_err());
        relay.set_online(true);
        assert!(connector.connect("memory").await.is_ok());
    }
}
