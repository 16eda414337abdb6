//! Pairing lifecycle and pairing-topic request routing

use super::types::Pairing;
use super::uri::{PairingUri, URI_VERSION};
use crate::context::{EngineContext, SendOptions, CLIENT_CONTEXT};
use crate::core_crypto::random_key;
use crate::core_expirer::ExpiryTarget;
use crate::core_rpc::params::{DeleteParams, PingParams};
use crate::core_rpc::{JsonRpcRecord, JsonRpcRequest, JsonRpcResponse, RequestParams, RpcMethod};
use crate::core_session::{Metadata, RelayProtocol};
use crate::core_store::Store;
use crate::errors::{EngineError, EngineResult};
use crate::events::ClientEvent;
use crate::time::{expiry_in, is_expired, FIVE_MINUTES, SEVEN_DAYS};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// A freshly created pairing and the URI to hand to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPairing {
    pub topic: String,
    pub uri: String,
}

/// Pairing-topic traffic for a method another engine registered
#[derive(Debug, Clone)]
pub enum ForwardedMessage {
    Request {
        topic: String,
        request: JsonRpcRequest,
    },
    Response {
        record: JsonRpcRecord,
        response: JsonRpcResponse,
    },
}

pub struct PairingEngine {
    ctx: Arc<EngineContext>,
    pairings: Store<String, Pairing>,
    handlers: Mutex<HashMap<RpcMethod, mpsc::UnboundedSender<ForwardedMessage>>>,
}

impl PairingEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let pairings = Store::new(
            "pairing",
            ctx.storage.clone(),
            ctx.storage_key(CLIENT_CONTEXT, "pairing"),
        );
        Self {
            ctx,
            pairings,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        self.pairings.restore().await
    }

    /// Route pairing-topic requests and responses for `method` to `tx`
    pub fn register(&self, method: RpcMethod, tx: mpsc::UnboundedSender<ForwardedMessage>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(method, tx);
        }
    }

    fn handler(&self, method: RpcMethod) -> Option<mpsc::UnboundedSender<ForwardedMessage>> {
        self.handlers.lock().ok()?.get(&method).cloned()
    }

    pub async fn create(&self, methods: Option<Vec<String>>) -> EngineResult<CreatedPairing> {
        let sym_key = Zeroizing::new(random_key());
        let topic = self.ctx.keystore.set_sym_key(*sym_key, None).await?;
        let expiry = expiry_in(FIVE_MINUTES);
        let relay = RelayProtocol {
            protocol: self.ctx.config.relay.protocol.clone(),
            data: None,
        };
        let methods = methods.unwrap_or_default();

        let pairing = Pairing {
            topic: topic.clone(),
            relay: relay.clone(),
            expiry,
            active: false,
            methods: methods.clone(),
            peer_metadata: None,
        };
        self.pairings.set(topic.clone(), pairing).await?;
        self.ctx.expirer.set(ExpiryTarget::Topic(topic.clone()), expiry).await?;
        self.ctx.relay.subscribe(&topic).await?;

        let uri = PairingUri {
            topic: topic.clone(),
            version: URI_VERSION,
            sym_key,
            relay,
            expiry_timestamp: expiry,
            methods,
        };
        info!(topic = %topic, "pairing created");
        Ok(CreatedPairing {
            topic,
            uri: uri.to_string(),
        })
    }

    /// Join a pairing from the peer's URI
    pub async fn pair(&self, uri: &str, activate: bool) -> EngineResult<Pairing> {
        let uri: PairingUri = uri.parse()?;
        if is_expired(uri.expiry_timestamp) {
            return Err(EngineError::Expired(format!(
                "pairing uri expired at {}",
                uri.expiry_timestamp
            )));
        }
        if let Some(existing) = self.pairings.try_get(&uri.topic).await {
            if existing.active {
                return Err(EngineError::MissingOrInvalid(format!(
                    "pairing {} is already active, request a new uri",
                    uri.topic
                )));
            }
        }

        let topic = uri.topic.clone();
        self.ctx
            .keystore
            .set_sym_key(*uri.sym_key, Some(&topic))
            .await?;
        let pairing = Pairing {
            topic: topic.clone(),
            relay: uri.relay.clone(),
            expiry: uri.expiry_timestamp,
            active: false,
            methods: uri.methods.clone(),
            peer_metadata: None,
        };
        self.pairings.set(topic.clone(), pairing).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Topic(topic.clone()), uri.expiry_timestamp)
            .await?;
        self.ctx.relay.subscribe(&topic).await?;
        info!(topic = %topic, "paired");

        let pairing = if activate {
            self.activate(&topic).await?
        } else {
            self.pairings.get(&topic).await?
        };
        self.ctx.emit(ClientEvent::PairingCreated {
            pairing: pairing.clone(),
        });
        Ok(pairing)
    }

    /// Mark active and extend to the long-lived expiry
    pub async fn activate(&self, topic: &str) -> EngineResult<Pairing> {
        let expiry = expiry_in(SEVEN_DAYS);
        let pairing = self
            .pairings
            .update(&topic.to_string(), |p| {
                p.active = true;
                p.expiry = expiry;
            })
            .await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Topic(topic.to_string()), expiry)
            .await?;
        debug!(topic, expiry, "pairing activated");
        Ok(pairing)
    }

    pub async fn update_metadata(&self, topic: &str, metadata: Metadata) -> EngineResult<()> {
        self.pairings
            .update(&topic.to_string(), |p| p.peer_metadata = Some(metadata))
            .await
            .map(|_| ())
    }

    pub async fn get_pairings(&self) -> Vec<Pairing> {
        self.pairings.values().await
    }

    pub async fn get(&self, topic: &str) -> EngineResult<Pairing> {
        self.pairings.get(&topic.to_string()).await
    }

    pub async fn is_pairing_topic(&self, topic: &str) -> bool {
        self.pairings.contains(&topic.to_string()).await
    }

    /// Round-trip a `pairing_ping`
    pub async fn ping(&self, topic: &str) -> EngineResult<()> {
        self.get(topic).await?;
        let pending = self
            .ctx
            .request(
                topic,
                RequestParams::PairingPing(PingParams {}),
                PING_TIMEOUT,
                SendOptions::default(),
            )
            .await?;
        pending.await.map(|_| ())
    }

    /// Tell the peer, then forget the pairing
    pub async fn disconnect(&self, topic: &str) -> EngineResult<()> {
        self.get(topic).await?;
        let sent = self
            .ctx
            .send_request(
                topic,
                RequestParams::PairingDelete(DeleteParams::user_disconnected()),
                SendOptions::default(),
            )
            .await;
        if let Err(e) = &sent {
            warn!(topic, error = %e, "pairing_delete not delivered");
        }
        self.delete_pairing(topic).await?;
        sent.map(|_| ())
    }

    async fn delete_pairing(&self, topic: &str) -> EngineResult<()> {
        self.pairings.delete(&topic.to_string()).await?;
        self.ctx.relay.unsubscribe(topic).await?;
        self.ctx.keystore.delete_sym_key(topic).await?;
        self.ctx.expirer.del(&ExpiryTarget::Topic(topic.to_string())).await?;
        self.ctx.history.delete(topic, None).await?;
        info!(topic, "pairing deleted");
        Ok(())
    }

    /// Handle a request that arrived on a pairing topic
    pub async fn on_request(&self, topic: &str, request: JsonRpcRequest) -> EngineResult<()> {
        let id = request.id;
        let method = match request.method.parse::<RpcMethod>() {
            Ok(method) => method,
            Err(e) => {
                warn!(topic, id, method = %request.method, "unknown pairing method");
                return self.ctx.send_error(topic, None, id, e.to_payload()).await;
            }
        };

        if !method.is_pairing_method() {
            return match self.handler(method) {
                Some(tx) => tx
                    .send(ForwardedMessage::Request {
                        topic: topic.to_string(),
                        request,
                    })
                    .map_err(|_| EngineError::Internal(format!("{} handler gone", method))),
                None => {
                    let err = EngineError::MethodNotFound(method.to_string());
                    self.ctx.send_error(topic, Some(method), id, err.to_payload()).await
                }
            };
        }

        match RequestParams::from_request(&request) {
            Ok(RequestParams::PairingPing(_)) => {
                self.ctx.send_result(topic, method, id, Value::Bool(true)).await?;
                self.ctx.emit(ClientEvent::PairingPing {
                    topic: topic.to_string(),
                    id,
                });
                Ok(())
            }
            Ok(RequestParams::PairingDelete(reason)) => {
                info!(topic, code = reason.code, "peer deleted pairing");
                self.ctx.send_result(topic, method, id, Value::Bool(true)).await?;
                self.delete_pairing(topic).await?;
                self.ctx.emit(ClientEvent::PairingDelete {
                    topic: topic.to_string(),
                    id,
                });
                Ok(())
            }
            Ok(_) => Err(EngineError::Internal(format!("{} misrouted", method))),
            Err(e) => self.ctx.send_error(topic, Some(method), id, e.to_payload()).await,
        }
    }

    /// Handle a response on a pairing topic; `record` is our original request
    pub async fn on_response(&self, record: JsonRpcRecord, response: JsonRpcResponse) -> EngineResult<()> {
        let method = record.method()?;
        if method.is_pairing_method() {
            // completed through the response waiters
            return Ok(());
        }
        match self.handler(method) {
            Some(tx) => tx
                .send(ForwardedMessage::Response { record, response })
                .map_err(|_| EngineError::Internal(format!("{} handler gone", method))),
            None => {
                debug!(method = %method, "no handler for pairing response");
                Ok(())
            }
        }
    }

    /// Clean up a pairing whose expiry passed; false when `topic` is not a pairing
    pub async fn on_expired(&self, topic: &str) -> EngineResult<bool> {
        if !self.is_pairing_topic(topic).await {
            return Ok(false);
        }
        self.delete_pairing(topic).await?;
        self.ctx.emit(ClientEvent::PairingExpire {
            topic: topic.to_string(),
        });
        Ok(true)
    }
}
