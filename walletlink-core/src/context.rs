//! Shared engine state
//!
//! One `EngineContext` is built per client and handed to both engines. It
//! owns the stores every protocol step touches and the helpers that turn a
//! typed request or response into a published envelope.

use crate::config::Config;
use crate::core_crypto::{Codec, EncodeOptions, KeyStore};
use crate::core_expirer::Expirer;
use crate::core_relay::{Heartbeat, PublishOptions, RelayTransport};
use crate::core_rpc::{
    payload_id, ErrorPayload, JsonRpcHistory, JsonRpcResponse, MethodOptions, RequestParams,
    ResponseWaiters, RpcMethod,
};
use crate::core_session::{LinkModeDelivery, Metadata};
use crate::core_store::{storage_key, KeyValueStorage};
use crate::errors::{EngineError, EngineResult};
use crate::events::ClientEvent;
use crate::shutdown::ShutdownCoordinator;
use crate::time::FIVE_MINUTES;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

/// Storage namespace for transport-level collections
pub const CORE_CONTEXT: &str = "core";
/// Storage namespace for engine-level collections
pub const CLIENT_CONTEXT: &str = "client";

/// Query parameter carrying a link-mode envelope
pub const LINK_MODE_ENVELOPE_PARAM: &str = "wc_ev";
pub const LINK_MODE_TOPIC_PARAM: &str = "topic";

/// Response options for a request whose method we do not know
const UNKNOWN_METHOD_OPTIONS: MethodOptions = MethodOptions {
    ttl: FIVE_MINUTES,
    tag: 0,
    prompt: false,
};

/// Per-send overrides
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// JSON-RPC id; a fresh payload id when absent
    pub id: Option<u64>,
    /// Publish ttl in seconds instead of the method default
    pub ttl: Option<u64>,
    /// Deliver through this universal link instead of the relay
    pub link_target: Option<String>,
}

pub struct EngineContext {
    pub config: Config,
    pub storage: Arc<dyn KeyValueStorage>,
    pub keystore: Arc<KeyStore>,
    pub codec: Codec,
    pub relay: Arc<RelayTransport>,
    pub history: JsonRpcHistory,
    pub expirer: Expirer,
    pub waiters: ResponseWaiters,
    pub heartbeat: Arc<Heartbeat>,
    pub shutdown: ShutdownCoordinator,
    pub metadata: Metadata,
    pub link_mode: Option<Arc<dyn LinkModeDelivery>>,
    events: broadcast::Sender<ClientEvent>,
}

impl EngineContext {
    pub fn new(
        config: Config,
        storage: Arc<dyn KeyValueStorage>,
        keystore: Arc<KeyStore>,
        relay: Arc<RelayTransport>,
        metadata: Metadata,
        link_mode: Option<Arc<dyn LinkModeDelivery>>,
    ) -> Self {
        let prefix = config.engine.storage_prefix.clone();
        let capacity = config.engine.event_capacity;
        let (events, _) = broadcast::channel(capacity);
        Self {
            codec: Codec::new(keystore.clone()),
            history: JsonRpcHistory::new(
                storage.clone(),
                storage_key(&prefix, CORE_CONTEXT, "history"),
                config.engine.history_retention,
            ),
            expirer: Expirer::new(
                storage.clone(),
                storage_key(&prefix, CORE_CONTEXT, "expirer"),
                capacity,
            ),
            waiters: ResponseWaiters::new(),
            heartbeat: Arc::new(Heartbeat::new(config.relay.heartbeat_interval)),
            shutdown: ShutdownCoordinator::new(Duration::from_secs(5)),
            config,
            storage,
            keystore,
            relay,
            metadata,
            link_mode,
            events,
        }
    }

    pub fn storage_key(&self, context: &str, name: &str) -> String {
        storage_key(&self.config.engine.storage_prefix, context, name)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        trace!(event = event.name(), "emitting");
        // no listeners is fine
        let _ = self.events.send(event);
    }

    /// Encrypt `payload` for `topic` and hand it to the relay or the link-mode hook
    async fn deliver(
        &self,
        topic: &str,
        payload: &str,
        options: MethodOptions,
        relay_id: Option<u64>,
        ttl: Option<u64>,
        link_target: Option<&str>,
    ) -> EngineResult<()> {
        if let (Some(target), Some(link)) = (link_target, self.link_mode.as_ref()) {
            let envelope = self
                .codec
                .encode(topic, payload, &EncodeOptions::url_safe())
                .await?;
            let url = link_mode_url(target, topic, &envelope)?;
            debug!(topic, "delivering over link mode");
            return link.deliver(&url).await;
        }

        let message = self
            .codec
            .encode(topic, payload, &EncodeOptions::default())
            .await?;
        let mut publish = PublishOptions::new(ttl.unwrap_or(options.ttl), options.tag, options.prompt);
        publish.id = relay_id;
        self.relay.publish(topic, message, publish).await
    }

    /// Record and publish a request; returns its id
    pub async fn send_request(
        &self,
        topic: &str,
        params: RequestParams,
        opts: SendOptions,
    ) -> EngineResult<u64> {
        let id = opts.id.unwrap_or_else(payload_id);
        let method = params.method();
        let chain_id = params.chain_id().map(str::to_string);
        let request = params.into_request(id)?;
        let payload = serde_json::to_string(&request)?;

        self.history.set(topic, &request, chain_id).await?;
        debug!(topic, id, method = %method, "sending request");
        self.deliver(
            topic,
            &payload,
            method.request_options(),
            Some(id),
            opts.ttl,
            opts.link_target.as_deref(),
        )
        .await?;
        Ok(id)
    }

    /// Publish a request and wait up to `timeout` for the peer's answer
    pub async fn request(
        &self,
        topic: &str,
        params: RequestParams,
        timeout: Duration,
        mut opts: SendOptions,
    ) -> EngineResult<Pending<Value>> {
        let id = *opts.id.get_or_insert_with(payload_id);
        let rx = self.waiters.register(id, timeout);
        match self.send_request(topic, params, opts).await {
            Ok(_) => Ok(Pending::new(rx)),
            Err(e) => {
                self.waiters.cancel(id);
                Err(e)
            }
        }
    }

    /// Publish a response to an inbound request and mark it answered
    pub async fn send_response(
        &self,
        topic: &str,
        method: Option<RpcMethod>,
        response: JsonRpcResponse,
        link_target: Option<&str>,
    ) -> EngineResult<()> {
        let options = match method {
            Some(m) if response.is_error() => m.reject_options(),
            Some(m) => m.response_options(),
            None => UNKNOWN_METHOD_OPTIONS,
        };
        let payload = serde_json::to_string(&response)?;
        self.history.resolve(&response).await?;
        debug!(topic, id = response.id(), error = response.is_error(), "sending response");
        self.deliver(topic, &payload, options, None, None, link_target).await
    }

    pub async fn send_result(
        &self,
        topic: &str,
        method: RpcMethod,
        id: u64,
        result: Value,
    ) -> EngineResult<()> {
        self.send_response(topic, Some(method), JsonRpcResponse::result(id, result), None)
            .await
    }

    pub async fn send_error(
        &self,
        topic: &str,
        method: Option<RpcMethod>,
        id: u64,
        error: ErrorPayload,
    ) -> EngineResult<()> {
        self.send_response(topic, method, JsonRpcResponse::error(id, error), None)
            .await
    }
}

/// `<universal>?wc_ev=<envelope>&topic=<topic>`
pub fn link_mode_url(target: &str, topic: &str, envelope: &str) -> EngineResult<String> {
    let mut url = url::Url::parse(target)
        .map_err(|e| EngineError::MissingOrInvalid(format!("link mode target {}: {}", target, e)))?;
    url.query_pairs_mut()
        .append_pair(LINK_MODE_ENVELOPE_PARAM, envelope)
        .append_pair(LINK_MODE_TOPIC_PARAM, topic);
    Ok(url.into())
}

/// Split a link-mode URL back into `(topic, envelope)`
pub fn parse_link_mode_url(link: &str) -> EngineResult<(String, String)> {
    let url = url::Url::parse(link)
        .map_err(|e| EngineError::MissingOrInvalid(format!("link mode url: {}", e)))?;
    let mut topic = None;
    let mut envelope = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            LINK_MODE_TOPIC_PARAM => topic = Some(value.into_owned()),
            LINK_MODE_ENVELOPE_PARAM => envelope = Some(value.into_owned()),
            _ => {}
        }
    }
    match (topic, envelope) {
        (Some(topic), Some(envelope)) => Ok((topic, envelope)),
        _ => Err(EngineError::MissingOrInvalid(
            "link mode url needs topic and wc_ev".to_string(),
        )),
    }
}

/// Outcome of an operation that completes after the peer answers
#[must_use = "a pending outcome does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<EngineResult<T>>,
}

impl<T> Pending<T> {
    pub fn new(rx: oneshot::Receiver<EngineResult<T>>) -> Self {
        Self { rx }
    }

    /// A pending value plus the sender that completes it
    pub fn channel() -> (oneshot::Sender<EngineResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for Pending<T> {
    type Output = EngineResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(EngineError::Internal("operation abandoned before completion".to_string()))
            })
        })
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}
