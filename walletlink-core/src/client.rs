//! Client facade
//!
//! ```text
//!   Client::new ──► init() ──┬─► heartbeat pulse ──┬─► relay keepalive
//!                            │                     └─► expiry sweep + history prune
//!                            ├─► relay connect loop
//!                            ├─► dispatcher: RelayEvent ─► decode ─► pairing | session
//!                            └─► session_propose forwarding
//! ```
//!
//! Every operation fails with `NotInitialized` until `init()` has run.
//! `shutdown()` is terminal: the background loops and their channels are
//! gone, so a stopped client cannot be re-initialized. Build a new `Client`
//! over the same storage to resume; persisted state is restored on `init()`.

use crate::config::Config;
use crate::context::{parse_link_mode_url, EngineContext, Pending, CORE_CONTEXT};
use crate::core_crypto::{DecodeOptions, Encoding, KeyStore};
use crate::core_expirer::ExpiryTarget;
use crate::core_pairing::{CreatedPairing, Pairing, PairingEngine};
use crate::core_relay::{metrics, Connector, RelayEvent, RelayTransport};
use crate::core_rpc::params::EventPayload;
use crate::core_rpc::{ErrorPayload, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, RpcMethod};
use crate::core_session::{
    ApproveParams, Approved, AuthSigner, ConnectParams, ConnectResponse, LinkModeDelivery,
    Metadata, Namespaces, OutboundRequest, PendingRequest, ProposalNamespaces, Session,
    SessionEngine, SessionProposal,
};
use crate::core_store::{storage_key, KeyValueStorage};
use crate::errors::{EngineError, EngineResult};
use crate::events::ClientEvent;
use crate::time::now_secs;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// Host-provided collaborators
pub struct ClientOptions {
    pub storage: Arc<dyn KeyValueStorage>,
    pub connector: Arc<dyn Connector>,
    pub metadata: Metadata,
    pub signer: Option<Arc<dyn AuthSigner>>,
    pub link_mode: Option<Arc<dyn LinkModeDelivery>>,
}

impl ClientOptions {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        connector: Arc<dyn Connector>,
        metadata: Metadata,
    ) -> Self {
        Self {
            storage,
            connector,
            metadata,
            signer: None,
            link_mode: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn AuthSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_link_mode(mut self, link_mode: Arc<dyn LinkModeDelivery>) -> Self {
        self.link_mode = Some(link_mode);
        self
    }
}

/// Routes decoded inbound traffic to the owning engine
struct Router {
    ctx: Arc<EngineContext>,
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
}

impl Router {
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::Connected => self.ctx.emit(ClientEvent::RelayConnected),
                RelayEvent::Disconnected => self.ctx.emit(ClientEvent::RelayDisconnected),
                RelayEvent::Message(message) => {
                    metrics::record_inbound_message("received");
                    if let Err(e) = self
                        .dispatch(&message.topic, &message.message, Encoding::Base64)
                        .await
                    {
                        warn!(topic = %message.topic, error = %e, "inbound message dropped");
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    async fn dispatch(&self, topic: &str, wire: &str, encoding: Encoding) -> EngineResult<()> {
        let opts = DecodeOptions {
            encoding,
            ..Default::default()
        };
        let payload = match self.ctx.codec.decode(topic, wire, &opts).await {
            Ok(payload) => payload,
            Err(e) => {
                metrics::record_decode_failure();
                return Err(e);
            }
        };

        match serde_json::from_str::<JsonRpcPayload>(&payload)? {
            JsonRpcPayload::Request(request) => self.on_request(topic, request).await,
            JsonRpcPayload::Response(response) => self.on_response(topic, response).await,
        }
    }

    async fn on_request(&self, topic: &str, request: JsonRpcRequest) -> EngineResult<()> {
        let chain_id = request
            .params
            .get("chainId")
            .and_then(Value::as_str)
            .map(str::to_string);
        if !self.ctx.history.set(topic, &request, chain_id).await? {
            trace!(topic, id = request.id, "duplicate request ignored");
            metrics::record_inbound_message("duplicate");
            return Ok(());
        }

        debug!(topic, id = request.id, method = %request.method, "inbound request");
        if self.pairing.is_pairing_topic(topic).await {
            self.pairing.on_request(topic, request).await
        } else {
            self.session.on_request(topic, request).await
        }
    }

    async fn on_response(&self, topic: &str, response: JsonRpcResponse) -> EngineResult<()> {
        let id = response.id();
        let Some(record) = self.ctx.history.resolve(&response).await? else {
            trace!(topic, id, "late or duplicate response ignored");
            return Ok(());
        };

        let method = record.method()?;
        debug!(topic, id, method = %method, error = response.is_error(), "inbound response");
        let outcome = response.outcome();
        if method.is_pairing_method() || method == RpcMethod::SessionPropose {
            self.pairing.on_response(record, response).await?;
        }
        self.ctx.waiters.complete(id, outcome);
        Ok(())
    }

    /// Heartbeat-driven expiry sweep and history pruning
    async fn run_expiry(self: Arc<Self>, mut pulses: broadcast::Receiver<u64>) {
        loop {
            match pulses.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }

            let targets = match self.ctx.expirer.sweep().await {
                Ok(targets) => targets,
                Err(e) => {
                    error!(error = %e, "expiry sweep failed");
                    continue;
                }
            };
            for target in targets {
                if let Err(e) = self.on_expired(&target).await {
                    warn!(%target, error = %e, "expiry handling failed");
                }
            }
            if let Err(e) = self.ctx.history.prune_at(now_secs()).await {
                warn!(error = %e, "history prune failed");
            }
        }
    }

    async fn on_expired(&self, target: &ExpiryTarget) -> EngineResult<()> {
        if let ExpiryTarget::Topic(topic) = target {
            if self.pairing.on_expired(topic).await? {
                return Ok(());
            }
        }
        if !self.session.on_expired(target).await? {
            trace!(%target, "expiry for nothing we track");
        }
        Ok(())
    }
}

pub struct Client {
    ctx: Arc<EngineContext>,
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
    router: Arc<Router>,
    forwarded: std::sync::Mutex<Option<mpsc::UnboundedReceiver<crate::core_pairing::ForwardedMessage>>>,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl Client {
    pub fn new(config: Config, options: ClientOptions) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::MissingOrInvalid(e.to_string()))?;
        metrics::init_metrics();

        let prefix = config.engine.storage_prefix.clone();
        let keystore = Arc::new(KeyStore::new(
            options.storage.clone(),
            storage_key(&prefix, CORE_CONTEXT, "keychain"),
        ));
        let relay = Arc::new(RelayTransport::new(
            config.relay.clone(),
            options.connector,
            keystore.clone(),
            options.storage.clone(),
            storage_key(&prefix, CORE_CONTEXT, "subscription"),
        ));
        let ctx = Arc::new(EngineContext::new(
            config,
            options.storage,
            keystore,
            relay,
            options.metadata,
            options.link_mode,
        ));

        let pairing = Arc::new(PairingEngine::new(ctx.clone()));
        let session = Arc::new(SessionEngine::new(ctx.clone(), pairing.clone(), options.signer));
        let (tx, rx) = mpsc::unbounded_channel();
        pairing.register(RpcMethod::SessionPropose, tx);

        let router = Arc::new(Router {
            ctx: ctx.clone(),
            pairing: pairing.clone(),
            session: session.clone(),
        });
        Ok(Self {
            ctx,
            pairing,
            session,
            router,
            forwarded: std::sync::Mutex::new(Some(rx)),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Restore persisted state and start the background loops
    pub async fn init(&self) -> EngineResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::NotInitialized(
                "client was shut down; create a new one".to_string(),
            ));
        }
        let forwarded = self
            .forwarded
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| EngineError::Internal("client already started".to_string()))?;

        self.ctx.keystore.restore().await?;
        self.ctx.relay.restore().await?;
        self.ctx.history.restore().await?;
        self.ctx.expirer.restore().await?;
        self.pairing.restore().await?;
        self.session.restore().await?;

        let shutdown = &self.ctx.shutdown;
        let relay_events = self.ctx.relay.subscribe_events();
        let pulses = self.ctx.heartbeat.subscribe();

        shutdown.spawn("dispatcher", self.router.clone().run(relay_events));
        shutdown.spawn("expiry", self.router.clone().run_expiry(pulses));
        shutdown.spawn("proposals", self.session.clone().run_forwarded(forwarded));

        let heartbeat = self.ctx.heartbeat.clone();
        shutdown.spawn("heartbeat", async move { heartbeat.run().await });
        shutdown.spawn("relay", self.ctx.relay.clone().run());
        shutdown.spawn(
            "relay-heartbeat",
            self.ctx.relay.clone().run_heartbeat(self.ctx.heartbeat.clone()),
        );

        self.initialized.store(true, Ordering::SeqCst);
        info!(name = %self.ctx.metadata.name, "client initialized");
        Ok(())
    }

    fn ensure_initialized(&self) -> EngineResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotInitialized("call init() first".to_string()))
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.subscribe_events()
    }

    /// Our relay identity (`did:key`)
    pub async fn client_id(&self) -> EngineResult<String> {
        self.ctx.keystore.client_id().await
    }

    pub fn relay(&self) -> &Arc<RelayTransport> {
        &self.ctx.relay
    }

    pub async fn create_pairing(&self, methods: Option<Vec<String>>) -> EngineResult<CreatedPairing> {
        self.ensure_initialized()?;
        self.pairing.create(methods).await
    }

    pub async fn pair(&self, uri: &str) -> EngineResult<Pairing> {
        self.ensure_initialized()?;
        self.pairing.pair(uri, false).await
    }

    pub async fn get_pairings(&self) -> EngineResult<Vec<Pairing>> {
        self.ensure_initialized()?;
        Ok(self.pairing.get_pairings().await)
    }

    pub async fn connect(&self, params: ConnectParams) -> EngineResult<ConnectResponse> {
        self.ensure_initialized()?;
        self.session.connect(params).await
    }

    pub async fn approve(&self, params: ApproveParams) -> EngineResult<Approved> {
        self.ensure_initialized()?;
        self.session.approve(params).await
    }

    pub async fn reject(&self, id: u64, reason: ErrorPayload) -> EngineResult<()> {
        self.ensure_initialized()?;
        self.session.reject(id, reason).await
    }

    pub async fn update(&self, topic: &str, namespaces: Namespaces) -> EngineResult<Pending<()>> {
        self.ensure_initialized()?;
        self.session.update(topic, namespaces).await
    }

    pub async fn extend(&self, topic: &str) -> EngineResult<Pending<()>> {
        self.ensure_initialized()?;
        self.session.extend(topic).await
    }

    pub async fn request(&self, request: OutboundRequest) -> EngineResult<Value> {
        self.ensure_initialized()?;
        self.session.request(request).await
    }

    pub async fn respond(&self, topic: &str, response: JsonRpcResponse) -> EngineResult<()> {
        self.ensure_initialized()?;
        self.session.respond(topic, response).await
    }

    pub async fn ping(&self, topic: &str) -> EngineResult<()> {
        self.ensure_initialized()?;
        self.session.ping(topic).await
    }

    pub async fn emit(&self, topic: &str, chain_id: &str, event: EventPayload) -> EngineResult<()> {
        self.ensure_initialized()?;
        self.session.emit(topic, chain_id, event).await
    }

    pub async fn disconnect(&self, topic: &str) -> EngineResult<()> {
        self.ensure_initialized()?;
        self.session.disconnect(topic).await
    }

    pub async fn get_active_sessions(&self) -> EngineResult<Vec<Session>> {
        self.ensure_initialized()?;
        Ok(self.session.get_active_sessions().await)
    }

    pub async fn find(&self, required: &ProposalNamespaces) -> EngineResult<Vec<Session>> {
        self.ensure_initialized()?;
        Ok(self.session.find(required).await)
    }

    pub async fn get_pending_proposals(&self) -> EngineResult<Vec<SessionProposal>> {
        self.ensure_initialized()?;
        Ok(self.session.get_pending_proposals().await)
    }

    pub async fn get_pending_session_requests(&self) -> EngineResult<Vec<PendingRequest>> {
        self.ensure_initialized()?;
        Ok(self.session.get_pending_session_requests().await)
    }

    /// Feed a link-mode URL received out of band into the dispatcher
    pub async fn dispatch_envelope(&self, link: &str) -> EngineResult<()> {
        self.ensure_initialized()?;
        let (topic, envelope) = parse_link_mode_url(link)?;
        self.router
            .dispatch(&topic, &envelope, Encoding::Base64Url)
            .await
    }

    /// Stop the background loops and drop the relay connection for good
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ctx.relay.close();
        self.ctx.shutdown.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
        info!("client shut down");
    }
}

#[cfg(test)]
impl Client {
    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub(crate) fn session_engine(&self) -> &Arc<SessionEngine> {
        &self.session
    }

    /// Run the expiry handling for `target` without waiting for the clock
    pub(crate) async fn expire(&self, target: &ExpiryTarget) -> EngineResult<()> {
        self.router.on_expired(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStorage;
    use crate::test_utils::fixtures::dapp_metadata;
    use crate::test_utils::MemoryRelay;

    fn client(relay: &MemoryRelay) -> Client {
        let options = ClientOptions::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(relay.connector()),
            dapp_metadata(),
        );
        Client::new(Config::default(), options).unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let relay = MemoryRelay::new();
        let client = client(&relay);

        let err = client.ping("abc").await.unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized(_)));
        assert!(matches!(
            client.connect(ConnectParams::default()).await,
            Err(EngineError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let relay = MemoryRelay::new();
        let client = client(&relay);

        client.init().await.unwrap();
        client.init().await.unwrap();
        assert!(client.get_active_sessions().await.unwrap().is_empty());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_topic_ping() {
        let relay = MemoryRelay::new();
        let client = client(&relay);
        client.init().await.unwrap();

        assert!(matches!(
            client.ping("deadbeef").await,
            Err(EngineError::NoMatchingKey(_))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_link_is_rejected() {
        let relay = MemoryRelay::new();
        let client = client(&relay);
        client.init().await.unwrap();

        let err = client
            .dispatch_envelope("https://dapp.example/wc?topic=abc")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingOrInvalid(_)));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let relay = MemoryRelay::new();
        let client = client(&relay);
        client.init().await.unwrap();
        client.shutdown().await;

        assert!(matches!(client.init().await, Err(EngineError::NotInitialized(_))));
        assert!(matches!(
            client.get_active_sessions().await,
            Err(EngineError::NotInitialized(_))
        ));
    }
}
