//! Relay transport
//!
//! Owns the connection loop: connect, resubscribe, flush queued publishes,
//! read until the socket dies, back off, repeat. Inbound subscription messages
//! are acknowledged and surfaced as [`RelayEvent::Message`] for topics the
//! client is subscribed to.
//!
//! Listeners get unbounded queues: a message acked to the relay is never
//! redelivered, so a slow dispatcher must not cause drops.

use super::heartbeat::Heartbeat;
use super::messages::{PublishParams, RelayMethods, SubscriptionParams};
use super::metrics;
use super::publisher::{PublishOptions, Publisher};
use super::requester::{ConnectionState, RelayRequester};
use super::socket::{Connector, SocketConnection, SocketEvent, SocketFrame};
use super::subscriber::Subscriber;
use crate::config::RelayConfig;
use crate::core_crypto::{relay_auth, KeyStore};
use crate::core_rpc::{payload_id, JsonRpcPayload, JsonRpcResponse};
use crate::core_store::KeyValueStorage;
use crate::errors::{EngineError, EngineResult, RelayError};
use crate::time::{now_secs, ONE_DAY};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub message: String,
    pub published_at: u64,
    pub tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Message(RelayMessage),
}

pub struct RelayTransport {
    config: RelayConfig,
    methods: RelayMethods,
    connector: Arc<dyn Connector>,
    keystore: Arc<KeyStore>,
    requester: Arc<RelayRequester>,
    subscriber: Arc<Subscriber>,
    publisher: Arc<Publisher>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<RelayEvent>>>,
    last_inbound: Mutex<Instant>,
    force_reconnect: Notify,
    enabled: watch::Sender<bool>,
}

impl RelayTransport {
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        keystore: Arc<KeyStore>,
        storage: Arc<dyn KeyValueStorage>,
        subscription_key: String,
    ) -> Self {
        let methods = RelayMethods::new(&config.protocol);
        let (enabled, _) = watch::channel(true);
        Self {
            requester: Arc::new(RelayRequester::new(config.request_timeout)),
            subscriber: Arc::new(Subscriber::new(storage, subscription_key, methods.clone())),
            publisher: Arc::new(Publisher::new(methods.publish.clone())),
            config,
            methods,
            connector,
            keystore,
            listeners: Mutex::new(Vec::new()),
            last_inbound: Mutex::new(Instant::now()),
            force_reconnect: Notify::new(),
            enabled,
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        self.subscriber.restore().await
    }

    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<RelayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }

    fn emit(&self, event: RelayEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.requester.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.requester.watch_state()
    }

    pub async fn publish(&self, topic: &str, message: String, opts: PublishOptions) -> EngineResult<()> {
        let id = opts.id.unwrap_or_else(payload_id);
        let params = PublishParams {
            topic: topic.to_string(),
            message,
            ttl: opts.ttl,
            tag: opts.tag,
            prompt: opts.prompt,
        };
        let timeout = opts.timeout.unwrap_or(self.config.publish_timeout);
        trace!(topic, id, tag = opts.tag, "publishing");
        self.publisher
            .publish(&self.requester, id, params, timeout, opts.throw_on_failed_publish)
            .await
            .map_err(EngineError::from)
    }

    pub async fn subscribe(&self, topic: &str) -> EngineResult<String> {
        self.subscriber.subscribe(&self.requester, topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> EngineResult<()> {
        self.subscriber.unsubscribe(&self.requester, topic).await
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriber.is_subscribed(topic).await
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscriber.topics().await
    }

    /// Close the socket and stay offline until [`start`](Self::start)
    pub fn close(&self) {
        self.enabled.send_replace(false);
    }

    pub fn start(&self) {
        self.enabled.send_replace(true);
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_inbound.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_inbound
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.config.reconnect_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=jitter_ms)
        };
        self.config.reconnect_interval + Duration::from_millis(jitter)
    }

    /// Websocket URL with `auth`, `projectId` and `ua` query params
    pub async fn relay_url(&self) -> EngineResult<String> {
        let signing = self.keystore.client_signing_key().await?;
        let jwt = relay_auth::issue_jwt(&signing, &self.config.url, now_secs(), ONE_DAY)?;
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| RelayError::ConnectionFailed(format!("invalid relay url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("auth", &jwt)
            .append_pair("projectId", &self.config.project_id)
            .append_pair("ua", &self.config.user_agent);
        Ok(url.into())
    }

    /// Connection loop; runs until the task is cancelled
    pub async fn run(self: Arc<Self>) {
        let mut enabled = self.enabled.subscribe();
        loop {
            if !*enabled.borrow_and_update() {
                debug!("relay transport closed, waiting for start");
                if enabled.changed().await.is_err() {
                    return;
                }
                continue;
            }

            if !self.connector.is_online().await {
                debug!("offline, delaying relay connect");
                tokio::time::sleep(self.backoff()).await;
                continue;
            }

            self.requester.set_state(ConnectionState::Connecting);
            match self.clone().connect_once().await {
                Ok(reason) => {
                    metrics::record_disconnect(reason);
                    info!(reason, "relay disconnected");
                }
                Err(e) => {
                    metrics::record_connection("failed");
                    warn!(error = %e, "relay connection failed");
                    self.requester.set_state(ConnectionState::Disconnected);
                }
            }

            if *self.enabled.borrow() {
                tokio::time::sleep(self.backoff()).await;
            }
        }
    }

    async fn connect_once(self: Arc<Self>) -> EngineResult<&'static str> {
        let url = self.relay_url().await?;
        let SocketConnection { outbound, mut inbound } = self.connector.connect(&url).await?;

        self.touch();
        self.requester.attach(outbound);
        metrics::record_connection("connected");
        info!(url = %self.config.url, "relay connected");
        self.emit(RelayEvent::Connected);

        let this = self.clone();
        tokio::spawn(async move {
            this.subscriber.resubscribe_all(&this.requester).await;
            this.publisher.redeliver(&this.requester);
        });

        let mut enabled = self.enabled.subscribe();
        let reason = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(SocketEvent::Text(text)) => {
                        self.touch();
                        self.handle_frame(&text).await;
                    }
                    Some(SocketEvent::Activity) => self.touch(),
                    Some(SocketEvent::Closed { code, reason }) => {
                        debug!(code, reason = %reason, "socket closed");
                        break "socket_closed";
                    }
                    None => break "socket_closed",
                },
                _ = self.force_reconnect.notified() => break "heartbeat_timeout",
                changed = enabled.changed() => {
                    if changed.is_err() || !*enabled.borrow() {
                        break "closed_by_client";
                    }
                }
            }
        };

        self.requester.detach();
        self.emit(RelayEvent::Disconnected);
        Ok(reason)
    }

    async fn handle_frame(&self, text: &str) {
        let payload: JsonRpcPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unparseable relay frame");
                return;
            }
        };

        match payload {
            JsonRpcPayload::Response(response) => {
                if !self.requester.on_response(response) {
                    trace!("relay response without a waiter");
                }
            }
            JsonRpcPayload::Request(request) if request.method == self.methods.subscription => {
                let ack = JsonRpcResponse::result(request.id, Value::Bool(true));
                if let Err(e) = self.requester.send_json(&ack) {
                    debug!(error = %e, "failed to ack subscription message");
                }

                let params: SubscriptionParams = match serde_json::from_value(request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!(error = %e, "malformed subscription params");
                        return;
                    }
                };
                let data = params.data;
                if !self.subscriber.is_subscribed(&data.topic).await {
                    metrics::record_inbound_message("unsubscribed");
                    debug!(topic = %data.topic, "message for unsubscribed topic dropped");
                    return;
                }
                metrics::record_inbound_message("delivered");
                self.emit(RelayEvent::Message(RelayMessage {
                    topic: data.topic,
                    message: data.message,
                    published_at: data.published_at,
                    tag: data.tag,
                }));
            }
            JsonRpcPayload::Request(request) => {
                debug!(method = %request.method, "ignoring relay request");
            }
        }
    }

    /// Keepalive and redelivery, one step per heartbeat pulse
    pub async fn run_heartbeat(self: Arc<Self>, heartbeat: Arc<Heartbeat>) {
        let mut pulses = heartbeat.subscribe();
        loop {
            match pulses.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.on_pulse(),
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn on_pulse(&self) {
        if self.requester.state() == ConnectionState::Connected {
            if self.idle_for() > self.config.heartbeat_timeout {
                warn!(idle = ?self.idle_for(), "relay silent past heartbeat timeout, reconnecting");
                self.force_reconnect.notify_waiters();
                return;
            }
            if let Err(e) = self.requester.send_frame(SocketFrame::Ping) {
                debug!(error = %e, "heartbeat ping failed");
            }
        }
        self.publisher.redeliver(&self.requester);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_store::MemoryStorage;
    use crate::test_utils::MemoryRelay;

    fn transport(relay: &MemoryRelay) -> Arc<RelayTransport> {
        transport_with(relay, Config::default().relay.heartbeat_timeout)
    }

    fn transport_with(relay: &MemoryRelay, heartbeat_timeout: Duration) -> Arc<RelayTransport> {
        let storage = Arc::new(MemoryStorage::new());
        let keystore = Arc::new(KeyStore::new(storage.clone(), "test:core//keychain".into()));
        let mut config = Config::default().relay;
        config.heartbeat_timeout = heartbeat_timeout;
        config.request_timeout = Duration::from_secs(2);
        config.reconnect_interval = Duration::from_millis(20);
        config.reconnect_jitter = Duration::ZERO;
        Arc::new(RelayTransport::new(
            config,
            Arc::new(relay.connector()),
            keystore,
            storage,
            "test:core//subscription".into(),
        ))
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("relay event")
                .expect("open queue");
            if let RelayEvent::Message(message) = event {
                return message;
            }
        }
    }

    async fn wait_for_event(rx: &mut mpsc::UnboundedReceiver<RelayEvent>, wanted: RelayEvent) {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(event)) if event == wanted => return,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event queue closed"),
                Err(_) => panic!("no {:?} event", wanted),
            }
        }
    }

    #[tokio::test]
    async fn test_relay_url_carries_auth_query() {
        let relay = MemoryRelay::new();
        let t = transport(&relay);
        let url = Url::parse(&t.relay_url().await.unwrap()).unwrap();
        let auth = url
            .query_pairs()
            .find(|(k, _)| k == "auth")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let claims = relay_auth::verify_jwt(&auth, now_secs()).unwrap();
        assert_eq!(claims.aud, crate::config::DEFAULT_RELAY_URL);
        assert!(url.query_pairs().any(|(k, _)| k == "projectId"));
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscriber() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay);
        let bob = transport(&relay);
        tokio::spawn(alice.clone().run());
        tokio::spawn(bob.clone().run());

        let mut bob_events = bob.subscribe_events();
        bob.subscribe("topic-1").await.unwrap();
        alice
            .publish("topic-1", "hello".into(), PublishOptions::new(300, 1108, true))
            .await
            .unwrap();

        let message = next_message(&mut bob_events).await;
        assert_eq!(message.topic, "topic-1");
        assert_eq!(message.message, "hello");
        assert_eq!(message.tag, 1108);
    }

    #[tokio::test]
    async fn test_messages_stored_before_subscribe_are_delivered() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay);
        let bob = transport(&relay);
        tokio::spawn(alice.clone().run());
        tokio::spawn(bob.clone().run());

        alice
            .publish("late", "early bird".into(), PublishOptions::new(300, 1100, true))
            .await
            .unwrap();

        let mut bob_events = bob.subscribe_events();
        bob.subscribe("late").await.unwrap();
        assert_eq!(next_message(&mut bob_events).await.message, "early bird");
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay);
        let bob = transport(&relay);
        tokio::spawn(alice.clone().run());
        tokio::spawn(bob.clone().run());

        let mut bob_events = bob.subscribe_events();
        bob.subscribe("sticky").await.unwrap();
        relay.disconnect_all();

        // wait for bob to come back
        loop {
            match tokio::time::timeout(Duration::from_secs(2), bob_events.recv()).await {
                Ok(Some(RelayEvent::Connected)) => break,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("event queue closed"),
                Err(_) => panic!("bob never reconnected"),
            }
        }

        alice
            .publish("sticky", "again".into(), PublishOptions::new(300, 1108, false))
            .await
            .unwrap();
        assert_eq!(next_message(&mut bob_events).await.message, "again");
    }

    #[tokio::test]
    async fn test_close_and_start() {
        let relay = MemoryRelay::new();
        let t = transport(&relay);
        let mut state = t.watch_state();
        tokio::spawn(t.clone().run());

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        t.close();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        t.start();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_backlog_is_kept_for_slow_listener() {
        let relay = MemoryRelay::new();
        let alice = transport(&relay);
        let bob = transport(&relay);
        tokio::spawn(alice.clone().run());
        tokio::spawn(bob.clone().run());

        let mut bob_events = bob.subscribe_events();
        bob.subscribe("busy").await.unwrap();
        // nobody reads bob's queue while these are acked
        for i in 0..300 {
            alice
                .publish("busy", format!("m{}", i), PublishOptions::new(300, 1108, true))
                .await
                .unwrap();
        }

        for i in 0..300 {
            assert_eq!(next_message(&mut bob_events).await.message, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_silent_relay_forces_reconnect() {
        let relay = MemoryRelay::new();
        let t = transport_with(&relay, Duration::from_millis(50));
        let mut events = t.subscribe_events();
        tokio::spawn(t.clone().run());
        wait_for_event(&mut events, RelayEvent::Connected).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        t.on_pulse();

        wait_for_event(&mut events, RelayEvent::Disconnected).await;
        wait_for_event(&mut events, RelayEvent::Connected).await;
    }

    #[tokio::test]
    async fn test_pulse_within_timeout_keeps_connection() {
        let relay = MemoryRelay::new();
        let t = transport(&relay);
        let mut events = t.subscribe_events();
        tokio::spawn(t.clone().run());
        wait_for_event(&mut events, RelayEvent::Connected).await;

        t.on_pulse();
        let next = tokio::time::timeout(Duration::from_millis(150), events.recv()).await;
        assert!(next.is_err(), "unexpected event {:?}", next);
        assert_eq!(t.state(), ConnectionState::Connected);
    }
}
