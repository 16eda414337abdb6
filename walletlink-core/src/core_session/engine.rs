//! Session engine: outbound operations and local state

use super::external::AuthSigner;
use super::namespaces::{
    check_chain, check_conforming, check_event, check_method, validate_namespaces,
    validate_proposal_namespaces,
};
use super::types::{
    AuthRequest, Namespaces, Participant, PendingRequest, ProposalNamespaces, RelayProtocol,
    Session, SessionProperties, SessionProposal,
};
use crate::context::{EngineContext, Pending, SendOptions, CLIENT_CONTEXT};
use crate::core_expirer::ExpiryTarget;
use crate::core_pairing::PairingEngine;
use crate::core_rpc::params::{
    DeleteParams, EventPayload, PingParams, RequestPayload, SessionEventParams,
    SessionExtendParams, SessionProposeParams, SessionRequestParams, SessionSettleParams,
    SessionUpdateParams,
};
use crate::core_rpc::{payload_id, ErrorPayload, JsonRpcResponse, RequestParams, RpcMethod};
use crate::core_store::Store;
use crate::errors::{EngineError, EngineResult};
use crate::time::{expiry_in, is_expired, now_secs, FIVE_MINUTES, SEVEN_DAYS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub required_namespaces: ProposalNamespaces,
    pub optional_namespaces: ProposalNamespaces,
    pub session_properties: Option<SessionProperties>,
    /// Reuse an existing pairing instead of creating one
    pub pairing_topic: Option<String>,
    pub relays: Option<Vec<RelayProtocol>>,
    pub authentication: Option<AuthRequest>,
}

#[derive(Debug)]
pub struct ConnectResponse {
    /// Present when a new pairing was created for this proposal
    pub uri: Option<String>,
    pub pairing_topic: String,
    pub proposal_id: u64,
    /// Resolves with the settled session, or the peer's rejection
    pub approval: Pending<Session>,
}

#[derive(Debug, Clone)]
pub struct ApproveParams {
    pub id: u64,
    pub namespaces: Namespaces,
    pub session_properties: Option<SessionProperties>,
    pub relay_protocol: Option<String>,
}

#[derive(Debug)]
pub struct Approved {
    pub topic: String,
    /// Resolves once the proposer acknowledges `session_settle`
    pub acknowledged: Pending<Session>,
}

/// A `session_request` to send to the peer
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub topic: String,
    pub chain_id: String,
    pub method: String,
    pub params: Value,
    /// Seconds until the request expires; 5 minutes when absent
    pub expiry: Option<u64>,
}

/// Proposer-side state between the propose response and `session_settle`
#[derive(Debug, Clone)]
pub(super) struct PendingSettlement {
    pub proposal_id: u64,
    pub pairing_topic: String,
    pub self_public_key: String,
    pub peer_public_key: String,
    pub required_namespaces: ProposalNamespaces,
    pub optional_namespaces: ProposalNamespaces,
}

/// Ids of the last peer update and extend applied to one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct AppliedChanges {
    update: Option<u64>,
    extend: Option<u64>,
}

impl AppliedChanges {
    pub(super) fn last(&self, method: RpcMethod) -> Option<u64> {
        match method {
            RpcMethod::SessionUpdate => self.update,
            RpcMethod::SessionExtend => self.extend,
            _ => None,
        }
    }

    pub(super) fn record(&mut self, method: RpcMethod, id: u64) {
        match method {
            RpcMethod::SessionUpdate => self.update = Some(id),
            RpcMethod::SessionExtend => self.extend = Some(id),
            _ => {}
        }
    }
}

pub struct SessionEngine {
    pub(super) ctx: Arc<EngineContext>,
    pub(super) pairing: Arc<PairingEngine>,
    pub(super) signer: Option<Arc<dyn AuthSigner>>,
    pub(super) sessions: Store<String, Session>,
    pub(super) proposals: Store<u64, SessionProposal>,
    pub(super) requests: Store<u64, PendingRequest>,
    pub(super) approvals: Mutex<HashMap<u64, oneshot::Sender<EngineResult<Session>>>>,
    pub(super) settlements: Mutex<HashMap<String, PendingSettlement>>,
    /// Persisted so the stale-change guard survives a restart
    pub(super) applied: Store<String, AppliedChanges>,
}

impl SessionEngine {
    pub fn new(
        ctx: Arc<EngineContext>,
        pairing: Arc<PairingEngine>,
        signer: Option<Arc<dyn AuthSigner>>,
    ) -> Self {
        let store = |name: &'static str| ctx.storage_key(CLIENT_CONTEXT, name);
        Self {
            sessions: Store::new("session", ctx.storage.clone(), store("session")),
            proposals: Store::new("proposal", ctx.storage.clone(), store("proposal")),
            requests: Store::new("request", ctx.storage.clone(), store("request")),
            approvals: Mutex::new(HashMap::new()),
            settlements: Mutex::new(HashMap::new()),
            applied: Store::new("applied", ctx.storage.clone(), store("applied")),
            ctx,
            pairing,
            signer,
        }
    }

    pub async fn restore(&self) -> EngineResult<()> {
        self.sessions.restore().await?;
        self.proposals.restore().await?;
        self.requests.restore().await?;
        self.applied.restore().await
    }

    pub(super) fn take_approval(&self, proposal_id: u64) -> Option<oneshot::Sender<EngineResult<Session>>> {
        self.approvals.lock().ok()?.remove(&proposal_id)
    }

    pub(super) fn take_settlement(&self, topic: &str) -> Option<PendingSettlement> {
        self.settlements.lock().ok()?.remove(topic)
    }

    pub async fn get_session(&self, topic: &str) -> EngineResult<Session> {
        self.sessions.get(&topic.to_string()).await
    }

    /// Propose a session over a new or existing pairing
    pub async fn connect(&self, params: ConnectParams) -> EngineResult<ConnectResponse> {
        validate_proposal_namespaces(&params.required_namespaces)?;
        validate_proposal_namespaces(&params.optional_namespaces)?;

        let (pairing_topic, uri) = match params.pairing_topic {
            Some(topic) => {
                let pairing = self.pairing.get(&topic).await?;
                if is_expired(pairing.expiry) {
                    return Err(EngineError::Expired(format!("pairing {}", topic)));
                }
                (topic, None)
            }
            None => {
                let created = self.pairing.create(None).await?;
                (created.topic, Some(created.uri))
            }
        };

        let public_key = self.ctx.keystore.generate_key_pair().await?;
        let id = payload_id();
        let expiry_timestamp = expiry_in(FIVE_MINUTES);
        let relays = params.relays.unwrap_or_else(|| {
            vec![RelayProtocol {
                protocol: self.ctx.config.relay.protocol.clone(),
                data: None,
            }]
        });
        let proposal_key = public_key.clone();
        let proposer = Participant {
            public_key,
            metadata: self.ctx.metadata.clone(),
        };

        let proposal = SessionProposal {
            id,
            pairing_topic: pairing_topic.clone(),
            proposer: proposer.clone(),
            required_namespaces: params.required_namespaces.clone(),
            optional_namespaces: params.optional_namespaces.clone(),
            relays: relays.clone(),
            session_properties: params.session_properties.clone(),
            expiry_timestamp,
            requested_authentication: params.authentication.clone(),
        };
        let request = SessionProposeParams {
            relays,
            proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            session_properties: params.session_properties,
            expiry_timestamp: Some(expiry_timestamp),
            requested_authentication: params.authentication,
        };

        let (tx, approval) = Pending::channel();
        if let Ok(mut approvals) = self.approvals.lock() {
            approvals.insert(id, tx);
        }
        self.proposals.set(id, proposal).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Id(id), expiry_timestamp)
            .await?;

        let sent = self
            .ctx
            .send_request(
                &pairing_topic,
                RequestParams::SessionPropose(request),
                SendOptions {
                    id: Some(id),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = sent {
            self.take_approval(id);
            self.drop_proposal(id).await?;
            self.ctx
                .keystore
                .delete_key_pair(&proposal_key)
                .await?;
            return Err(e);
        }

        info!(id, pairing_topic = %pairing_topic, "session proposed");
        Ok(ConnectResponse {
            uri,
            pairing_topic,
            proposal_id: id,
            approval,
        })
    }

    /// Accept a received proposal with `namespaces`
    pub async fn approve(self: &Arc<Self>, params: ApproveParams) -> EngineResult<Approved> {
        let proposal = self.proposals.get(&params.id).await?;
        if is_expired(proposal.expiry_timestamp) {
            self.drop_proposal(params.id).await?;
            return Err(EngineError::Expired(format!("proposal {}", params.id)));
        }
        validate_namespaces(&params.namespaces)?;
        check_conforming(&proposal.required_namespaces, &params.namespaces)?;

        let authentication = match (&proposal.requested_authentication, &self.signer) {
            (Some(request), Some(signer)) => Some(signer.sign(request).await?),
            _ => None,
        };

        let self_public_key = self.ctx.keystore.generate_key_pair().await?;
        let topic = self
            .ctx
            .keystore
            .generate_shared_key(&self_public_key, &proposal.proposer.public_key, None)
            .await?;
        let relay = RelayProtocol {
            protocol: params
                .relay_protocol
                .unwrap_or_else(|| self.ctx.config.relay.protocol.clone()),
            data: None,
        };
        let expiry = expiry_in(SEVEN_DAYS);
        let controller = Participant {
            public_key: self_public_key.clone(),
            metadata: self.ctx.metadata.clone(),
        };

        let session = Session {
            topic: topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: relay.clone(),
            expiry,
            acknowledged: false,
            controller: self_public_key.clone(),
            self_participant: controller.clone(),
            peer: proposal.proposer.clone(),
            namespaces: params.namespaces.clone(),
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
            session_properties: params.session_properties.clone(),
            authentication: authentication.clone(),
        };
        let settle = SessionSettleParams {
            relay: relay.clone(),
            controller,
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces.clone(),
            optional_namespaces: proposal.optional_namespaces.clone(),
            session_properties: params.session_properties,
            expiry,
            pairing_topic: Some(proposal.pairing_topic.clone()),
            authentication,
        };
        let result = serde_json::to_value(crate::core_rpc::params::SessionProposeResponse {
            relay,
            responder_public_key: self_public_key.clone(),
        })?;

        let published = async {
            self.sessions.set(topic.clone(), session).await?;
            self.ctx
                .expirer
                .set(ExpiryTarget::Topic(topic.clone()), expiry)
                .await?;
            self.ctx.relay.subscribe(&topic).await?;
            let settled = self
                .ctx
                .request(
                    &topic,
                    RequestParams::SessionSettle(settle),
                    Duration::from_secs(RpcMethod::SessionSettle.request_options().ttl),
                    SendOptions::default(),
                )
                .await?;
            self.ctx
                .send_result(&proposal.pairing_topic, RpcMethod::SessionPropose, proposal.id, result)
                .await?;
            Ok::<_, EngineError>(settled)
        }
        .await;
        let settled = match published {
            Ok(settled) => settled,
            Err(e) => {
                // the proposal stays pending so approve can be retried
                warn!(id = proposal.id, topic = %topic, error = %e, "approve failed, discarding session");
                if let Err(cleanup) = self.discard_session(&topic, &self_public_key).await {
                    warn!(topic = %topic, error = %cleanup, "cleanup after failed approve");
                }
                return Err(e);
            }
        };

        self.pairing.activate(&proposal.pairing_topic).await?;
        self.pairing
            .update_metadata(&proposal.pairing_topic, proposal.proposer.metadata.clone())
            .await?;
        self.proposals.delete(&proposal.id).await?;
        self.ctx.expirer.del(&ExpiryTarget::Id(proposal.id)).await?;
        info!(id = proposal.id, topic = %topic, "proposal approved");

        let (tx, acknowledged) = Pending::channel();
        let engine = Arc::clone(self);
        let ack_topic = topic.clone();
        tokio::spawn(async move {
            let outcome = match settled.await {
                Ok(_) => engine
                    .sessions
                    .update(&ack_topic, |s| s.acknowledged = true)
                    .await,
                Err(e) => {
                    warn!(topic = %ack_topic, error = %e, "session_settle not acknowledged");
                    if let Err(cleanup) = engine.delete_session(&ack_topic).await {
                        warn!(topic = %ack_topic, error = %cleanup, "cleanup after failed settle");
                    }
                    Err(e)
                }
            };
            let _ = tx.send(outcome);
        });

        Ok(Approved {
            topic,
            acknowledged,
        })
    }

    /// Undo a half-built approval; every step tolerates missing state
    async fn discard_session(&self, topic: &str, self_public_key: &str) -> EngineResult<()> {
        self.delete_session(topic).await?;
        self.ctx.keystore.delete_sym_key(topic).await?;
        self.ctx.keystore.delete_key_pair(self_public_key).await
    }

    /// Decline a received proposal
    pub async fn reject(&self, id: u64, reason: ErrorPayload) -> EngineResult<()> {
        let proposal = self.proposals.get(&id).await?;
        let sent = self
            .ctx
            .send_error(&proposal.pairing_topic, Some(RpcMethod::SessionPropose), id, reason)
            .await;
        self.drop_proposal(id).await?;
        info!(id, "proposal rejected");
        sent
    }

    fn controlled_session(session: &Session) -> EngineResult<()> {
        if session.is_controller() {
            Ok(())
        } else {
            Err(EngineError::MissingOrInvalid(format!(
                "only the controller may change session {}",
                session.topic
            )))
        }
    }

    /// Replace the session namespaces; rolled back if the peer refuses
    pub async fn update(self: &Arc<Self>, topic: &str, namespaces: Namespaces) -> EngineResult<Pending<()>> {
        let session = self.get_session(topic).await?;
        Self::controlled_session(&session)?;
        validate_namespaces(&namespaces)?;
        check_conforming(&session.required_namespaces, &namespaces)?;

        let key = topic.to_string();
        let previous = session.namespaces;
        let applied = namespaces.clone();
        self.sessions
            .update(&key, |s| s.namespaces = namespaces.clone())
            .await?;

        let sent = self
            .ctx
            .request(
                topic,
                RequestParams::SessionUpdate(SessionUpdateParams { namespaces }),
                Duration::from_secs(RpcMethod::SessionUpdate.request_options().ttl),
                SendOptions::default(),
            )
            .await;
        let ack = match sent {
            Ok(ack) => ack,
            Err(e) => {
                self.rollback_namespaces(&key, &applied, previous).await;
                return Err(e);
            }
        };

        let (tx, pending) = Pending::channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = ack.await.map(|_| ());
            if let Err(e) = &outcome {
                warn!(topic = %key, error = %e, "session_update refused, rolling back");
                engine.rollback_namespaces(&key, &applied, previous).await;
            }
            let _ = tx.send(outcome);
        });
        Ok(pending)
    }

    pub(super) async fn rollback_namespaces(&self, topic: &String, applied: &Namespaces, previous: Namespaces) {
        let result = self
            .sessions
            .update(topic, |s| {
                // a later update already replaced ours
                if &s.namespaces == applied {
                    s.namespaces = previous;
                }
            })
            .await;
        if let Err(e) = result {
            debug!(topic = %topic, error = %e, "namespace rollback skipped");
        }
    }

    /// Push the session expiry out by a week; rolled back if the peer refuses
    pub async fn extend(self: &Arc<Self>, topic: &str) -> EngineResult<Pending<()>> {
        let session = self.get_session(topic).await?;
        Self::controlled_session(&session)?;

        let key = topic.to_string();
        let previous = session.expiry;
        let expiry = expiry_in(SEVEN_DAYS);
        self.set_session_expiry(&key, expiry).await?;

        let sent = self
            .ctx
            .request(
                topic,
                RequestParams::SessionExtend(SessionExtendParams { expiry }),
                Duration::from_secs(RpcMethod::SessionExtend.request_options().ttl),
                SendOptions::default(),
            )
            .await;
        let ack = match sent {
            Ok(ack) => ack,
            Err(e) => {
                self.rollback_expiry(&key, expiry, previous).await;
                return Err(e);
            }
        };

        let (tx, pending) = Pending::channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = ack.await.map(|_| ());
            if let Err(e) = &outcome {
                warn!(topic = %key, error = %e, "session_extend refused, rolling back");
                engine.rollback_expiry(&key, expiry, previous).await;
            }
            let _ = tx.send(outcome);
        });
        Ok(pending)
    }

    pub(super) async fn set_session_expiry(&self, topic: &String, expiry: u64) -> EngineResult<()> {
        self.sessions.update(topic, |s| s.expiry = expiry).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Topic(topic.clone()), expiry)
            .await
    }

    pub(super) async fn rollback_expiry(&self, topic: &String, applied: u64, previous: u64) {
        let current = match self.sessions.try_get(topic).await {
            Some(session) => session.expiry,
            None => return,
        };
        if current != applied {
            return;
        }
        if let Err(e) = self.set_session_expiry(topic, previous).await {
            debug!(topic = %topic, error = %e, "expiry rollback failed");
        }
    }

    /// Send a `session_request` and wait for the peer's answer
    pub async fn request(&self, args: OutboundRequest) -> EngineResult<Value> {
        let session = self.get_session(&args.topic).await?;
        check_method(&session.namespaces, &args.chain_id, &args.method)?;

        let ttl = args.expiry.unwrap_or(FIVE_MINUTES);
        if !(FIVE_MINUTES..=SEVEN_DAYS).contains(&ttl) {
            return Err(EngineError::MissingOrInvalid(format!(
                "request expiry {}s outside {}..={}",
                ttl, FIVE_MINUTES, SEVEN_DAYS
            )));
        }

        let params = SessionRequestParams {
            request: RequestPayload {
                method: args.method,
                params: args.params,
                expiry_timestamp: Some(expiry_in(ttl)),
            },
            chain_id: args.chain_id,
        };
        let opts = SendOptions {
            id: Some(payload_id()),
            ttl: Some(ttl),
            link_target: self.link_target(&session),
        };
        let id = opts.id.unwrap_or_default();
        let pending = self
            .ctx
            .request(
                &args.topic,
                RequestParams::SessionRequest(params),
                Duration::from_secs(ttl),
                opts,
            )
            .await;
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => {
                debug!(id, error = %e, "session_request not sent");
                self.ctx.history.delete(&args.topic, Some(id)).await?;
                return Err(e);
            }
        };

        let outcome = pending.await;
        if let Err(EngineError::Expired(_)) = &outcome {
            self.ctx.history.delete(&args.topic, Some(id)).await?;
        }
        outcome
    }

    pub(super) fn link_target(&self, session: &Session) -> Option<String> {
        self.ctx.link_mode.as_ref()?;
        session.link_mode_target().map(str::to_string)
    }

    /// Answer an inbound `session_request`
    pub async fn respond(&self, topic: &str, response: JsonRpcResponse) -> EngineResult<()> {
        let session = self.get_session(topic).await?;
        let id = response.id();
        let sent = self
            .ctx
            .send_response(
                topic,
                Some(RpcMethod::SessionRequest),
                response,
                self.link_target(&session).as_deref(),
            )
            .await;

        self.requests.delete(&id).await?;
        self.ctx.expirer.del(&ExpiryTarget::Id(id)).await?;
        sent
    }

    /// Liveness round-trip over a session or pairing topic
    pub async fn ping(&self, topic: &str) -> EngineResult<()> {
        if self.sessions.contains(&topic.to_string()).await {
            let pending = self
                .ctx
                .request(
                    topic,
                    RequestParams::SessionPing(PingParams {}),
                    PING_TIMEOUT,
                    SendOptions::default(),
                )
                .await?;
            return pending.await.map(|_| ());
        }
        if self.pairing.is_pairing_topic(topic).await {
            return self.pairing.ping(topic).await;
        }
        Err(EngineError::NoMatchingKey(format!("no session or pairing {}", topic)))
    }

    /// Emit an approved event to the peer
    pub async fn emit(&self, topic: &str, chain_id: &str, event: EventPayload) -> EngineResult<()> {
        let session = self.get_session(topic).await?;
        check_chain(&session.namespaces, chain_id)?;
        check_event(&session.namespaces, chain_id, &event.name)?;
        self.ctx
            .send_request(
                topic,
                RequestParams::SessionEvent(SessionEventParams {
                    event,
                    chain_id: chain_id.to_string(),
                }),
                SendOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Tell the peer and drop all local state for a session or pairing topic
    pub async fn disconnect(&self, topic: &str) -> EngineResult<()> {
        if self.sessions.contains(&topic.to_string()).await {
            let sent = self
                .ctx
                .send_request(
                    topic,
                    RequestParams::SessionDelete(DeleteParams::user_disconnected()),
                    SendOptions::default(),
                )
                .await;
            if let Err(e) = &sent {
                warn!(topic, error = %e, "session_delete not delivered");
            }
            self.delete_session(topic).await?;
            return sent.map(|_| ());
        }
        if self.pairing.is_pairing_topic(topic).await {
            return self.pairing.disconnect(topic).await;
        }
        Err(EngineError::NoMatchingKey(format!("no session or pairing {}", topic)))
    }

    /// Local cleanup shared by disconnect, peer delete and expiry
    pub(super) async fn delete_session(&self, topic: &str) -> EngineResult<()> {
        let key = topic.to_string();
        let Some(session) = self.sessions.delete(&key).await? else {
            return Ok(());
        };

        self.ctx.relay.unsubscribe(topic).await?;
        self.ctx.keystore.delete_sym_key(topic).await?;
        self.ctx
            .keystore
            .delete_key_pair(&session.self_participant.public_key)
            .await?;
        self.ctx.expirer.del(&ExpiryTarget::Topic(key.clone())).await?;
        self.ctx.history.delete(topic, None).await?;

        for request in self.requests.values().await {
            if request.topic == topic {
                self.requests.delete(&request.id).await?;
                self.ctx.expirer.del(&ExpiryTarget::Id(request.id)).await?;
            }
        }
        self.applied.delete(&key).await?;
        info!(topic, "session deleted");
        Ok(())
    }

    /// Forget a proposal and its expiry
    pub(super) async fn drop_proposal(&self, id: u64) -> EngineResult<()> {
        self.proposals.delete(&id).await?;
        self.ctx.expirer.del(&ExpiryTarget::Id(id)).await
    }

    pub async fn get_active_sessions(&self) -> Vec<Session> {
        let now = now_secs();
        self.sessions
            .values()
            .await
            .into_iter()
            .filter(|s| s.expiry > now)
            .collect()
    }

    /// Sessions whose namespaces satisfy `required`
    pub async fn find(&self, required: &ProposalNamespaces) -> Vec<Session> {
        self.get_active_sessions()
            .await
            .into_iter()
            .filter(|s| check_conforming(required, &s.namespaces).is_ok())
            .collect()
    }

    pub async fn get_pending_proposals(&self) -> Vec<SessionProposal> {
        self.proposals.values().await
    }

    pub async fn get_pending_session_requests(&self) -> Vec<PendingRequest> {
        self.requests.values().await
    }
}
