//! Session engine: peer-initiated traffic and expiry

use super::engine::{PendingSettlement, SessionEngine};
use super::namespaces::{check_chain, check_conforming, check_event, check_method, validate_namespaces};
use super::types::{Participant, PendingRequest, Session, SessionProposal};
use crate::core_expirer::ExpiryTarget;
use crate::core_pairing::ForwardedMessage;
use crate::core_rpc::params::{
    SessionEventParams, SessionExtendParams, SessionProposeParams, SessionProposeResponse,
    SessionRequestParams, SessionSettleParams, SessionUpdateParams,
};
use crate::core_rpc::{JsonRpcRecord, JsonRpcRequest, JsonRpcResponse, RequestParams, RpcMethod};
use crate::errors::{EngineError, EngineResult};
use crate::events::ClientEvent;
use crate::time::{expiry_in, is_expired, now_secs, FIVE_MINUTES, SEVEN_DAYS};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tolerated clock drift on a peer's extend expiry
const EXTEND_SKEW_SECS: u64 = 60;

impl SessionEngine {
    /// Consume `session_propose` traffic the pairing engine forwards
    pub async fn run_forwarded(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ForwardedMessage>) {
        while let Some(message) = rx.recv().await {
            let outcome = match message {
                ForwardedMessage::Request { topic, request } => {
                    self.on_propose_request(&topic, request).await
                }
                ForwardedMessage::Response { record, response } => {
                    self.on_propose_response(record, response).await
                }
            };
            if let Err(e) = outcome {
                warn!(error = %e, "forwarded proposal traffic failed");
            }
        }
        debug!("proposal forwarding closed");
    }

    async fn on_propose_request(&self, topic: &str, request: JsonRpcRequest) -> EngineResult<()> {
        let id = request.id;
        let params = match RequestParams::from_request(&request) {
            Ok(RequestParams::SessionPropose(params)) => params,
            Ok(other) => {
                return Err(EngineError::Internal(format!("{} misrouted", other.method())));
            }
            Err(e) => {
                return self
                    .ctx
                    .send_error(topic, Some(RpcMethod::SessionPropose), id, e.to_payload())
                    .await;
            }
        };
        let SessionProposeParams {
            relays,
            proposer,
            required_namespaces,
            optional_namespaces,
            session_properties,
            expiry_timestamp,
            requested_authentication,
        } = params;

        let proposal = SessionProposal {
            id,
            pairing_topic: topic.to_string(),
            proposer,
            required_namespaces,
            optional_namespaces,
            relays,
            session_properties,
            expiry_timestamp: expiry_timestamp.unwrap_or_else(|| expiry_in(FIVE_MINUTES)),
            requested_authentication,
        };
        if is_expired(proposal.expiry_timestamp) {
            return self
                .ctx
                .send_error(
                    topic,
                    Some(RpcMethod::SessionPropose),
                    id,
                    EngineError::Expired(format!("proposal {}", id)).to_payload(),
                )
                .await;
        }

        self.proposals.set(id, proposal.clone()).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Id(id), proposal.expiry_timestamp)
            .await?;
        self.pairing
            .update_metadata(topic, proposal.proposer.metadata.clone())
            .await?;
        info!(id, pairing_topic = topic, "session proposal received");
        self.ctx.emit(ClientEvent::SessionProposal {
            proposal: Box::new(proposal),
        });
        Ok(())
    }

    async fn on_propose_response(&self, record: JsonRpcRecord, response: JsonRpcResponse) -> EngineResult<()> {
        let id = record.id;
        let Some(proposal) = self.proposals.try_get(&id).await else {
            debug!(id, "response for unknown proposal");
            return Ok(());
        };
        let self_public_key = proposal.proposer.public_key.clone();

        let accepted = response
            .outcome()
            .and_then(|value| {
                serde_json::from_value::<SessionProposeResponse>(value).map_err(EngineError::from)
            });
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                info!(id, error = %e, "proposal declined");
                self.fail_approval(id, e);
                self.drop_proposal(id).await?;
                return self.ctx.keystore.delete_key_pair(&self_public_key).await;
            }
        };

        let topic = self
            .ctx
            .keystore
            .generate_shared_key(&self_public_key, &accepted.responder_public_key, None)
            .await?;
        if let Ok(mut settlements) = self.settlements.lock() {
            settlements.insert(
                topic.clone(),
                PendingSettlement {
                    proposal_id: id,
                    pairing_topic: proposal.pairing_topic.clone(),
                    self_public_key,
                    peer_public_key: accepted.responder_public_key,
                    required_namespaces: proposal.required_namespaces,
                    optional_namespaces: proposal.optional_namespaces,
                },
            );
        }
        // settle may already be waiting for us on the relay
        self.ctx.relay.subscribe(&topic).await?;
        debug!(id, topic = %topic, "awaiting session_settle");
        Ok(())
    }

    fn fail_approval(&self, proposal_id: u64, error: EngineError) {
        if let Some(tx) = self.take_approval(proposal_id) {
            let _ = tx.send(Err(error));
        }
    }

    /// Handle a request that arrived on a session topic
    pub async fn on_request(&self, topic: &str, request: JsonRpcRequest) -> EngineResult<()> {
        let id = request.id;
        let params = match RequestParams::from_request(&request) {
            Ok(params) => params,
            Err(e) => {
                warn!(topic, id, method = %request.method, error = %e, "rejecting session request");
                let method = request.method.parse::<RpcMethod>().ok();
                return self.ctx.send_error(topic, method, id, e.to_payload()).await;
            }
        };
        let method = params.method();

        let handled = match params {
            RequestParams::SessionSettle(p) => self.on_settle(topic, id, p).await,
            RequestParams::SessionUpdate(p) => self.on_update(topic, id, p).await,
            RequestParams::SessionExtend(p) => self.on_extend(topic, id, p).await,
            RequestParams::SessionRequest(p) => self.on_session_request(topic, id, p).await,
            RequestParams::SessionEvent(p) => self.on_event(topic, id, p).await,
            RequestParams::SessionPing(_) => self.on_ping(topic, id).await,
            RequestParams::SessionDelete(reason) => {
                info!(topic, code = reason.code, "peer deleted session");
                self.on_delete(topic, id).await
            }
            RequestParams::SessionPropose(_)
            | RequestParams::PairingPing(_)
            | RequestParams::PairingDelete(_) => Err(EngineError::MissingOrInvalid(format!(
                "{} is not valid on a session topic",
                method
            ))),
        };

        match handled {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(topic, id, method = %method, error = %e, "session request refused");
                self.ctx.send_error(topic, Some(method), id, e.to_payload()).await
            }
        }
    }

    async fn on_settle(&self, topic: &str, id: u64, params: SessionSettleParams) -> EngineResult<()> {
        let settlement = self.take_settlement(topic).ok_or_else(|| {
            EngineError::NoMatchingKey(format!("no pending settlement on {}", topic))
        })?;
        let proposal_id = settlement.proposal_id;

        let session = match self.settled_session(topic, settlement, params) {
            Ok(session) => session,
            Err(e) => {
                self.fail_approval(proposal_id, e.clone());
                self.drop_proposal(proposal_id).await?;
                return Err(e);
            }
        };

        self.sessions.set(topic.to_string(), session.clone()).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Topic(topic.to_string()), session.expiry)
            .await?;
        self.ctx
            .send_result(topic, RpcMethod::SessionSettle, id, Value::Bool(true))
            .await?;

        self.pairing.activate(&session.pairing_topic).await?;
        self.pairing
            .update_metadata(&session.pairing_topic, session.peer.metadata.clone())
            .await?;
        self.drop_proposal(proposal_id).await?;
        if let Some(tx) = self.take_approval(proposal_id) {
            let _ = tx.send(Ok(session.clone()));
        }

        info!(topic, proposal_id, "session settled");
        self.ctx.emit(ClientEvent::SessionConnect {
            session: Box::new(session),
        });
        Ok(())
    }

    fn settled_session(
        &self,
        topic: &str,
        settlement: PendingSettlement,
        params: SessionSettleParams,
    ) -> EngineResult<Session> {
        if params.controller.public_key != settlement.peer_public_key {
            return Err(EngineError::MissingOrInvalid(
                "settle controller does not match the responder".to_string(),
            ));
        }
        if is_expired(params.expiry) {
            return Err(EngineError::Expired(format!("session {}", topic)));
        }
        validate_namespaces(&params.namespaces)?;
        check_conforming(&settlement.required_namespaces, &params.namespaces)?;

        Ok(Session {
            topic: topic.to_string(),
            pairing_topic: settlement.pairing_topic,
            relay: params.relay,
            expiry: params.expiry,
            acknowledged: true,
            controller: params.controller.public_key.clone(),
            self_participant: Participant {
                public_key: settlement.self_public_key,
                metadata: self.ctx.metadata.clone(),
            },
            peer: params.controller,
            namespaces: params.namespaces,
            required_namespaces: settlement.required_namespaces,
            optional_namespaces: settlement.optional_namespaces,
            session_properties: params.session_properties,
            authentication: params.authentication,
        })
    }

    /// Peer-controlled session, and `id` not older than the last applied change
    async fn check_peer_change(
        &self,
        topic: &str,
        id: u64,
        method: RpcMethod,
        reject: fn(String) -> EngineError,
    ) -> EngineResult<Session> {
        let session = self.get_session(topic).await?;
        if session.controller != session.peer.public_key {
            return Err(reject(format!("peer does not control {}", topic)));
        }
        let last = self
            .applied
            .try_get(&topic.to_string())
            .await
            .and_then(|applied| applied.last(method));
        if let Some(last) = last {
            if id < last {
                return Err(reject(format!("{} older than applied {}", id, last)));
            }
        }
        Ok(session)
    }

    async fn mark_applied(&self, topic: &str, method: RpcMethod, id: u64) -> EngineResult<()> {
        let key = topic.to_string();
        let mut applied = self.applied.try_get(&key).await.unwrap_or_default();
        applied.record(method, id);
        self.applied.set(key, applied).await
    }

    async fn on_update(&self, topic: &str, id: u64, params: SessionUpdateParams) -> EngineResult<()> {
        let session = self
            .check_peer_change(topic, id, RpcMethod::SessionUpdate, EngineError::InvalidUpdateRequest)
            .await?;
        validate_namespaces(&params.namespaces)?;
        check_conforming(&session.required_namespaces, &params.namespaces)?;

        let namespaces = params.namespaces;
        self.sessions
            .update(&topic.to_string(), |s| s.namespaces = namespaces.clone())
            .await?;
        self.mark_applied(topic, RpcMethod::SessionUpdate, id).await?;
        self.ctx
            .send_result(topic, RpcMethod::SessionUpdate, id, Value::Bool(true))
            .await?;
        self.ctx.emit(ClientEvent::SessionUpdate {
            topic: topic.to_string(),
            id,
            namespaces,
        });
        Ok(())
    }

    async fn on_extend(&self, topic: &str, id: u64, params: SessionExtendParams) -> EngineResult<()> {
        self.check_peer_change(topic, id, RpcMethod::SessionExtend, EngineError::InvalidExtendRequest)
            .await?;
        let now = now_secs();
        if params.expiry <= now || params.expiry > now + SEVEN_DAYS + EXTEND_SKEW_SECS {
            return Err(EngineError::InvalidExtendRequest(format!(
                "expiry {} outside the next seven days",
                params.expiry
            )));
        }

        self.set_session_expiry(&topic.to_string(), params.expiry).await?;
        self.mark_applied(topic, RpcMethod::SessionExtend, id).await?;
        self.ctx
            .send_result(topic, RpcMethod::SessionExtend, id, Value::Bool(true))
            .await?;
        self.ctx.emit(ClientEvent::SessionExtend {
            topic: topic.to_string(),
            id,
            expiry: params.expiry,
        });
        Ok(())
    }

    async fn on_session_request(&self, topic: &str, id: u64, params: SessionRequestParams) -> EngineResult<()> {
        let session = self.get_session(topic).await?;
        check_method(&session.namespaces, &params.chain_id, &params.request.method)?;
        let expiry_timestamp = params
            .request
            .expiry_timestamp
            .unwrap_or_else(|| expiry_in(FIVE_MINUTES));
        if is_expired(expiry_timestamp) {
            return Err(EngineError::Expired(format!("request {}", id)));
        }

        let request = PendingRequest {
            id,
            topic: topic.to_string(),
            chain_id: params.chain_id,
            method: params.request.method,
            params: params.request.params,
            expiry_timestamp,
        };
        self.requests.set(id, request.clone()).await?;
        self.ctx
            .expirer
            .set(ExpiryTarget::Id(id), expiry_timestamp)
            .await?;
        debug!(topic, id, method = %request.method, "session request pending");
        self.ctx.emit(ClientEvent::SessionRequest { request });
        Ok(())
    }

    async fn on_event(&self, topic: &str, id: u64, params: SessionEventParams) -> EngineResult<()> {
        let session = self.get_session(topic).await?;
        check_chain(&session.namespaces, &params.chain_id)?;
        check_event(&session.namespaces, &params.chain_id, &params.event.name)?;
        self.ctx
            .send_result(topic, RpcMethod::SessionEvent, id, Value::Bool(true))
            .await?;
        self.ctx.emit(ClientEvent::SessionEvent {
            topic: topic.to_string(),
            id,
            chain_id: params.chain_id,
            event: params.event,
        });
        Ok(())
    }

    async fn on_ping(&self, topic: &str, id: u64) -> EngineResult<()> {
        self.get_session(topic).await?;
        self.ctx
            .send_result(topic, RpcMethod::SessionPing, id, Value::Bool(true))
            .await?;
        self.ctx.emit(ClientEvent::SessionPing {
            topic: topic.to_string(),
            id,
        });
        Ok(())
    }

    async fn on_delete(&self, topic: &str, id: u64) -> EngineResult<()> {
        self.get_session(topic).await?;
        self.ctx
            .send_result(topic, RpcMethod::SessionDelete, id, Value::Bool(true))
            .await?;
        // answered already, so a cleanup failure is only logged
        if let Err(e) = self.delete_session(topic).await {
            warn!(topic, error = %e, "session cleanup after peer delete failed");
        }
        self.ctx.emit(ClientEvent::SessionDelete {
            topic: topic.to_string(),
            id,
        });
        Ok(())
    }

    /// Clean up whatever `target` names; false when it is not ours
    pub async fn on_expired(&self, target: &ExpiryTarget) -> EngineResult<bool> {
        match target {
            ExpiryTarget::Topic(topic) => {
                if !self.sessions.contains(topic).await {
                    return Ok(false);
                }
                self.delete_session(topic).await?;
                info!(topic = %topic, "session expired");
                self.ctx.emit(ClientEvent::SessionExpire {
                    topic: topic.clone(),
                });
                Ok(true)
            }
            ExpiryTarget::Id(id) => {
                if let Some(proposal) = self.proposals.try_get(id).await {
                    self.expire_proposal(proposal).await?;
                    return Ok(true);
                }
                if self.requests.delete(id).await?.is_some() {
                    self.ctx.expirer.del(target).await?;
                    debug!(id, "session request expired");
                    self.ctx.emit(ClientEvent::SessionRequestExpire { id: *id });
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    async fn expire_proposal(&self, proposal: SessionProposal) -> EngineResult<()> {
        let id = proposal.id;
        let settlements: Vec<(String, PendingSettlement)> = match self.settlements.lock() {
            Ok(mut pending) => {
                let topics: Vec<String> = pending
                    .iter()
                    .filter(|(_, s)| s.proposal_id == id)
                    .map(|(t, _)| t.clone())
                    .collect();
                topics
                    .into_iter()
                    .filter_map(|t| pending.remove(&t).map(|s| (t, s)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for (topic, _) in &settlements {
            self.ctx.relay.unsubscribe(topic).await?;
            self.ctx.keystore.delete_sym_key(topic).await?;
        }

        if let Some(tx) = self.take_approval(id) {
            let _ = tx.send(Err(EngineError::Expired(format!("proposal {}", id))));
            self.ctx
                .keystore
                .delete_key_pair(&proposal.proposer.public_key)
                .await?;
        }
        self.drop_proposal(id).await?;
        info!(id, "proposal expired");
        self.ctx.emit(ClientEvent::ProposalExpire { id });
        Ok(())
    }
}
