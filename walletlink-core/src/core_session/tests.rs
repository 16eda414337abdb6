//! Engine-level session tests: partial failures, expiry, stale changes, rollback

use super::engine::AppliedChanges;
use super::{ApproveParams, ConnectParams, ConnectResponse, Namespace, OutboundRequest, Session, SessionProposal};
use crate::config::Config;
use crate::context::{SendOptions, CLIENT_CONTEXT};
use crate::core_expirer::ExpiryTarget;
use crate::core_rpc::params::SessionUpdateParams;
use crate::core_rpc::{RequestParams, RpcMethod};
use crate::core_store::{MemoryStorage, Store};
use crate::errors::EngineError;
use crate::events::ClientEvent;
use crate::test_utils::{
    approved_namespaces, dapp_metadata, recv_matching, required_namespaces, wallet_metadata,
    MemoryRelay, DEFAULT_TEST_TIMEOUT,
};
use crate::{Client, ClientOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct Peer {
    client: Client,
    events: broadcast::Receiver<ClientEvent>,
}

fn config() -> Config {
    let mut config = Config::default();
    config.relay.request_timeout = Duration::from_millis(500);
    config.relay.heartbeat_interval = Duration::from_millis(200);
    config.relay.heartbeat_timeout = Duration::from_secs(5);
    config.relay.reconnect_interval = Duration::from_millis(50);
    config.relay.reconnect_jitter = Duration::ZERO;
    config
}

async fn peer(relay: &MemoryRelay, metadata: super::Metadata) -> Peer {
    let options = ClientOptions::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(relay.connector()),
        metadata,
    );
    let client = Client::new(config(), options).unwrap();
    let events = client.events();
    client.init().await.unwrap();
    Peer { client, events }
}

async fn propose(dapp: &Peer, wallet: &mut Peer) -> (ConnectResponse, SessionProposal) {
    let connected = dapp
        .client
        .connect(ConnectParams {
            required_namespaces: required_namespaces(),
            ..Default::default()
        })
        .await
        .unwrap();
    wallet.client.pair(connected.uri.as_deref().unwrap()).await.unwrap();
    let proposal = recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::SessionProposal { proposal } => Some(*proposal),
        _ => None,
    })
    .await
    .unwrap();
    (connected, proposal)
}

fn approval(id: u64) -> ApproveParams {
    ApproveParams {
        id,
        namespaces: approved_namespaces(),
        session_properties: None,
        relay_protocol: None,
    }
}

/// Full handshake; returns the dapp's view of the session
async fn settle(dapp: &Peer, wallet: &mut Peer) -> Session {
    let (connected, proposal) = propose(dapp, wallet).await;
    let approved = wallet.client.approve(approval(proposal.id)).await.unwrap();
    let session = timeout(DEFAULT_TEST_TIMEOUT, connected.approval)
        .await
        .unwrap()
        .unwrap();
    timeout(DEFAULT_TEST_TIMEOUT, approved.acknowledged)
        .await
        .unwrap()
        .unwrap();
    session
}

fn with_solana(mut namespaces: super::Namespaces) -> super::Namespaces {
    namespaces.insert(
        "solana".into(),
        Namespace {
            chains: Some(vec!["solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp".into()]),
            accounts: vec!["solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp:7S3P4HxJpyyigGzodYwHtCxZyUQe9JiBMHyRWXArAaKv".into()],
            methods: vec!["solana_signMessage".into()],
            events: vec![],
        },
    );
    namespaces
}

async fn wait_online(peer: &mut Peer) {
    recv_matching(&mut peer.events, DEFAULT_TEST_TIMEOUT, |event| {
        matches!(event, ClientEvent::RelayConnected).then_some(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failed_approve_leaves_nothing_behind() {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let (connected, proposal) = propose(&dapp, &mut wallet).await;
    let topics_before = wallet.client.relay().subscribed_topics().await;

    relay.set_online(false);
    relay.disconnect_all();
    let err = wallet.client.approve(approval(proposal.id)).await.unwrap_err();
    assert!(matches!(err, EngineError::Relay(_)), "{:?}", err);

    assert!(wallet.client.get_active_sessions().await.unwrap().is_empty());
    assert_eq!(wallet.client.get_pending_proposals().await.unwrap().len(), 1);
    assert_eq!(wallet.client.relay().subscribed_topics().await, topics_before);

    // the same proposal can still be approved once the relay is back
    relay.set_online(true);
    wait_online(&mut wallet).await;
    let approved = wallet.client.approve(approval(proposal.id)).await.unwrap();
    let session = timeout(DEFAULT_TEST_TIMEOUT, connected.approval)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.topic, approved.topic);
    assert_eq!(wallet.client.get_active_sessions().await.unwrap().len(), 1);
    assert!(wallet.client.get_pending_proposals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_proposal_fails_both_sides() {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let (connected, proposal) = propose(&dapp, &mut wallet).await;
    assert_eq!(connected.proposal_id, proposal.id);

    dapp.client.expire(&ExpiryTarget::Id(proposal.id)).await.unwrap();
    let outcome = timeout(DEFAULT_TEST_TIMEOUT, connected.approval).await.unwrap();
    assert!(matches!(outcome, Err(EngineError::Expired(_))));
    let expired = recv_matching(&mut dapp.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::ProposalExpire { id } => Some(id),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(expired, proposal.id);
    assert!(dapp.client.get_pending_proposals().await.unwrap().is_empty());

    wallet.client.expire(&ExpiryTarget::Id(proposal.id)).await.unwrap();
    recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::ProposalExpire { id } if id == proposal.id => Some(()),
        _ => None,
    })
    .await
    .unwrap();
    assert!(wallet.client.get_pending_proposals().await.unwrap().is_empty());
    assert!(matches!(
        wallet.client.approve(approval(proposal.id)).await,
        Err(EngineError::NoMatchingKey(_))
    ));
}

#[tokio::test]
async fn test_expired_request_is_forgotten() {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let session = settle(&dapp, &mut wallet).await;

    let request = dapp.client.request(OutboundRequest {
        topic: session.topic.clone(),
        chain_id: "eip155:1".into(),
        method: "personal_sign".into(),
        params: json!(["0xdeadbeef"]),
        expiry: None,
    });
    tokio::pin!(request);
    let pending = tokio::select! {
        answered = &mut request => panic!("request answered early: {:?}", answered),
        pending = recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
            ClientEvent::SessionRequest { request } => Some(request),
            _ => None,
        }) => pending.unwrap(),
    };
    assert_eq!(wallet.client.get_pending_session_requests().await.unwrap().len(), 1);

    wallet.client.expire(&ExpiryTarget::Id(pending.id)).await.unwrap();
    let expired = recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::SessionRequestExpire { id } => Some(id),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(expired, pending.id);
    assert!(wallet.client.get_pending_session_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_session_and_pairing_are_cleaned_up() {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let session = settle(&dapp, &mut wallet).await;
    let ctx = wallet.client.context().clone();
    assert!(ctx.keystore.has_keys(&session.topic).await);

    wallet
        .client
        .expire(&ExpiryTarget::Topic(session.topic.clone()))
        .await
        .unwrap();
    let expired = recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::SessionExpire { topic } => Some(topic),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(expired, session.topic);
    assert!(wallet.client.get_active_sessions().await.unwrap().is_empty());
    assert!(!ctx.relay.is_subscribed(&session.topic).await);
    assert!(!ctx.keystore.has_keys(&session.topic).await);

    wallet
        .client
        .expire(&ExpiryTarget::Topic(session.pairing_topic.clone()))
        .await
        .unwrap();
    let expired = recv_matching(&mut wallet.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::PairingExpire { topic } => Some(topic),
        _ => None,
    })
    .await
    .unwrap();
    assert_eq!(expired, session.pairing_topic);
    assert!(wallet
        .client
        .get_pairings()
        .await
        .unwrap()
        .iter()
        .all(|p| p.topic != session.pairing_topic));
}

#[tokio::test]
async fn test_stale_update_is_refused() {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let session = settle(&dapp, &mut wallet).await;
    let topic = session.topic.clone();

    let updated = with_solana(approved_namespaces());
    let ack = wallet.client.update(&topic, updated.clone()).await.unwrap();
    timeout(DEFAULT_TEST_TIMEOUT, ack).await.unwrap().unwrap();
    let applied_id = recv_matching(&mut dapp.events, DEFAULT_TEST_TIMEOUT, |event| match event {
        ClientEvent::SessionUpdate { id, .. } => Some(id),
        _ => None,
    })
    .await
    .unwrap();

    // an update older than the one already applied
    let stale = wallet
        .client
        .context()
        .request(
            &topic,
            RequestParams::SessionUpdate(SessionUpdateParams {
                namespaces: approved_namespaces(),
            }),
            DEFAULT_TEST_TIMEOUT,
            SendOptions {
                id: Some(applied_id - 1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let outcome = timeout(DEFAULT_TEST_TIMEOUT, stale).await.unwrap();
    assert!(matches!(outcome, Err(EngineError::InvalidUpdateRequest(_))), "{:?}", outcome);
    assert_eq!(dapp.client.get_active_sessions().await.unwrap()[0].namespaces, updated);

    // the guard is persisted with the session state
    let ctx = dapp.client.context();
    let persisted: Store<String, AppliedChanges> =
        Store::new("applied", ctx.storage.clone(), ctx.storage_key(CLIENT_CONTEXT, "applied"));
    persisted.restore().await.unwrap();
    let applied = persisted.get(&topic).await.unwrap();
    assert_eq!(applied.last(RpcMethod::SessionUpdate), Some(applied_id));
}

#[tokio::test]
async fn test_refused_changes_roll_back() {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let session = settle(&dapp, &mut wallet).await;
    let topic = session.topic.clone();

    // the dapp believes it already applied newer changes than anything we send
    let mut newest = AppliedChanges::default();
    newest.record(RpcMethod::SessionUpdate, u64::MAX);
    newest.record(RpcMethod::SessionExtend, u64::MAX);
    dapp.client
        .session_engine()
        .applied
        .set(topic.clone(), newest)
        .await
        .unwrap();

    let before = wallet.client.get_active_sessions().await.unwrap().remove(0);
    let ack = wallet
        .client
        .update(&topic, with_solana(approved_namespaces()))
        .await
        .unwrap();
    let optimistic = wallet.client.get_active_sessions().await.unwrap().remove(0);
    assert!(optimistic.namespaces.contains_key("solana"));

    let outcome = timeout(DEFAULT_TEST_TIMEOUT, ack).await.unwrap();
    assert!(matches!(outcome, Err(EngineError::InvalidUpdateRequest(_))), "{:?}", outcome);
    let after = wallet.client.get_active_sessions().await.unwrap().remove(0);
    assert_eq!(after.namespaces, before.namespaces);

    let ack = wallet.client.extend(&topic).await.unwrap();
    let outcome = timeout(DEFAULT_TEST_TIMEOUT, ack).await.unwrap();
    assert!(matches!(outcome, Err(EngineError::InvalidExtendRequest(_))), "{:?}", outcome);
    let after = wallet.client.get_active_sessions().await.unwrap().remove(0);
    assert_eq!(after.expiry, before.expiry);
}

#[tokio::test]
async fn test_rollback_keeps_newer_change() {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, dapp_metadata()).await;
    let mut wallet = peer(&relay, wallet_metadata()).await;
    let session = settle(&dapp, &mut wallet).await;
    let engine = wallet.client.session_engine();
    let topic = session.topic.clone();

    let newer = with_solana(approved_namespaces());
    engine
        .sessions
        .update(&topic, |s| s.namespaces = newer.clone())
        .await
        .unwrap();

    // rolling back an older attempt must not clobber the newer namespaces
    let older_attempt = approved_namespaces();
    engine
        .rollback_namespaces(&topic, &older_attempt, required_only())
        .await;
    assert_eq!(engine.get_session(&topic).await.unwrap().namespaces, newer);

    let current = engine.get_session(&topic).await.unwrap().expiry;
    engine.rollback_expiry(&topic, current + 1, current - 10).await;
    assert_eq!(engine.get_session(&topic).await.unwrap().expiry, current);
}

fn required_only() -> super::Namespaces {
    let mut namespaces = approved_namespaces();
    if let Some(eip155) = namespaces.get_mut("eip155") {
        eip155.chains = Some(vec!["eip155:1".into()]);
        eip155.accounts.truncate(1);
    }
    namespaces
}
