//! Account flows over the in-memory relay.
//!
//! Each peer is a full [`Account`] with its own mock environment, so expiry
//! is driven by advancing that peer's wall clock.

use std::time::Duration;

use tether_client::{
    Account, AccountConfig, AccountError, AccountEvent, ConfigError, MemoryRelay, MemoryTransport, Target, Transport,
};
use tether_core::{
    ChannelState, DiscoveryError, DispatchError, Environment, Handshake, HandshakeAction, HandshakeError, KeyStore,
    MemoryKeyStorage, env::test_utils::MockEnv,
};
use tether_proto::{
    Address, Attachment, Chat, DiscoveryRequest, DiscoveryResponse, EnvelopeKind, Introduction, Payload,
    ProposalData, RequestId, Status, Token, TypedContent,
};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    account: Account<MemoryTransport, MockEnv>,
    events: UnboundedReceiver<AccountEvent>,
    transport: MemoryTransport,
    env: MockEnv,
    inbox: Address,
}

fn config(target: Target) -> AccountConfig {
    let mut config = AccountConfig::new(target);
    config.sweep_interval = Duration::from_secs(3600);
    config
}

async fn peer_with(relay: &MemoryRelay, seed: u64, config: AccountConfig) -> Peer {
    let env = MockEnv::with_seed(seed);
    let (transport, inbound) = relay.connect();
    let (account, events) = Account::configure_with_env(config, env.clone(), transport.clone(), inbound).unwrap();
    let inbox = account.inbox_open(0).await.unwrap();
    Peer { account, events, transport, env, inbox }
}

async fn peer(relay: &MemoryRelay, seed: u64) -> Peer {
    peer_with(relay, seed, config(Target::Sandbox)).await
}

/// Collect events up to and including the first one matching `last`.
async fn events_until(
    events: &mut UnboundedReceiver<AccountEvent>,
    last: impl Fn(&AccountEvent) -> bool,
) -> Vec<AccountEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event channel closed");
            let done = last(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for(events: &mut UnboundedReceiver<AccountEvent>, wanted: impl Fn(&AccountEvent) -> bool) -> AccountEvent {
    let mut seen = events_until(events, wanted).await;
    seen.pop().unwrap()
}

/// Open a channel in band, `initiator` offering to `responder`.
async fn connect(initiator: &mut Peer, responder: &mut Peer) -> Address {
    let expires = initiator.env.wall_clock_secs() + 3600;
    initiator.account.connection_negotiate(initiator.inbox, responder.inbox, expires).await.unwrap();

    let responder_inbox = responder.inbox;
    let accepted =
        wait_for(&mut initiator.events, |e| matches!(e, AccountEvent::ConnectionAccepted { peer, .. } if *peer == responder_inbox))
            .await;
    let AccountEvent::ConnectionAccepted { status, group, .. } = accepted else { unreachable!() };
    assert_eq!(status, Status::Success);

    let initiator_inbox = initiator.inbox;
    let established = wait_for(
        &mut responder.events,
        |e| matches!(e, AccountEvent::ConnectionEstablished { peer, .. } if *peer == initiator_inbox),
    )
    .await;
    assert_eq!(
        established,
        AccountEvent::ConnectionEstablished { status: Status::Success, peer: initiator.inbox, group }
    );
    group
}

#[tokio::test]
async fn out_of_band_discovery_then_acknowledged_chat() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 1).await;
    let mut bob = peer(&relay, 2).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let (request, pending) = alice.account.discovery_request(key_package, expires).unwrap();
    assert_eq!(pending.request_id(), request.id);
    let payload = request.encode_out_of_band().unwrap();

    let scanned = DiscoveryRequest::decode_out_of_band(&payload).unwrap();
    assert_eq!(scanned, request);
    let group = bob.account.discovery_respond(bob.inbox, &scanned).await.unwrap();
    assert_eq!(bob.account.channel_state(&alice.inbox), Some(ChannelState::Established));

    let responder = tokio::time::timeout(WAIT, pending.response()).await.unwrap().unwrap();
    assert_eq!(responder, bob.inbox);
    assert_eq!(alice.account.channel_state(&bob.inbox), Some(ChannelState::Established));
    assert_eq!(alice.account.channel_group(&bob.inbox), Some(group));

    let seen = events_until(&mut alice.events, |e| matches!(e, AccountEvent::DiscoveryResolved { .. })).await;
    assert!(seen.contains(&AccountEvent::ConnectionAccepted { status: Status::Success, peer: bob.inbox, group }));
    assert_eq!(
        seen.last(),
        Some(&AccountEvent::DiscoveryResolved { request_id: request.id, result: Ok(bob.inbox) })
    );

    let id = alice.account.message_send(bob.inbox, Chat::new("hello")).await.unwrap();
    let received = wait_for(&mut bob.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    let AccountEvent::MessageReceived(message) = received else { unreachable!() };
    assert_eq!(message.id, id);
    assert_eq!(message.from, alice.inbox);
    assert_eq!(message.group, group);
    assert_eq!(message.content, TypedContent::Chat(Chat::new("hello")));

    let status = tokio::time::timeout(WAIT, alice.account.message_acknowledged(id)).await.unwrap();
    assert_eq!(status, Status::Success);
    assert_eq!(alice.account.message_acknowledged(id).await, Status::UnknownReference);
}

#[tokio::test]
async fn in_band_negotiation_carries_chat_both_ways() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 3).await;
    let mut bob = peer(&relay, 4).await;
    let group = connect(&mut alice, &mut bob).await;

    let committed = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Commit { .. })).await;
    assert!(matches!(committed, AccountEvent::Commit { from, group: g, .. } if from == bob.inbox && g == group));

    let reply_to = alice.account.message_send(bob.inbox, Chat::new("ping")).await.unwrap();
    wait_for(&mut bob.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;

    let reply = bob.account.message_send(alice.inbox, Chat::new("pong").referencing(reply_to)).await.unwrap();
    let received = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    let AccountEvent::MessageReceived(message) = received else { unreachable!() };
    assert_eq!(message.id, reply);
    assert_eq!(message.content, TypedContent::Chat(Chat::new("pong").referencing(reply_to)));

    assert_eq!(tokio::time::timeout(WAIT, bob.account.message_acknowledged(reply)).await.unwrap(), Status::Success);
}

#[tokio::test]
async fn awaited_key_package_establishes_channel() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 21).await;
    let mut bob = peer(&relay, 22).await;
    let now = bob.env.wall_clock_secs();

    let err = bob.account.connection_await(bob.inbox, alice.inbox, now).unwrap_err();
    assert_eq!(err, AccountError::Handshake(HandshakeError::Expired { expires: now }));

    bob.account.connection_await(bob.inbox, alice.inbox, now + 600).unwrap();
    let group = connect(&mut alice, &mut bob).await;
    assert_eq!(bob.account.channel_group(&alice.inbox), Some(group));
    assert_eq!(bob.account.channel_state(&alice.inbox), Some(ChannelState::Established));
}

#[tokio::test]
async fn send_without_channel_fails_and_sends_nothing() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, 5).await;
    let stranger = Address::from_bytes([0x5a; 32]);

    let err = alice.account.message_send(stranger, Chat::new("hi")).await.unwrap_err();
    assert_eq!(err, AccountError::Dispatch(DispatchError::ChannelNotReady { peer: stranger, state: None }));
    assert_eq!(err.status(), Status::ChannelNotReady);
    assert_eq!(alice.transport.sent_count(), 0);
}

#[tokio::test]
async fn send_on_pending_channel_fails_and_sends_nothing() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, 6).await;
    let stranger = Address::from_bytes([0x6b; 32]);
    let expires = alice.env.wall_clock_secs() + 3600;

    alice.account.connection_negotiate(alice.inbox, stranger, expires).await.unwrap();
    assert_eq!(alice.account.channel_state(&stranger), Some(ChannelState::Pending));
    let sent = alice.transport.sent_count();

    let err = alice.account.message_send(stranger, Chat::new("too early")).await.unwrap_err();
    assert_eq!(
        err,
        AccountError::Dispatch(DispatchError::ChannelNotReady { peer: stranger, state: Some(ChannelState::Pending) })
    );
    assert_eq!(alice.transport.sent_count(), sent);
}

#[tokio::test]
async fn disconnected_transport_fails_fast_and_keeps_channels() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 7).await;
    let mut bob = peer(&relay, 8).await;
    connect(&mut alice, &mut bob).await;

    alice.transport.disconnect("network lost");
    let disconnected = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Disconnected { .. })).await;
    assert_eq!(disconnected, AccountEvent::Disconnected { reason: Some("network lost".to_string()) });
    assert!(!alice.account.is_connected());

    let err = alice.account.message_send(bob.inbox, Chat::new("lost")).await.unwrap_err();
    assert_eq!(err, AccountError::TransportUnavailable);
    assert_eq!(err.status(), Status::TransportUnavailable);
    assert!(err.is_transient());
    assert_eq!(alice.account.inbox_open(0).await.unwrap_err(), AccountError::TransportUnavailable);
    assert_eq!(alice.account.channel_state(&bob.inbox), Some(ChannelState::Established));

    alice.transport.reconnect();
    wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Connected)).await;
    let id = alice.account.message_send(bob.inbox, Chat::new("back")).await.unwrap();
    assert_eq!(tokio::time::timeout(WAIT, alice.account.message_acknowledged(id)).await.unwrap(), Status::Success);
}

#[tokio::test]
async fn duplicate_welcome_establishes_once() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 9).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    // responder driven by hand so the welcome can be replayed
    let env = MockEnv::with_seed(10);
    let mut store = KeyStore::open(env.clone(), MemoryKeyStorage::new(), [10; 32], 8).unwrap();
    let mut handshake = Handshake::new();
    let bob_inbox = store.open_inbox(0).unwrap();
    let (bob_transport, _bob_events) = relay.connect();

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let outcome = handshake.on_key_package(&mut store, bob_inbox, &key_package, env.wall_clock_secs()).unwrap();
    let welcome_envelope = outcome
        .actions
        .iter()
        .find_map(|action| match action {
            HandshakeAction::Send(envelope) if envelope.kind == EnvelopeKind::Welcome => Some(envelope.clone()),
            _ => None,
        })
        .unwrap();

    bob_transport.send(welcome_envelope.clone()).await.unwrap();
    bob_transport.send(welcome_envelope.clone()).await.unwrap();

    let mut proposal = ProposalData { group: outcome.group, proposal: b"rename".to_vec(), signature: Vec::new() };
    proposal.signature = store.sign(&bob_inbox, &proposal.to_be_signed()).unwrap();
    bob_transport.send(Payload::Proposal(proposal).into_envelope(bob_inbox, alice.inbox).unwrap()).await.unwrap();

    let seen = events_until(&mut alice.events, |e| matches!(e, AccountEvent::Proposal { .. })).await;
    let accepted = seen.iter().filter(|e| matches!(e, AccountEvent::ConnectionAccepted { .. })).count();
    assert_eq!(accepted, 1);
    assert!(!seen.iter().any(|e| matches!(e, AccountEvent::Dropped { .. })));

    let Payload::Welcome(welcome) = Payload::from_envelope(&welcome_envelope).unwrap() else { unreachable!() };
    assert_eq!(alice.account.connection_accept(&welcome).await.unwrap(), (Status::Success, outcome.group));
    assert_eq!(alice.account.channel_group(&bob_inbox), Some(outcome.group));
}

#[tokio::test]
async fn unknown_discovery_response_is_dropped_but_acknowledged() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 11).await;
    let mut bob = peer(&relay, 12).await;
    connect(&mut alice, &mut bob).await;

    let stray = RequestId::from_bytes([0x42; 32]);
    let id = bob.account.message_send(alice.inbox, DiscoveryResponse { response_to: stray }).await.unwrap();

    let dropped = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Dropped { .. })).await;
    assert_eq!(
        dropped,
        AccountEvent::Dropped { kind: EnvelopeKind::Message, from: bob.inbox, status: Status::UnknownRequest }
    );
    assert_eq!(tokio::time::timeout(WAIT, bob.account.message_acknowledged(id)).await.unwrap(), Status::Success);
}

#[tokio::test]
async fn response_after_expiry_resolves_expired() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 13).await;
    let bob = peer(&relay, 14).await;
    let now = alice.env.wall_clock_secs();

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, now + 3600).unwrap();
    let (request, pending) = alice.account.discovery_request(key_package, now + 60).unwrap();

    // only the requester's clock moves; the responder still sees a live request
    alice.env.advance(120);
    bob.account.discovery_respond(bob.inbox, &request).await.unwrap();

    let result = tokio::time::timeout(WAIT, pending.response()).await.unwrap();
    assert_eq!(result, Err(AccountError::Discovery(DiscoveryError::Expired(request.id))));
    let resolved = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::DiscoveryResolved { .. })).await;
    assert_eq!(resolved, AccountEvent::DiscoveryResolved { request_id: request.id, result: Err(Status::Expired) });
}

#[tokio::test]
async fn sweep_expires_unanswered_request() {
    let relay = MemoryRelay::new();
    let mut fast_sweep = config(Target::Sandbox);
    fast_sweep.sweep_interval = Duration::from_millis(10);
    let alice = peer_with(&relay, 15, fast_sweep).await;
    let expires = alice.env.wall_clock_secs() + 60;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let (request, pending) = alice.account.discovery_request(key_package, expires).unwrap();
    alice.env.advance(61);

    let result = tokio::time::timeout(WAIT, pending.response()).await.unwrap();
    assert_eq!(result, Err(AccountError::Discovery(DiscoveryError::Expired(request.id))));
}

#[tokio::test]
async fn cancelled_request_ignores_late_response() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 16).await;
    let bob = peer(&relay, 17).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let (request, pending) = alice.account.discovery_request(key_package, expires).unwrap();
    assert!(alice.account.discovery_cancel(&request.id));
    assert!(!alice.account.discovery_cancel(&request.id));
    assert_eq!(pending.response().await, Err(AccountError::Cancelled));

    bob.account.discovery_respond(bob.inbox, &request).await.unwrap();
    let dropped = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Dropped { .. })).await;
    assert!(matches!(dropped, AccountEvent::Dropped { status: Status::UnknownRequest, .. }));
}

#[tokio::test]
async fn concurrent_discovery_requests_resolve_independently() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, 18).await;
    let bob = peer(&relay, 19).await;
    let carol = peer(&relay, 20).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let second_inbox = alice.account.inbox_open(0).await.unwrap();
    let first = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let second = alice.account.connection_negotiate_out_of_band(second_inbox, expires).unwrap();
    let (first_request, first_pending) = alice.account.discovery_request(first, expires).unwrap();
    let (second_request, second_pending) = alice.account.discovery_request(second, expires).unwrap();

    carol.account.discovery_respond(carol.inbox, &second_request).await.unwrap();
    bob.account.discovery_respond(bob.inbox, &first_request).await.unwrap();

    assert_eq!(tokio::time::timeout(WAIT, second_pending.response()).await.unwrap(), Ok(carol.inbox));
    assert_eq!(tokio::time::timeout(WAIT, first_pending.response()).await.unwrap(), Ok(bob.inbox));
}

#[tokio::test]
async fn responder_rejects_request_for_other_deployment() {
    let relay = MemoryRelay::new();
    let alice = peer_with(&relay, 21, config(Target::Production)).await;
    let bob = peer(&relay, 22).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let (request, _pending) = alice.account.discovery_request(key_package, expires).unwrap();
    assert!(!request.flags.contains(tether_proto::Flags::TARGET_SANDBOX));

    let err = bob.account.discovery_respond(bob.inbox, &request).await.unwrap_err();
    assert_eq!(err, AccountError::TargetMismatch(request.id));
    assert_eq!(bob.account.channel_state(&alice.inbox), None);
}

#[tokio::test]
async fn shutdown_fails_pending_waiters() {
    let relay = MemoryRelay::new();
    let alice = peer(&relay, 23).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let (_, pending) = alice.account.discovery_request(key_package, expires).unwrap();
    alice.account.shutdown();

    assert_eq!(pending.response().await, Err(AccountError::Shutdown));
}

#[tokio::test]
async fn cancelled_negotiation_rejects_welcome() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 24).await;
    let bob = peer(&relay, 25).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    let key_package = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    assert!(alice.account.connection_cancel(&key_package.reference()));
    assert!(!alice.account.connection_cancel(&key_package.reference()));
    let failed = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::ConnectionFailed { .. })).await;
    assert_eq!(
        failed,
        AccountEvent::ConnectionFailed {
            status: Status::Cancelled,
            local: alice.inbox,
            peer: None,
            key_package: Some(key_package.reference()),
        }
    );

    bob.account.connection_establish(bob.inbox, &key_package).await.unwrap();
    let dropped = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::Dropped { .. })).await;
    assert_eq!(
        dropped,
        AccountEvent::Dropped { kind: EnvelopeKind::Welcome, from: bob.inbox, status: Status::UnmatchedWelcome }
    );
    assert_eq!(alice.account.channel_state(&bob.inbox), None);
}

#[tokio::test]
async fn exhausted_key_package_budget_is_transient() {
    let relay = MemoryRelay::new();
    let mut tight = config(Target::Sandbox);
    tight.key_package_budget = 1;
    let alice = peer_with(&relay, 26, tight).await;
    let expires = alice.env.wall_clock_secs() + 3600;

    alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
    let err = alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap_err();
    assert_eq!(err.status(), Status::KeyExhausted);
    assert!(err.is_transient());
}

#[tokio::test]
async fn redb_storage_requires_32_byte_key() {
    let dir = tempfile::tempdir().unwrap();
    let relay = MemoryRelay::new();

    let (transport, inbound) = relay.connect();
    let short_key = config(Target::Sandbox).with_storage_path(dir.path().join("keys.redb"), vec![1u8; 16]);
    let err = Account::configure_with_env(short_key, MockEnv::new(), transport, inbound).err().unwrap();
    assert_eq!(err, AccountError::Config(ConfigError::StorageKeyLength(16)));

    let full_key = config(Target::Sandbox).with_storage_path(dir.path().join("keys.redb"), vec![1u8; 32]);
    let alice = peer_with(&relay, 27, full_key).await;
    let expires = alice.env.wall_clock_secs() + 3600;
    alice.account.connection_negotiate_out_of_band(alice.inbox, expires).unwrap();
}

fn fast_sweep() -> AccountConfig {
    let mut config = config(Target::Sandbox);
    config.sweep_interval = Duration::from_millis(10);
    config
}

#[tokio::test]
async fn expired_negotiation_fails_and_clears_pending_channel() {
    let relay = MemoryRelay::new();
    let mut alice = peer_with(&relay, 30, fast_sweep()).await;
    let stranger = Address::from_bytes([0x7c; 32]);
    let expires = alice.env.wall_clock_secs() + 10;

    let reference = alice.account.connection_negotiate(alice.inbox, stranger, expires).await.unwrap();
    assert_eq!(alice.account.channel_state(&stranger), Some(ChannelState::Pending));
    alice.env.advance(20);

    let failed = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::ConnectionFailed { .. })).await;
    assert_eq!(
        failed,
        AccountEvent::ConnectionFailed {
            status: Status::Expired,
            local: alice.inbox,
            peer: Some(stranger),
            key_package: Some(reference),
        }
    );
    assert_eq!(alice.account.channel_state(&stranger), None);
    assert!(!alice.account.connection_cancel(&reference));
}

#[tokio::test]
async fn unacknowledged_message_expires_after_delivery_timeout() {
    let relay = MemoryRelay::new();
    let mut alice_config = fast_sweep();
    alice_config.delivery_timeout = Duration::from_secs(60);
    let mut alice = peer_with(&relay, 31, alice_config).await;
    let mut bob = peer(&relay, 32).await;
    connect(&mut alice, &mut bob).await;

    // relay holds the message while bob is away, so no acknowledgement comes back
    bob.transport.disconnect("away");
    let id = alice.account.message_send(bob.inbox, Chat::new("anyone there?")).await.unwrap();
    alice.env.advance(61);

    let failed = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::DeliveryFailed { .. })).await;
    assert_eq!(failed, AccountEvent::DeliveryFailed { reference: id, status: Status::Expired });
    assert_eq!(tokio::time::timeout(WAIT, alice.account.message_acknowledged(id)).await.unwrap(), Status::Expired);
    assert_eq!(alice.account.message_acknowledged(id).await, Status::UnknownReference);
}

#[tokio::test]
async fn uncollected_delivery_status_is_dropped_after_timeout() {
    let relay = MemoryRelay::new();
    let mut alice_config = fast_sweep();
    alice_config.delivery_timeout = Duration::from_secs(60);
    let mut alice = peer_with(&relay, 33, alice_config).await;
    let mut bob = peer(&relay, 34).await;
    connect(&mut alice, &mut bob).await;

    let id = alice.account.message_send(bob.inbox, Chat::new("hi")).await.unwrap();
    wait_for(&mut bob.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    // let the acknowledgement land before the clock moves
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice.env.advance(61);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.account.message_acknowledged(id).await, Status::UnknownReference);
}

#[tokio::test]
async fn introduction_tokens_are_stored_per_issuer_and_inbox() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 35).await;
    let mut bob = peer(&relay, 36).await;
    connect(&mut alice, &mut bob).await;
    assert!(alice.account.tokens(&bob.inbox, &alice.inbox).is_empty());

    let first = Introduction { tokens: vec![Token(b"push-1".to_vec())] };
    bob.account.message_send(alice.inbox, first).await.unwrap();
    wait_for(&mut alice.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    assert_eq!(alice.account.tokens(&bob.inbox, &alice.inbox), vec![Token(b"push-1".to_vec())]);

    let second = Introduction { tokens: vec![Token(b"push-2".to_vec()), Token(b"mail".to_vec())] };
    bob.account.message_send(alice.inbox, second.clone()).await.unwrap();
    let received = wait_for(&mut alice.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    let AccountEvent::MessageReceived(message) = received else { unreachable!() };
    assert_eq!(message.content, TypedContent::Introduction(second.clone()));
    assert_eq!(alice.account.tokens(&bob.inbox, &alice.inbox), second.tokens);
    assert!(bob.account.tokens(&alice.inbox, &bob.inbox).is_empty());
}

#[tokio::test]
async fn chat_attachments_arrive_intact() {
    let relay = MemoryRelay::new();
    let mut alice = peer(&relay, 37).await;
    let mut bob = peer(&relay, 38).await;
    connect(&mut alice, &mut bob).await;

    let chat = Chat::new("see attached").attach(Attachment::new("cat.png", "image/png", vec![0x89, b'P', b'N', b'G']));
    alice.account.message_send(bob.inbox, chat.clone()).await.unwrap();
    let received = wait_for(&mut bob.events, |e| matches!(e, AccountEvent::MessageReceived(_))).await;
    let AccountEvent::MessageReceived(message) = received else { unreachable!() };
    assert_eq!(message.content, TypedContent::Chat(chat));
}

/// Reopen redb-backed storage once the previous account has released it.
async fn reopen(
    relay: &MemoryRelay,
    config: &AccountConfig,
    env: &MockEnv,
) -> (Account<MemoryTransport, MockEnv>, UnboundedReceiver<AccountEvent>) {
    tokio::time::timeout(WAIT, async {
        loop {
            let (transport, inbound) = relay.connect();
            match Account::configure_with_env(config.clone(), env.clone(), transport, inbound) {
                Ok(opened) => return opened,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("storage never released")
}

fn redb_config(path: &std::path::Path) -> AccountConfig {
    let mut config = config(Target::Sandbox).with_storage_path(path, vec![7u8; 32]);
    config.key_package_budget = 1;
    config
}

#[tokio::test]
async fn restart_reclaims_expired_key_package_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let relay = MemoryRelay::new();
    let config = redb_config(&dir.path().join("keys.redb"));
    let env = MockEnv::with_seed(39);

    let (alice, _events) = reopen(&relay, &config, &env).await;
    let inbox = alice.inbox_open(0).await.unwrap();
    let expires = env.wall_clock_secs() + 10;
    alice.connection_negotiate_out_of_band(inbox, expires).unwrap();
    alice.shutdown();

    env.advance(100_000);
    let (alice, _events) = reopen(&relay, &config, &env).await;
    let expires = env.wall_clock_secs() + 10;
    alice.connection_negotiate_out_of_band(inbox, expires).unwrap();
}

#[tokio::test]
async fn restart_keeps_live_key_package_usable() {
    let dir = tempfile::tempdir().unwrap();
    let relay = MemoryRelay::new();
    let config = redb_config(&dir.path().join("keys.redb"));
    let env = MockEnv::with_seed(40);
    let bob = peer(&relay, 41).await;

    let (alice, _events) = reopen(&relay, &config, &env).await;
    let inbox = alice.inbox_open(0).await.unwrap();
    let key_package = alice.connection_negotiate_out_of_band(inbox, env.wall_clock_secs() + 3600).unwrap();
    alice.shutdown();

    let (alice, mut events) = reopen(&relay, &config, &env).await;
    wait_for(&mut events, |e| matches!(e, AccountEvent::Connected)).await;
    let (_, group) = bob.account.connection_establish(bob.inbox, &key_package).await.unwrap();

    let accepted = wait_for(&mut events, |e| matches!(e, AccountEvent::ConnectionAccepted { .. })).await;
    assert_eq!(accepted, AccountEvent::ConnectionAccepted { status: Status::Success, peer: bob.inbox, group });
    assert_eq!(alice.channel_state(&bob.inbox), Some(ChannelState::Established));
}
