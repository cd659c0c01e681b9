//! Account: the caller-facing API.
//!
//! An [`Account`] owns the key store, handshake, discovery and dispatch
//! state machines for every inbox it opens. A background router task feeds
//! them transport events; a sweep task expires stale requests, negotiations,
//! key package secrets and unacknowledged messages. Callers drive it through
//! `async` methods and observe
//! inbound activity on the [`AccountEvent`] channel returned by
//! [`Account::configure`].
//!
//! # Locking
//!
//! State lives behind `std::sync` locks that are never held across an
//! `.await`. When two are needed they are taken handshake before key store,
//! channels before dispatcher. Waiter tables are leaves.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Lock poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use tether_core::{
    Abandoned, AnyKeyStorage, Channel, ChannelRole, ChannelState, DiscoveryEngine, DiscoveryError, DispatchError,
    Environment, Establishment, Handshake, HandshakeAction, KeyStore, KeyStoreError, MemoryKeyStorage,
    MessageDispatcher, RedbKeyStorage,
};
use tether_proto::{
    Address, DiscoveryRequest, DiscoveryResponse, Envelope, KeyPackage, KeyPackageRef, MessageId, RequestId,
    Status, Token, TypedContent, Welcome,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};

use crate::{
    config::{AccountConfig, ConfigError, StorageConfig, Target},
    error::AccountError,
    event::AccountEvent,
    router::EventRouter,
    system_env::SystemEnv,
    transport::{Transport, TransportEvent},
};

type DiscoveryWaiter = oneshot::Sender<Result<Address, AccountError>>;

enum Delivery {
    Pending {
        /// Unix seconds
        sent: u64,
        waiters: Vec<oneshot::Sender<Status>>,
    },
    Settled {
        /// Unix seconds
        at: u64,
        status: Status,
    },
}

/// Completed handshake step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settled {
    pub(crate) peer: Address,
    pub(crate) group: Address,
    pub(crate) replayed: bool,
}

/// State shared between the account handle and its background tasks.
pub(crate) struct Shared<T, E: Environment> {
    env: E,
    pub(crate) transport: T,
    target: Target,
    /// Seconds
    delivery_timeout: u64,
    keystore: Mutex<KeyStore<AnyKeyStorage, E>>,
    handshake: Mutex<Handshake>,
    discovery: RwLock<DiscoveryEngine>,
    channels: RwLock<HashMap<Address, Channel>>,
    dispatcher: Mutex<MessageDispatcher>,
    discovery_waiters: Mutex<HashMap<RequestId, DiscoveryWaiter>>,
    deliveries: Mutex<HashMap<MessageId, Delivery>>,
    /// Tokens keyed by (issuer, holding inbox)
    tokens: Mutex<HashMap<(Address, Address), Vec<Token>>>,
    events: mpsc::UnboundedSender<AccountEvent>,
}

impl<T: Transport, E: Environment> Shared<T, E> {
    pub(crate) fn now(&self) -> u64 {
        self.env.wall_clock_secs()
    }

    pub(crate) fn emit(&self, event: AccountEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("account event receiver dropped");
        }
    }

    fn ensure_connected(&self) -> Result<(), AccountError> {
        if self.transport.is_connected() { Ok(()) } else { Err(AccountError::TransportUnavailable) }
    }

    pub(crate) fn owns_inbox(&self, address: &Address) -> bool {
        self.keystore.lock().expect("keystore lock poisoned").has_inbox(address)
    }

    pub(crate) fn live_inboxes(&self) -> Vec<Address> {
        self.keystore.lock().expect("keystore lock poisoned").live_inboxes()
    }

    pub(crate) async fn send(&self, envelope: Envelope) -> Result<(), AccountError> {
        let (kind, to) = (envelope.kind, envelope.to);
        if let Err(err) = self.transport.send(envelope).await {
            tracing::warn!(?kind, %to, error = %err, "envelope send failed");
            return Err(err.into());
        }
        tracing::trace!(?kind, %to, "envelope sent");
        Ok(())
    }

    /// Install channels first, then send in order.
    async fn execute(&self, actions: Vec<HandshakeAction>) -> Result<(), AccountError> {
        let mut outbound = Vec::new();
        for action in actions {
            match action {
                HandshakeAction::Send(envelope) => outbound.push(envelope),
                HandshakeAction::Establish(establishment) => self.install(establishment)?,
            }
        }
        for envelope in outbound {
            self.send(envelope).await?;
        }
        Ok(())
    }

    fn install(&self, establishment: Establishment) -> Result<(), AccountError> {
        let (peer, negotiation, role) = (establishment.peer, establishment.negotiation, establishment.role);

        let mut channels = self.channels();
        if let Err(err) = establishment.install(&mut channels) {
            tracing::warn!(%peer, %negotiation, state = ?err.from, "channel not installed");
            return Err(AccountError::ChannelClosed(peer));
        }
        tracing::debug!(%peer, %negotiation, ?role, "channel established");
        Ok(())
    }

    /// Consume a key package as responder.
    pub(crate) async fn establish(&self, local: Address, key_package: &KeyPackage) -> Result<Settled, AccountError> {
        let outcome = {
            let mut handshake = self.handshake.lock().expect("handshake lock poisoned");
            let mut keystore = self.keystore.lock().expect("keystore lock poisoned");
            handshake.on_key_package(&mut *keystore, local, key_package, self.now())?
        };
        let settled = Settled { peer: outcome.peer, group: outcome.group, replayed: outcome.replayed };
        self.execute(outcome.actions).await?;
        Ok(settled)
    }

    /// Complete one of our negotiations with a welcome.
    pub(crate) async fn accept(&self, welcome: &Welcome) -> Result<Settled, AccountError> {
        let outcome = {
            let mut handshake = self.handshake.lock().expect("handshake lock poisoned");
            let mut keystore = self.keystore.lock().expect("keystore lock poisoned");
            handshake.on_welcome(&mut *keystore, welcome, self.now())?
        };
        let settled = Settled { peer: outcome.peer, group: outcome.group, replayed: outcome.replayed };
        self.execute(outcome.actions).await?;
        Ok(settled)
    }

    pub(crate) fn handshake(&self) -> std::sync::MutexGuard<'_, Handshake> {
        self.handshake.lock().expect("handshake lock poisoned")
    }

    pub(crate) fn discovery(&self) -> std::sync::RwLockWriteGuard<'_, DiscoveryEngine> {
        self.discovery.write().expect("discovery lock poisoned")
    }

    pub(crate) fn channels(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Address, Channel>> {
        self.channels.write().expect("channels lock poisoned")
    }

    pub(crate) fn dispatcher(&self) -> std::sync::MutexGuard<'_, MessageDispatcher> {
        self.dispatcher.lock().expect("dispatcher lock poisoned")
    }

    async fn send_content(&self, peer: Address, content: &TypedContent) -> Result<MessageId, AccountError> {
        self.ensure_connected()?;
        let nonce = self.keystore.lock().expect("keystore lock poisoned").nonce();

        let (id, envelope) = {
            let mut channels = self.channels();
            let channel = channels.get_mut(&peer).ok_or(DispatchError::ChannelNotReady { peer, state: None })?;
            self.dispatcher().send(channel, content, nonce)?
        };

        let pending = Delivery::Pending { sent: self.now(), waiters: Vec::new() };
        self.deliveries.lock().expect("deliveries lock poisoned").insert(id, pending);
        if let Err(err) = self.send(envelope).await {
            self.dispatcher().forget(&id);
            self.deliveries.lock().expect("deliveries lock poisoned").remove(&id);
            return Err(err);
        }

        tracing::debug!(%peer, message = %id, content_type = content.content_type().name(), "message sent");
        Ok(id)
    }

    /// Record the final status of an outgoing message.
    /// Replace the tokens `issuer` handed to `inbox`.
    pub(crate) fn store_tokens(&self, issuer: Address, inbox: Address, tokens: Vec<Token>) {
        tracing::info!(%issuer, %inbox, count = tokens.len(), "tokens stored");
        self.tokens.lock().expect("tokens lock poisoned").insert((issuer, inbox), tokens);
    }

    pub(crate) fn settle(&self, reference: MessageId, status: Status) {
        let at = self.now();
        let mut deliveries = self.deliveries.lock().expect("deliveries lock poisoned");
        match deliveries.remove(&reference) {
            Some(Delivery::Pending { waiters, .. }) if waiters.is_empty() => {
                deliveries.insert(reference, Delivery::Settled { at, status });
            },
            Some(Delivery::Pending { waiters, .. }) => {
                for waiter in waiters {
                    let _ = waiter.send(status);
                }
            },
            Some(settled @ Delivery::Settled { .. }) => {
                deliveries.insert(reference, settled);
            },
            None => {},
        }
    }

    /// Resolve a discovery waiter and report the outcome.
    pub(crate) fn resolve_discovery(&self, request_id: RequestId, result: Result<Address, AccountError>) {
        let waiter = self.discovery_waiters.lock().expect("waiters lock poisoned").remove(&request_id);
        let reported = result.as_ref().copied().map_err(AccountError::status);
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
        self.emit(AccountEvent::DiscoveryResolved { request_id, result: reported });
    }

    /// Report a negotiation that ended without a channel and drop the
    /// pending channel it opened.
    pub(crate) fn abandon(&self, abandoned: &Abandoned, status: Status) {
        if let Some(peer) = abandoned.peer {
            let mut channels = self.channels();
            let opened_here = channels.get(&peer).is_some_and(|channel| {
                channel.state() == ChannelState::Pending
                    && channel.local() == abandoned.local
                    && channel.role() == abandoned.role
            });
            if opened_here {
                channels.remove(&peer);
            }
        }

        tracing::info!(negotiation = %abandoned.negotiation, %status, "negotiation failed");
        self.emit(AccountEvent::ConnectionFailed {
            status,
            local: abandoned.local,
            peer: abandoned.peer,
            key_package: abandoned.key_package_ref,
        });
    }

    /// Expire discovery requests, negotiations, key package secrets and
    /// deliveries.
    pub(crate) fn sweep(&self) {
        let now = self.now();
        let expired = self.discovery().sweep(now);
        for request_id in expired {
            tracing::info!(%request_id, "discovery request expired");
            self.resolve_discovery(request_id, Err(DiscoveryError::Expired(request_id).into()));
        }

        let (abandoned, reclaimed) = {
            let mut handshake = self.handshake();
            let mut keystore = self.keystore.lock().expect("keystore lock poisoned");
            let abandoned = handshake.expire(&mut *keystore, now);
            (abandoned, keystore.sweep_key_packages(now))
        };
        for negotiation in &abandoned {
            self.abandon(negotiation, Status::Expired);
        }
        match reclaimed {
            Ok(references) if !references.is_empty() => {
                tracing::debug!(count = references.len(), "expired key package secrets destroyed");
            },
            Ok(_) => {},
            Err(err) => tracing::warn!(error = %err, "key package sweep failed"),
        }

        self.sweep_deliveries(now);
    }

    /// Settle messages unacknowledged past the delivery timeout as
    /// `Expired` and drop statuses nobody collected.
    fn sweep_deliveries(&self, now: u64) {
        let timeout = self.delivery_timeout;
        let mut overdue = Vec::new();
        self.deliveries.lock().expect("deliveries lock poisoned").retain(|id, delivery| match delivery {
            Delivery::Pending { sent, .. } => {
                if now >= sent.saturating_add(timeout) {
                    overdue.push(*id);
                }
                true
            },
            Delivery::Settled { at, .. } => now < at.saturating_add(timeout),
        });

        for reference in overdue {
            self.dispatcher().forget(&reference);
            self.settle(reference, Status::Expired);
            tracing::info!(message = %reference, "delivery expired unacknowledged");
            self.emit(AccountEvent::DeliveryFailed { reference, status: Status::Expired });
        }
    }

    fn close(&self) {
        for channel in self.channels().values_mut() {
            channel.close();
        }
        for (_, waiter) in self.discovery_waiters.lock().expect("waiters lock poisoned").drain() {
            let _ = waiter.send(Err(AccountError::Shutdown));
        }
        for (_, delivery) in self.deliveries.lock().expect("deliveries lock poisoned").drain() {
            if let Delivery::Pending { waiters, .. } = delivery {
                for waiter in waiters {
                    let _ = waiter.send(Status::Cancelled);
                }
            }
        }
    }
}

/// Discovery request awaiting its response.
///
/// Dropping the handle does not cancel the request; it stays pending until
/// answered, swept at expiry or cancelled with [`Account::discovery_cancel`].
#[derive(Debug)]
pub struct PendingDiscovery {
    request_id: RequestId,
    response: oneshot::Receiver<Result<Address, AccountError>>,
}

impl PendingDiscovery {
    /// Request id.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the responder's inbox address.
    ///
    /// # Errors
    ///
    /// - `AccountError::Discovery(Expired)` if the request expired first
    /// - `AccountError::Cancelled` if it was cancelled or superseded
    /// - `AccountError::Shutdown` if the account shut down
    pub async fn response(self) -> Result<Address, AccountError> {
        self.response.await.unwrap_or(Err(AccountError::Cancelled))
    }
}

/// Messaging account bound to one transport.
///
/// # Example
///
/// ```ignore
/// let relay = MemoryRelay::new();
/// let (transport, inbound) = relay.connect();
/// let (account, mut events) = Account::configure(AccountConfig::default(), transport, inbound)?;
/// let inbox = account.inbox_open(0).await?;
/// ```
pub struct Account<T: Transport, E: Environment = SystemEnv> {
    shared: Arc<Shared<T, E>>,
    tasks: Vec<AbortHandle>,
}

impl<T: Transport> Account<T, SystemEnv> {
    /// Open an account with the system environment.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `AccountError::Config` if the configuration is invalid
    /// - `AccountError::KeyStore` if storage cannot be opened
    pub fn configure(
        config: AccountConfig,
        transport: T,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AccountEvent>), AccountError> {
        Self::configure_with_env(config, SystemEnv::new(), transport, inbound)
    }
}

impl<T: Transport, E: Environment> Account<T, E> {
    /// Open an account with an explicit environment.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Same as [`Account::configure`].
    pub fn configure_with_env(
        config: AccountConfig,
        env: E,
        transport: T,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AccountEvent>), AccountError> {
        config.validate()?;

        let (storage, storage_key) = match &config.storage {
            StorageConfig::Memory => (AnyKeyStorage::Memory(MemoryKeyStorage::new()), env.random_array()),
            StorageConfig::Path { path, key } => {
                let storage_key: [u8; 32] =
                    key.as_slice().try_into().map_err(|_| ConfigError::StorageKeyLength(key.len()))?;
                let storage = RedbKeyStorage::open(path).map_err(KeyStoreError::from)?;
                (AnyKeyStorage::Redb(storage), storage_key)
            },
        };
        let keystore = KeyStore::open(env.clone(), storage, storage_key, config.key_package_budget)?;
        let mut handshake = Handshake::new();
        handshake.restore(&keystore, env.wall_clock_secs())?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            env: env.clone(),
            transport,
            target: config.target,
            delivery_timeout: config.delivery_timeout.as_secs(),
            keystore: Mutex::new(keystore),
            handshake: Mutex::new(handshake),
            discovery: RwLock::new(DiscoveryEngine::new()),
            channels: RwLock::new(HashMap::new()),
            dispatcher: Mutex::new(MessageDispatcher::new()),
            discovery_waiters: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            events,
        });

        let router = tokio::spawn(EventRouter::new(Arc::clone(&shared)).run(inbound));
        let sweeper = {
            let shared = Arc::clone(&shared);
            let interval = config.sweep_interval;
            tokio::spawn(async move {
                loop {
                    env.sleep(interval).await;
                    shared.sweep();
                }
            })
        };

        tracing::info!(deployment = ?config.target, storage = ?config.storage, rpc = %config.endpoints.rpc, "account configured");
        let account = Self { shared, tasks: vec![router.abort_handle(), sweeper.abort_handle()] };
        Ok((account, events_rx))
    }

    /// Deployment this account targets.
    pub fn target(&self) -> Target {
        self.shared.target
    }

    /// Check if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    /// Open a new inbox and subscribe to it.
    ///
    /// `expires` is Unix seconds, 0 for an inbox that never expires.
    ///
    /// # Errors
    ///
    /// - `AccountError::TransportUnavailable` if disconnected
    /// - `AccountError::KeyStore` if the identity cannot be stored
    pub async fn inbox_open(&self, expires: u64) -> Result<Address, AccountError> {
        self.shared.ensure_connected()?;
        let inbox = self.shared.keystore.lock().expect("keystore lock poisoned").open_inbox(expires)?;
        self.shared.transport.subscribe(inbox).await?;
        Ok(inbox)
    }

    /// Generate a key package for `inbox` to hand over out of band.
    ///
    /// The negotiation completes when the peer's welcome arrives.
    ///
    /// # Errors
    ///
    /// - `AccountError::Handshake` if `expires` is not in the future, the
    ///   inbox is unknown or the key package budget is exhausted
    pub fn connection_negotiate_out_of_band(&self, inbox: Address, expires: u64) -> Result<KeyPackage, AccountError> {
        let now = self.shared.now();
        let mut handshake = self.shared.handshake();
        let mut keystore = self.shared.keystore.lock().expect("keystore lock poisoned");
        let (_, key_package) = handshake.begin_out_of_band(&mut *keystore, inbox, expires, now)?;
        Ok(key_package)
    }

    /// Offer a key package to `peer` through the relay.
    ///
    /// A pending channel to `peer` exists until the welcome arrives.
    ///
    /// # Errors
    ///
    /// - `AccountError::TransportUnavailable` if disconnected
    /// - `AccountError::Handshake` as for
    ///   [`Account::connection_negotiate_out_of_band`]
    pub async fn connection_negotiate(
        &self,
        inbox: Address,
        peer: Address,
        expires: u64,
    ) -> Result<KeyPackageRef, AccountError> {
        self.shared.ensure_connected()?;
        let now = self.shared.now();
        let (reference, actions) = {
            let mut handshake = self.shared.handshake();
            let mut keystore = self.shared.keystore.lock().expect("keystore lock poisoned");
            let (_, reference, actions) = handshake.begin_in_band(&mut *keystore, inbox, peer, expires, now)?;
            (reference, actions)
        };

        self.shared.channels().entry(peer).or_insert_with(|| Channel::pending(inbox, peer, ChannelRole::Initiator));
        self.shared.execute(actions).await?;
        Ok(reference)
    }

    /// Expect `peer` to offer a key package to `inbox` through the relay.
    ///
    /// The relayed key package completes this negotiation. Unexpected key
    /// packages are still answered.
    ///
    /// # Errors
    ///
    /// - `AccountError::Handshake` if `expires` is not in the future or the
    ///   inbox is not ours
    pub fn connection_await(&self, inbox: Address, peer: Address, expires: u64) -> Result<(), AccountError> {
        let now = self.shared.now();
        let mut handshake = self.shared.handshake();
        let keystore = self.shared.keystore.lock().expect("keystore lock poisoned");
        handshake.await_key_package(&*keystore, inbox, peer, expires, now)?;
        Ok(())
    }

    /// Abandon the negotiation waiting on `key_package`.
    ///
    /// Returns true if it was still in progress. The negotiation is reported
    /// as [`AccountEvent::ConnectionFailed`] with `Cancelled` and its pending
    /// channel is dropped.
    pub fn connection_cancel(&self, key_package: &KeyPackageRef) -> bool {
        let abandoned = {
            let mut handshake = self.shared.handshake();
            let Some(id) = handshake.awaiting(key_package).map(tether_core::Negotiation::id) else {
                return false;
            };
            let mut keystore = self.shared.keystore.lock().expect("keystore lock poisoned");
            handshake.cancel(&mut *keystore, id)
        };
        let Some(abandoned) = abandoned else {
            return false;
        };
        self.shared.abandon(&abandoned, Status::Cancelled);
        true
    }

    /// Accept a welcome to one of our key packages.
    ///
    /// Welcomes relayed to our inboxes are accepted automatically; this is
    /// for welcomes obtained some other way. Accepting the same welcome twice
    /// returns the first result.
    ///
    /// # Errors
    ///
    /// - `AccountError::Handshake` if the welcome is unmatched, expired,
    ///   misaddressed or badly signed
    pub async fn connection_accept(&self, welcome: &Welcome) -> Result<(Status, Address), AccountError> {
        let settled = self.shared.accept(welcome).await?;
        Ok((Status::Success, settled.group))
    }

    /// Consume a peer's key package and open a channel as responder.
    ///
    /// Sends the welcome and commit to the key package owner.
    ///
    /// # Errors
    ///
    /// - `AccountError::TransportUnavailable` if disconnected
    /// - `AccountError::Handshake` if the key package is expired or badly
    ///   signed, or `inbox` is not ours
    pub async fn connection_establish(
        &self,
        inbox: Address,
        key_package: &KeyPackage,
    ) -> Result<(Status, Address), AccountError> {
        self.shared.ensure_connected()?;
        let settled = self.shared.establish(inbox, key_package).await?;
        Ok((Status::Success, settled.group))
    }

    /// Register a discovery request for `key_package`.
    ///
    /// The request carries the sandbox flag when the account targets the
    /// sandbox. Render it with [`DiscoveryRequest::encode_out_of_band`].
    ///
    /// # Errors
    ///
    /// - `AccountError::Discovery(Expired)` if `expires` is not in the future
    /// - `AccountError::Discovery(RequestIdReused)` if an identical request
    ///   was already resolved
    pub fn discovery_request(
        &self,
        key_package: KeyPackage,
        expires: u64,
    ) -> Result<(DiscoveryRequest, PendingDiscovery), AccountError> {
        let now = self.shared.now();
        let flags = self.shared.target.discovery_flags();
        let request = self.shared.discovery().create_request(key_package, expires, flags, now)?;

        let (tx, rx) = oneshot::channel();
        let superseded = self.shared.discovery_waiters.lock().expect("waiters lock poisoned").insert(request.id, tx);
        if superseded.is_some() {
            tracing::debug!(request_id = %request.id, "discovery request re-registered");
        }

        tracing::info!(request_id = %request.id, expires, "discovery request created");
        let pending = PendingDiscovery { request_id: request.id, response: rx };
        Ok((request, pending))
    }

    /// Cancel a pending discovery request. Returns true if it was pending.
    ///
    /// Its [`PendingDiscovery`] resolves with `Cancelled`; a late response
    /// is dropped as unknown.
    pub fn discovery_cancel(&self, request_id: &RequestId) -> bool {
        let cancelled = self.shared.discovery().cancel(request_id);
        if let Some(waiter) = self.shared.discovery_waiters.lock().expect("waiters lock poisoned").remove(request_id) {
            let _ = waiter.send(Err(AccountError::Cancelled));
        }
        if cancelled {
            tracing::debug!(%request_id, "discovery request cancelled");
        }
        cancelled
    }

    /// Answer a scanned discovery request from `inbox`.
    ///
    /// Establishes a channel with the requester, then sends a discovery
    /// response over it. Returns the channel group.
    ///
    /// # Errors
    ///
    /// - `AccountError::Discovery(Expired)` if the request has expired
    /// - `AccountError::TargetMismatch` if it was made for another deployment
    /// - anything [`Account::connection_establish`] or
    ///   [`Account::message_send`] returns
    pub async fn discovery_respond(&self, inbox: Address, request: &DiscoveryRequest) -> Result<Address, AccountError> {
        if request.is_expired(self.shared.now()) {
            return Err(DiscoveryError::Expired(request.id).into());
        }
        if !self.shared.target.accepts(request.flags) {
            return Err(AccountError::TargetMismatch(request.id));
        }

        let (_, group) = self.connection_establish(inbox, &request.key_package).await?;
        let response = TypedContent::DiscoveryResponse(DiscoveryResponse { response_to: request.id });
        self.shared.send_content(request.key_package.owner, &response).await?;

        tracing::info!(request_id = %request.id, %group, "discovery request answered");
        Ok(group)
    }

    /// Send `content` over the established channel to `peer`.
    ///
    /// Returns the message id; [`Account::message_acknowledged`] waits for
    /// the peer's acknowledgement.
    ///
    /// # Errors
    ///
    /// - `AccountError::TransportUnavailable` if disconnected
    /// - `AccountError::Dispatch(ChannelNotReady)` if no channel to `peer` is
    ///   established; nothing is sent
    pub async fn message_send(
        &self,
        peer: Address,
        content: impl Into<TypedContent>,
    ) -> Result<MessageId, AccountError> {
        self.shared.send_content(peer, &content.into()).await
    }

    /// Wait for the delivery status of a sent message.
    ///
    /// Resolves once with `Success` when acknowledged, the peer's error
    /// status when refused, or `Expired` when no answer came within the
    /// delivery timeout. A status is handed out once and kept for one
    /// delivery timeout; asking again, too late, or for an id never sent
    /// returns `UnknownReference`.
    pub async fn message_acknowledged(&self, id: MessageId) -> Status {
        let waiter = {
            let mut deliveries = self.shared.deliveries.lock().expect("deliveries lock poisoned");
            match deliveries.remove(&id) {
                None => return Status::UnknownReference,
                Some(Delivery::Settled { status, .. }) => return status,
                Some(Delivery::Pending { sent, mut waiters }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    deliveries.insert(id, Delivery::Pending { sent, waiters });
                    rx
                },
            }
        };
        waiter.await.unwrap_or(Status::Cancelled)
    }

    /// State of the channel to `peer`, if any.
    pub fn channel_state(&self, peer: &Address) -> Option<ChannelState> {
        self.shared.channels.read().expect("channels lock poisoned").get(peer).map(Channel::state)
    }

    /// Tokens `issuer` introduced to `inbox`, most recent introduction only.
    pub fn tokens(&self, issuer: &Address, inbox: &Address) -> Vec<Token> {
        self.shared.tokens.lock().expect("tokens lock poisoned").get(&(*issuer, *inbox)).cloned().unwrap_or_default()
    }

    /// Group of the established channel to `peer`, if any.
    pub fn channel_group(&self, peer: &Address) -> Option<Address> {
        self.shared.channels.read().expect("channels lock poisoned").get(peer).and_then(Channel::group)
    }

    /// Stop background tasks, close channels and fail every waiter.
    pub fn shutdown(mut self) {
        self.stop();
        tracing::info!("account shut down");
    }

    fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.close();
    }
}

impl<T: Transport, E: Environment> Drop for Account<T, E> {
    fn drop(&mut self) {
        self.stop();
    }
}
