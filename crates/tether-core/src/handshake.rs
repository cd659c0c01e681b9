//! Channel negotiation state machine.
//!
//! Uses the action pattern: methods take the key store and the current time
//! and return actions (envelopes to send, channels to install) for the driver
//! to execute. No I/O happens here.
//!
//! # State Machine
//!
//! ```text
//!            key package awaited or received     validated
//!   ┌──────┐ ─────────────────────────> AwaitingKeyPackage ──────────┐
//!   │ Idle │                                                         ↓
//!   └──────┘ ─────────────────────────> AwaitingWelcome ──────> Established
//!                 key package offered          welcome
//!
//!   any non-terminal state ── expiry / invalid input / cancel ──> Failed
//! ```
//!
//! The initiator offers a key package (out of band or in band) and waits for a
//! welcome. The responder consumes a key package, derives the channel and
//! answers with a Welcome followed by a signed Commit.
//!
//! # Invariants
//!
//! - States only move along the arrows above
//! - A key package secret is consumed by at most one welcome
//! - Processing the same welcome or key package twice returns the first
//!   result without re-establishing, until the negotiation's expiry passes
//! - Terminal negotiations and replay records are pruned by the first sweep
//!   after their expiry

use std::collections::HashMap;

use tether_proto::{
    Address, CommitData, Envelope, KeyPackage, KeyPackageRef, Payload, ProposalData, Welcome,
    WelcomeId,
};

use crate::{
    channel::{BackwardTransition, Channel, ChannelRole, ChannelState},
    crypto::{self, ChannelKey},
    env::Environment,
    error::{HandshakeError, KeyStoreError},
    keystore::{KeyStorage, KeyStore},
};

/// Epoch of the commit that opens a channel.
pub const INITIAL_EPOCH: u64 = 1;

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Created, nothing exchanged
    Idle,
    /// Responder validating a received key package
    AwaitingKeyPackage,
    /// Initiator waiting for the welcome to its key package
    AwaitingWelcome,
    /// Channel agreed
    Established,
    /// Negotiation ended without a channel
    Failed,
}

impl NegotiationState {
    /// True for Established and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }

    fn can_transition(self, to: Self) -> bool {
        use NegotiationState::{AwaitingKeyPackage, AwaitingWelcome, Established, Failed, Idle};
        match (self, to) {
            (Idle, AwaitingKeyPackage | AwaitingWelcome)
            | (AwaitingKeyPackage | AwaitingWelcome, Established) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Identifier of one negotiation attempt, local to this state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NegotiationId(u64);

impl std::fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "negotiation-{}", self.0)
    }
}

/// One negotiation attempt.
#[derive(Debug, Clone)]
pub struct Negotiation {
    id: NegotiationId,
    role: ChannelRole,
    state: NegotiationState,
    local: Address,
    peer: Option<Address>,
    key_package_ref: Option<KeyPackageRef>,
    expires: u64,
    group: Option<Address>,
}

impl Negotiation {
    /// Negotiation id.
    pub fn id(&self) -> NegotiationId {
        self.id
    }

    /// Side played by this account.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Local inbox.
    pub fn local(&self) -> Address {
        self.local
    }

    /// Peer inbox, once known.
    pub fn peer(&self) -> Option<Address> {
        self.peer
    }

    /// Key package this negotiation revolves around. None while a responder
    /// is still waiting for it.
    pub fn key_package_ref(&self) -> Option<KeyPackageRef> {
        self.key_package_ref
    }

    /// Expiry in Unix seconds.
    pub fn expires(&self) -> u64 {
        self.expires
    }

    /// Group address, once established.
    pub fn group(&self) -> Option<Address> {
        self.group
    }

    fn transition(&mut self, to: NegotiationState, operation: &'static str) -> Result<(), HandshakeError> {
        if !self.state.can_transition(to) {
            return Err(HandshakeError::InvalidState { state: self.state, operation });
        }
        tracing::trace!(negotiation = %self.id, from = ?self.state, ?to, "negotiation transition");
        self.state = to;
        Ok(())
    }
}

/// Agreed channel parameters, ready to be installed.
#[derive(Debug)]
pub struct Establishment {
    /// Negotiation that produced the channel
    pub negotiation: NegotiationId,
    /// Local inbox
    pub local: Address,
    /// Peer inbox
    pub peer: Address,
    /// Group address
    pub group: Address,
    /// Side played by this account
    pub role: ChannelRole,
    /// Channel key
    pub key: ChannelKey,
}

impl Establishment {
    /// Build the established channel.
    pub fn into_channel(self) -> Channel {
        Channel::established(self.local, self.peer, self.role, self.group, self.key)
    }

    /// Install the channel in a table keyed by peer inbox.
    ///
    /// A Pending channel this negotiation opened is established in place. A
    /// channel already bound to the same group is kept as is, so a duplicate
    /// handshake never resets sequence numbers. Any other channel is replaced
    /// by the newer group.
    ///
    /// # Errors
    ///
    /// - `BackwardTransition` if the channel to the peer is Closed
    pub fn install(self, channels: &mut HashMap<Address, Channel>) -> Result<(), BackwardTransition> {
        if let Some(channel) = channels.get_mut(&self.peer) {
            match channel.state() {
                ChannelState::Closed => {
                    return Err(BackwardTransition { from: ChannelState::Closed, to: ChannelState::Established });
                },
                ChannelState::Pending if channel.local() == self.local && channel.role() == self.role => {
                    return channel.establish(self.group, self.key);
                },
                ChannelState::Established if channel.group() == Some(self.group) => return Ok(()),
                ChannelState::Pending | ChannelState::Established => {
                    tracing::debug!(peer = %self.peer, negotiation = %self.negotiation, "replacing channel with a newer group");
                },
            }
        }
        channels.insert(self.peer, self.into_channel());
        Ok(())
    }
}

/// Negotiation that ended without a channel, by expiry or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned {
    /// Negotiation that failed
    pub negotiation: NegotiationId,
    /// Side played by this account
    pub role: ChannelRole,
    /// Local inbox
    pub local: Address,
    /// Peer inbox, if it was known
    pub peer: Option<Address>,
    /// Key package the negotiation revolved around, if any
    pub key_package_ref: Option<KeyPackageRef>,
}

impl From<&Negotiation> for Abandoned {
    fn from(negotiation: &Negotiation) -> Self {
        Self {
            negotiation: negotiation.id,
            role: negotiation.role,
            local: negotiation.local,
            peer: negotiation.peer,
            key_package_ref: negotiation.key_package_ref,
        }
    }
}

/// Actions returned by the handshake state machine.
///
/// The driver executes these in order:
/// - `Send`: hand the envelope to the transport
/// - `Establish`: install the channel in the channel table
#[derive(Debug)]
pub enum HandshakeAction {
    /// Send this envelope
    Send(Envelope),
    /// Install this channel
    Establish(Establishment),
}

/// Result of processing a key package or welcome.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Negotiation that handled the input
    pub negotiation: NegotiationId,
    /// Peer inbox
    pub peer: Address,
    /// Group address
    pub group: Address,
    /// True if the input was already processed; `actions` is then empty
    pub replayed: bool,
    /// Actions for the driver
    pub actions: Vec<HandshakeAction>,
}

#[derive(Debug, Clone, Copy)]
struct Settled {
    negotiation: NegotiationId,
    peer: Address,
    group: Address,
    /// Replays are answered until this expiry
    expires: u64,
}

/// Handshake state machine for every inbox of one account.
#[derive(Debug, Default)]
pub struct Handshake {
    next_id: u64,
    negotiations: HashMap<NegotiationId, Negotiation>,
    awaiting_welcome: HashMap<KeyPackageRef, NegotiationId>,
    awaiting_key_package: HashMap<(Address, Address), NegotiationId>,
    accepted_welcomes: HashMap<WelcomeId, Settled>,
    consumed_key_packages: HashMap<KeyPackageRef, Settled>,
    applied_commits: HashMap<WelcomeId, u64>,
}

impl Handshake {
    /// Empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Negotiation by id.
    pub fn negotiation(&self, id: NegotiationId) -> Option<&Negotiation> {
        self.negotiations.get(&id)
    }

    /// Negotiation waiting for a welcome to `key_package_ref`.
    pub fn awaiting(&self, key_package_ref: &KeyPackageRef) -> Option<&Negotiation> {
        self.awaiting_welcome.get(key_package_ref).and_then(|id| self.negotiations.get(id))
    }

    fn create(
        &mut self,
        role: ChannelRole,
        local: Address,
        peer: Option<Address>,
        key_package_ref: Option<KeyPackageRef>,
        expires: u64,
    ) -> NegotiationId {
        self.next_id += 1;
        let id = NegotiationId(self.next_id);
        self.negotiations.insert(
            id,
            Negotiation {
                id,
                role,
                state: NegotiationState::Idle,
                local,
                peer,
                key_package_ref,
                expires,
                group: None,
            },
        );
        id
    }

    fn get_mut(&mut self, id: NegotiationId) -> Result<&mut Negotiation, HandshakeError> {
        self.negotiations.get_mut(&id).ok_or(HandshakeError::InvalidState {
            state: NegotiationState::Idle,
            operation: "look up negotiation",
        })
    }

    /// Offer a key package through an out-of-band channel.
    ///
    /// Generates a key package for `inbox` and waits for a welcome to it.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::Expired` if `expires` is not in the future
    /// - `HandshakeError::KeyStore` if `inbox` is unknown or the key package
    ///   budget is exhausted
    pub fn begin_out_of_band<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        inbox: Address,
        expires: u64,
        now_secs: u64,
    ) -> Result<(NegotiationId, KeyPackage), HandshakeError> {
        let (id, key_package) = self.offer(keystore, inbox, None, expires, now_secs)?;
        tracing::info!(negotiation = %id, %inbox, expires, "out-of-band negotiation started");
        Ok((id, key_package))
    }

    /// Offer a key package to a known peer through the relay.
    ///
    /// Returns the negotiation, the reference of the offered key package and
    /// the envelope carrying it.
    ///
    /// # Errors
    ///
    /// Same as [`Handshake::begin_out_of_band`].
    pub fn begin_in_band<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        inbox: Address,
        peer: Address,
        expires: u64,
        now_secs: u64,
    ) -> Result<(NegotiationId, KeyPackageRef, Vec<HandshakeAction>), HandshakeError> {
        let (id, key_package) = self.offer(keystore, inbox, Some(peer), expires, now_secs)?;
        let reference = key_package.reference();
        let envelope = Payload::KeyPackage(key_package).into_envelope(inbox, peer)?;

        tracing::info!(negotiation = %id, %inbox, %peer, expires, "in-band negotiation started");
        Ok((id, reference, vec![HandshakeAction::Send(envelope)]))
    }

    /// Resume waiting for welcomes to key packages generated before a
    /// restart.
    ///
    /// Every unexpired secret in the key store that no negotiation tracks
    /// gets an initiator negotiation awaiting its welcome. The original peer
    /// is not stored, so a welcome from any sender is accepted.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::KeyStore` if the stored secrets cannot be read
    pub fn restore<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &KeyStore<S, E>,
        now_secs: u64,
    ) -> Result<Vec<NegotiationId>, HandshakeError> {
        let mut restored = Vec::new();
        for (reference, owner, expires) in keystore.pending_key_packages()? {
            if expires <= now_secs || self.awaiting_welcome.contains_key(&reference) || !keystore.has_inbox(&owner) {
                continue;
            }
            let id = self.create(ChannelRole::Initiator, owner, None, Some(reference), expires);
            self.get_mut(id)?.transition(NegotiationState::AwaitingWelcome, "restore key package")?;
            self.awaiting_welcome.insert(reference, id);
            restored.push(id);
        }

        if !restored.is_empty() {
            tracing::info!(count = restored.len(), "negotiations restored from stored key packages");
        }
        Ok(restored)
    }

    fn offer<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        inbox: Address,
        peer: Option<Address>,
        expires: u64,
        now_secs: u64,
    ) -> Result<(NegotiationId, KeyPackage), HandshakeError> {
        if expires <= now_secs {
            return Err(HandshakeError::Expired { expires });
        }

        let key_package = keystore.generate_key_package(&inbox, expires)?;
        let reference = key_package.reference();

        let id = self.create(ChannelRole::Initiator, inbox, peer, Some(reference), expires);
        self.get_mut(id)?.transition(NegotiationState::AwaitingWelcome, "offer key package")?;
        self.awaiting_welcome.insert(reference, id);
        Ok((id, key_package))
    }

    /// Expect `peer` to offer a key package to `inbox` before `expires`.
    ///
    /// The key package is handled by [`Handshake::on_key_package`], which
    /// completes this negotiation instead of starting a new one. Waiting
    /// twice for the same pair returns the existing negotiation.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::Expired` if `expires` is not in the future
    /// - `HandshakeError::Misaddressed` if `inbox` is not a live inbox
    pub fn await_key_package<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &KeyStore<S, E>,
        inbox: Address,
        peer: Address,
        expires: u64,
        now_secs: u64,
    ) -> Result<NegotiationId, HandshakeError> {
        if expires <= now_secs {
            return Err(HandshakeError::Expired { expires });
        }
        if !keystore.has_inbox(&inbox) {
            return Err(HandshakeError::Misaddressed(inbox));
        }
        if let Some(id) = self.awaiting_key_package.get(&(inbox, peer)) {
            return Ok(*id);
        }

        let id = self.create(ChannelRole::Responder, inbox, Some(peer), None, expires);
        self.get_mut(id)?.transition(NegotiationState::AwaitingKeyPackage, "await key package")?;
        self.awaiting_key_package.insert((inbox, peer), id);

        tracing::debug!(negotiation = %id, %inbox, %peer, expires, "awaiting key package");
        Ok(id)
    }

    /// Consume a peer's key package and open a channel as responder.
    ///
    /// On success the actions are, in order: send Welcome, send Commit,
    /// install the channel. The welcome goes first so the initiator holds the
    /// channel before anything encrypted under it arrives.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidSignature` if the key package is not signed
    ///   by its owner
    /// - `HandshakeError::Expired` if the key package has expired
    /// - `HandshakeError::Misaddressed` if `local` is not a live inbox
    pub fn on_key_package<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        local: Address,
        key_package: &KeyPackage,
        now_secs: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let reference = key_package.reference();
        if let Some(settled) = self.consumed_key_packages.get(&reference) {
            tracing::debug!(%reference, "key package already consumed, returning previous result");
            return Ok(replayed(*settled));
        }

        let owner = key_package.owner;
        if !crypto::verify(&owner, &key_package.to_be_signed(), &key_package.signature) {
            return Err(HandshakeError::InvalidSignature { signer: owner });
        }
        if !keystore.has_inbox(&local) {
            return Err(HandshakeError::Misaddressed(local));
        }

        let id = if let Some(id) = self.awaiting_key_package.remove(&(local, owner)) {
            self.get_mut(id)?.key_package_ref = Some(reference);
            id
        } else {
            let id = self.create(ChannelRole::Responder, local, Some(owner), Some(reference), key_package.expires);
            self.get_mut(id)?.transition(NegotiationState::AwaitingKeyPackage, "receive key package")?;
            id
        };

        match self.respond(keystore, id, key_package, now_secs) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::warn!(negotiation = %id, %owner, error = %err, "key package rejected");
                self.get_mut(id)?.transition(NegotiationState::Failed, "reject key package")?;
                Err(err)
            },
        }
    }

    fn respond<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        id: NegotiationId,
        key_package: &KeyPackage,
        now_secs: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if key_package.is_expired(now_secs) {
            return Err(HandshakeError::Expired { expires: key_package.expires });
        }

        let local = self.get_mut(id)?.local;
        let owner = key_package.owner;
        let reference = key_package.reference();

        let ephemeral = keystore.ephemeral_secret();
        let (key, group) =
            crypto::derive_channel(&ephemeral, &key_package.init_key, &reference, &owner, &local)
                .map_err(|_| HandshakeError::KeyAgreement("non-contributory init key".to_string()))?;

        let mut welcome = Welcome {
            from: local,
            to: owner,
            key_package_ref: reference,
            init_key: crypto::x25519_public(&ephemeral),
            signature: Vec::new(),
        };
        welcome.signature = keystore.sign(&local, &welcome.to_be_signed())?;

        let mut commit = CommitData {
            group,
            epoch: INITIAL_EPOCH,
            commit: welcome.id().as_bytes().to_vec(),
            signature: Vec::new(),
        };
        commit.signature = keystore.sign(&local, &commit.to_be_signed())?;

        let welcome_envelope = Payload::Welcome(welcome).into_envelope(local, owner)?;
        let commit_envelope = Payload::Commit(commit).into_envelope(local, owner)?;

        let negotiation = self.get_mut(id)?;
        negotiation.transition(NegotiationState::Established, "send welcome")?;
        negotiation.group = Some(group);
        let expires = negotiation.expires.max(key_package.expires);

        let settled = Settled { negotiation: id, peer: owner, group, expires };
        self.consumed_key_packages.insert(reference, settled);

        tracing::info!(negotiation = %id, peer = %owner, %group, "channel established as responder");
        Ok(HandshakeOutcome {
            negotiation: id,
            peer: owner,
            group,
            replayed: false,
            actions: vec![
                HandshakeAction::Send(welcome_envelope),
                HandshakeAction::Send(commit_envelope),
                HandshakeAction::Establish(Establishment {
                    negotiation: id,
                    local,
                    peer: owner,
                    group,
                    role: ChannelRole::Responder,
                    key,
                }),
            ],
        })
    }

    /// Accept a welcome to one of our key packages.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::Misaddressed` if `welcome.to` is not a live inbox
    /// - `HandshakeError::InvalidSignature` if the sender did not sign it
    /// - `HandshakeError::UnmatchedWelcome` if no negotiation awaits a welcome
    ///   to the referenced key package
    /// - `HandshakeError::Expired` if the negotiation expired; it moves to
    ///   Failed and the key package secret is destroyed
    pub fn on_welcome<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        welcome: &Welcome,
        now_secs: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let welcome_id = welcome.id();
        if let Some(settled) = self.accepted_welcomes.get(&welcome_id) {
            tracing::debug!(welcome = %welcome_id, "duplicate welcome, returning previous result");
            return Ok(replayed(*settled));
        }

        if !keystore.has_inbox(&welcome.to) {
            return Err(HandshakeError::Misaddressed(welcome.to));
        }
        if !crypto::verify(&welcome.from, &welcome.to_be_signed(), &welcome.signature) {
            return Err(HandshakeError::InvalidSignature { signer: welcome.from });
        }

        let reference = welcome.key_package_ref;
        let id = *self.awaiting_welcome.get(&reference).ok_or(HandshakeError::UnmatchedWelcome(reference))?;
        let negotiation = self.get_mut(id)?;

        let peer_matches = negotiation.peer.is_none_or(|peer| peer == welcome.from);
        if negotiation.local != welcome.to || !peer_matches {
            return Err(HandshakeError::UnmatchedWelcome(reference));
        }

        if now_secs >= negotiation.expires {
            let expires = negotiation.expires;
            negotiation.transition(NegotiationState::Failed, "accept expired welcome")?;
            let abandoned = Abandoned::from(&*negotiation);
            self.release(keystore, &abandoned);
            tracing::warn!(negotiation = %id, "welcome arrived after negotiation expired");
            return Err(HandshakeError::Expired { expires });
        }

        let secret = keystore.take_key_package(&reference).map_err(|err| match err {
            KeyStoreError::UnknownKeyPackage(r) => HandshakeError::UnmatchedWelcome(r),
            other => HandshakeError::KeyStore(other),
        })?;
        let (key, group) =
            crypto::derive_channel(&secret.secret, &welcome.init_key, &reference, &welcome.to, &welcome.from)
                .map_err(|_| HandshakeError::KeyAgreement("non-contributory ephemeral key".to_string()))?;

        let negotiation = self.get_mut(id)?;
        negotiation.transition(NegotiationState::Established, "accept welcome")?;
        negotiation.peer = Some(welcome.from);
        negotiation.group = Some(group);
        let (local, expires) = (negotiation.local, negotiation.expires);

        self.awaiting_welcome.remove(&reference);
        let settled = Settled { negotiation: id, peer: welcome.from, group, expires };
        self.accepted_welcomes.insert(welcome_id, settled);

        tracing::info!(negotiation = %id, peer = %welcome.from, %group, "channel established as initiator");
        Ok(HandshakeOutcome {
            negotiation: id,
            peer: welcome.from,
            group,
            replayed: false,
            actions: vec![HandshakeAction::Establish(Establishment {
                negotiation: id,
                local,
                peer: welcome.from,
                group,
                role: ChannelRole::Initiator,
                key,
            })],
        })
    }

    /// Apply a commit from `sender`. Returns false if it was already applied.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidSignature` if `sender` did not sign it
    /// - `HandshakeError::UnknownGroup` if no established negotiation with
    ///   `sender` owns the group
    pub fn on_commit(&mut self, sender: Address, commit: &CommitData) -> Result<bool, HandshakeError> {
        if !crypto::verify(&sender, &commit.to_be_signed(), &commit.signature) {
            return Err(HandshakeError::InvalidSignature { signer: sender });
        }

        let expires = self
            .negotiations
            .values()
            .find(|n| {
                n.state == NegotiationState::Established
                    && n.group == Some(commit.group)
                    && n.peer == Some(sender)
            })
            .map(Negotiation::expires)
            .ok_or(HandshakeError::UnknownGroup(commit.group))?;

        let fresh = self.applied_commits.insert(commit.id(), expires).is_none();
        if fresh {
            tracing::debug!(group = %commit.group, epoch = commit.epoch, "commit applied");
        }
        Ok(fresh)
    }

    /// Check a proposal from `sender`.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidSignature` if `sender` did not sign it
    pub fn on_proposal(&self, sender: Address, proposal: &ProposalData) -> Result<(), HandshakeError> {
        if !crypto::verify(&sender, &proposal.to_be_signed(), &proposal.signature) {
            return Err(HandshakeError::InvalidSignature { signer: sender });
        }
        Ok(())
    }

    /// Abandon a negotiation. Returns it if it was still in progress.
    ///
    /// The key package secret is destroyed, so a later welcome is unmatched.
    /// A secret the backend fails to destroy is left to the key store's
    /// expiry sweep.
    pub fn cancel<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        id: NegotiationId,
    ) -> Option<Abandoned> {
        let negotiation = self.negotiations.get_mut(&id)?;
        negotiation.transition(NegotiationState::Failed, "cancel").ok()?;
        let abandoned = Abandoned::from(&*negotiation);
        self.release(keystore, &abandoned);

        tracing::debug!(negotiation = %id, "negotiation cancelled");
        Some(abandoned)
    }

    /// Fail every in-progress negotiation expired at `now_secs` and prune
    /// what earlier sweeps left behind.
    ///
    /// Negotiations that already were terminal and expired are dropped along
    /// with their replay records. Negotiations failed by this call stay
    /// visible until the next one.
    pub fn expire<S: KeyStorage, E: Environment>(
        &mut self,
        keystore: &mut KeyStore<S, E>,
        now_secs: u64,
    ) -> Vec<Abandoned> {
        self.prune(now_secs);

        let mut expired = Vec::new();
        for negotiation in self.negotiations.values_mut() {
            if now_secs < negotiation.expires {
                continue;
            }
            if negotiation.transition(NegotiationState::Failed, "expire").is_ok() {
                expired.push(Abandoned::from(&*negotiation));
            }
        }
        for abandoned in &expired {
            self.release(keystore, abandoned);
        }

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "negotiations expired");
        }
        expired
    }

    fn prune(&mut self, now_secs: u64) {
        let before = self.negotiations.len();
        self.negotiations.retain(|_, n| !n.state.is_terminal() || now_secs < n.expires);
        self.accepted_welcomes.retain(|_, settled| now_secs < settled.expires);
        self.consumed_key_packages.retain(|_, settled| now_secs < settled.expires);
        self.applied_commits.retain(|_, expires| now_secs < *expires);

        let pruned = before - self.negotiations.len();
        if pruned > 0 {
            tracing::trace!(pruned, "settled negotiations pruned");
        }
    }

    /// Drop the lookups of a failed negotiation and destroy its secret.
    fn release<S: KeyStorage, E: Environment>(&mut self, keystore: &mut KeyStore<S, E>, abandoned: &Abandoned) {
        self.awaiting_key_package.retain(|_, waiting| *waiting != abandoned.negotiation);
        let (Some(reference), ChannelRole::Initiator) = (abandoned.key_package_ref, abandoned.role) else {
            return;
        };
        self.awaiting_welcome.remove(&reference);
        if let Err(err) = keystore.discard_key_package(&reference) {
            tracing::warn!(negotiation = %abandoned.negotiation, %reference, error = %err, "key package secret left for the expiry sweep");
        }
    }
}

fn replayed(settled: Settled) -> HandshakeOutcome {
    HandshakeOutcome {
        negotiation: settled.negotiation,
        peer: settled.peer,
        group: settled.group,
        replayed: true,
        actions: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use tether_proto::EnvelopeKind;

    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::{
        env::test_utils::MockEnv,
        keystore::{MemoryKeyStorage, StorageError},
    };

    fn ids(abandoned: &[Abandoned]) -> Vec<NegotiationId> {
        abandoned.iter().map(|a| a.negotiation).collect()
    }

    type Store = KeyStore<MemoryKeyStorage, MockEnv>;

    struct Side {
        env: MockEnv,
        store: Store,
        handshake: Handshake,
        inbox: Address,
    }

    fn side(seed: u64) -> Side {
        let env = MockEnv::with_seed(seed);
        let mut store = KeyStore::open(env.clone(), MemoryKeyStorage::new(), [seed as u8; 32], 8).unwrap();
        let inbox = store.open_inbox(0).unwrap();
        Side { env, store, handshake: Handshake::new(), inbox }
    }

    impl Side {
        fn now(&self) -> u64 {
            self.env.wall_clock_secs()
        }
    }

    fn envelopes(actions: &[HandshakeAction]) -> Vec<&Envelope> {
        actions
            .iter()
            .filter_map(|a| match a {
                HandshakeAction::Send(envelope) => Some(envelope),
                HandshakeAction::Establish(_) => None,
            })
            .collect()
    }

    fn welcome_from(actions: &[HandshakeAction]) -> Welcome {
        let envelope = envelopes(actions)
            .into_iter()
            .find(|e| e.kind == EnvelopeKind::Welcome)
            .expect("welcome envelope");
        match Payload::from_envelope(envelope).unwrap() {
            Payload::Welcome(welcome) => welcome,
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    fn commit_from(actions: &[HandshakeAction]) -> CommitData {
        let envelope = envelopes(actions)
            .into_iter()
            .find(|e| e.kind == EnvelopeKind::Commit)
            .expect("commit envelope");
        match Payload::from_envelope(envelope).unwrap() {
            Payload::Commit(commit) => commit,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    fn establish(outcome: HandshakeOutcome) -> Channel {
        outcome
            .actions
            .into_iter()
            .find_map(|a| match a {
                HandshakeAction::Establish(e) => Some(e.into_channel()),
                HandshakeAction::Send(_) => None,
            })
            .expect("establish action")
    }

    #[test]
    fn out_of_band_negotiation_establishes_both_sides() {
        let mut alice = side(1);
        let mut bob = side(2);

        let (id, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();
        assert_eq!(alice.handshake.negotiation(id).unwrap().state(), NegotiationState::AwaitingWelcome);

        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        assert!(!responded.replayed);
        assert_eq!(responded.peer, alice.inbox);

        let kinds: Vec<_> = envelopes(&responded.actions).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Welcome, EnvelopeKind::Commit]);

        let welcome = welcome_from(&responded.actions);
        let commit = commit_from(&responded.actions);
        let bob_group = responded.group;
        let bob_channel = establish(responded);

        let now = alice.now();
        let accepted = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();
        assert_eq!(accepted.group, bob_group);
        assert_eq!(accepted.peer, bob.inbox);
        assert_eq!(alice.handshake.negotiation(id).unwrap().state(), NegotiationState::Established);

        let alice_channel = establish(accepted);
        assert_eq!(alice_channel.state(), ChannelState::Established);
        assert_eq!(
            alice_channel.key().unwrap().as_bytes(),
            bob_channel.key().unwrap().as_bytes()
        );

        assert!(alice.handshake.on_commit(bob.inbox, &commit).unwrap());
        assert!(!alice.handshake.on_commit(bob.inbox, &commit).unwrap());
    }

    #[test]
    fn duplicate_welcome_returns_previous_result() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();
        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);

        let now = alice.now();
        let first = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();
        let second = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();

        assert!(second.replayed);
        assert!(second.actions.is_empty());
        assert_eq!(second.group, first.group);
    }

    #[test]
    fn duplicate_key_package_returns_previous_result() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();

        let now = bob.now();
        let first = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let second = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        assert!(second.replayed);
        assert_eq!(second.group, first.group);
    }

    #[test]
    fn welcome_for_unknown_key_package_is_unmatched() {
        let mut alice = side(1);
        let mut bob = side(2);
        let mut carol = side(3);

        // carol's key package answered by bob, delivered to alice
        let (_, kp) = carol
            .handshake
            .begin_out_of_band(&mut carol.store, carol.inbox, carol.env.wall_clock_secs() + 3600, carol.env.wall_clock_secs())
            .unwrap();
        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let mut welcome = welcome_from(&responded.actions);
        welcome.to = alice.inbox;
        welcome.signature = bob.store.sign(&bob.inbox, &welcome.to_be_signed()).unwrap();

        let now = alice.now();
        let err = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap_err();
        assert_eq!(err, HandshakeError::UnmatchedWelcome(kp.reference()));
    }

    #[test]
    fn misaddressed_welcome_is_rejected() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();
        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);

        let mut stranger = side(4);
        let now = stranger.now();
        assert_eq!(
            stranger.handshake.on_welcome(&mut stranger.store, &welcome, now).unwrap_err(),
            HandshakeError::Misaddressed(alice.inbox)
        );
    }

    #[test]
    fn forged_welcome_is_rejected() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();
        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let mut welcome = welcome_from(&responded.actions);
        welcome.init_key = [5; 32];

        let now = alice.now();
        assert!(matches!(
            alice.handshake.on_welcome(&mut alice.store, &welcome, now),
            Err(HandshakeError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn expired_key_package_fails_negotiation() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 10, alice.env.wall_clock_secs())
            .unwrap();

        bob.env.advance(10);
        let now = bob.now();
        let err = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap_err();
        assert_eq!(err, HandshakeError::Expired { expires: kp.expires });

        let failed = bob.handshake.negotiations.values().all(|n| n.state() == NegotiationState::Failed);
        assert!(failed);
    }

    #[test]
    fn welcome_after_expiry_fails_and_destroys_secret() {
        let mut alice = side(1);
        let mut bob = side(2);
        let (id, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 10, alice.env.wall_clock_secs())
            .unwrap();
        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);

        alice.env.advance(10);
        let now = alice.now();
        assert!(matches!(
            alice.handshake.on_welcome(&mut alice.store, &welcome, now),
            Err(HandshakeError::Expired { .. })
        ));
        assert_eq!(alice.handshake.negotiation(id).unwrap().state(), NegotiationState::Failed);
        assert!(alice.store.take_key_package(&kp.reference()).is_err());
    }

    #[test]
    fn awaited_key_package_completes_waiting_negotiation() {
        let mut alice = side(1);
        let mut bob = side(2);
        let now = bob.now();
        let waiting = bob.handshake.await_key_package(&bob.store, bob.inbox, alice.inbox, now + 60, now).unwrap();
        assert_eq!(bob.handshake.await_key_package(&bob.store, bob.inbox, alice.inbox, now + 60, now), Ok(waiting));
        assert_eq!(bob.handshake.negotiation(waiting).unwrap().state(), NegotiationState::AwaitingKeyPackage);
        assert_eq!(bob.handshake.negotiation(waiting).unwrap().key_package_ref(), None);

        let (_, kp) = alice
            .handshake
            .begin_out_of_band(&mut alice.store, alice.inbox, alice.env.wall_clock_secs() + 3600, alice.env.wall_clock_secs())
            .unwrap();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();

        assert_eq!(responded.negotiation, waiting);
        let negotiation = bob.handshake.negotiation(waiting).unwrap();
        assert_eq!(negotiation.state(), NegotiationState::Established);
        assert_eq!(negotiation.key_package_ref(), Some(kp.reference()));
    }

    #[test]
    fn awaited_key_package_expires() {
        let mut bob = side(2);
        let peer = Address::from_bytes([7; 32]);
        let now = bob.now();
        let waiting = bob.handshake.await_key_package(&bob.store, bob.inbox, peer, now + 10, now).unwrap();

        let expired = bob.handshake.expire(&mut bob.store, now + 10);
        assert_eq!(ids(&expired), vec![waiting]);
        assert_eq!(expired[0].peer, Some(peer));
        assert_eq!(expired[0].key_package_ref, None);
        assert_eq!(bob.handshake.negotiation(waiting).unwrap().state(), NegotiationState::Failed);

        let again = bob.handshake.await_key_package(&bob.store, bob.inbox, peer, now + 60, now + 10).unwrap();
        assert_ne!(again, waiting);
    }

    #[test]
    fn awaiting_on_unknown_inbox_is_misaddressed() {
        let mut bob = side(2);
        let stranger = Address::from_bytes([9; 32]);
        let now = bob.now();
        assert_eq!(
            bob.handshake.await_key_package(&bob.store, stranger, Address::from_bytes([7; 32]), now + 60, now),
            Err(HandshakeError::Misaddressed(stranger))
        );
    }

    #[test]
    fn in_band_offer_sends_key_package_to_peer() {
        let mut alice = side(1);
        let peer = Address::from_bytes([7; 32]);
        let now = alice.now();
        let (id, reference, actions) =
            alice.handshake.begin_in_band(&mut alice.store, alice.inbox, peer, now + 60, now).unwrap();

        let sent = envelopes(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::KeyPackage);
        assert_eq!(sent[0].to, peer);

        let Payload::KeyPackage(kp) = Payload::from_envelope(sent[0]).unwrap() else {
            panic!("expected key package");
        };
        assert_eq!(kp.reference(), reference);
        assert_eq!(alice.handshake.awaiting(&reference).map(Negotiation::id), Some(id));
    }

    #[test]
    fn in_band_welcome_from_other_peer_is_unmatched() {
        let mut alice = side(1);
        let mut bob = side(2);
        let expected = Address::from_bytes([7; 32]);
        let now = alice.now();
        let (_, _, actions) =
            alice.handshake.begin_in_band(&mut alice.store, alice.inbox, expected, now + 60, now).unwrap();
        let Payload::KeyPackage(kp) = Payload::from_envelope(envelopes(&actions)[0]).unwrap() else {
            panic!("expected key package");
        };

        let now = bob.now();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);

        let now = alice.now();
        assert_eq!(
            alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap_err(),
            HandshakeError::UnmatchedWelcome(kp.reference())
        );
    }

    #[test]
    fn cancel_and_expire_fail_in_progress_negotiations() {
        let mut alice = side(1);
        let now = alice.now();
        let (a, _) = alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 10, now).unwrap();
        let (b, _) = alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 3600, now).unwrap();

        let cancelled = alice.handshake.cancel(&mut alice.store, b).unwrap();
        assert_eq!(cancelled.negotiation, b);
        assert_eq!(cancelled.local, alice.inbox);
        assert!(alice.handshake.cancel(&mut alice.store, b).is_none());

        assert_eq!(ids(&alice.handshake.expire(&mut alice.store, now + 10)), vec![a]);
        assert_eq!(alice.handshake.negotiation(a).unwrap().state(), NegotiationState::Failed);
        assert_eq!(alice.handshake.negotiation(b).unwrap().state(), NegotiationState::Failed);
    }

    #[derive(Clone, Default)]
    struct FailingStorage {
        inner: MemoryKeyStorage,
        failing: Arc<AtomicBool>,
    }

    impl KeyStorage for FailingStorage {
        fn put_inbox(&self, address: &Address, sealed: &[u8]) -> Result<(), StorageError> {
            self.inner.put_inbox(address, sealed)
        }

        fn load_inboxes(&self) -> Result<Vec<(Address, Vec<u8>)>, StorageError> {
            self.inner.load_inboxes()
        }

        fn put_key_package(&self, reference: &KeyPackageRef, sealed: &[u8]) -> Result<(), StorageError> {
            self.inner.put_key_package(reference, sealed)
        }

        fn take_key_package(&self, reference: &KeyPackageRef) -> Result<Option<Vec<u8>>, StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io("disk full".to_string()));
            }
            self.inner.take_key_package(reference)
        }

        fn load_key_packages(&self) -> Result<Vec<(KeyPackageRef, Vec<u8>)>, StorageError> {
            self.inner.load_key_packages()
        }

        fn key_package_count(&self) -> Result<usize, StorageError> {
            self.inner.key_package_count()
        }
    }

    #[test]
    fn storage_failure_still_reports_every_abandoned_negotiation() {
        let env = MockEnv::with_seed(1);
        let storage = FailingStorage::default();
        let mut store = KeyStore::open(env.clone(), storage.clone(), [1; 32], 8).unwrap();
        let inbox = store.open_inbox(0).unwrap();
        let mut handshake = Handshake::new();
        let now = env.wall_clock_secs();
        let (a, _) = handshake.begin_out_of_band(&mut store, inbox, now + 10, now).unwrap();
        let (b, _) = handshake.begin_out_of_band(&mut store, inbox, now + 10, now).unwrap();
        let (c, kp) = handshake.begin_out_of_band(&mut store, inbox, now + 3600, now).unwrap();

        storage.failing.store(true, Ordering::SeqCst);
        assert_eq!(handshake.cancel(&mut store, c).map(|x| x.negotiation), Some(c));
        assert!(handshake.awaiting(&kp.reference()).is_none());

        let mut expired = ids(&handshake.expire(&mut store, now + 10));
        expired.sort();
        assert_eq!(expired, vec![a, b]);
        assert_eq!(handshake.negotiation(a).unwrap().state(), NegotiationState::Failed);
        assert_eq!(handshake.negotiation(b).unwrap().state(), NegotiationState::Failed);

        // leftover secrets go once the backend recovers
        storage.failing.store(false, Ordering::SeqCst);
        assert_eq!(store.sweep_key_packages(now + 10).unwrap().len(), 2);
        assert_eq!(store.sweep_key_packages(now + 3600).unwrap(), vec![kp.reference()]);
    }

    #[test]
    fn sweeps_prune_settled_negotiations_and_replay_records() {
        let mut alice = side(1);
        let mut bob = side(2);
        let now = alice.now();
        let (established, kp) =
            alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 60, now).unwrap();
        let (stale, _) = alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 60, now).unwrap();

        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);
        let commit = commit_from(&responded.actions);
        alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();
        assert!(alice.handshake.on_commit(bob.inbox, &commit).unwrap());

        let later = now + 60;
        assert_eq!(ids(&alice.handshake.expire(&mut alice.store, later)), vec![stale]);
        assert!(alice.handshake.negotiation(established).is_none());
        assert_eq!(alice.handshake.negotiation(stale).unwrap().state(), NegotiationState::Failed);
        assert!(alice.handshake.accepted_welcomes.is_empty());
        assert!(alice.handshake.applied_commits.is_empty());

        assert!(alice.handshake.expire(&mut alice.store, later).is_empty());
        assert!(alice.handshake.negotiations.is_empty());
        assert!(alice.handshake.awaiting_welcome.is_empty());

        assert!(bob.handshake.expire(&mut bob.store, later).is_empty());
        assert!(bob.handshake.negotiations.is_empty());
        assert!(bob.handshake.consumed_key_packages.is_empty());
    }

    #[test]
    fn restored_negotiation_accepts_welcome_after_restart() {
        let env = MockEnv::with_seed(1);
        let storage = MemoryKeyStorage::new();
        let mut store = KeyStore::open(env.clone(), storage.clone(), [1; 32], 8).unwrap();
        let inbox = store.open_inbox(0).unwrap();
        let now = env.wall_clock_secs();
        let (_, kp) = Handshake::new().begin_out_of_band(&mut store, inbox, now + 3600, now).unwrap();
        drop(store);

        let mut store = KeyStore::open(env.clone(), storage, [1; 32], 8).unwrap();
        let mut handshake = Handshake::new();
        let restored = handshake.restore(&store, now).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(handshake.restore(&store, now).unwrap().is_empty());
        let negotiation = handshake.awaiting(&kp.reference()).unwrap();
        assert_eq!(negotiation.local(), inbox);
        assert_eq!(negotiation.peer(), None);

        let mut bob = side(2);
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);
        let accepted = handshake.on_welcome(&mut store, &welcome, now).unwrap();
        assert_eq!(accepted.peer, bob.inbox);
        assert_eq!(accepted.group, responded.group);
    }

    #[test]
    fn install_establishes_pending_channel_in_place() {
        let mut alice = side(1);
        let mut bob = side(2);
        let now = alice.now();
        let (_, _, actions) =
            alice.handshake.begin_in_band(&mut alice.store, alice.inbox, bob.inbox, now + 60, now).unwrap();
        let Payload::KeyPackage(kp) = Payload::from_envelope(envelopes(&actions)[0]).unwrap() else {
            panic!("expected key package");
        };

        let mut channels = HashMap::new();
        channels.insert(bob.inbox, Channel::pending(alice.inbox, bob.inbox, ChannelRole::Initiator));

        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);
        let accepted = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();
        let group = accepted.group;
        for action in accepted.actions {
            if let HandshakeAction::Establish(establishment) = action {
                establishment.install(&mut channels).unwrap();
            }
        }
        assert_eq!(channels[&bob.inbox].state(), ChannelState::Established);
        assert_eq!(channels[&bob.inbox].group(), Some(group));
    }

    #[test]
    fn install_never_reopens_closed_channel() {
        let mut alice = side(1);
        let mut bob = side(2);
        let now = alice.now();
        let (_, kp) = alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 60, now).unwrap();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let group = responded.group;
        let establishment = responded
            .actions
            .into_iter()
            .find_map(|a| match a {
                HandshakeAction::Establish(e) => Some(e),
                HandshakeAction::Send(_) => None,
            })
            .unwrap();

        let mut closed = Channel::pending(bob.inbox, alice.inbox, ChannelRole::Responder);
        closed.close();
        let mut channels = HashMap::from([(alice.inbox, closed)]);
        assert_eq!(
            establishment.install(&mut channels),
            Err(BackwardTransition { from: ChannelState::Closed, to: ChannelState::Established })
        );
        assert_eq!(channels[&alice.inbox].state(), ChannelState::Closed);
        assert_ne!(channels[&alice.inbox].group(), Some(group));
    }

    #[test]
    fn install_keeps_channel_of_same_group() {
        let mut alice = side(1);
        let mut bob = side(2);
        let now = alice.now();
        let (_, kp) = alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now + 60, now).unwrap();
        let responded = bob.handshake.on_key_package(&mut bob.store, bob.inbox, &kp, now).unwrap();
        let welcome = welcome_from(&responded.actions);

        let accepted = alice.handshake.on_welcome(&mut alice.store, &welcome, now).unwrap();
        let mut installed = establish(accepted);
        installed.next_send_sequence();
        let mut channels = HashMap::from([(bob.inbox, installed)]);

        // same group again
        let (key, group) = {
            let channel = &channels[&bob.inbox];
            (channel.key().unwrap().clone(), channel.group().unwrap())
        };
        Establishment {
            negotiation: NegotiationId(99),
            local: alice.inbox,
            peer: bob.inbox,
            group,
            role: ChannelRole::Initiator,
            key,
        }
        .install(&mut channels)
        .unwrap();
        assert_eq!(channels.get_mut(&bob.inbox).unwrap().next_send_sequence(), 2);
    }

    #[test]
    fn offer_in_the_past_is_rejected() {
        let mut alice = side(1);
        let now = alice.now();
        assert_eq!(
            alice.handshake.begin_out_of_band(&mut alice.store, alice.inbox, now, now).unwrap_err(),
            HandshakeError::Expired { expires: now }
        );
    }

    #[test]
    fn commit_for_unknown_group_is_rejected() {
        let mut alice = side(1);
        let bob = side(2);
        let mut commit = CommitData {
            group: Address::from_bytes([1; 32]),
            epoch: INITIAL_EPOCH,
            commit: vec![],
            signature: vec![],
        };
        commit.signature = bob.store.sign(&bob.inbox, &commit.to_be_signed()).unwrap();
        assert_eq!(
            alice.handshake.on_commit(bob.inbox, &commit).unwrap_err(),
            HandshakeError::UnknownGroup(commit.group)
        );
    }

    #[test]
    fn transitions_follow_the_diagram() {
        use NegotiationState::*;
        assert!(Idle.can_transition(AwaitingWelcome));
        assert!(AwaitingWelcome.can_transition(Established));
        assert!(AwaitingKeyPackage.can_transition(Failed));
        assert!(!Established.can_transition(Failed));
        assert!(!Failed.can_transition(Established));
        assert!(!AwaitingWelcome.can_transition(AwaitingKeyPackage));
        assert!(!Idle.can_transition(Established));
    }
}
