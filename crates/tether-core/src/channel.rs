//! Encrypted channel between two inboxes.
//!
//! # State machine
//!
//! ```text
//! Pending ──establish──> Established ──close──> Closed
//!    └─────────────────close───────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - State never moves backward
//! - An Established channel always has a group address and key
//! - Send sequence numbers strictly increase

use tether_proto::Address;

use crate::crypto::ChannelKey;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    /// Negotiation started, no key yet
    Pending,
    /// Key agreed, messages may flow
    Established,
    /// Torn down, never reopens
    Closed,
}

/// Side of the negotiation this account played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Offered the key package
    Initiator,
    /// Consumed the key package and sent the welcome
    Responder,
}

/// Attempted to move a channel backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackwardTransition {
    /// Current state
    pub from: ChannelState,
    /// Rejected target
    pub to: ChannelState,
}

/// A channel to one peer inbox.
#[derive(Debug)]
pub struct Channel {
    local: Address,
    peer: Address,
    role: ChannelRole,
    state: ChannelState,
    group: Option<Address>,
    key: Option<ChannelKey>,
    send_sequence: u64,
    recv_sequence: Option<u64>,
}

impl Channel {
    /// Channel waiting for its handshake to finish.
    pub fn pending(local: Address, peer: Address, role: ChannelRole) -> Self {
        Self {
            local,
            peer,
            role,
            state: ChannelState::Pending,
            group: None,
            key: None,
            send_sequence: 0,
            recv_sequence: None,
        }
    }

    /// Channel whose key is already agreed.
    pub fn established(local: Address, peer: Address, role: ChannelRole, group: Address, key: ChannelKey) -> Self {
        let mut channel = Self::pending(local, peer, role);
        channel.group = Some(group);
        channel.key = Some(key);
        channel.state = ChannelState::Established;
        channel
    }

    /// Local inbox.
    pub fn local(&self) -> Address {
        self.local
    }

    /// Peer inbox.
    pub fn peer(&self) -> Address {
        self.peer
    }

    /// Role in the negotiation.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Group address, once established.
    pub fn group(&self) -> Option<Address> {
        self.group
    }

    /// True if messages can be sent.
    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }

    pub(crate) fn key(&self) -> Option<&ChannelKey> {
        self.key.as_ref()
    }

    /// Move a Pending channel to Established with the agreed key.
    ///
    /// Establishing an already Established channel replaces nothing and
    /// succeeds only if the group matches (duplicate handshake).
    ///
    /// # Errors
    ///
    /// - `BackwardTransition` if the channel is Closed or already bound to a
    ///   different group
    pub fn establish(&mut self, group: Address, key: ChannelKey) -> Result<(), BackwardTransition> {
        match self.state {
            ChannelState::Pending => {
                self.group = Some(group);
                self.key = Some(key);
                self.state = ChannelState::Established;
                Ok(())
            },
            ChannelState::Established if self.group == Some(group) => Ok(()),
            from => Err(BackwardTransition { from, to: ChannelState::Established }),
        }
    }

    /// Close the channel and drop its key. Idempotent.
    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
        self.key = None;
    }

    pub(crate) fn next_send_sequence(&mut self) -> u64 {
        self.send_sequence += 1;
        self.send_sequence
    }

    pub(crate) fn last_received(&self) -> Option<u64> {
        self.recv_sequence
    }

    pub(crate) fn record_received(&mut self, sequence: u64) {
        self.recv_sequence = Some(sequence);
    }
}
