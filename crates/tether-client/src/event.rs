//! Events surfaced to the application.

use tether_core::Message;
use tether_proto::{Address, EnvelopeKind, KeyPackageRef, MessageId, RequestId, Status};

/// Event emitted by an [`crate::Account`] on its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// Transport connected to the relay
    Connected,

    /// Transport lost the relay; channels keep their state
    Disconnected {
        /// Reason reported by the transport
        reason: Option<String>,
    },

    /// A relayed key package opened a channel with us as responder
    ConnectionEstablished {
        /// Completion status
        status: Status,
        /// Initiator inbox
        peer: Address,
        /// Channel group
        group: Address,
    },

    /// A welcome completed one of our negotiations
    ConnectionAccepted {
        /// Completion status
        status: Status,
        /// Responder inbox
        peer: Address,
        /// Channel group
        group: Address,
    },

    /// A negotiation ended without a channel
    ConnectionFailed {
        /// `Expired` or `Cancelled`
        status: Status,
        /// Local inbox
        local: Address,
        /// Peer inbox, if it was known
        peer: Option<Address>,
        /// Key package the negotiation revolved around, if any
        key_package: Option<KeyPackageRef>,
    },

    /// A discovery request was resolved, expired or cancelled
    DiscoveryResolved {
        /// Request id
        request_id: RequestId,
        /// Responder inbox, or the failure status
        result: Result<Address, Status>,
    },

    /// Application message received and acknowledged
    MessageReceived(Message),

    /// Peer acknowledged one of our messages
    Acknowledged {
        /// Message id
        reference: MessageId,
        /// Acknowledging peer
        from: Address,
    },

    /// Peer refused one of our messages, or it was never acknowledged
    /// within the delivery timeout (`Expired`)
    DeliveryFailed {
        /// Message id
        reference: MessageId,
        /// Reported status
        status: Status,
    },

    /// Peer reported an error not tied to any message
    PeerError {
        /// Reporting peer
        from: Address,
        /// Reported status
        status: Status,
        /// Human-readable reason
        message: String,
    },

    /// Group membership proposal from a channel peer
    Proposal {
        /// Proposer
        from: Address,
        /// Group
        group: Address,
    },

    /// Group membership commit applied
    Commit {
        /// Committer
        from: Address,
        /// Group
        group: Address,
        /// New epoch
        epoch: u64,
    },

    /// Inbound envelope discarded by the router
    Dropped {
        /// Envelope kind
        kind: EnvelopeKind,
        /// Sender
        from: Address,
        /// Why it was dropped
        status: Status,
    },
}
