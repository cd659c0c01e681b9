//! Error types for the Tether core state machines.
//!
//! One enum per component: key store, discovery, handshake and dispatch.
//! Every variant maps onto a wire [`Status`] so failures can be reported to
//! peers and to completion callbacks with the same vocabulary.

use tether_proto::{Address, KeyPackageRef, MessageId, ProtocolError, RequestId, Status};
use thiserror::Error;

use crate::{channel::ChannelState, handshake::NegotiationState, keystore::StorageError};

/// Errors raised by the key store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    /// Outstanding key package budget is used up
    #[error("key material exhausted: {outstanding} outstanding key packages (budget {budget})")]
    KeyExhausted {
        /// Key packages generated and not yet consumed
        outstanding: usize,
        /// Configured budget
        budget: usize,
    },

    /// No identity key exists for this inbox
    #[error("unknown inbox: {0}")]
    UnknownInbox(Address),

    /// Inbox existed but its expiry has passed
    #[error("inbox expired: {0}")]
    InboxExpired(Address),

    /// Key package was never generated here or was already consumed
    #[error("unknown key package: {0}")]
    UnknownKeyPackage(KeyPackageRef),

    /// Stored record could not be unsealed or parsed
    #[error("corrupt key record: {0}")]
    Corrupt(String),

    /// Backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl KeyStoreError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::KeyExhausted { .. } => Status::KeyExhausted,
            Self::UnknownInbox(_) | Self::InboxExpired(_) => Status::Misaddressed,
            Self::UnknownKeyPackage(_) => Status::UnmatchedWelcome,
            Self::Corrupt(_) | Self::Storage(_) => Status::StorageError,
        }
    }

    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// A full budget frees up as key packages are consumed or expire.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::KeyExhausted { .. })
    }
}

/// Errors raised by the discovery engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Response does not correlate with any pending request
    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),

    /// Request has already passed its expiry
    #[error("request expired: {0}")]
    Expired(RequestId),

    /// Id belongs to a request that was already resolved or cancelled
    #[error("request id reused: {0}")]
    RequestIdReused(RequestId),

    /// Encoding or decoding failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl DiscoveryError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownRequest(_) => Status::UnknownRequest,
            Self::Expired(_) => Status::Expired,
            Self::RequestIdReused(_) => Status::RequestIdReused,
            Self::Protocol(_) => Status::InvalidPayload,
        }
    }
}

/// Errors raised by the handshake state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Welcome references a key package with no negotiation awaiting it
    #[error("welcome does not match any pending negotiation: {0}")]
    UnmatchedWelcome(KeyPackageRef),

    /// Message addressed to an inbox this account does not own
    #[error("misaddressed: {0} is not a local inbox")]
    Misaddressed(Address),

    /// Key package or negotiation passed its expiry
    #[error("negotiation expired at {expires}")]
    Expired {
        /// Expiry in Unix seconds
        expires: u64,
    },

    /// Signature did not verify against the claimed sender
    #[error("invalid signature from {signer}")]
    InvalidSignature {
        /// Claimed signer
        signer: Address,
    },

    /// Operation not allowed in the current negotiation state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state
        state: NegotiationState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Commit names a group with no established negotiation
    #[error("unknown group: {0}")]
    UnknownGroup(Address),

    /// Key agreement produced an unusable secret
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// Key store failure
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Encoding failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl HandshakeError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::UnmatchedWelcome(_) => Status::UnmatchedWelcome,
            Self::Misaddressed(_) | Self::UnknownGroup(_) => Status::Misaddressed,
            Self::Expired { .. } => Status::Expired,
            Self::InvalidSignature { .. } | Self::KeyAgreement(_) => Status::InvalidSignature,
            Self::InvalidState { .. } => Status::InvalidState,
            Self::KeyStore(err) => err.status(),
            Self::Protocol(_) => Status::InvalidPayload,
        }
    }

    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KeyStore(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors raised by the message dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No established channel to the peer
    #[error("channel to {peer} not ready (state {state:?})")]
    ChannelNotReady {
        /// Peer inbox
        peer: Address,
        /// Current state, `None` if no channel exists
        state: Option<ChannelState>,
    },

    /// Content type outside the closed set
    #[error("unsupported content type: {0:#06x}")]
    UnsupportedContentType(u16),

    /// Message belongs to a different group than the sender's channel
    #[error("message for group {found} arrived on channel {expected}")]
    WrongGroup {
        /// Group of the channel
        expected: Address,
        /// Group named in the message
        found: Address,
    },

    /// Ciphertext failed authentication
    #[error("decryption failed for message {0}")]
    DecryptionFailed(MessageId),

    /// Message id does not match its content
    #[error("message id mismatch: claimed {claimed}")]
    IdMismatch {
        /// Id carried in the message
        claimed: MessageId,
    },

    /// Sequence number already seen on this channel
    #[error("replayed message: sequence {sequence} <= {last}")]
    Replay {
        /// Sequence carried in the message
        sequence: u64,
        /// Highest sequence seen so far
        last: u64,
    },

    /// Acknowledgement or error for a message we never sent
    #[error("unknown reference: {0}")]
    UnknownReference(MessageId),

    /// Encoding or decoding failed
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for DispatchError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedContentType(code) => Self::UnsupportedContentType(code),
            other => Self::Protocol(other),
        }
    }
}

impl DispatchError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::ChannelNotReady { .. } => Status::ChannelNotReady,
            Self::UnsupportedContentType(_) => Status::UnsupportedContentType,
            Self::WrongGroup { .. } => Status::Misaddressed,
            Self::DecryptionFailed(_) | Self::IdMismatch { .. } => Status::InvalidSignature,
            Self::Replay { .. } | Self::Protocol(_) => Status::InvalidPayload,
            Self::UnknownReference(_) => Status::UnknownReference,
        }
    }
}
