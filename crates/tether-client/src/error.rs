//! Account errors.

use tether_core::{DiscoveryError, DispatchError, HandshakeError, KeyStoreError};
use tether_proto::{Address, ProtocolError, RequestId, Status};
use thiserror::Error;

use crate::{config::ConfigError, transport::TransportError};

/// Errors returned by [`crate::Account`] operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountError {
    /// Transport is disconnected
    #[error("transport unavailable")]
    TransportUnavailable,

    /// Transport failed to deliver
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Key store failure
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Discovery failure
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Handshake failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Messaging failure
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Encoding or decoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Discovery request was created for another target
    #[error("discovery request {0} targets a different deployment")]
    TargetMismatch(RequestId),

    /// Channel to this peer is closed and cannot be established again
    #[error("channel to {0} is closed")]
    ChannelClosed(Address),

    /// Operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// Account has shut down
    #[error("account shut down")]
    Shutdown,
}

impl AccountError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::TransportUnavailable => Status::TransportUnavailable,
            Self::Transport(TransportError::Disconnected) => Status::TransportUnavailable,
            Self::Transport(TransportError::Protocol(_)) => Status::InvalidPayload,
            Self::Transport(TransportError::Send(_)) => Status::TransportError,
            Self::Config(_) => Status::InvalidState,
            Self::KeyStore(err) => err.status(),
            Self::Discovery(err) => err.status(),
            Self::Handshake(err) => err.status(),
            Self::Dispatch(err) => err.status(),
            Self::Protocol(_) | Self::TargetMismatch(_) => Status::InvalidPayload,
            Self::ChannelClosed(_) => Status::ChannelNotReady,
            Self::Cancelled | Self::Shutdown => Status::Cancelled,
        }
    }

    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Only transport failures and an exhausted key package budget qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransportUnavailable => true,
            Self::Transport(err) => err.is_transient(),
            Self::KeyStore(err) => err.is_transient(),
            Self::Handshake(err) => err.is_transient(),
            _ => false,
        }
    }
}
