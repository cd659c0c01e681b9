//! Transport contract.
//!
//! A transport moves opaque envelopes to the relay and delivers inbound
//! events on a channel handed to [`crate::Account::configure`]. Protocol logic
//! never lives here.

use std::future::Future;

use tether_proto::{Address, Envelope};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Not connected to the relay.
    #[error("transport disconnected")]
    Disconnected,

    /// Relay refused or lost the envelope.
    #[error("send failed: {0}")]
    Send(String),

    /// Envelope could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Send(_))
    }
}

/// Inbound transport events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Envelope addressed to one of our inboxes.
    Envelope(Envelope),
    /// Connection to the relay (re)established.
    Connect,
    /// Connection to the relay lost.
    Disconnect {
        /// Reason reported by the transport, if any.
        reason: Option<String>,
    },
}

/// Outbound half of a relay connection.
///
/// # Implementations
///
/// - [`crate::MemoryTransport`]: in-process relay for tests and the demo
/// - Network transports provide the same contract over the wire
pub trait Transport: Send + Sync + 'static {
    /// Hand an envelope to the relay.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Disconnected` if the connection is down.
    fn send(&self, envelope: Envelope) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask the relay to deliver envelopes addressed to `inbox`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Disconnected` if the connection is down.
    fn subscribe(&self, inbox: Address) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Check if connected to the relay.
    fn is_connected(&self) -> bool;
}
