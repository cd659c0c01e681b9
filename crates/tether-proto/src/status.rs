//! Status codes.
//!
//! Closed enumeration reported to completion callbacks and carried in error
//! envelopes. Codes and names are stable; new statuses are appended.

use std::fmt;

/// Outcome of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation completed
    Success,
    /// Transport failed to deliver; retryable
    TransportError,
    /// Transport is disconnected
    TransportUnavailable,
    /// Request or key package outlived its deadline
    Expired,
    /// Response does not correlate with any pending request
    UnknownRequest,
    /// Welcome does not match any pending negotiation
    UnmatchedWelcome,
    /// Channel is not established
    ChannelNotReady,
    /// No key material budget left
    KeyExhausted,
    /// Content type outside the supported set
    UnsupportedContentType,
    /// Payload could not be decoded
    InvalidPayload,
    /// Signature verification failed
    InvalidSignature,
    /// Operation was cancelled by the caller
    Cancelled,
    /// Persistent storage failed
    StorageError,
    /// Acknowledgement or error references an unknown message
    UnknownReference,
    /// Payload was addressed to a different inbox
    Misaddressed,
    /// Request id was already used
    RequestIdReused,
    /// Operation is invalid in the current state
    InvalidState,
}

impl Status {
    /// Every status, in code order.
    pub const ALL: [Self; 17] = [
        Self::Success,
        Self::TransportError,
        Self::TransportUnavailable,
        Self::Expired,
        Self::UnknownRequest,
        Self::UnmatchedWelcome,
        Self::ChannelNotReady,
        Self::KeyExhausted,
        Self::UnsupportedContentType,
        Self::InvalidPayload,
        Self::InvalidSignature,
        Self::Cancelled,
        Self::StorageError,
        Self::UnknownReference,
        Self::Misaddressed,
        Self::RequestIdReused,
        Self::InvalidState,
    ];

    /// Stable numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::TransportError => 0x0001,
            Self::TransportUnavailable => 0x0002,
            Self::Expired => 0x0003,
            Self::UnknownRequest => 0x0004,
            Self::UnmatchedWelcome => 0x0005,
            Self::ChannelNotReady => 0x0006,
            Self::KeyExhausted => 0x0007,
            Self::UnsupportedContentType => 0x0008,
            Self::InvalidPayload => 0x0009,
            Self::InvalidSignature => 0x000A,
            Self::Cancelled => 0x000B,
            Self::StorageError => 0x000C,
            Self::UnknownReference => 0x000D,
            Self::Misaddressed => 0x000E,
            Self::RequestIdReused => 0x000F,
            Self::InvalidState => 0x0010,
        }
    }

    /// Status for a numeric code. `None` for unknown codes.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// Human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransportError => "transport_error",
            Self::TransportUnavailable => "transport_unavailable",
            Self::Expired => "expired",
            Self::UnknownRequest => "unknown_request",
            Self::UnmatchedWelcome => "unmatched_welcome",
            Self::ChannelNotReady => "channel_not_ready",
            Self::KeyExhausted => "key_exhausted",
            Self::UnsupportedContentType => "unsupported_content_type",
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidSignature => "invalid_signature",
            Self::Cancelled => "cancelled",
            Self::StorageError => "storage_error",
            Self::UnknownReference => "unknown_reference",
            Self::Misaddressed => "misaddressed",
            Self::RequestIdReused => "request_id_reused",
            Self::InvalidState => "invalid_state",
        }
    }

    /// True for [`Status::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
