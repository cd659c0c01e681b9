//! Protocol-level errors.
//!
//! Raised while encoding or decoding envelopes, payloads, content and
//! out-of-band requests. They never carry secret material.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the wire codecs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a complete structure could be read
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Magic number did not match
    #[error("invalid magic: {found:#010x}")]
    InvalidMagic {
        /// Magic value that was read
        found: u32,
    },

    /// Version byte is not supported by this implementation
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Envelope kind byte is not a known kind
    #[error("unknown envelope kind: {0:#04x}")]
    UnknownKind(u8),

    /// Body exceeds the protocol limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Content type code is outside the closed set
    #[error("unsupported content type: {0:#06x}")]
    UnsupportedContentType(u16),

    /// Identifier had the wrong length or was not valid hex
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}

/// Serialize a value to CBOR.
///
/// Field order follows declaration order, so equal values always produce equal
/// bytes. Content-derived identifiers rely on this.
pub(crate) fn to_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
