//! CBOR-encoded envelope bodies.
//!
//! The envelope header carries the kind, so only the inner struct is
//! serialized (no variant tag). A body can never be decoded as a different
//! payload type than its header claims.
//!
//! # Invariants
//!
//! Each variant maps to exactly one [`EnvelopeKind`] (enforced by match
//! exhaustiveness). Decoding an encoded payload with its own kind yields an
//! equal value.

pub mod app;
pub mod handshake;

use crate::{
    Address, Envelope, EnvelopeKind,
    errors::{ProtocolError, Result, from_cbor, to_cbor},
};

/// All envelope bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Membership proposal
    Proposal(handshake::ProposalData),
    /// Key package offered in band
    KeyPackage(handshake::KeyPackage),
    /// Membership commit
    Commit(handshake::CommitData),
    /// Channel welcome
    Welcome(handshake::Welcome),
    /// Encrypted application message
    Message(app::EncryptedMessage),
    /// Delivery acknowledgement
    Acknowledgement(app::Acknowledgement),
    /// Error report
    Error(app::ErrorPayload),
}

impl Payload {
    /// Envelope kind for this payload.
    #[must_use]
    pub const fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Proposal(_) => EnvelopeKind::Proposal,
            Self::KeyPackage(_) => EnvelopeKind::KeyPackage,
            Self::Commit(_) => EnvelopeKind::Commit,
            Self::Welcome(_) => EnvelopeKind::Welcome,
            Self::Message(_) => EnvelopeKind::Message,
            Self::Acknowledgement(_) => EnvelopeKind::Acknowledgement,
            Self::Error(_) => EnvelopeKind::Error,
        }
    }

    /// Serialize the inner struct.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Proposal(inner) => to_cbor(inner),
            Self::KeyPackage(inner) => to_cbor(inner),
            Self::Commit(inner) => to_cbor(inner),
            Self::Welcome(inner) => to_cbor(inner),
            Self::Message(inner) => to_cbor(inner),
            Self::Acknowledgement(inner) => to_cbor(inner),
            Self::Error(inner) => to_cbor(inner),
        }
    }

    /// Decode a body for the given kind.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if `bytes` exceed the body limit
    /// - `ProtocolError::CborDecode` if the body does not match the kind
    pub fn decode(kind: EnvelopeKind, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > Envelope::MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: Envelope::MAX_BODY_SIZE,
            });
        }

        Ok(match kind {
            EnvelopeKind::Proposal => Self::Proposal(from_cbor(bytes)?),
            EnvelopeKind::KeyPackage => Self::KeyPackage(from_cbor(bytes)?),
            EnvelopeKind::Commit => Self::Commit(from_cbor(bytes)?),
            EnvelopeKind::Welcome => Self::Welcome(from_cbor(bytes)?),
            EnvelopeKind::Message => Self::Message(from_cbor(bytes)?),
            EnvelopeKind::Acknowledgement => Self::Acknowledgement(from_cbor(bytes)?),
            EnvelopeKind::Error => Self::Error(from_cbor(bytes)?),
        })
    }

    /// Wrap into an addressed envelope.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_envelope(self, from: Address, to: Address) -> Result<Envelope> {
        let body = self.encode()?;
        Ok(Envelope::new(self.kind(), from, to, body))
    }

    /// Parse the body of an envelope.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborDecode` if the body does not match the kind
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        Self::decode(envelope.kind, &envelope.body)
    }
}
