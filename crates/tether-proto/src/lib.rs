//! Tether wire protocol.
//!
//! Value types and codecs shared by every Tether component. Nothing in this
//! crate performs I/O or cryptography beyond hashing for content-derived
//! identifiers.
//!
//! # Layers
//!
//! - [`Envelope`]: fixed binary header (kind, sender, recipient, body length)
//!   followed by an opaque body. The relay routes on the header alone.
//! - [`Payload`]: CBOR body of an envelope, selected by [`EnvelopeKind`].
//! - [`Content`]: typed application content carried inside an encrypted
//!   message (chat, discovery request/response).
//! - [`DiscoveryRequest`]: the out-of-band payload rendered as a QR code or
//!   passed through any other side channel.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod content;
pub mod discovery;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod payloads;
pub mod status;

pub use content::{Attachment, Chat, Content, ContentType, DiscoveryResponse, Introduction, Token, TypedContent};
pub use discovery::{DiscoveryRequest, Flags};
pub use envelope::{Envelope, EnvelopeKind};
pub use errors::{ProtocolError, Result};
pub use ids::{Address, KeyPackageRef, MessageId, RequestId, WelcomeId};
pub use payloads::{
    Payload,
    app::{Acknowledgement, EncryptedMessage, ErrorPayload},
    handshake::{CommitData, KeyPackage, ProposalData, Welcome},
};
pub use status::Status;
