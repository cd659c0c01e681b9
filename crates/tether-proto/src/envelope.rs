//! Transport envelope.
//!
//! Layout on the wire (big endian):
//!
//! ```text
//! ┌───────┬─────────┬──────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ magic │ version │ kind │ reserved │   from   │    to    │ body_len │   body   │
//! │  4 B  │   1 B   │ 1 B  │   2 B    │   32 B   │   32 B   │   4 B    │ body_len │
//! └───────┴─────────┴──────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The relay routes on `to` without touching the body. The body is the CBOR
//! [`Payload`](crate::Payload) selected by `kind`.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    Address,
    errors::{ProtocolError, Result},
};

/// Kind of an envelope, selecting the payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Group membership proposal
    Proposal = 0x01,
    /// Key package offered for channel establishment
    KeyPackage = 0x02,
    /// Group membership commit
    Commit = 0x03,
    /// Welcome admitting the recipient to a channel
    Welcome = 0x04,
    /// Encrypted application message
    Message = 0x05,
    /// Delivery acknowledgement
    Acknowledgement = 0x06,
    /// Delivery or processing error
    Error = 0x07,
}

impl EnvelopeKind {
    /// Kind for a wire byte. `None` for unknown bytes.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Proposal),
            0x02 => Some(Self::KeyPackage),
            0x03 => Some(Self::Commit),
            0x04 => Some(Self::Welcome),
            0x05 => Some(Self::Message),
            0x06 => Some(Self::Acknowledgement),
            0x07 => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Addressed, opaque transport unit.
///
/// # Invariants
///
/// - `body.len()` never exceeds [`Envelope::MAX_BODY_SIZE`] once encoded;
///   [`Envelope::encode`] enforces it and [`Envelope::decode`] rejects larger
///   bodies before allocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Payload type
    pub kind: EnvelopeKind,
    /// Sender inbox
    pub from: Address,
    /// Recipient inbox
    pub to: Address,
    /// CBOR payload bytes
    pub body: Bytes,
}

impl Envelope {
    /// Magic number ("TTHR").
    pub const MAGIC: u32 = 0x5454_4852;

    /// Wire format version.
    pub const VERSION: u8 = 1;

    /// Header length in bytes.
    pub const HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 32 + 32 + 4;

    /// Maximum body length (1 MiB).
    pub const MAX_BODY_SIZE: usize = 1 << 20;

    /// Create an envelope.
    #[must_use]
    pub fn new(kind: EnvelopeKind, from: Address, to: Address, body: impl Into<Bytes>) -> Self {
        Self { kind, from, to, body: body.into() }
    }

    /// Total encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.body.len()
    }

    /// Encode header and body into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the body exceeds the limit
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.body.len() > Self::MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.body.len(),
                max: Self::MAX_BODY_SIZE,
            });
        }

        dst.put_u32(Self::MAGIC);
        dst.put_u8(Self::VERSION);
        dst.put_u8(self.kind.to_u8());
        dst.put_u16(0);
        dst.put_slice(self.from.as_bytes());
        dst.put_slice(self.to.as_bytes());
        dst.put_u32(self.body.len() as u32);
        dst.put_slice(&self.body);

        Ok(())
    }

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the body exceeds the limit
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decode one envelope from the start of `src`.
    ///
    /// Trailing bytes after the body are ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if the header or body is incomplete
    /// - `ProtocolError::InvalidMagic` / `UnsupportedVersion` / `UnknownKind`
    ///   for malformed headers
    /// - `ProtocolError::PayloadTooLarge` if the declared body is over the
    ///   limit
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: Self::HEADER_SIZE,
                available: src.len(),
            });
        }

        let mut cursor = src;
        let magic = cursor.get_u32();
        if magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic { found: magic });
        }

        let version = cursor.get_u8();
        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind_byte = cursor.get_u8();
        let kind = EnvelopeKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;
        let _reserved = cursor.get_u16();

        let mut from = [0u8; 32];
        cursor.copy_to_slice(&mut from);
        let mut to = [0u8; 32];
        cursor.copy_to_slice(&mut to);

        let body_len = cursor.get_u32() as usize;
        if body_len > Self::MAX_BODY_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: body_len, max: Self::MAX_BODY_SIZE });
        }
        if cursor.remaining() < body_len {
            return Err(ProtocolError::Truncated {
                needed: Self::HEADER_SIZE + body_len,
                available: src.len(),
            });
        }

        let body = Bytes::copy_from_slice(&cursor[..body_len]);

        Ok(Self { kind, from: Address::from_bytes(from), to: Address::from_bytes(to), body })
    }
}
