//! Discovery requests and their out-of-band encoding.
//!
//! A discovery request carries a key package to someone we have never talked
//! to, through a channel outside the relay (QR code, link, copy-paste). The
//! payload is:
//!
//! ```text
//! "TTHR" (4 B) | version (1 B) | CBOR { key_package, expires, flags }
//! ```
//!
//! The request id is SHA-256 over a label and the CBOR body, so encoding the
//! same content twice (a retransmission) always produces the same id. The id
//! is not on the wire; decoding recomputes it.

use serde::{Deserialize, Serialize};

use crate::{
    KeyPackage, RequestId,
    errors::{ProtocolError, Result, from_cbor, to_cbor},
};

/// Request option bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Request targets the sandbox environment.
    pub const TARGET_SANDBOX: Self = Self(0x01);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits. Unknown bits are kept.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Serialize, Deserialize)]
struct RequestBody {
    key_package: KeyPackage,
    expires: u64,
    flags: Flags,
}

/// One-shot request asking a peer to open a channel with us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Content-derived identifier
    pub id: RequestId,
    /// Key package the responder uses to create the channel
    pub key_package: KeyPackage,
    /// Unix seconds after which responses are rejected
    pub expires: u64,
    /// Request options
    pub flags: Flags,
}

impl DiscoveryRequest {
    /// Out-of-band payload magic.
    pub const MAGIC: [u8; 4] = *b"TTHR";

    /// Out-of-band payload version.
    pub const VERSION: u8 = 1;

    const ID_LABEL: &'static [u8] = b"tether discovery request v1";

    /// Build a request, deriving its id from the content.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn new(key_package: KeyPackage, expires: u64, flags: Flags) -> Result<Self> {
        let body = RequestBody { key_package, expires, flags };
        let id = Self::derive_id(&to_cbor(&body)?);
        Ok(Self { id, key_package: body.key_package, expires, flags })
    }

    fn derive_id(cbor_body: &[u8]) -> RequestId {
        RequestId::digest(&[Self::ID_LABEL, cbor_body])
    }

    /// True once `now_secs` has reached the expiry.
    #[must_use]
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expires
    }

    /// Encode for an out-of-band channel.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode_out_of_band(&self) -> Result<Vec<u8>> {
        let body = RequestBody {
            key_package: self.key_package.clone(),
            expires: self.expires,
            flags: self.flags,
        };
        let cbor = to_cbor(&body)?;

        let mut out = Vec::with_capacity(Self::MAGIC.len() + 1 + cbor.len());
        out.extend_from_slice(&Self::MAGIC);
        out.push(Self::VERSION);
        out.extend_from_slice(&cbor);
        Ok(out)
    }

    /// Decode an out-of-band payload. Exact inverse of
    /// [`DiscoveryRequest::encode_out_of_band`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Truncated` if the prefix is incomplete
    /// - `ProtocolError::InvalidMagic` / `UnsupportedVersion` for foreign
    ///   payloads
    /// - `ProtocolError::CborDecode` if the body is malformed
    pub fn decode_out_of_band(bytes: &[u8]) -> Result<Self> {
        let prefix = Self::MAGIC.len() + 1;
        if bytes.len() < prefix {
            return Err(ProtocolError::Truncated { needed: prefix, available: bytes.len() });
        }

        if bytes[..4] != Self::MAGIC {
            let found = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            return Err(ProtocolError::InvalidMagic { found });
        }

        if bytes[4] != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(bytes[4]));
        }

        let cbor = &bytes[prefix..];
        let body: RequestBody = from_cbor(cbor)?;

        Ok(Self {
            id: Self::derive_id(cbor),
            key_package: body.key_package,
            expires: body.expires,
            flags: body.flags,
        })
    }
}
