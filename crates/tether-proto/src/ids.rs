//! Fixed-size identifiers.
//!
//! Every identifier is a 32-byte value compared by value. Two instances decoded
//! from the same hex string are equal and hash identically, which is what the
//! pending tables key on.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ProtocolError, Result};

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Length of the identifier in bytes.
            pub const LEN: usize = 32;

            /// Wrap raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// SHA-256 over the concatenation of `parts`.
            #[must_use]
            pub fn digest(parts: &[&[u8]]) -> Self {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                Self(hasher.finalize().into())
            }

            /// Lowercase hex encoding.
            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 64 character hex string.
            ///
            /// # Errors
            ///
            /// - `ProtocolError::InvalidId` if the string is not 32 bytes of hex
            pub fn from_hex(s: &str) -> Result<Self> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|e| ProtocolError::InvalidId(format!("{}: {e}", stringify!($name))))?;
                Ok(Self(bytes))
            }

            /// Build from a slice, which must be exactly 32 bytes.
            ///
            /// # Errors
            ///
            /// - `ProtocolError::InvalidId` if the slice has the wrong length
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                let array: [u8; 32] = bytes.try_into().map_err(|_| {
                    ProtocolError::InvalidId(format!(
                        "{}: expected 32 bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }
    };
}

byte_id! {
    /// Public-key-derived identifier of an inbox or an encrypted group.
    ///
    /// Inbox addresses are Ed25519 verifying keys. Group addresses are derived
    /// from the channel secret.
    Address
}

byte_id! {
    /// Content-derived identifier of a discovery request.
    RequestId
}

byte_id! {
    /// Content-derived identifier of an application message.
    MessageId
}

byte_id! {
    /// Hash reference to a key package.
    KeyPackageRef
}

byte_id! {
    /// Hash of a welcome, used for replay detection.
    WelcomeId
}
