//! Application-level payloads.

use serde::{Deserialize, Serialize};

use crate::{Address, MessageId, Status};

/// Size of the `XChaCha20` nonce carried with each message.
pub const NONCE_SIZE: usize = 24;

/// Message sealed under a channel secret.
///
/// `id` is content-derived by the sender; the receiver recomputes it after
/// opening and rejects mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// Content-derived message id
    pub id: MessageId,
    /// Group address of the channel
    pub group: Address,
    /// Sender's per-channel sequence number
    pub sequence: u64,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the authentication tag
    pub ciphertext: Vec<u8>,
}

/// Confirms delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Id of the acknowledged message
    pub reference: MessageId,
}

/// Reports a failure, optionally tied to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Message the error refers to, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reference: Option<MessageId>,
    /// [`Status`] code
    pub code: u16,
    /// Human-readable detail
    pub message: String,
}

impl ErrorPayload {
    /// Build an error payload for a status.
    pub fn new(reference: Option<MessageId>, status: Status, message: impl Into<String>) -> Self {
        Self { reference, code: status.code(), message: message.into() }
    }

    /// Decoded status. Unknown codes map to [`Status::InvalidPayload`].
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_code(self.code).unwrap_or(Status::InvalidPayload)
    }
}
