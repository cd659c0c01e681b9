//! Message dispatch over established channels.
//!
//! Seals outgoing content, opens incoming messages, decodes their content
//! type through the closed set and correlates acknowledgements and errors with
//! the messages we sent. All functions are pure: nonces are provided by the
//! caller.
//!
//! # Message identity
//!
//! ```text
//! id  = SHA-256("tether message v1" || group || sender || sequence || plaintext)
//! aad = id || group || sequence
//! ```
//!
//! The receiver recomputes the id after decryption, so an id always names
//! exactly one (channel, sender, position, content).
//!
//! # Invariants
//!
//! - Nothing is sealed for a channel that is not Established
//! - Received sequence numbers strictly increase per channel
//! - An acknowledgement or error resolves an outstanding message at most once

use std::collections::HashMap;

use tether_proto::{
    Acknowledgement, Address, Content, EncryptedMessage, Envelope, ErrorPayload, MessageId, Payload,
    Status, TypedContent,
};
use zeroize::Zeroizing;

use crate::{
    channel::Channel,
    crypto::{self, NONCE_SIZE},
    error::DispatchError,
};

const MESSAGE_ID_LABEL: &[u8] = b"tether message v1";

/// Decrypted application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Content-derived id
    pub id: MessageId,
    /// Sender inbox
    pub from: Address,
    /// Recipient inbox
    pub to: Address,
    /// Channel group
    pub group: Address,
    /// Sender's sequence number
    pub sequence: u64,
    /// Decoded content
    pub content: TypedContent,
}

fn message_id(group: &Address, sender: &Address, sequence: u64, plaintext: &[u8]) -> MessageId {
    MessageId::digest(&[
        MESSAGE_ID_LABEL,
        group.as_bytes(),
        sender.as_bytes(),
        &sequence.to_be_bytes(),
        plaintext,
    ])
}

fn associated_data(id: &MessageId, group: &Address, sequence: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(72);
    aad.extend_from_slice(id.as_bytes());
    aad.extend_from_slice(group.as_bytes());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad
}

fn not_ready(channel: &Channel) -> DispatchError {
    DispatchError::ChannelNotReady { peer: channel.peer(), state: Some(channel.state()) }
}

/// Outgoing message tracker.
#[derive(Debug, Default)]
pub struct MessageDispatcher {
    outstanding: HashMap<MessageId, Address>,
}

impl MessageDispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `content` for the channel's peer.
    ///
    /// Returns the message id and the envelope to send. The message is
    /// tracked as outstanding until acknowledged, rejected or forgotten.
    ///
    /// # Errors
    ///
    /// - `DispatchError::ChannelNotReady` if the channel is not Established
    pub fn send(
        &mut self,
        channel: &mut Channel,
        content: &TypedContent,
        nonce: [u8; NONCE_SIZE],
    ) -> Result<(MessageId, Envelope), DispatchError> {
        let (Some(group), Some(key), true) = (channel.group(), channel.key(), channel.is_established())
        else {
            return Err(not_ready(channel));
        };
        let key = Zeroizing::new(*key.as_bytes());

        let plaintext = content.encode()?.to_bytes()?;
        let sequence = channel.next_send_sequence();
        let id = message_id(&group, &channel.local(), sequence, &plaintext);
        let aad = associated_data(&id, &group, sequence);

        let message = EncryptedMessage {
            id,
            group,
            sequence,
            nonce,
            ciphertext: crypto::seal(&key, &nonce, &aad, &plaintext),
        };
        let envelope = Payload::Message(message).into_envelope(channel.local(), channel.peer())?;

        self.outstanding.insert(id, channel.peer());
        tracing::debug!(message = %id, peer = %channel.peer(), content_type = content.content_type().name(), "message sealed");
        Ok((id, envelope))
    }

    /// Open a message received on `channel`.
    ///
    /// The sequence number is recorded as soon as the message authenticates,
    /// even if its content type turns out to be unsupported.
    ///
    /// # Errors
    ///
    /// - `DispatchError::ChannelNotReady` if the channel is not Established
    /// - `DispatchError::WrongGroup` if the message names another group
    /// - `DispatchError::Replay` if the sequence was already seen
    /// - `DispatchError::DecryptionFailed` / `IdMismatch` if it does not
    ///   authenticate
    /// - `DispatchError::UnsupportedContentType` for content outside the set
    pub fn receive(&self, channel: &mut Channel, message: &EncryptedMessage) -> Result<Message, DispatchError> {
        let (Some(group), Some(key), true) = (channel.group(), channel.key(), channel.is_established())
        else {
            return Err(not_ready(channel));
        };
        let key = Zeroizing::new(*key.as_bytes());

        if message.group != group {
            return Err(DispatchError::WrongGroup { expected: group, found: message.group });
        }
        if let Some(last) = channel.last_received()
            && message.sequence <= last
        {
            return Err(DispatchError::Replay { sequence: message.sequence, last });
        }

        let aad = associated_data(&message.id, &group, message.sequence);
        let plaintext = crypto::open(&key, &message.nonce, &aad, &message.ciphertext)
            .ok_or(DispatchError::DecryptionFailed(message.id))?;

        if message_id(&group, &channel.peer(), message.sequence, &plaintext) != message.id {
            return Err(DispatchError::IdMismatch { claimed: message.id });
        }
        channel.record_received(message.sequence);

        let content = Content::from_bytes(&plaintext)?.decode()?;
        Ok(Message {
            id: message.id,
            from: channel.peer(),
            to: channel.local(),
            group,
            sequence: message.sequence,
            content,
        })
    }

    /// Acknowledgement envelope for a message received on `channel`.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Protocol` if encoding fails
    pub fn acknowledge(&self, channel: &Channel, reference: MessageId) -> Result<Envelope, DispatchError> {
        Ok(Payload::Acknowledgement(Acknowledgement { reference })
            .into_envelope(channel.local(), channel.peer())?)
    }

    /// Error envelope telling `to` why a message was refused.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Protocol` if encoding fails
    pub fn reject(
        &self,
        from: Address,
        to: Address,
        reference: Option<MessageId>,
        status: Status,
        reason: impl Into<String>,
    ) -> Result<Envelope, DispatchError> {
        Ok(Payload::Error(ErrorPayload::new(reference, status, reason)).into_envelope(from, to)?)
    }

    /// Resolve an outstanding message acknowledged by `from`.
    ///
    /// # Errors
    ///
    /// - `DispatchError::UnknownReference` if we have no outstanding message
    ///   with that id sent to `from`
    pub fn on_acknowledgement(&mut self, from: Address, ack: &Acknowledgement) -> Result<MessageId, DispatchError> {
        self.resolve(from, ack.reference)?;
        Ok(ack.reference)
    }

    /// Resolve an outstanding message refused by `from`.
    ///
    /// # Errors
    ///
    /// - `DispatchError::UnknownReference` if `reference` is not outstanding
    ///   to `from`
    pub fn on_error(&mut self, from: Address, reference: MessageId, status: Status) -> Result<Status, DispatchError> {
        self.resolve(from, reference)?;
        Ok(status)
    }

    fn resolve(&mut self, from: Address, reference: MessageId) -> Result<(), DispatchError> {
        match self.outstanding.get(&reference) {
            Some(peer) if *peer == from => {
                self.outstanding.remove(&reference);
                Ok(())
            },
            _ => Err(DispatchError::UnknownReference(reference)),
        }
    }

    /// Stop tracking a message (it never left, or its waiter is gone).
    pub fn forget(&mut self, reference: &MessageId) -> bool {
        self.outstanding.remove(reference).is_some()
    }

    /// Messages awaiting acknowledgement.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
