//! Application content carried inside encrypted messages.
//!
//! [`Content`] keeps the raw type code so that content from newer peers still
//! decodes at the envelope level; only [`Content::decode`] enforces the closed
//! set and reports unknown codes.

use serde::{Deserialize, Serialize};

use crate::{
    DiscoveryRequest, MessageId, RequestId,
    errors::{ProtocolError, Result, from_cbor, to_cbor},
};

/// Closed set of supported content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Out-of-band discovery request
    DiscoveryRequest,
    /// Response correlating with a discovery request
    DiscoveryResponse,
    /// Chat message
    Chat,
    /// Tokens the sender hands over for reaching it later
    Introduction,
}

impl ContentType {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::DiscoveryRequest => 0x0101,
            Self::DiscoveryResponse => 0x0102,
            Self::Chat => 0x0201,
            Self::Introduction => 0x0202,
        }
    }

    /// Type for a code. `None` outside the closed set.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0101 => Some(Self::DiscoveryRequest),
            0x0102 => Some(Self::DiscoveryResponse),
            0x0201 => Some(Self::Chat),
            0x0202 => Some(Self::Introduction),
            _ => None,
        }
    }

    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DiscoveryRequest => "DISCOVERY_REQUEST",
            Self::DiscoveryResponse => "DISCOVERY_RESPONSE",
            Self::Chat => "CHAT",
            Self::Introduction => "INTRODUCTION",
        }
    }
}

/// Typed content with its raw code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Raw content type code
    pub content_type: u16,
    /// CBOR body for the type
    pub body: Vec<u8>,
}

impl Content {
    /// Content type if the code is in the closed set.
    #[must_use]
    pub fn content_type(&self) -> Option<ContentType> {
        ContentType::from_code(self.content_type)
    }

    /// Decode the body according to the content type.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnsupportedContentType` for codes outside the set
    /// - `ProtocolError::CborDecode` if the body is malformed
    pub fn decode(&self) -> Result<TypedContent> {
        let content_type = self
            .content_type()
            .ok_or(ProtocolError::UnsupportedContentType(self.content_type))?;

        Ok(match content_type {
            ContentType::DiscoveryRequest => {
                TypedContent::DiscoveryRequest(DiscoveryRequest::decode_out_of_band(&self.body)?)
            },
            ContentType::DiscoveryResponse => TypedContent::DiscoveryResponse(from_cbor(&self.body)?),
            ContentType::Chat => TypedContent::Chat(from_cbor(&self.body)?),
            ContentType::Introduction => TypedContent::Introduction(from_cbor(&self.body)?),
        })
    }

    /// Serialize to bytes (the plaintext that gets sealed).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_cbor(self)
    }

    /// Parse from plaintext bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborDecode` if the bytes are malformed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_cbor(bytes)
    }
}

/// Decoded content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedContent {
    /// Discovery request passed in band
    DiscoveryRequest(DiscoveryRequest),
    /// Discovery response
    DiscoveryResponse(DiscoveryResponse),
    /// Chat message
    Chat(Chat),
    /// Introduction
    Introduction(Introduction),
}

impl TypedContent {
    /// Content type of this value.
    #[must_use]
    pub const fn content_type(&self) -> ContentType {
        match self {
            Self::DiscoveryRequest(_) => ContentType::DiscoveryRequest,
            Self::DiscoveryResponse(_) => ContentType::DiscoveryResponse,
            Self::Chat(_) => ContentType::Chat,
            Self::Introduction(_) => ContentType::Introduction,
        }
    }

    /// Encode into raw content.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Content> {
        let body = match self {
            Self::DiscoveryRequest(request) => request.encode_out_of_band()?,
            Self::DiscoveryResponse(response) => to_cbor(response)?,
            Self::Chat(chat) => to_cbor(chat)?,
            Self::Introduction(introduction) => to_cbor(introduction)?,
        };
        Ok(Content { content_type: self.content_type().code(), body })
    }
}

impl From<Chat> for TypedContent {
    fn from(chat: Chat) -> Self {
        Self::Chat(chat)
    }
}

impl From<DiscoveryResponse> for TypedContent {
    fn from(response: DiscoveryResponse) -> Self {
        Self::DiscoveryResponse(response)
    }
}

impl From<Introduction> for TypedContent {
    fn from(introduction: Introduction) -> Self {
        Self::Introduction(introduction)
    }
}

/// Chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Message text
    pub message: String,
    /// Message this one replies to
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub referencing: Option<MessageId>,
    /// Files carried inline with the message
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<Attachment>,
}

impl Chat {
    /// Plain chat message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), referencing: None, attachments: Vec::new() }
    }

    /// Reply to an earlier message.
    #[must_use]
    pub fn referencing(mut self, id: MessageId) -> Self {
        self.referencing = Some(id);
        self
    }

    /// Carry a file with the message.
    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// File attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name shown to the recipient
    pub name: String,
    /// MIME type, e.g. `image/png`
    pub mime_type: String,
    /// File contents
    pub data: Vec<u8>,
}

impl Attachment {
    /// Attachment with the given contents.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), mime_type: mime_type.into(), data: data.into() }
    }
}

/// Opaque token issued by a peer, e.g. for push notifications.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub Vec<u8>);

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({} bytes)", self.0.len())
    }
}

/// Tokens a peer hands over so it can be reached later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    /// Issued tokens
    pub tokens: Vec<Token>,
}

/// Response to a discovery request. The responder is the message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// Id of the request being answered
    pub response_to: RequestId,
}
