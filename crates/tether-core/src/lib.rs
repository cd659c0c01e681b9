//! Tether core: Sans-IO state machines for discovery, channel negotiation and
//! message dispatch.
//!
//! Nothing here touches the network. Each component takes inputs (decoded
//! payloads, the current time, the key store) and returns results or actions
//! that a driver executes. Time and randomness come from an [`Environment`],
//! so the same code runs in production and in deterministic tests.
//!
//! # Components
//!
//! - [`KeyStore`]: inbox identities and one-time key package secrets
//! - [`DiscoveryEngine`]: pending out-of-band requests awaiting a response
//! - [`Handshake`]: key package / welcome / commit negotiation
//! - [`MessageDispatcher`]: sealing, opening and acknowledging messages
//! - [`Channel`]: per-peer state with a monotonic lifecycle

#![forbid(unsafe_code)]

pub mod channel;
pub mod crypto;
pub mod discovery;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod handshake;
pub mod keystore;

pub use channel::{BackwardTransition, Channel, ChannelRole, ChannelState};
pub use discovery::{DiscoveryEngine, Resolution};
pub use dispatcher::{Message, MessageDispatcher};
pub use env::Environment;
pub use error::{DiscoveryError, DispatchError, HandshakeError, KeyStoreError};
pub use handshake::{
    Abandoned, Establishment, Handshake, HandshakeAction, HandshakeOutcome, Negotiation, NegotiationId,
    NegotiationState,
};
pub use keystore::{AnyKeyStorage, KeyStorage, KeyStore, MemoryKeyStorage, RedbKeyStorage};
