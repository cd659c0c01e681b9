//! Tether client: an async account over a pluggable relay transport.
//!
//! [`Account`] wraps the Sans-IO state machines from `tether-core` with a
//! background router and expiry sweep. Inbound activity is surfaced as
//! [`AccountEvent`]s; outbound operations are `async` and resolve once.
//!
//! # Transports
//!
//! Anything implementing [`Transport`] can carry envelopes.
//! [`MemoryRelay`] connects accounts in one process for tests and demos.

#![forbid(unsafe_code)]

mod account;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
mod router;
pub mod system_env;
pub mod transport;

pub use account::{Account, PendingDiscovery};
pub use config::{AccountConfig, ConfigError, Endpoints, LogLevel, StorageConfig, Target};
pub use error::AccountError;
pub use event::AccountEvent;
pub use memory::{MemoryRelay, MemoryTransport};
pub use system_env::SystemEnv;
pub use transport::{Transport, TransportError, TransportEvent};
