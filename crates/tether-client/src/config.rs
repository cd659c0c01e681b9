//! Account configuration.
//!
//! The target environment selects default relay endpoints and whether
//! discovery requests carry the sandbox flag. Key material lives either in
//! memory or in a redb file sealed under a caller-supplied 32-byte key.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use tether_core::keystore::DEFAULT_KEY_PACKAGE_BUDGET;
use tether_proto::Flags;
use thiserror::Error;

/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a sent message waits for its acknowledgement, and a settled
/// status waits to be collected.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Configuration errors. Fatal to `configure`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Storage key has the wrong length
    #[error("storage key must be 32 bytes, got {0}")]
    StorageKeyLength(usize),

    /// Endpoint string is empty
    #[error("{0} endpoint is empty")]
    EmptyEndpoint(&'static str),

    /// Key package budget of zero
    #[error("key package budget must be positive")]
    ZeroBudget,

    /// Sweep interval of zero
    #[error("sweep interval must be positive")]
    ZeroSweepInterval,

    /// Delivery timeout under one second
    #[error("delivery timeout must be at least one second")]
    ShortDeliveryTimeout,

    /// Unrecognised log level
    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    /// Unrecognised deployment name
    #[error("unknown target: {0}")]
    UnknownTarget(String),
}

/// Deployment the account talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Target {
    /// Test deployment
    #[default]
    Sandbox,
    /// Live deployment
    Production,
}

impl Target {
    /// Default endpoints for this deployment.
    pub fn endpoints(self) -> Endpoints {
        match self {
            Self::Sandbox => Endpoints {
                rpc: "https://rpc.sandbox.tether.example".to_string(),
                object: "https://objects.sandbox.tether.example".to_string(),
                message: "wss://messages.sandbox.tether.example".to_string(),
            },
            Self::Production => Endpoints {
                rpc: "https://rpc.tether.example".to_string(),
                object: "https://objects.tether.example".to_string(),
                message: "wss://messages.tether.example".to_string(),
            },
        }
    }

    /// Flags carried by discovery requests created under this target.
    pub fn discovery_flags(self) -> Flags {
        match self {
            Self::Sandbox => Flags::TARGET_SANDBOX,
            Self::Production => Flags::NONE,
        }
    }

    /// Whether a request with `flags` was created under this target.
    pub fn accepts(self, flags: Flags) -> bool {
        flags.contains(Flags::TARGET_SANDBOX) == (self == Self::Sandbox)
    }
}

impl FromStr for Target {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Self::Sandbox),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::UnknownTarget(s.to_string())),
        }
    }
}

/// Relay endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Request/response API
    pub rpc: String,
    /// Object storage
    pub object: String,
    /// Message relay
    pub message: String,
}

/// Where key material is kept.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Process memory, sealed under a random key per account
    Memory,
    /// redb database file
    Path {
        /// Database file
        path: PathBuf,
        /// Sealing key; must be 32 bytes
        key: Vec<u8>,
    },
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::Path { path, .. } => f.debug_struct("Path").field("path", path).finish_non_exhaustive(),
        }
    }
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and errors
    Warn,
    /// Lifecycle events
    #[default]
    Info,
    /// State transitions
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(ConfigError::UnknownLogLevel(s.to_string())),
        }
    }
}

/// Account configuration.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Key material storage
    pub storage: StorageConfig,
    /// Relay endpoints
    pub endpoints: Endpoints,
    /// Deployment
    pub target: Target,
    /// Log verbosity for binaries that install a subscriber
    pub log_level: LogLevel,
    /// Maximum key packages outstanding at once
    pub key_package_budget: usize,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// How long a sent message waits for its acknowledgement before it
    /// settles as `Expired`; also how long a settled status is kept
    pub delivery_timeout: Duration,
}

impl AccountConfig {
    /// In-memory configuration for `target` with its default endpoints.
    pub fn new(target: Target) -> Self {
        Self {
            storage: StorageConfig::Memory,
            endpoints: target.endpoints(),
            target,
            log_level: LogLevel::default(),
            key_package_budget: DEFAULT_KEY_PACKAGE_BUDGET,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Keep key material in a redb file at `path`.
    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>, key: impl Into<Vec<u8>>) -> Self {
        self.storage = StorageConfig::Path { path: path.into(), key: key.into() };
        self
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let StorageConfig::Path { key, .. } = &self.storage
            && key.len() != 32
        {
            return Err(ConfigError::StorageKeyLength(key.len()));
        }
        for (name, endpoint) in
            [("rpc", &self.endpoints.rpc), ("object", &self.endpoints.object), ("message", &self.endpoints.message)]
        {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::EmptyEndpoint(name));
            }
        }
        if self.key_package_budget == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.delivery_timeout.as_secs() == 0 {
            return Err(ConfigError::ShortDeliveryTimeout);
        }
        Ok(())
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self::new(Target::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(AccountConfig::default().validate(), Ok(()));
        assert_eq!(AccountConfig::new(Target::Production).validate(), Ok(()));
    }

    #[test]
    fn targets_have_distinct_endpoints() {
        assert_ne!(Target::Sandbox.endpoints(), Target::Production.endpoints());
    }

    #[test]
    fn storage_key_must_be_32_bytes() {
        let config = AccountConfig::default().with_storage_path("/tmp/keys.redb", vec![0u8; 16]);
        assert_eq!(config.validate(), Err(ConfigError::StorageKeyLength(16)));

        let config = AccountConfig::default().with_storage_path("/tmp/keys.redb", vec![0u8; 32]);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_budget_and_interval_rejected() {
        let mut config = AccountConfig::default();
        config.key_package_budget = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBudget));

        let mut config = AccountConfig::default();
        config.sweep_interval = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroSweepInterval));

        let mut config = AccountConfig::default();
        config.delivery_timeout = Duration::from_millis(500);
        assert_eq!(config.validate(), Err(ConfigError::ShortDeliveryTimeout));
    }

    #[test]
    fn empty_endpoint_rejected() {
        let mut config = AccountConfig::default();
        config.endpoints.message = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyEndpoint("message")));
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn target_parses_by_name() {
        assert_eq!("Sandbox".parse::<Target>(), Ok(Target::Sandbox));
        assert_eq!("prod".parse::<Target>(), Ok(Target::Production));
        assert_eq!("staging".parse::<Target>(), Err(ConfigError::UnknownTarget("staging".to_string())));
    }

    #[test]
    fn sandbox_flag_follows_target() {
        assert!(Target::Sandbox.accepts(Target::Sandbox.discovery_flags()));
        assert!(Target::Production.accepts(Target::Production.discovery_flags()));
        assert!(!Target::Production.accepts(Flags::TARGET_SANDBOX));
        assert!(!Target::Sandbox.accepts(Flags::NONE));
    }

    #[test]
    fn storage_debug_hides_key() {
        let config = StorageConfig::Path { path: "/tmp/k".into(), key: vec![0xab; 32] };
        assert!(!format!("{config:?}").contains("171"));
    }
}
