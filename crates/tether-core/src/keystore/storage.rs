//! Key storage backends.
//!
//! Backends only ever see sealed records: the key store encrypts every secret
//! under the account storage key before handing it over. The trait is
//! synchronous (no async) like the rest of the core.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tether_proto::{Address, KeyPackageRef};
use thiserror::Error;

use super::redb::RedbKeyStorage;

/// Backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// I/O or database failure
    #[error("storage I/O error: {0}")]
    Io(String),
}

/// Persistence for sealed key records.
///
/// Must be Clone (clones access the same underlying storage), Send + Sync
/// and synchronous.
pub trait KeyStorage: Clone + Send + Sync + 'static {
    /// Store the sealed identity record for an inbox. Overwrites.
    fn put_inbox(&self, address: &Address, sealed: &[u8]) -> Result<(), StorageError>;

    /// All sealed inbox records.
    fn load_inboxes(&self) -> Result<Vec<(Address, Vec<u8>)>, StorageError>;

    /// Store a sealed key package secret.
    fn put_key_package(&self, reference: &KeyPackageRef, sealed: &[u8]) -> Result<(), StorageError>;

    /// Remove and return a sealed key package secret.
    ///
    /// # Invariants
    ///
    /// - Post: a second call with the same reference returns `None`
    fn take_key_package(&self, reference: &KeyPackageRef) -> Result<Option<Vec<u8>>, StorageError>;

    /// All sealed key package secrets.
    fn load_key_packages(&self) -> Result<Vec<(KeyPackageRef, Vec<u8>)>, StorageError>;

    /// Number of stored key package secrets.
    fn key_package_count(&self) -> Result<usize, StorageError>;
}

/// In-memory backend. Contents vanish with the process.
#[derive(Clone, Default)]
pub struct MemoryKeyStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    inboxes: HashMap<Address, Vec<u8>>,
    key_packages: HashMap<KeyPackageRef, Vec<u8>>,
}

impl MemoryKeyStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("key storage mutex poisoned")
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn put_inbox(&self, address: &Address, sealed: &[u8]) -> Result<(), StorageError> {
        self.lock().inboxes.insert(*address, sealed.to_vec());
        Ok(())
    }

    fn load_inboxes(&self) -> Result<Vec<(Address, Vec<u8>)>, StorageError> {
        Ok(self.lock().inboxes.iter().map(|(a, s)| (*a, s.clone())).collect())
    }

    fn put_key_package(&self, reference: &KeyPackageRef, sealed: &[u8]) -> Result<(), StorageError> {
        self.lock().key_packages.insert(*reference, sealed.to_vec());
        Ok(())
    }

    fn take_key_package(&self, reference: &KeyPackageRef) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().key_packages.remove(reference))
    }

    fn load_key_packages(&self) -> Result<Vec<(KeyPackageRef, Vec<u8>)>, StorageError> {
        Ok(self.lock().key_packages.iter().map(|(r, s)| (*r, s.clone())).collect())
    }

    fn key_package_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock().key_packages.len())
    }
}

/// Backend chosen at runtime from configuration.
#[derive(Clone)]
pub enum AnyKeyStorage {
    /// Process memory
    Memory(MemoryKeyStorage),
    /// Redb file
    Redb(RedbKeyStorage),
}

impl KeyStorage for AnyKeyStorage {
    fn put_inbox(&self, address: &Address, sealed: &[u8]) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.put_inbox(address, sealed),
            Self::Redb(s) => s.put_inbox(address, sealed),
        }
    }

    fn load_inboxes(&self) -> Result<Vec<(Address, Vec<u8>)>, StorageError> {
        match self {
            Self::Memory(s) => s.load_inboxes(),
            Self::Redb(s) => s.load_inboxes(),
        }
    }

    fn put_key_package(&self, reference: &KeyPackageRef, sealed: &[u8]) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.put_key_package(reference, sealed),
            Self::Redb(s) => s.put_key_package(reference, sealed),
        }
    }

    fn take_key_package(&self, reference: &KeyPackageRef) -> Result<Option<Vec<u8>>, StorageError> {
        match self {
            Self::Memory(s) => s.take_key_package(reference),
            Self::Redb(s) => s.take_key_package(reference),
        }
    }

    fn load_key_packages(&self) -> Result<Vec<(KeyPackageRef, Vec<u8>)>, StorageError> {
        match self {
            Self::Memory(s) => s.load_key_packages(),
            Self::Redb(s) => s.load_key_packages(),
        }
    }

    fn key_package_count(&self) -> Result<usize, StorageError> {
        match self {
            Self::Memory(s) => s.key_package_count(),
            Self::Redb(s) => s.key_package_count(),
        }
    }
}
