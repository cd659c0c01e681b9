//! Key store: inbox identities and one-time key package secrets.
//!
//! Every inbox is an Ed25519 identity; its public key is the inbox address.
//! Key packages bind a fresh X25519 init key to an inbox with a signature and
//! an expiry. The init key secret stays here until exactly one welcome
//! consumes it.
//!
//! # Invariants
//!
//! - A key package secret is returned by [`KeyStore::take_key_package`] at
//!   most once
//! - At most `budget` key package secrets are outstanding at any time
//! - Secrets reach the backend only sealed under the storage key
//! - An expired key package secret is destroyed by the next sweep, at the
//!   latest when the store is reopened

mod redb;
mod storage;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tether_proto::{Address, KeyPackage, KeyPackageRef};
use zeroize::{Zeroize, Zeroizing};

pub use self::{
    redb::RedbKeyStorage,
    storage::{AnyKeyStorage, KeyStorage, MemoryKeyStorage, StorageError},
};
use crate::{
    crypto::{self, Identity},
    env::Environment,
    error::KeyStoreError,
};

/// Default number of outstanding key packages per account.
pub const DEFAULT_KEY_PACKAGE_BUDGET: usize = 64;

#[derive(Serialize, Deserialize)]
struct InboxRecord {
    seed: [u8; 32],
    /// Unix seconds, 0 = never
    expires: u64,
}

impl Drop for InboxRecord {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

/// Init key secret behind a key package.
#[derive(Serialize, Deserialize)]
pub struct KeyPackageSecret {
    /// Inbox that signed the key package
    pub owner: Address,
    /// X25519 init key secret
    pub secret: [u8; 32],
    /// Key package expiry
    pub expires: u64,
}

impl Drop for KeyPackageSecret {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyPackageSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPackageSecret")
            .field("owner", &self.owner)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

struct Inbox {
    identity: Identity,
    expires: u64,
}

/// Identity and key package store.
pub struct KeyStore<S: KeyStorage, E: Environment> {
    env: E,
    storage: S,
    storage_key: Zeroizing<[u8; 32]>,
    inboxes: HashMap<Address, Inbox>,
    budget: usize,
}

impl<S: KeyStorage, E: Environment> KeyStore<S, E> {
    /// Open the store, loading existing inboxes from `storage` and destroying
    /// key package secrets that expired while the store was closed.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::Storage` if the backend fails
    /// - `KeyStoreError::Corrupt` if a record does not open under `storage_key`
    pub fn open(env: E, storage: S, storage_key: [u8; 32], budget: usize) -> Result<Self, KeyStoreError> {
        let storage_key = Zeroizing::new(storage_key);
        let mut inboxes = HashMap::new();

        for (address, sealed) in storage.load_inboxes()? {
            let record: InboxRecord = unseal(&storage_key, &sealed)?;
            let identity = Identity::from_seed(&record.seed);
            if identity.address() != address {
                return Err(KeyStoreError::Corrupt(format!("inbox record for {address} holds another key")));
            }
            inboxes.insert(address, Inbox { identity, expires: record.expires });
        }

        let mut store = Self { env, storage, storage_key, inboxes, budget };
        let now = store.env.wall_clock_secs();
        let reclaimed = store.sweep_key_packages(now)?;

        tracing::debug!(inboxes = store.inboxes.len(), reclaimed = reclaimed.len(), budget, "key store opened");
        Ok(store)
    }

    /// Create a new inbox identity.
    ///
    /// `expires` is Unix seconds, 0 for an inbox that never expires.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::Storage` if the record cannot be persisted
    pub fn open_inbox(&mut self, expires: u64) -> Result<Address, KeyStoreError> {
        let seed = Zeroizing::new(self.env.random_array());
        let identity = Identity::from_seed(&seed);
        let address = identity.address();

        let record = InboxRecord { seed: *seed, expires };
        let sealed = self.seal(&record)?;
        self.storage.put_inbox(&address, &sealed)?;
        self.inboxes.insert(address, Inbox { identity, expires });

        tracing::info!(%address, expires, "inbox opened");
        Ok(address)
    }

    /// True if `address` is a live inbox of this store.
    pub fn has_inbox(&self, address: &Address) -> bool {
        self.inbox(address).is_ok()
    }

    /// Every inbox that has not expired.
    pub fn live_inboxes(&self) -> Vec<Address> {
        self.inboxes.keys().filter(|address| self.has_inbox(address)).copied().collect()
    }

    fn inbox(&self, address: &Address) -> Result<&Inbox, KeyStoreError> {
        let inbox = self.inboxes.get(address).ok_or(KeyStoreError::UnknownInbox(*address))?;
        if inbox.expires != 0 && self.env.wall_clock_secs() >= inbox.expires {
            return Err(KeyStoreError::InboxExpired(*address));
        }
        Ok(inbox)
    }

    /// Generate and sign a key package for `owner`.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::UnknownInbox` / `InboxExpired` if `owner` is not a
    ///   live inbox
    /// - `KeyStoreError::KeyExhausted` if the outstanding budget is used up
    pub fn generate_key_package(&mut self, owner: &Address, expires: u64) -> Result<KeyPackage, KeyStoreError> {
        let identity = self.inbox(owner)?.identity.clone();

        let outstanding = self.storage.key_package_count()?;
        if outstanding >= self.budget {
            tracing::warn!(%owner, outstanding, budget = self.budget, "key package budget exhausted");
            return Err(KeyStoreError::KeyExhausted { outstanding, budget: self.budget });
        }

        let secret = KeyPackageSecret { owner: *owner, secret: self.env.random_array(), expires };
        let mut key_package = KeyPackage {
            owner: *owner,
            init_key: crypto::x25519_public(&secret.secret),
            expires,
            signature: Vec::new(),
        };
        key_package.signature = identity.sign(&key_package.to_be_signed());

        let reference = key_package.reference();
        let sealed = self.seal(&secret)?;
        self.storage.put_key_package(&reference, &sealed)?;

        tracing::debug!(%owner, %reference, expires, "key package generated");
        Ok(key_package)
    }

    /// Consume the secret for a key package.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::UnknownKeyPackage` if never generated or already
    ///   consumed
    pub fn take_key_package(&mut self, reference: &KeyPackageRef) -> Result<KeyPackageSecret, KeyStoreError> {
        let sealed = self
            .storage
            .take_key_package(reference)?
            .ok_or(KeyStoreError::UnknownKeyPackage(*reference))?;
        unseal(&self.storage_key, &sealed)
    }

    /// Destroy a key package secret without using it. Returns true if it
    /// existed.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::Storage` if the backend fails
    pub fn discard_key_package(&mut self, reference: &KeyPackageRef) -> Result<bool, KeyStoreError> {
        Ok(self.storage.take_key_package(reference)?.is_some())
    }

    /// Key package secrets still held, with their owner and expiry.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::Storage` if the backend fails
    /// - `KeyStoreError::Corrupt` if a record does not open under the storage key
    pub fn pending_key_packages(&self) -> Result<Vec<(KeyPackageRef, Address, u64)>, KeyStoreError> {
        self.storage
            .load_key_packages()?
            .into_iter()
            .map(|(reference, sealed)| {
                let secret: KeyPackageSecret = unseal(&self.storage_key, &sealed)?;
                Ok((reference, secret.owner, secret.expires))
            })
            .collect()
    }

    /// Destroy every key package secret expired at `now_secs`, returning
    /// the budget they held. Returns the destroyed references.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::Storage` if the backend fails
    /// - `KeyStoreError::Corrupt` if a record does not open under the storage key
    pub fn sweep_key_packages(&mut self, now_secs: u64) -> Result<Vec<KeyPackageRef>, KeyStoreError> {
        let mut reclaimed = Vec::new();
        for (reference, _, expires) in self.pending_key_packages()? {
            if expires <= now_secs && self.storage.take_key_package(&reference)?.is_some() {
                tracing::debug!(%reference, expires, "expired key package destroyed");
                reclaimed.push(reference);
            }
        }
        Ok(reclaimed)
    }

    /// Sign `message` as `signer`.
    ///
    /// # Errors
    ///
    /// - `KeyStoreError::UnknownInbox` / `InboxExpired` if `signer` is not a
    ///   live inbox
    pub fn sign(&self, signer: &Address, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        Ok(self.inbox(signer)?.identity.sign(message))
    }

    /// Fresh ephemeral X25519 secret.
    pub fn ephemeral_secret(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.env.random_array())
    }

    /// Random nonce for message sealing.
    pub fn nonce(&self) -> [u8; crypto::NONCE_SIZE] {
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        self.env.random_bytes(&mut nonce);
        nonce
    }

    fn seal<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, KeyStoreError> {
        let mut plain = Zeroizing::new(Vec::new());
        ciborium::ser::into_writer(record, &mut *plain).map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        Ok(crypto::seal_record(&self.storage_key, &self.nonce(), &plain))
    }
}

fn unseal<T: serde::de::DeserializeOwned>(storage_key: &[u8; 32], sealed: &[u8]) -> Result<T, KeyStoreError> {
    let plain = crypto::open_record(storage_key, sealed)
        .map(Zeroizing::new)
        .ok_or_else(|| KeyStoreError::Corrupt("record does not open under the storage key".to_string()))?;
    ciborium::de::from_reader(plain.as_slice()).map_err(|e| KeyStoreError::Corrupt(e.to_string()))
}
