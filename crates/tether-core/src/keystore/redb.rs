//! Redb-backed durable key storage.
//!
//! Uses Redb's ACID transactions so a consumed key package can never be
//! handed out twice, even across restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tether_proto::{Address, KeyPackageRef};

use super::storage::{KeyStorage, StorageError};

/// Table: inboxes
/// Key: inbox address [32 bytes]
/// Value: sealed identity record
const INBOXES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inboxes");

/// Table: key_packages
/// Key: key package reference [32 bytes]
/// Value: sealed init key secret record
const KEY_PACKAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_packages");

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Durable key storage backed by Redb. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbKeyStorage {
    db: Arc<Database>,
}

impl RedbKeyStorage {
    /// Open or create a database at `path`, creating tables if missing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(INBOXES).map_err(io)?;
            let _ = txn.open_table(KEY_PACKAGES).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(table).map_err(io)?;
            table.insert(key, value).map_err(io)?;
        }
        txn.commit().map_err(io)
    }
}

impl KeyStorage for RedbKeyStorage {
    fn put_inbox(&self, address: &Address, sealed: &[u8]) -> Result<(), StorageError> {
        self.put(INBOXES, address.as_bytes(), sealed)
    }

    fn load_inboxes(&self) -> Result<Vec<(Address, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(INBOXES).map_err(io)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            let address = Address::from_slice(key.value()).map_err(io)?;
            out.push((address, value.value().to_vec()));
        }
        Ok(out)
    }

    fn put_key_package(&self, reference: &KeyPackageRef, sealed: &[u8]) -> Result<(), StorageError> {
        self.put(KEY_PACKAGES, reference.as_bytes(), sealed)
    }

    fn take_key_package(&self, reference: &KeyPackageRef) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let removed = {
            let mut table = txn.open_table(KEY_PACKAGES).map_err(io)?;
            let removed = table.remove(reference.as_bytes().as_slice()).map_err(io)?;
            removed.map(|guard| guard.value().to_vec())
        };
        txn.commit().map_err(io)?;
        Ok(removed)
    }

    fn load_key_packages(&self) -> Result<Vec<(KeyPackageRef, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KEY_PACKAGES).map_err(io)?;

        let mut out = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            let reference = KeyPackageRef::from_slice(key.value()).map_err(io)?;
            out.push((reference, value.value().to_vec()));
        }
        Ok(out)
    }

    fn key_package_count(&self) -> Result<usize, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KEY_PACKAGES).map_err(io)?;
        let len = table.len().map_err(io)?;
        Ok(usize::try_from(len).unwrap_or(usize::MAX))
    }
}
