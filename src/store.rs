//! Key-value store abstraction and the key schema used by the syncer.
//!
//! The storage engine itself is external; the syncer only needs point reads,
//! point writes and atomic batch writes. Keys carry single-byte prefixes so
//! bytecodes, flat-state snapshot rows and the sync checkpoint share one
//! namespace without colliding.

use ethereum_types::H256;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::constants::SYNC_STATUS_KEY;

/// Prefix for contract bytecode entries, keyed by code hash.
const CODE_PREFIX: u8 = b'c';
/// Prefix for flat account snapshot rows, keyed by account hash.
const ACCOUNT_SNAPSHOT_PREFIX: u8 = b'a';
/// Prefix for flat storage snapshot rows, keyed by account and slot hash.
const STORAGE_SNAPSHOT_PREFIX: u8 = b'o';

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The persistence interface the syncer writes through.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Applies every operation in the batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// A buffered set of writes applied in a single atomic step.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.size += key.len() + value.len();
        self.ops.push((key, value));
    }

    /// Total byte size of the buffered keys and values, used to decide when
    /// an opportunistic flush is due.
    pub fn value_size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, yielding its operations in insertion order.
    pub fn into_ops(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.ops
    }
}

// ---------------------------------------------------------------------------
// Key schema helpers
// ---------------------------------------------------------------------------

fn prefixed(prefix: u8, parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + parts.iter().map(|p| p.len()).sum::<usize>());
    key.push(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn code_key(hash: H256) -> Vec<u8> {
    prefixed(CODE_PREFIX, &[hash.as_bytes()])
}

pub fn account_snapshot_key(account_hash: H256) -> Vec<u8> {
    prefixed(ACCOUNT_SNAPSHOT_PREFIX, &[account_hash.as_bytes()])
}

pub fn storage_snapshot_key(account_hash: H256, storage_hash: H256) -> Vec<u8> {
    prefixed(
        STORAGE_SNAPSHOT_PREFIX,
        &[account_hash.as_bytes(), storage_hash.as_bytes()],
    )
}

/// Stages a validated bytecode into a batch.
pub fn write_code(batch: &mut WriteBatch, hash: H256, code: &[u8]) {
    batch.put(code_key(hash), code.to_vec());
}

pub fn read_code(db: &dyn KeyValueStore, hash: H256) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(&code_key(hash))
}

pub fn has_code(db: &dyn KeyValueStore, hash: H256) -> Result<bool, StoreError> {
    Ok(db.get(&code_key(hash))?.is_some())
}

/// Stages a flat account snapshot row into a batch.
pub fn write_account_snapshot(batch: &mut WriteBatch, account_hash: H256, blob: &[u8]) {
    batch.put(account_snapshot_key(account_hash), blob.to_vec());
}

/// Stages a flat storage snapshot row into a batch.
pub fn write_storage_snapshot(
    batch: &mut WriteBatch,
    account_hash: H256,
    storage_hash: H256,
    value: &[u8],
) {
    batch.put(storage_snapshot_key(account_hash, storage_hash), value.to_vec());
}

pub fn read_sync_status(db: &dyn KeyValueStore) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(SYNC_STATUS_KEY)
}

pub fn write_sync_status(db: &dyn KeyValueStore, status: &[u8]) -> Result<(), StoreError> {
    db.put(SYNC_STATUS_KEY, status)
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Map-backed store for tests and light embedders.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write();
        for (key, value) in batch.into_ops() {
            map.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefixes_do_not_collide() {
        let hash = H256::repeat_byte(0xab);
        let code = code_key(hash);
        let account = account_snapshot_key(hash);
        let storage = storage_snapshot_key(hash, hash);
        assert_ne!(code[0], account[0]);
        assert_ne!(account[0], storage[0]);
        assert_ne!(code[0], storage[0]);
        assert_eq!(code.len(), 33);
        assert_eq!(account.len(), 33);
        assert_eq!(storage.len(), 65);
    }

    #[test]
    fn batch_tracks_value_size_and_applies_atomically() {
        let db = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        write_code(&mut batch, H256::repeat_byte(1), b"aaaa");
        write_code(&mut batch, H256::repeat_byte(2), b"bb");
        assert_eq!(batch.value_size(), 33 + 4 + 33 + 2);

        db.write(batch).unwrap();
        assert_eq!(
            read_code(&db, H256::repeat_byte(1)).unwrap().as_deref(),
            Some(b"aaaa".as_slice())
        );
        assert!(has_code(&db, H256::repeat_byte(2)).unwrap());
        assert!(!has_code(&db, H256::repeat_byte(3)).unwrap());
    }

    #[test]
    fn sync_status_round_trips() {
        let db = InMemoryStore::new();
        assert!(read_sync_status(&db).unwrap().is_none());
        write_sync_status(&db, b"{}").unwrap();
        assert_eq!(read_sync_status(&db).unwrap().as_deref(), Some(b"{}".as_slice()));
    }
}
