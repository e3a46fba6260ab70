//! Account state codec and the per-chunk account sync task.
//!
//! The upstream range sync already downloaded the account leaves for each
//! chunk of the hash space; this module turns those leaves into bytecode
//! work items and keeps per-task bookkeeping of which accounts still wait
//! for their code.

use ethereum_types::{H256, U256};
use indexmap::IndexSet;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

use crate::constants::{EMPTY_CODE_HASH, EMPTY_ROOT_HASH};
use crate::store::{has_code, KeyValueStore, StoreError};

/// An account row of the global state trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAccount {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl Encodable for StateAccount {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(4);
        stream.append(&self.nonce);
        stream.append(&self.balance);
        stream.append(&self.storage_root);
        stream.append(&self.code_hash);
    }
}

impl Decodable for StateAccount {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            storage_root: rlp.val_at(2)?,
            code_hash: rlp.val_at(3)?,
        })
    }
}

/// Re-encodes an account for flat snapshot storage, replacing the well-known
/// defaults (empty storage trie, no code) with empty strings to save space.
pub fn slim_account_rlp(account: &StateAccount) -> Vec<u8> {
    let mut stream = RlpStream::new_list(4);
    stream.append(&account.nonce);
    stream.append(&account.balance);
    if account.storage_root == EMPTY_ROOT_HASH {
        stream.append_empty_data();
    } else {
        stream.append(&account.storage_root);
    }
    if account.code_hash == EMPTY_CODE_HASH {
        stream.append_empty_data();
    } else {
        stream.append(&account.code_hash);
    }
    stream.out().to_vec()
}

/// A single account leaf obtained by the upstream range sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLeaf {
    /// Hash of the account address; its position in the account hash space.
    pub hash: H256,
    /// Code hash the account declares.
    pub code_hash: H256,
}

/// Produces the already-downloaded account leaves for a chunk of the account
/// hash space. Implemented by the upstream layer that ran the range sync.
pub trait LeafSource: Send + Sync {
    /// Returns the leaves whose account hash falls within `[first, last]`,
    /// in account-hash order.
    fn leaves(&self, first: H256, last: H256) -> Vec<AccountLeaf>;
}

/// Sync task covering one contiguous chunk of the account hash space.
///
/// Only the chunk boundaries are persisted in the checkpoint; the bytecode
/// bookkeeping is rebuilt from the leaf source (and the codes already in the
/// store) whenever a cycle starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountTask {
    /// First account hash covered by this chunk.
    #[serde(rename = "Next")]
    pub next: H256,
    /// Last account hash covered by this chunk.
    #[serde(rename = "Last")]
    pub last: H256,

    #[serde(skip)]
    pub(crate) id: u64,
    #[serde(skip)]
    pub(crate) leaves: Vec<AccountLeaf>,
    /// Parallel to `leaves`: whether the account still waits for its code.
    #[serde(skip)]
    pub(crate) need_code: Vec<bool>,
    /// Number of accounts still waiting for their code.
    #[serde(skip)]
    pub(crate) pend: usize,
    /// Code hashes queued for retrieval, in insertion order. Hashes are
    /// removed while assigned to a request and restored on revert.
    #[serde(skip)]
    pub(crate) code_tasks: IndexSet<H256>,
    #[serde(skip)]
    pub(crate) done: bool,
}

impl AccountTask {
    pub fn new(next: H256, last: H256) -> Self {
        Self {
            next,
            last,
            id: 0,
            leaves: Vec::new(),
            need_code: Vec::new(),
            pend: 0,
            code_tasks: IndexSet::new(),
            done: false,
        }
    }

    /// Rebuilds the bytecode bookkeeping from the leaf source, skipping
    /// codeless accounts and codes that are already persisted. Rechecking the
    /// store here is what makes a resumed cycle skip finished work.
    pub(crate) fn hydrate(
        &mut self,
        id: u64,
        source: &dyn LeafSource,
        db: &dyn KeyValueStore,
    ) -> Result<(), StoreError> {
        self.id = id;
        self.leaves = source.leaves(self.next, self.last);
        self.need_code = Vec::with_capacity(self.leaves.len());
        self.pend = 0;
        self.code_tasks.clear();
        for leaf in &self.leaves {
            let need = leaf.code_hash != EMPTY_CODE_HASH && !has_code(db, leaf.code_hash)?;
            if need {
                self.pend += 1;
                self.code_tasks.insert(leaf.code_hash);
            }
            self.need_code.push(need);
        }
        self.done = self.pend == 0;
        Ok(())
    }

    /// Copy carrying only the persistent chunk boundaries.
    pub(crate) fn snapshot(&self) -> Self {
        Self::new(self.next, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{write_code, InMemoryStore, WriteBatch};
    use crate::utils::keccak256;

    struct StaticLeaves(Vec<AccountLeaf>);

    impl LeafSource for StaticLeaves {
        fn leaves(&self, first: H256, last: H256) -> Vec<AccountLeaf> {
            self.0
                .iter()
                .filter(|leaf| leaf.hash >= first && leaf.hash <= last)
                .copied()
                .collect()
        }
    }

    fn account() -> StateAccount {
        StateAccount {
            nonce: 7,
            balance: U256::from(1_000_000u64),
            storage_root: H256::repeat_byte(0x11),
            code_hash: H256::repeat_byte(0x22),
        }
    }

    #[test]
    fn account_rlp_round_trips() {
        let original = account();
        let encoded = rlp::encode(&original);
        let decoded: StateAccount = rlp::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn slim_encoding_keeps_non_default_fields() {
        let blob = slim_account_rlp(&account());
        let rlp = Rlp::new(&blob);
        assert_eq!(rlp.item_count().unwrap(), 4);
        assert_eq!(rlp.val_at::<H256>(2).unwrap(), H256::repeat_byte(0x11));
        assert_eq!(rlp.val_at::<H256>(3).unwrap(), H256::repeat_byte(0x22));
    }

    #[test]
    fn slim_encoding_omits_defaults() {
        let mut plain = account();
        plain.storage_root = EMPTY_ROOT_HASH;
        plain.code_hash = EMPTY_CODE_HASH;
        let blob = slim_account_rlp(&plain);
        let rlp = Rlp::new(&blob);
        assert!(rlp.val_at::<Vec<u8>>(2).unwrap().is_empty());
        assert!(rlp.val_at::<Vec<u8>>(3).unwrap().is_empty());
        assert!(blob.len() < rlp::encode(&plain).len());
    }

    #[test]
    fn hydrate_skips_codeless_and_persisted_accounts() {
        let db = InMemoryStore::new();
        let stored_code = b"persisted".to_vec();
        let stored_hash = keccak256(&stored_code);
        let mut batch = WriteBatch::new();
        write_code(&mut batch, stored_hash, &stored_code);
        db.write(batch).unwrap();

        let wanted = H256::repeat_byte(0xaa);
        let source = StaticLeaves(vec![
            AccountLeaf { hash: H256::repeat_byte(1), code_hash: EMPTY_CODE_HASH },
            AccountLeaf { hash: H256::repeat_byte(2), code_hash: stored_hash },
            AccountLeaf { hash: H256::repeat_byte(3), code_hash: wanted },
            // Two accounts may well declare the same code.
            AccountLeaf { hash: H256::repeat_byte(4), code_hash: wanted },
        ]);

        let mut task = AccountTask::new(H256::zero(), H256::repeat_byte(0xff));
        task.hydrate(1, &source, &db).unwrap();

        assert_eq!(task.pend, 2);
        assert_eq!(task.need_code, vec![false, false, true, true]);
        assert_eq!(task.code_tasks.len(), 1);
        assert!(task.code_tasks.contains(&wanted));
        assert!(!task.done);
    }

    #[test]
    fn hydrate_marks_empty_chunks_done() {
        let db = InMemoryStore::new();
        let source = StaticLeaves(Vec::new());
        let mut task = AccountTask::new(H256::zero(), H256::repeat_byte(0xff));
        task.hydrate(1, &source, &db).unwrap();
        assert!(task.done);
    }
}
