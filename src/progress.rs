//! Resumable sync progress.
//!
//! The checkpoint is stored as JSON under a well-known key so that older
//! checkpoints keep decoding across versions. An unreadable checkpoint is
//! discarded in favour of a fresh retrieval plan rather than aborting.

use ethereum_types::{BigEndianHash, H256, U256};
use serde::{Deserialize, Serialize};

use crate::account::AccountTask;
use crate::constants::ACCOUNT_CONCURRENCY;

/// Database entry allowing a suspended sync cycle to be resumed later.
/// Without it there is no way to restart a suspended cycle, as the syncer
/// would have no knowledge of the suspension point.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Account chunks still being worked on.
    #[serde(rename = "Tasks", default)]
    pub tasks: Vec<AccountTask>,

    /// Number of bytecodes downloaded by the sync phase.
    #[serde(rename = "BytecodeSynced")]
    pub bytecode_synced: u64,
    /// Number of bytecode bytes downloaded by the sync phase.
    #[serde(rename = "BytecodeBytes")]
    pub bytecode_bytes: u64,

    /// Number of bytecodes downloaded by the heal phase.
    #[serde(rename = "BytecodeHealSynced")]
    pub bytecode_heal_synced: u64,
    /// Number of bytecode bytes downloaded by the heal phase.
    #[serde(rename = "BytecodeHealBytes")]
    pub bytecode_heal_bytes: u64,
}

/// Ephemeral progress that is reported on demand but never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncPending {
    /// Number of bytecodes the heal phase currently has queued.
    pub bytecode_heal_pending: u64,
}

/// Fresh retrieval plan: the 256-bit account hash space split into
/// contiguous equal chunks, with the last chunk clamped to `0xFF…FF` to
/// absorb division rounding.
pub(crate) fn fresh_account_tasks() -> Vec<AccountTask> {
    let step = U256::MAX / U256::from(ACCOUNT_CONCURRENCY);
    let mut tasks = Vec::with_capacity(ACCOUNT_CONCURRENCY);
    let mut next = U256::zero();
    for i in 0..ACCOUNT_CONCURRENCY {
        let last = if i == ACCOUNT_CONCURRENCY - 1 {
            U256::MAX
        } else {
            next + step
        };
        tasks.push(AccountTask::new(
            H256::from_uint(&next),
            H256::from_uint(&last),
        ));
        if i < ACCOUNT_CONCURRENCY - 1 {
            next = last + U256::one();
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_plan_covers_the_whole_hash_space() {
        let tasks = fresh_account_tasks();
        assert_eq!(tasks.len(), ACCOUNT_CONCURRENCY);
        assert_eq!(tasks[0].next, H256::zero());
        assert_eq!(tasks.last().unwrap().last, H256::repeat_byte(0xff));
        for pair in tasks.windows(2) {
            let last = pair[0].last.into_uint();
            let next = pair[1].next.into_uint();
            assert_eq!(next, last + U256::one(), "chunks must be contiguous");
        }
    }

    #[test]
    fn checkpoint_serializes_with_stable_keys() {
        let progress = SyncProgress {
            tasks: vec![AccountTask::new(H256::zero(), H256::repeat_byte(0xff))],
            bytecode_synced: 3,
            bytecode_bytes: 1024,
            bytecode_heal_synced: 1,
            bytecode_heal_bytes: 64,
        };
        let value = serde_json::to_value(&progress).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "Tasks",
            "BytecodeSynced",
            "BytecodeBytes",
            "BytecodeHealSynced",
            "BytecodeHealBytes",
        ] {
            assert!(object.contains_key(key), "missing checkpoint key {key}");
        }
        assert_eq!(value["BytecodeBytes"], 1024);
        assert!(value["Tasks"][0].as_object().unwrap().contains_key("Next"));
    }

    #[test]
    fn checkpoint_round_trips() {
        let progress = SyncProgress {
            tasks: fresh_account_tasks(),
            bytecode_synced: 42,
            bytecode_bytes: 9000,
            bytecode_heal_synced: 7,
            bytecode_heal_bytes: 128,
        };
        let blob = serde_json::to_vec(&progress).unwrap();
        let decoded: SyncProgress = serde_json::from_slice(&blob).unwrap();
        assert_eq!(decoded.tasks.len(), ACCOUNT_CONCURRENCY);
        assert_eq!(decoded.bytecode_synced, 42);
        assert_eq!(decoded.bytecode_heal_bytes, 128);
        assert_eq!(decoded.tasks[3].next, progress.tasks[3].next);
    }

    #[test]
    fn missing_tasks_field_defaults_to_empty() {
        let decoded: SyncProgress = serde_json::from_slice(
            br#"{"BytecodeSynced":1,"BytecodeBytes":2,"BytecodeHealSynced":3,"BytecodeHealBytes":4}"#,
        )
        .unwrap();
        assert!(decoded.tasks.is_empty());
        assert_eq!(decoded.bytecode_heal_synced, 3);
    }
}
