//! Tuning constants for the bytecode sync core.
//!
//! The request sizing values are heuristics, not protocol rules: they decide
//! how full responses get and how much bandwidth a single query may burn.

use ethereum_types::H256;
use hex_literal::hex;
use std::time::Duration;

// ============================================================================
// Request Sizing
// ============================================================================

/// Minimum number of bytes to request from a remote peer. Used as the low cap
/// for range-style requests; bytecode requests are limited by item count.
pub const MIN_REQUEST_SIZE: u64 = 64 * 1024;

/// Maximum number of bytes to request from a remote peer in a single query.
pub const MAX_REQUEST_SIZE: u64 = 512 * 1024;

/// Maximum number of bytecode blobs to request in a single query. Too low and
/// responses don't fill up, wasting round trips; too high and responses get
/// capped, wasting bandwidth.
///
/// Deployed bytecodes are capped at 24KB, and most contracts come nowhere
/// near that, so requesting 4x the worst-case fill is a good approximation.
pub const MAX_CODE_REQUEST_COUNT: usize = MAX_REQUEST_SIZE as usize / (24 * 1024) * 4;

/// Maximum number of trie node blobs the heal scheduler is asked to queue up
/// alongside bytecodes in a single top-up.
pub const MAX_TRIE_REQUEST_COUNT: usize = MAX_REQUEST_SIZE as usize / 512;

// ============================================================================
// Concurrency
// ============================================================================

/// Number of chunks to split the account hash space into for concurrent
/// retrieval by the upstream range sync.
pub const ACCOUNT_CONCURRENCY: usize = 16;

/// Number of chunks to split a large contract storage trie into for
/// concurrent retrieval by the upstream range sync.
pub const STORAGE_CONCURRENCY: usize = 16;

// ============================================================================
// Persistence
// ============================================================================

/// Byte size past which the shared flat-state write batch is flushed to the
/// store and reset.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Database key under which the JSON sync checkpoint is persisted.
pub const SYNC_STATUS_KEY: &[u8] = b"CodeSyncStatus";

// ============================================================================
// Reporting
// ============================================================================

/// Minimum interval between two progress log lines.
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(8);

// ============================================================================
// Well-known hashes
// ============================================================================

/// Keccak-256 hash of the empty bytecode. Accounts declaring it carry no
/// code and never become work items.
pub const EMPTY_CODE_HASH: H256 = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

/// Root hash of an empty state trie.
pub const EMPTY_ROOT_HASH: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::keccak256;

    #[test]
    fn empty_code_hash_matches_keccak_of_nothing() {
        assert_eq!(keccak256(&[]), EMPTY_CODE_HASH);
    }

    #[test]
    fn code_request_count_fills_a_max_request() {
        // 512 KiB worth of worst-case 24 KiB contracts, requested 4x over.
        assert_eq!(MAX_CODE_REQUEST_COUNT, 84);
        assert_eq!(MAX_TRIE_REQUEST_COUNT, 1024);
    }
}
