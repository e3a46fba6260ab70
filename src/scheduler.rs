//! Interface of the external state-trie reconstruction scheduler driven by
//! the heal phase.
//!
//! The scheduler owns the knowledge of which trie nodes and contract codes
//! are still missing from the reassembled state. The syncer pulls work out
//! of it with [`TrieScheduler::missing`], feeds downloaded bytecodes back in
//! with [`TrieScheduler::process`], and commits its staged writes into a
//! database batch.

use bytes::Bytes;
use ethereum_types::H256;
use thiserror::Error;

use crate::store::WriteBatch;

/// Path of a trie node as a list of key segments (one for account trie
/// nodes, two for storage trie nodes).
pub type SyncPath = Vec<Vec<u8>>;

/// Outcomes the scheduler may report for a submitted bytecode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The entry was already integrated; counted and tolerated.
    #[error("already processed")]
    AlreadyProcessed,

    /// The entry was never requested by the scheduler; counted and
    /// tolerated.
    #[error("not requested")]
    NotRequested,

    /// The scheduler rejected the entry internally. The blob already passed
    /// the content-hash check, so this is logged but does not fail the
    /// request.
    #[error("invalid entry: {0}")]
    Invalid(String),
}

/// A batch of retrieval tasks handed out by the scheduler.
#[derive(Debug, Default)]
pub struct MissingTasks {
    /// Missing trie nodes with their paths.
    pub nodes: Vec<(H256, SyncPath)>,
    /// Missing contract codes.
    pub codes: Vec<H256>,
}

pub trait TrieScheduler: Send + Sync {
    /// Hands out up to `limit` retrieval tasks that are not yet in flight.
    fn missing(&self, limit: usize) -> MissingTasks;

    /// Number of entries the scheduler is still waiting on, handed out or
    /// not. The heal phase is complete when this reaches zero.
    fn pending(&self) -> usize;

    /// Integrates a downloaded bytecode.
    fn process(&self, hash: H256, data: Bytes) -> Result<(), SchedulerError>;

    /// Moves the scheduler's staged writes into `batch` for atomic
    /// persistence.
    fn commit(&self, batch: &mut WriteBatch) -> Result<(), SchedulerError>;
}
