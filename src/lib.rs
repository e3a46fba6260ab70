//! Contract bytecode syncing over a snap-style protocol.
//!
//! This crate downloads the bytecodes referenced by a chunked account space
//! from a pool of untrusted remote peers, validates every blob against its
//! keccak-256 content hash, persists it into a key-value store and tracks
//! progress durably, so a partially completed sync can be resumed across
//! process restarts. Once the sync phase drains, a heal phase drives an
//! external trie reconstruction scheduler to repair the code gaps the
//! chunked retrieval left at chunk boundaries.
//!
//! The storage engine, the peer transport and the trie scheduler are
//! external collaborators, consumed through the [`store::KeyValueStore`],
//! [`peer::SyncPeer`] and [`scheduler::TrieScheduler`] traits.

pub mod account;
pub mod constants;
pub mod error;
pub mod peer;
pub mod progress;
pub mod rates;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod utils;

pub use account::{AccountLeaf, AccountTask, LeafSource, StateAccount};
pub use error::SyncError;
pub use peer::{RequestError, SyncPeer};
pub use progress::{SyncPending, SyncProgress};
pub use rates::{MessageKind, RateTrackers, Tracker};
pub use scheduler::{MissingTasks, SchedulerError, SyncPath, TrieScheduler};
pub use store::{InMemoryStore, KeyValueStore, StoreError, WriteBatch};
pub use sync::{cross_reference_bytecodes, Syncer};
