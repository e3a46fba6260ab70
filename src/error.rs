use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced at the syncer's API boundary.
///
/// Peer-attributable failures (timeouts, refusals, wire errors, bad replies)
/// never escape [`Syncer::sync`](crate::sync::Syncer::sync); they cause local
/// rescheduling instead. Only cancellation and fatal store errors propagate.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A peer with the same id is already tracked by the registry.
    #[error("already registered")]
    AlreadyRegistered,

    /// The peer id is unknown to the registry.
    #[error("not registered")]
    NotRegistered,

    /// The sync cycle was terminated through the external cancel signal.
    #[error("sync cancelled")]
    Cancelled,

    /// A peer reply contained data that was never requested, or delivered it
    /// out of manifest order.
    #[error("unexpected bytecode")]
    UnexpectedBytecode,

    /// The store failed on the critical persistence path; the cycle cannot
    /// maintain its invariants past this point.
    #[error(transparent)]
    Store(#[from] StoreError),
}
