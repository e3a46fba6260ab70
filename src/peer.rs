use async_trait::async_trait;
use ethereum_types::H256;
use thiserror::Error;

/// Failure to issue a wire request to a peer.
#[derive(Debug, Error)]
#[error("peer request failed: {0}")]
pub struct RequestError(pub String);

/// The methods required for a peer to be synced against, abstracted so mock
/// peers can be built without the full networking stack.
///
/// Replies do not come back through this trait: the transport delivers them
/// by invoking [`Syncer::on_byte_codes`](crate::sync::Syncer::on_byte_codes)
/// with the request id.
#[async_trait]
pub trait SyncPeer: Send + Sync {
    /// Retrieves the peer's unique identifier.
    fn id(&self) -> String;

    /// Fetches a batch of contract bytecodes by content hash, capping the
    /// response at `byte_cap` bytes. A successful return only means the
    /// request went out on the wire.
    async fn request_byte_codes(
        &self,
        request_id: u64,
        hashes: Vec<H256>,
        byte_cap: u64,
    ) -> Result<(), RequestError>;
}
