use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Computes the keccak-256 content hash of a blob. The hash doubles as the
/// work-item identity throughout the syncer.
pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_vector() {
        // keccak256("abc")
        let hash = keccak256(b"abc");
        assert_eq!(
            format!("{hash:?}"),
            "0x4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45"
        );
    }
}
