//! Keccak-256, the hash used for address derivation, transaction hashing and address checksums.
use sha3::{Digest, Keccak256};

/// Type alias for a Keccak-256 result.
pub type Keccak256Hash = [u8; 32];

/// Computes the Keccak-256 digest of `data`. This is the Keccak padding Ethereum uses, not NIST
/// SHA3-256.
pub fn keccak256<T: AsRef<[u8]>>(data: T) -> Keccak256Hash {
    Keccak256::digest(data.as_ref()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
