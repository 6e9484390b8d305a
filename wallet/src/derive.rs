// Third party imports
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Derives the private key of child `index` from a parent key and a seed.
///
/// `sha256(parent_key || be_u64(index) || seed)`: the same parent, index and seed
/// always yield the same child, so pools can be rebuilt across runs.
pub fn derive_child_key(parent_key: &[u8], index: u64, seed: &str) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(parent_key);
    hasher.update(index.to_be_bytes());
    hasher.update(seed.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&hasher.finalize());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let parent = [7u8; 32];
        assert_eq!(*derive_child_key(&parent, 3, "run-a"), *derive_child_key(&parent, 3, "run-a"));
        assert_ne!(*derive_child_key(&parent, 3, "run-a"), *derive_child_key(&parent, 4, "run-a"));
        assert_ne!(*derive_child_key(&parent, 3, "run-a"), *derive_child_key(&parent, 3, "run-b"));
    }

    #[test]
    fn test_derivation_layout() {
        let parent = [1u8; 32];
        let mut preimage = parent.to_vec();
        preimage.extend_from_slice(&5u64.to_be_bytes());
        preimage.extend_from_slice(b"seed");
        let expected: [u8; 32] = Sha256::digest(&preimage).into();
        assert_eq!(*derive_child_key(&parent, 5, "seed"), expected);
    }
}
