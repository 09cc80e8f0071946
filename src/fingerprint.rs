use sha2::{Digest, Sha256};

/// First eight bytes of the SHA-256 digest. Stable across platforms and
/// runs, which `std::hash` does not promise.
pub fn stable_hash(input: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[0..8]);
    u64::from_be_bytes(bytes)
}

pub fn stable_hash_str(input: &str) -> u64 {
    stable_hash(input.as_bytes())
}
