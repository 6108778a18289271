use sha2::{Digest, Sha256};

/// Hex SHA-256, used to keep raw identifiers out of storage paths.
pub fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let first = compute_hash("store-1");
        assert_eq!(first.len(), 64);
        assert_eq!(first, compute_hash("store-1"));
        assert_ne!(first, compute_hash("store-2"));
    }
}
