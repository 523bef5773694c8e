use serde::{Deserialize, Serialize};

/// Fixed-length opaque index key, ordered bytewise.
///
/// Callers that index integers pack them big-endian (via `From<u64>`) so
/// numeric order and byte order coincide; the tree itself only ever
/// compares.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IndexKey(pub [u8; 8]);

impl IndexKey {
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<u64> for IndexKey {
    fn from(value: u64) -> Self {
        IndexKey(value.to_be_bytes())
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_order_matches_byte_order() {
        let mut keys: Vec<IndexKey> = [3u64, 256, 1, 1 << 40, 255].iter().map(|&k| k.into()).collect();
        keys.sort();
        let sorted: Vec<u64> = keys.iter().map(|k| k.as_u64()).collect();
        assert_eq!(sorted, vec![1, 3, 255, 256, 1 << 40]);
    }
}
