//! Content addressing for finished bundles.
//!
//! Two digests are computed over the complete on-wire byte sequence
//! (headers || ciphertext || MAC): a plain SHA-256, and the Glacier tree
//! hash — SHA-256 over 1 MiB leaves, adjacent pairs hashed together until
//! a single root remains. Data at most one leaf long has tree hash equal
//! to the linear hash.

use openssl::sha::Sha256;

pub const TREE_HASH_LEAF_SIZE: usize = 1024 * 1024;

/// SHA-256 over a sequence of buffers treated as one byte stream.
pub fn sequential_sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finish()
}

/// Glacier-style tree hash over a sequence of buffers treated as one byte
/// stream. Leaves are split at 1 MiB boundaries of the logical stream,
/// regardless of where the buffer boundaries fall.
pub fn sequential_tree_hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    let mut leaf_hasher = Sha256::new();
    let mut leaf_fill = 0usize;

    for part in parts {
        let mut rest = *part;
        while !rest.is_empty() {
            let take = rest.len().min(TREE_HASH_LEAF_SIZE - leaf_fill);
            leaf_hasher.update(&rest[..take]);
            leaf_fill += take;
            rest = &rest[take..];
            if leaf_fill == TREE_HASH_LEAF_SIZE {
                leaves.push(std::mem::replace(&mut leaf_hasher, Sha256::new()).finish());
                leaf_fill = 0;
            }
        }
    }
    if leaf_fill > 0 || leaves.is_empty() {
        leaves.push(leaf_hasher.finish());
    }

    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for pair in leaves.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = Sha256::new();
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                next.push(hasher.finish());
            } else {
                next.push(pair[0]);
            }
        }
        leaves = next;
    }
    leaves[0]
}

/// Both digests as lowercase hex, in one pass over the data.
pub fn compute_bundle_digests(parts: &[&[u8]]) -> (String, String) {
    (
        hex::encode(sequential_sha256(parts)),
        hex::encode(sequential_tree_hash(parts)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_data_tree_equals_linear() {
        let data = vec![0xabu8; TREE_HASH_LEAF_SIZE];
        let parts: [&[u8]; 1] = [&data];
        assert_eq!(sequential_tree_hash(&parts), sequential_sha256(&parts));
    }

    #[test]
    fn empty_data_tree_equals_linear() {
        let parts: [&[u8]; 0] = [];
        assert_eq!(sequential_tree_hash(&parts), sequential_sha256(&parts));
        assert_eq!(
            hex::encode(sequential_sha256(&parts)),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn two_leaves_hash_pairwise() {
        let data = vec![0x11u8; TREE_HASH_LEAF_SIZE + 5];
        let parts: [&[u8]; 1] = [&data];

        let leaf0 = {
            let mut hasher = Sha256::new();
            hasher.update(&data[..TREE_HASH_LEAF_SIZE]);
            hasher.finish()
        };
        let leaf1 = {
            let mut hasher = Sha256::new();
            hasher.update(&data[TREE_HASH_LEAF_SIZE..]);
            hasher.finish()
        };
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(&leaf0);
            hasher.update(&leaf1);
            hasher.finish()
        };

        assert_eq!(sequential_tree_hash(&parts), expected);
        assert_ne!(sequential_tree_hash(&parts), sequential_sha256(&parts));
    }

    #[test]
    fn buffer_boundaries_do_not_matter() {
        let data = vec![0x7fu8; 3 * TREE_HASH_LEAF_SIZE + 100];
        let whole: [&[u8]; 1] = [&data];
        let split: [&[u8]; 3] = [&data[..10], &data[10..TREE_HASH_LEAF_SIZE + 1], &data[TREE_HASH_LEAF_SIZE + 1..]];
        assert_eq!(sequential_tree_hash(&whole), sequential_tree_hash(&split));
        assert_eq!(sequential_sha256(&whole), sequential_sha256(&split));
    }
}
