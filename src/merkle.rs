//! Merkle content proofs over announcement content
//!
//! Content is cut into 32-byte leaves, the final leaf zero padded. The leaf level
//! is padded with zero leaves to a power of two and parents are the domain hash of
//! `left ‖ right`, never sorted. A proof is the raw leaf followed by the siblings
//! on the way to the root.

use crate::crypto::hash_pair;
use crate::{Error, Result};

/// Leaf size in bytes
pub const LEAF_SIZE: usize = 32;

/// Split content into zero-padded 32-byte leaves
fn leaves(content: &[u8]) -> Vec<[u8; 32]> {
    if content.is_empty() {
        return vec![[0u8; 32]];
    }
    content
        .chunks(LEAF_SIZE)
        .map(|chunk| {
            let mut leaf = [0u8; 32];
            leaf[..chunk.len()].copy_from_slice(chunk);
            leaf
        })
        .collect()
}

/// Number of leaves the content occupies
pub fn leaf_count(content_len: usize) -> usize {
    content_len.div_ceil(LEAF_SIZE).max(1)
}

/// Every level of the tree, leaves first, root last
fn levels(content: &[u8]) -> Vec<Vec<[u8; 32]>> {
    let mut level = leaves(content);
    level.resize(level.len().next_power_of_two(), [0u8; 32]);
    let mut out = vec![level];
    while out[out.len() - 1].len() > 1 {
        let next = out[out.len() - 1]
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        out.push(next);
    }
    out
}

/// Root of the content tree
///
/// Content of 32 bytes or less is its own (padded) root.
pub fn content_root(content: &[u8]) -> [u8; 32] {
    let levels = levels(content);
    levels[levels.len() - 1][0]
}

/// Build a proof for the leaf selected by `identifier mod leafCount`
pub fn build_proof(content: &[u8], identifier: u32) -> Vec<u8> {
    let levels = levels(content);
    let mut index = identifier as usize % leaf_count(content.len());
    let mut proof = Vec::with_capacity(LEAF_SIZE * levels.len());
    proof.extend_from_slice(&levels[0][index]);
    for level in &levels[..levels.len() - 1] {
        proof.extend_from_slice(&level[index ^ 1]);
        index >>= 1;
    }
    proof
}

/// Fold a proof back into the root it commits to
pub fn fold_proof(proof: &[u8], content_len: usize, identifier: u32) -> Result<[u8; 32]> {
    if proof.is_empty() || proof.len() % LEAF_SIZE != 0 {
        return Err(Error::format(format!(
            "content proof length {} is not a non-zero multiple of {}",
            proof.len(),
            LEAF_SIZE
        )));
    }
    let count = leaf_count(content_len);
    let depth = count.next_power_of_two().trailing_zeros() as usize;
    if proof.len() != LEAF_SIZE * (depth + 1) {
        return Err(Error::format(format!(
            "content proof for {} leaves must be {} bytes, got {}",
            count,
            LEAF_SIZE * (depth + 1),
            proof.len()
        )));
    }
    let mut index = identifier as usize % count;
    let mut chunks = proof.chunks_exact(LEAF_SIZE).map(|c| {
        let mut node = [0u8; 32];
        node.copy_from_slice(c);
        node
    });
    let mut acc = chunks.next().unwrap_or([0u8; 32]);
    for sibling in chunks {
        acc = if index & 1 == 0 {
            hash_pair(&acc, &sibling)
        } else {
            hash_pair(&sibling, &acc)
        };
        index >>= 1;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_fold_matches_root() {
        for len in [1usize, 32, 33, 64, 65, 1000] {
            let data = content(len);
            let root = content_root(&data);
            for identifier in [0u32, 1, 2, 5, 31, 0xdead_beef, u32::MAX] {
                let proof = build_proof(&data, identifier);
                assert_eq!(
                    fold_proof(&proof, len, identifier).unwrap(),
                    root,
                    "len {} identifier {}",
                    len,
                    identifier
                );
            }
        }
    }

    #[test]
    fn test_small_content_is_single_leaf() {
        let data = content(20);
        let mut padded = [0u8; 32];
        padded[..20].copy_from_slice(&data);
        assert_eq!(content_root(&data), padded);
        assert_eq!(build_proof(&data, 12345), padded.to_vec());
    }

    #[test]
    fn test_two_leaf_root() {
        let data = content(64);
        let mut left = [0u8; 32];
        let mut right = [0u8; 32];
        left.copy_from_slice(&data[..32]);
        right.copy_from_slice(&data[32..]);
        assert_eq!(content_root(&data), hash_pair(&left, &right));

        let proof = build_proof(&data, 1);
        assert_eq!(&proof[..32], &right);
        assert_eq!(&proof[32..], &left);
    }

    #[test]
    fn test_leaf_index_wraps_on_leaf_count() {
        // 65 bytes -> 3 leaves padded to 4; identifier 3 selects leaf 0
        let data = content(65);
        assert_eq!(leaf_count(65), 3);
        assert_eq!(build_proof(&data, 3), build_proof(&data, 0));
    }

    #[test]
    fn test_fold_rejects_bad_lengths() {
        assert!(fold_proof(&[], 64, 0).is_err());
        assert!(fold_proof(&[0u8; 33], 64, 0).is_err());
        assert!(fold_proof(&[0u8; 32], 64, 0).is_err());
    }

    #[test]
    fn test_tampered_proof_changes_root() {
        let data = content(1000);
        let mut proof = build_proof(&data, 17);
        proof[40] ^= 1;
        assert_ne!(fold_proof(&proof, 1000, 17).unwrap(), content_root(&data));
    }
}
