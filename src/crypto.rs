//! Cryptographic utilities for the pool
//!
//! Provides the 32-byte Blake2b domain hash, deterministic per-height signing
//! keys, share-id derivation and announcement signatures.

use crate::types::BlockHeader;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signer, SigningKey};

/// Blake2b with a 32-byte output
pub type Blake2b256 = Blake2b<U32>;

/// Hash arbitrary data with the pool domain hash
pub fn hash256(data: &[u8]) -> [u8; 32] {
    Blake2b256::digest(data).into()
}

/// Hash the concatenation of two nodes
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Derive the signing key for `height` from the pool's private seed
///
/// Same seed and height always give the same key, so validators can recompute the
/// expected public key without any key distribution.
pub fn derive_signing_key(private_seed: &[u8], height: u32) -> SigningKey {
    let mut hasher = Blake2b256::new();
    hasher.update(private_seed);
    hasher.update(height.to_le_bytes());
    let seed: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&seed)
}

/// Public half of [`derive_signing_key`]
pub fn derive_public_key(private_seed: &[u8], height: u32) -> [u8; 32] {
    derive_signing_key(private_seed, height).verifying_key().to_bytes()
}

/// Identifier binding a content proof to one share
///
/// The first 16 bytes of the header hash XORed with the first 16 bytes of the
/// proof payload. Short proofs are treated as zero padded.
pub fn share_id(header: &BlockHeader, proof: &[u8]) -> [u8; 16] {
    let header_hash = hash256(header.as_bytes());
    let mut id = [0u8; 16];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = header_hash[i] ^ proof.get(i).copied().unwrap_or(0);
    }
    id
}

/// Index used for content proofs and handler shard routing
pub fn content_proof_index(share_id: &[u8; 16]) -> u32 {
    u32::from_le_bytes([share_id[0], share_id[1], share_id[2], share_id[3]])
}

/// Detached signature over an announcement
pub fn sign_announcement(key: &SigningKey, announcement: &[u8]) -> [u8; 64] {
    key.sign(announcement).to_bytes()
}
