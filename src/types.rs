//! Core types for work distribution
//!
//! `Work` and `BlockTemplate` are immutable snapshots produced once per height by
//! the master and mirrored by every consumer. Their binary forms are what gets
//! persisted and served, so each type keeps its canonical encoding alongside the
//! parsed fields.

use crate::codec::{write_var_bytes, write_varint, Reader};
use crate::{Error, Result};
use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a block header
pub const HEADER_SIZE: usize = 80;

/// An 80-byte block header
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader([u8; HEADER_SIZE]);

impl BlockHeader {
    const PREV_HASH: std::ops::Range<usize> = 4..36;
    const MERKLE_ROOT: std::ops::Range<usize> = 36..68;
    const NONCE: std::ops::Range<usize> = 76..80;

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; HEADER_SIZE] = slice.try_into().map_err(|_| {
            Error::format(format!(
                "block header must be {} bytes, got {}",
                HEADER_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }

    /// Hash of the parent block, in internal byte order
    pub fn prev_hash(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[Self::PREV_HASH]);
        out
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[Self::MERKLE_ROOT]);
        out
    }

    pub fn nonce(&self) -> u32 {
        u32::from_le_bytes([self.0[76], self.0[77], self.0[78], self.0[79]])
    }

    /// Copy of `self` carrying the miner-controlled fields of `mined`
    ///
    /// Only the merkle root and nonce come from the miner; version, parent hash,
    /// time and bits stay as the pool issued them.
    pub fn with_mined_fields(&self, mined: &BlockHeader) -> BlockHeader {
        let mut out = self.0;
        out[Self::MERKLE_ROOT].copy_from_slice(&mined.0[Self::MERKLE_ROOT]);
        out[Self::NONCE].copy_from_slice(&mined.0[Self::NONCE]);
        BlockHeader(out)
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHeader({})", hex::encode(self.0))
    }
}

/// Render an internal-order hash the way block explorers show it
pub fn display_hash(hash: &[u8; 32]) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Unit of work for one height, as published by the master
#[derive(Clone, PartialEq, Eq)]
pub struct Work {
    header: BlockHeader,
    signing_key: [u8; 32],
    share_target: u32,
    ann_target: u32,
    height: u32,
    coinbase: Vec<u8>,
    proof: Vec<[u8; 32]>,
    binary: Bytes,
}

impl Work {
    /// Fixed-size prefix before the coinbase
    const FIXED_SIZE: usize = HEADER_SIZE + 32 + 4 * 4;

    /// Build work and its canonical encoding
    pub fn new(
        header: BlockHeader,
        signing_key: [u8; 32],
        share_target: u32,
        ann_target: u32,
        height: u32,
        coinbase: Vec<u8>,
        proof: Vec<[u8; 32]>,
    ) -> Self {
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + coinbase.len() + proof.len() * 32);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&signing_key);
        buf.put_u32_le(share_target);
        buf.put_u32_le(ann_target);
        buf.put_u32_le(height);
        buf.put_u32_le(coinbase.len() as u32);
        buf.extend_from_slice(&coinbase);
        for hash in &proof {
            buf.extend_from_slice(hash);
        }
        Self {
            header,
            signing_key,
            share_target,
            ann_target,
            height,
            coinbase,
            proof,
            binary: Bytes::from(buf),
        }
    }

    /// Decode the binary form served as `work_<height>.bin`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let header = BlockHeader::from_bytes(reader.array("work header")?);
        let signing_key = reader.array::<32>("work signing key")?;
        let share_target = reader.u32("work share target")?;
        let ann_target = reader.u32("work ann target")?;
        let height = reader.u32("work height")?;
        let coinbase_len = reader.u32("work coinbase length")? as usize;
        let coinbase = reader.take(coinbase_len, "work coinbase")?.to_vec();
        let tail = reader.rest();
        if tail.len() % 32 != 0 {
            return Err(Error::format(format!(
                "work proof is {} bytes, not a multiple of 32",
                tail.len()
            )));
        }
        let proof = tail
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        Ok(Self {
            header,
            signing_key,
            share_target,
            ann_target,
            height,
            coinbase,
            proof,
            binary: Bytes::copy_from_slice(bytes),
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn signing_key(&self) -> &[u8; 32] {
        &self.signing_key
    }

    pub fn share_target(&self) -> u32 {
        self.share_target
    }

    pub fn ann_target(&self) -> u32 {
        self.ann_target
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn coinbase(&self) -> &[u8] {
        &self.coinbase
    }

    pub fn proof(&self) -> &[[u8; 32]] {
        &self.proof
    }

    /// Hash of the block this work builds on
    pub fn last_hash(&self) -> [u8; 32] {
        self.header.prev_hash()
    }

    /// Canonical binary form
    pub fn to_bytes(&self) -> Bytes {
        self.binary.clone()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("height", &self.height)
            .field("last_hash", &display_hash(&self.last_hash()))
            .field("share_target", &format_args!("{:08x}", self.share_target))
            .field("ann_target", &format_args!("{:08x}", self.ann_target))
            .field("coinbase_len", &self.coinbase.len())
            .field("proof_len", &self.proof.len())
            .finish()
    }
}

/// Current block template encoding version
pub const BLOCK_TEMPLATE_VERSION: u32 = 1;

/// Everything needed to turn a share into a full block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub height: u32,
    pub header: BlockHeader,
    /// Coinbase transaction without witness data, containing the commit placeholder
    pub coinbase: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    /// Remaining transactions, serialized
    pub transactions: Vec<Vec<u8>>,
}

impl BlockTemplate {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        buf.put_u32_le(BLOCK_TEMPLATE_VERSION);
        buf.put_u32_le(self.height);
        buf.extend_from_slice(self.header.as_bytes());
        write_var_bytes(&mut buf, &self.coinbase)?;
        write_varint(&mut buf, self.merkle_branch.len() as u64)?;
        for hash in &self.merkle_branch {
            buf.extend_from_slice(hash);
        }
        write_varint(&mut buf, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            write_var_bytes(&mut buf, tx)?;
        }
        Ok(Bytes::from(buf))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let version = reader.u32("template version")?;
        if version != BLOCK_TEMPLATE_VERSION {
            return Err(Error::format(format!(
                "block template version {} does not match expected {}",
                version, BLOCK_TEMPLATE_VERSION
            )));
        }
        let height = reader.u32("template height")?;
        let header = BlockHeader::from_bytes(reader.array("template header")?);
        let coinbase = reader.var_bytes("template coinbase")?.to_vec();
        let branch_len = reader.varint("template branch count")?;
        let merkle_branch = (0..branch_len)
            .map(|_| reader.array::<32>("template branch"))
            .collect::<Result<Vec<_>>>()?;
        let tx_count = reader.varint("template tx count")?;
        let transactions = (0..tx_count)
            .map(|_| reader.var_bytes("template tx").map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        reader.expect_end("block template")?;
        Ok(Self {
            height,
            header,
            coinbase,
            merkle_branch,
            transactions,
        })
    }
}

/// Pool topology document served as `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfigDoc {
    pub current_height: u32,
    pub master_url: String,
    #[serde(default)]
    pub submit_ann_urls: Vec<String>,
    #[serde(default)]
    pub download_ann_urls: Vec<String>,
    #[serde(default)]
    pub submit_block_urls: Vec<String>,
    pub version: u32,
}

/// File name of the persisted work for `height`
pub fn work_file_name(height: u32) -> String {
    format!("work_{}.bin", height)
}

/// File name of the persisted block template for `height`
pub fn template_file_name(height: u32) -> String {
    format!("bt_{}.bin", height)
}

/// Kind of snapshot named by a served file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Work,
    Template,
}

/// Parse `work_<h>.bin` / `bt_<h>.bin`
pub fn parse_snapshot_name(name: &str) -> Option<(SnapshotKind, u32)> {
    let stem = name.strip_suffix(".bin")?;
    let (kind, height) = if let Some(h) = stem.strip_prefix("work_") {
        (SnapshotKind::Work, h)
    } else {
        (SnapshotKind::Template, stem.strip_prefix("bt_")?)
    };
    if height.is_empty() || !height.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    height.parse().ok().map(|h| (kind, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn sample_template() -> BlockTemplate {
        BlockTemplate {
            height: 101,
            header: BlockHeader::from_bytes([9u8; HEADER_SIZE]),
            coinbase: vec![1, 2, 3, 4],
            merkle_branch: vec![[1u8; 32], [2u8; 32]],
            transactions: vec![vec![0xaa; 10], vec![0xbb; 300]],
        }
    }

    proptest! {
        #[test]
        fn work_roundtrip(
            header in prop::collection::vec(any::<u8>(), HEADER_SIZE),
            key in prop::array::uniform32(any::<u8>()),
            share_target in 0u32..(1 << 31),
            ann_target in 0u32..(1 << 31),
            height in 0u32..(1 << 31),
            coinbase in prop::collection::vec(any::<u8>(), 0..300),
            proof in prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..12),
        ) {
            let work = Work::new(
                BlockHeader::from_slice(&header).unwrap(),
                key,
                share_target,
                ann_target,
                height,
                coinbase,
                proof,
            );
            let decoded = Work::decode(&work.to_bytes()).unwrap();
            prop_assert_eq!(&decoded, &work);
            prop_assert_eq!(decoded.to_bytes(), work.to_bytes());
        }
    }

    #[test]
    fn test_work_layout() {
        let mut header = [0u8; HEADER_SIZE];
        header[4..36].copy_from_slice(&[0x11; 32]);
        let work = Work::new(
            BlockHeader::from_bytes(header),
            [0x22; 32],
            0x1e0fffff,
            0x2000ffff,
            101,
            vec![0xcb; 5],
            vec![[0x33; 32]],
        );
        let bytes = work.to_bytes();
        assert_eq!(bytes.len(), 80 + 32 + 16 + 5 + 32);
        assert_eq!(&bytes[112..116], &0x1e0fffffu32.to_le_bytes());
        assert_eq!(&bytes[120..124], &101u32.to_le_bytes());
        assert_eq!(&bytes[124..128], &5u32.to_le_bytes());
        assert_eq!(work.last_hash(), [0x11; 32]);
    }

    #[test]
    fn test_work_decode_short_buffer() {
        assert_matches!(Work::decode(&[0u8; 100]), Err(Error::Format { .. }));

        let work = Work::new(
            BlockHeader::from_bytes([0u8; HEADER_SIZE]),
            [0; 32],
            1,
            1,
            1,
            vec![0; 20],
            vec![],
        );
        let bytes = work.to_bytes();
        assert_matches!(Work::decode(&bytes[..bytes.len() - 1]), Err(Error::Format { .. }));

        let mut misaligned = bytes.to_vec();
        misaligned.extend_from_slice(&[0u8; 31]);
        assert_matches!(Work::decode(&misaligned), Err(Error::Format { .. }));
    }

    #[test]
    fn test_template_roundtrip_and_version() {
        let bt = sample_template();
        let encoded = bt.encode().unwrap();
        assert_eq!(BlockTemplate::decode(&encoded).unwrap(), bt);

        let mut wrong = encoded.to_vec();
        wrong[0] = 2;
        assert_matches!(BlockTemplate::decode(&wrong), Err(Error::Format { .. }));
    }

    #[test]
    fn test_header_mined_fields() {
        let pool = BlockHeader::from_bytes([1u8; HEADER_SIZE]);
        let mined = BlockHeader::from_bytes([2u8; HEADER_SIZE]);
        let merged = pool.with_mined_fields(&mined);
        assert_eq!(merged.prev_hash(), [1u8; 32]);
        assert_eq!(merged.merkle_root(), [2u8; 32]);
        assert_eq!(merged.nonce(), u32::from_le_bytes([2; 4]));
        assert_eq!(&merged.as_bytes()[68..76], &[1u8; 8]);
    }

    #[test]
    fn test_snapshot_names() {
        assert_eq!(parse_snapshot_name("work_101.bin"), Some((SnapshotKind::Work, 101)));
        assert_eq!(parse_snapshot_name("bt_7.bin"), Some((SnapshotKind::Template, 7)));
        assert_eq!(parse_snapshot_name(&work_file_name(5)), Some((SnapshotKind::Work, 5)));
        assert_eq!(parse_snapshot_name("work_.bin"), None);
        assert_eq!(parse_snapshot_name("work_+1.bin"), None);
        assert_eq!(parse_snapshot_name("config.json"), None);
        assert_eq!(parse_snapshot_name("work_1.txt"), None);
    }

    #[test]
    fn test_config_doc_json() {
        let doc = PoolConfigDoc {
            current_height: 5,
            master_url: "http://master".to_string(),
            submit_ann_urls: vec!["http://ann0".to_string()],
            download_ann_urls: vec![],
            submit_block_urls: vec!["http://blk0".to_string()],
            version: 1,
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["currentHeight"], 5);
        assert_eq!(json["submitBlockUrls"][0], "http://blk0");
        let back: PoolConfigDoc = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
