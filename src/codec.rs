//! Wire formats shared by the pool roles and the compute engines
//!
//! Everything here is fixed-layout little-endian binary. Layouts must match the
//! compute engines bit for bit, so decoders reject any length they do not expect
//! rather than guessing.

use crate::types::{BlockHeader, HEADER_SIZE};
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;

/// Largest value a varint can carry
pub const VARINT_MAX: u64 = u32::MAX as u64;

/// Proof entity type tags
pub mod entity {
    /// End of the entity list, always with length zero
    pub const TERMINATOR: u64 = 0;
    /// PacketCrypt proof (nonce2, announcements, announcement tree proof)
    pub const PCP: u64 = 1;
    /// Detached signatures for signed announcements
    pub const SIGNATURES: u64 = 2;
    /// Content proofs for announcements with out-of-band content
    pub const CONTENT_PROOFS: u64 = 3;
}

/// Bounds-checked little-endian reader over a byte slice
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::format(format!(
                "{}: need {} bytes at offset {}, only {} left",
                what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2, what)?))
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4, what)?))
    }

    pub(crate) fn varint(&mut self, what: &str) -> Result<u64> {
        match self.u8(what)? {
            0xfd => Ok(self.u16(what)? as u64),
            0xfe => Ok(self.u32(what)? as u64),
            0xff => Err(Error::format(format!(
                "{}: 64-bit varints are not supported",
                what
            ))),
            small => Ok(small as u64),
        }
    }

    /// Read a varint length prefix followed by that many bytes
    pub(crate) fn var_bytes(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.varint(what)? as usize;
        self.take(len, what)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn expect_end(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::format(format!(
                "{}: {} trailing bytes",
                what,
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Append a varint, refusing values that do not fit in 32 bits
pub fn write_varint(buf: &mut Vec<u8>, value: u64) -> Result<()> {
    if value <= 0xfc {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(value as u16);
    } else if value <= VARINT_MAX {
        buf.put_u8(0xfe);
        buf.put_u32_le(value as u32);
    } else {
        return Err(Error::format(format!(
            "varint value {} exceeds the 32-bit limit",
            value
        )));
    }
    Ok(())
}

/// Encode a single varint
pub fn encode_varint(value: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(5);
    write_varint(&mut buf, value)?;
    Ok(buf)
}

/// Decode a varint from the front of `bytes`, returning the value and bytes consumed
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut reader = Reader::new(bytes);
    let value = reader.varint("varint")?;
    Ok((value, reader.pos))
}

/// Append a length-prefixed byte string
pub(crate) fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    write_varint(buf, data.len() as u64)?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Append a typed proof entity
pub fn write_entity(buf: &mut Vec<u8>, kind: u64, payload: &[u8]) -> Result<()> {
    write_varint(buf, kind)?;
    write_var_bytes(buf, payload)
}

/// Coinbase commitment placed in the coinbase transaction by the block miner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinbaseCommit {
    /// Least work target among the committed announcements
    pub ann_least_work_target: u32,
    /// Root of the announcement tree
    pub merkle_root: [u8; 32],
    /// Number of announcements in the tree
    pub ann_count: u64,
}

impl CoinbaseCommit {
    /// Encoded size
    pub const SIZE: usize = 48;
    /// Leading magic bytes
    pub const MAGIC: [u8; 4] = [0x09, 0xf9, 0x11, 0x02];

    /// Decode a 48-byte commitment. The magic is skipped, not checked.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::format(format!(
                "coinbase commit must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut reader = Reader::new(bytes);
        reader.take(4, "coinbase commit magic")?;
        let ann_least_work_target = reader.u32("coinbase commit target")?;
        let merkle_root = reader.array::<32>("coinbase commit merkle root")?;
        let low = reader.u32("coinbase commit ann count")? as u64;
        let high = reader.u32("coinbase commit ann count")? as u64;
        Ok(Self {
            ann_least_work_target,
            merkle_root,
            ann_count: low + (high << 32),
        })
    }

    /// Encode with the magic prefix
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&Self::MAGIC);
        buf.put_u32_le(self.ann_least_work_target);
        buf.extend_from_slice(&self.merkle_root);
        buf.put_u32_le(self.ann_count as u32);
        buf.put_u32_le((self.ann_count >> 32) as u32);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// Announcement submission header sent to announcement handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnPost {
    pub version: u32,
    pub hash_num: u8,
    pub hash_mod: u8,
    pub signing_key: [u8; 32],
    pub parent_block_hash: [u8; 32],
    pub min_work: u32,
    pub parent_block_height: u32,
    /// Payout address, NUL padded
    pub pay_to: [u8; 64],
}

impl AnnPost {
    /// Header size; producers and consumers must agree on it exactly
    pub const SIZE: usize = 144;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::format(format!(
                "ann post header must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut reader = Reader::new(bytes);
        let version = reader.u32("ann post version")?;
        let hash_num = reader.u8("ann post hash num")?;
        let hash_mod = reader.u8("ann post hash mod")?;
        reader.u16("ann post reserved")?;
        Ok(Self {
            version,
            hash_num,
            hash_mod,
            signing_key: reader.array("ann post signing key")?,
            parent_block_hash: reader.array("ann post parent hash")?,
            min_work: reader.u32("ann post min work")?,
            parent_block_height: reader.u32("ann post parent height")?,
            pay_to: reader.array("ann post pay to")?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(self.version);
        buf.put_u8(self.hash_num);
        buf.put_u8(self.hash_mod);
        buf.put_u16_le(0);
        buf.extend_from_slice(&self.signing_key);
        buf.extend_from_slice(&self.parent_block_hash);
        buf.put_u32_le(self.min_work);
        buf.put_u32_le(self.parent_block_height);
        buf.extend_from_slice(&self.pay_to);
        buf
    }

    /// Payout address with NUL padding removed
    pub fn pay_to_str(&self) -> String {
        let end = self.pay_to.iter().position(|b| *b == 0).unwrap_or(self.pay_to.len());
        String::from_utf8_lossy(&self.pay_to[..end]).into_owned()
    }
}

/// Size of one announcement record
pub const ANNOUNCEMENT_SIZE: usize = 1024;

/// Number of announcements carried by every share
pub const ANNS_PER_SHARE: usize = 4;

/// Fixed header fields of an announcement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnouncementHeader {
    pub version: u8,
    pub soft_nonce: [u8; 3],
    pub hard_nonce: u32,
    pub work_bits: u32,
    pub parent_block_height: u32,
    pub content_type: u32,
    pub content_length: u32,
    pub content_hash: [u8; 32],
    pub signing_key: [u8; 32],
}

impl AnnouncementHeader {
    /// Encoded size of the header fields
    pub const SIZE: usize = 88;

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(Self {
            version: reader.u8("ann version")?,
            soft_nonce: reader.array("ann soft nonce")?,
            hard_nonce: reader.u32("ann hard nonce")?,
            work_bits: reader.u32("ann work bits")?,
            parent_block_height: reader.u32("ann parent height")?,
            content_type: reader.u32("ann content type")?,
            content_length: reader.u32("ann content length")?,
            content_hash: reader.array("ann content hash")?,
            signing_key: reader.array("ann signing key")?,
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.version);
        buf.extend_from_slice(&self.soft_nonce);
        buf.put_u32_le(self.hard_nonce);
        buf.put_u32_le(self.work_bits);
        buf.put_u32_le(self.parent_block_height);
        buf.put_u32_le(self.content_type);
        buf.put_u32_le(self.content_length);
        buf.extend_from_slice(&self.content_hash);
        buf.extend_from_slice(&self.signing_key);
    }
}

/// A 1024-byte announcement as produced by the announcement miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    header: AnnouncementHeader,
    bytes: Vec<u8>,
}

impl Announcement {
    /// Build an announcement from header fields and a body filling the rest
    pub fn new(header: AnnouncementHeader, body: &[u8]) -> Result<Self> {
        if body.len() != ANNOUNCEMENT_SIZE - AnnouncementHeader::SIZE {
            return Err(Error::format(format!(
                "announcement body must be {} bytes, got {}",
                ANNOUNCEMENT_SIZE - AnnouncementHeader::SIZE,
                body.len()
            )));
        }
        let mut bytes = Vec::with_capacity(ANNOUNCEMENT_SIZE);
        header.encode_into(&mut bytes);
        bytes.extend_from_slice(body);
        Ok(Self { header, bytes })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ANNOUNCEMENT_SIZE {
            return Err(Error::format(format!(
                "announcement must be {} bytes, got {}",
                ANNOUNCEMENT_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            header: AnnouncementHeader::decode(&bytes[..AnnouncementHeader::SIZE])?,
            bytes: bytes.to_vec(),
        })
    }

    pub fn header(&self) -> &AnnouncementHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn parent_block_height(&self) -> u32 {
        self.header.parent_block_height
    }

    pub fn content_length(&self) -> u32 {
        self.header.content_length
    }

    pub fn content_hash(&self) -> &[u8; 32] {
        &self.header.content_hash
    }

    pub fn signing_key(&self) -> &[u8; 32] {
        &self.header.signing_key
    }

    /// An all-zero signing key means the announcement is unsigned
    pub fn is_signed(&self) -> bool {
        self.header.signing_key != [0u8; 32]
    }

    /// Content short enough to live inline in the content hash field
    pub fn inline_content(&self) -> Option<&[u8]> {
        let len = self.header.content_length as usize;
        (len <= 32).then(|| &self.header.content_hash[..len])
    }
}

/// Payload of the PacketCrypt proof entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketCryptProof {
    pub nonce2: u32,
    pub announcements: Vec<Announcement>,
    /// Inclusion proof of the announcements in the committed tree
    pub ann_proof: Vec<u8>,
}

impl PacketCryptProof {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let nonce2 = reader.u32("proof nonce2")?;
        let announcements = (0..ANNS_PER_SHARE)
            .map(|_| Announcement::decode(reader.take(ANNOUNCEMENT_SIZE, "proof announcement")?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            nonce2,
            announcements,
            ann_proof: reader.rest().to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(4 + ANNOUNCEMENT_SIZE * self.announcements.len() + self.ann_proof.len());
        buf.put_u32_le(self.nonce2);
        for ann in &self.announcements {
            buf.extend_from_slice(ann.as_bytes());
        }
        buf.extend_from_slice(&self.ann_proof);
        buf
    }
}

/// Block header followed by the framed PacketCrypt proof entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAndProof {
    pub header: BlockHeader,
    /// Raw payload of the PacketCrypt proof entity
    pub proof: Vec<u8>,
}

impl HeaderAndProof {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let header = BlockHeader::from_bytes(reader.array::<HEADER_SIZE>("block header")?);
        let kind = reader.varint("proof entity type")?;
        if kind != entity::PCP {
            return Err(Error::format(format!(
                "expected proof entity type {}, got {}",
                entity::PCP,
                kind
            )));
        }
        let proof = reader.var_bytes("proof entity")?.to_vec();
        reader.expect_end("header and proof")?;
        Ok(Self { header, proof })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 10 + self.proof.len());
        buf.extend_from_slice(self.header.as_bytes());
        write_entity(&mut buf, entity::PCP, &self.proof)?;
        Ok(buf)
    }

    /// Parse the announcements and tree proof out of the proof payload
    pub fn packetcrypt_proof(&self) -> Result<PacketCryptProof> {
        PacketCryptProof::decode(&self.proof)
    }
}

/// A block share produced by the block miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub coinbase_commit: CoinbaseCommit,
    pub header_and_proof: HeaderAndProof,
}

impl Share {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CoinbaseCommit::SIZE {
            return Err(Error::format(format!(
                "share shorter than its {}-byte coinbase commit",
                CoinbaseCommit::SIZE
            )));
        }
        let (commit, rest) = bytes.split_at(CoinbaseCommit::SIZE);
        Ok(Self {
            coinbase_commit: CoinbaseCommit::decode(commit)?,
            header_and_proof: HeaderAndProof::decode(rest)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = self.coinbase_commit.encode().to_vec();
        buf.extend_from_slice(&self.header_and_proof.encode()?);
        Ok(buf)
    }
}

/// A batch of shares written to disk by the block miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareFile {
    pub work_height: u32,
    pub shares: Vec<Share>,
}

impl ShareFile {
    pub const VERSION: u32 = 1;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let version = reader.u32("share file version")?;
        if version != Self::VERSION {
            return Err(Error::format(format!(
                "unsupported share file version {}",
                version
            )));
        }
        let work_height = reader.u32("share file height")?;
        let count = reader.varint("share file count")?;
        let mut shares = Vec::new();
        for _ in 0..count {
            shares.push(Share::decode(reader.var_bytes("share file entry")?)?);
        }
        reader.expect_end("share file")?;
        Ok(Self {
            work_height,
            shares,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.put_u32_le(Self::VERSION);
        buf.put_u32_le(self.work_height);
        write_varint(&mut buf, self.shares.len() as u64)?;
        for share in &self.shares {
            write_var_bytes(&mut buf, &share.encode()?)?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_announcement(parent: u32) -> Announcement {
        let header = AnnouncementHeader {
            version: 1,
            parent_block_height: parent,
            content_length: 4,
            content_hash: [7u8; 32],
            ..Default::default()
        };
        Announcement::new(header, &vec![0x5a; ANNOUNCEMENT_SIZE - AnnouncementHeader::SIZE])
            .unwrap()
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, len) in [
            (0u64, 1usize),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x10000, 5),
            (0xffff_ffff, 5),
        ] {
            let encoded = encode_varint(value).unwrap();
            assert_eq!(encoded.len(), len, "length for {:#x}", value);
            assert_eq!(decode_varint(&encoded).unwrap(), (value, len));
        }
    }

    #[test]
    fn test_varint_rejects_large_values() {
        assert_matches!(encode_varint(0x1_0000_0000), Err(Error::Format { .. }));
        assert_matches!(decode_varint(&[0xff, 0, 0, 0, 0, 1, 0, 0, 0]), Err(Error::Format { .. }));
        assert_matches!(decode_varint(&[0xfd, 0x01]), Err(Error::Format { .. }));
    }

    #[test]
    fn test_coinbase_commit_layout() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&CoinbaseCommit::MAGIC);
        raw.extend_from_slice(&0x2000_0fffu32.to_le_bytes());
        raw.extend_from_slice(&[0xab; 32]);
        raw.extend_from_slice(&5u32.to_le_bytes());
        raw.extend_from_slice(&2u32.to_le_bytes());

        let commit = CoinbaseCommit::decode(&raw).unwrap();
        assert_eq!(commit.ann_least_work_target, 0x2000_0fff);
        assert_eq!(commit.merkle_root, [0xab; 32]);
        assert_eq!(commit.ann_count, 5 + 2 * (1u64 << 32));
        assert_eq!(commit.encode().to_vec(), raw);
    }

    #[test]
    fn test_coinbase_commit_wrong_size() {
        assert_matches!(CoinbaseCommit::decode(&[0u8; 47]), Err(Error::Format { .. }));
    }

    #[test]
    fn test_ann_post_is_144_bytes() {
        let mut pay_to = [0u8; 64];
        pay_to[..5].copy_from_slice(b"pkt1q");
        let post = AnnPost {
            version: 1,
            hash_num: 2,
            hash_mod: 4,
            signing_key: [1; 32],
            parent_block_hash: [2; 32],
            min_work: 0x2000_ffff,
            parent_block_height: 99,
            pay_to,
        };
        let encoded = post.encode();
        assert_eq!(encoded.len(), AnnPost::SIZE);
        assert_eq!(AnnPost::decode(&encoded).unwrap(), post);
        assert_eq!(post.pay_to_str(), "pkt1q");
        assert_matches!(AnnPost::decode(&encoded[..143]), Err(Error::Format { .. }));
    }

    #[test]
    fn test_announcement_fields() {
        let ann = sample_announcement(42);
        let decoded = Announcement::decode(ann.as_bytes()).unwrap();
        assert_eq!(decoded.parent_block_height(), 42);
        assert_eq!(decoded.content_length(), 4);
        assert_eq!(decoded.inline_content(), Some(&[7u8; 4][..]));
        assert!(!decoded.is_signed());
        assert_eq!(&ann.as_bytes()[12..16], &42u32.to_le_bytes());
    }

    #[test]
    fn test_header_and_proof_framing() {
        let pcp = PacketCryptProof {
            nonce2: 9,
            announcements: (0..4).map(sample_announcement).collect(),
            ann_proof: vec![0xcc; 96],
        };
        let hap = HeaderAndProof {
            header: BlockHeader::from_bytes([3u8; HEADER_SIZE]),
            proof: pcp.encode(),
        };
        let encoded = hap.encode().unwrap();
        // header, type byte, 0xfd length prefix
        assert_eq!(encoded.len(), HEADER_SIZE + 1 + 3 + hap.proof.len());
        let decoded = HeaderAndProof::decode(&encoded).unwrap();
        assert_eq!(decoded, hap);
        assert_eq!(decoded.packetcrypt_proof().unwrap(), pcp);

        let mut trailing = encoded.clone();
        trailing.push(0);
        assert_matches!(HeaderAndProof::decode(&trailing), Err(Error::Format { .. }));

        let mut wrong_type = encoded;
        wrong_type[HEADER_SIZE] = entity::SIGNATURES as u8;
        assert_matches!(HeaderAndProof::decode(&wrong_type), Err(Error::Format { .. }));
    }

    #[test]
    fn test_share_file() {
        let share = Share {
            coinbase_commit: CoinbaseCommit {
                ann_least_work_target: 1,
                merkle_root: [4; 32],
                ann_count: 10,
            },
            header_and_proof: HeaderAndProof {
                header: BlockHeader::from_bytes([5u8; HEADER_SIZE]),
                proof: vec![1, 2, 3],
            },
        };
        let file = ShareFile {
            work_height: 77,
            shares: vec![share.clone(), share],
        };
        let decoded = ShareFile::decode(&file.encode().unwrap()).unwrap();
        assert_eq!(decoded, file);

        let mut bad_version = file.encode().unwrap();
        bad_version[0] = 2;
        assert_matches!(ShareFile::decode(&bad_version), Err(Error::Format { .. }));
    }

    #[test]
    fn test_short_proof_payload() {
        assert_matches!(PacketCryptProof::decode(&[0u8; 100]), Err(Error::Format { .. }));
    }
}
