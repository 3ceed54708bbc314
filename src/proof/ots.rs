//! OpenTimestamps detached timestamp codec
//!
//! A detached timestamp is the magic header, a major version, the hash op
//! that produced the file digest, the digest itself, and a timestamp tree.
//! Each tree node holds attestations and operations; every operation leads to
//! a child node for the message it produces. `0xff` marks a fork (another
//! item follows at the same node), `0x00` introduces an attestation.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Magic bytes at the start of every detached timestamp
pub const HEADER_MAGIC: &[u8] =
    b"\x00OpenTimestamps\x00\x00Proof\x00\xbf\x89\xe2\xe8\x84\xe8\x92\x94";

/// Supported major version
pub const MAJOR_VERSION: u64 = 1;

const MAX_DEPTH: usize = 256;
const MAX_MSG_LEN: usize = 4096;
const MAX_PAYLOAD_LEN: usize = 8192;
const MAX_URI_LEN: usize = 1000;

const TAG_ATTESTATION: u8 = 0x00;
const TAG_FORK: u8 = 0xff;

const PENDING_TAG: [u8; 8] = [0x83, 0xdf, 0xe3, 0x0d, 0x2e, 0xf9, 0x0c, 0x8e];
const BITCOIN_TAG: [u8; 8] = [0x05, 0x88, 0x96, 0x0d, 0x73, 0xd7, 0x19, 0x01];
const LITECOIN_TAG: [u8; 8] = [0x06, 0x86, 0x9a, 0x0d, 0x73, 0xd7, 0x1b, 0x45];

/// A commitment operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Sha1,
    Ripemd160,
    Sha256,
    Keccak256,
    Append(Vec<u8>),
    Prepend(Vec<u8>),
    Reverse,
    Hexlify,
}

impl Op {
    fn tag(&self) -> u8 {
        match self {
            Op::Sha1 => 0x02,
            Op::Ripemd160 => 0x03,
            Op::Sha256 => 0x08,
            Op::Keccak256 => 0x67,
            Op::Append(_) => 0xf0,
            Op::Prepend(_) => 0xf1,
            Op::Reverse => 0xf2,
            Op::Hexlify => 0xf3,
        }
    }

    /// Digest length produced by a hash op, `None` for other ops
    pub fn digest_len(&self) -> Option<usize> {
        match self {
            Op::Sha1 | Op::Ripemd160 => Some(20),
            Op::Sha256 | Op::Keccak256 => Some(32),
            _ => None,
        }
    }

    fn read(tag: u8, r: &mut Reader<'_>) -> Result<Self> {
        let op = match tag {
            0x02 => Op::Sha1,
            0x03 => Op::Ripemd160,
            0x08 => Op::Sha256,
            0x67 => Op::Keccak256,
            0xf0 => Op::Append(r.read_varbytes(1, MAX_MSG_LEN)?),
            0xf1 => Op::Prepend(r.read_varbytes(1, MAX_MSG_LEN)?),
            0xf2 => Op::Reverse,
            0xf3 => Op::Hexlify,
            other => {
                return Err(Error::proof_format(format!("unknown op tag {:#04x}", other)));
            }
        };
        Ok(op)
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        if let Op::Append(arg) | Op::Prepend(arg) = self {
            write_varbytes(out, arg);
        }
    }

    /// Apply the operation to a message
    pub fn apply(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let result = match self {
            Op::Sha256 => Sha256::digest(msg).to_vec(),
            Op::Append(arg) => [msg, arg.as_slice()].concat(),
            Op::Prepend(arg) => [arg.as_slice(), msg].concat(),
            Op::Reverse => msg.iter().rev().copied().collect(),
            Op::Hexlify => hex::encode(msg).into_bytes(),
            Op::Sha1 | Op::Ripemd160 | Op::Keccak256 => {
                return Err(Error::proof_format(format!(
                    "op {:#04x} cannot be evaluated",
                    self.tag()
                )));
            }
        };
        if result.len() > MAX_MSG_LEN {
            return Err(Error::proof_format("message exceeds maximum length"));
        }
        Ok(result)
    }
}

/// A claim that a message existed at some point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    /// Submitted to a calendar, not yet anchored
    Pending { uri: String },

    /// Anchored in a Bitcoin block's merkle root
    Bitcoin { height: u64 },

    /// Anchored in a Litecoin block's merkle root
    Litecoin { height: u64 },

    /// Attestation type this codec does not interpret
    Unknown { tag: [u8; 8], payload: Vec<u8> },
}

impl Attestation {
    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let tag: [u8; 8] = r
            .read_bytes(8)?
            .try_into()
            .map_err(|_| Error::proof_format("short attestation tag"))?;
        let payload = r.read_varbytes(0, MAX_PAYLOAD_LEN)?;
        let mut p = Reader::new(&payload);

        let attestation = match tag {
            PENDING_TAG => {
                let raw = p.read_varbytes(0, MAX_URI_LEN)?;
                let uri = String::from_utf8(raw)
                    .map_err(|_| Error::proof_format("calendar URI is not UTF-8"))?;
                if !uri.chars().all(is_uri_char) {
                    return Err(Error::proof_format(format!("invalid calendar URI {:?}", uri)));
                }
                Attestation::Pending { uri }
            }
            BITCOIN_TAG => Attestation::Bitcoin {
                height: p.read_varuint()?,
            },
            LITECOIN_TAG => Attestation::Litecoin {
                height: p.read_varuint()?,
            },
            _ => {
                return Ok(Attestation::Unknown { tag, payload });
            }
        };
        p.expect_eof()?;
        Ok(attestation)
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let tag = match self {
            Attestation::Pending { uri } => {
                write_varbytes(&mut payload, uri.as_bytes());
                PENDING_TAG
            }
            Attestation::Bitcoin { height } => {
                write_varuint(&mut payload, *height);
                BITCOIN_TAG
            }
            Attestation::Litecoin { height } => {
                write_varuint(&mut payload, *height);
                LITECOIN_TAG
            }
            Attestation::Unknown { tag, payload: raw } => {
                payload.extend_from_slice(raw);
                *tag
            }
        };
        out.extend_from_slice(&tag);
        write_varbytes(out, &payload);
    }
}

fn is_uri_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._/:".contains(c)
}

/// One node of a timestamp tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub attestations: Vec<Attestation>,
    pub ops: Vec<(Op, Timestamp)>,
}

impl Timestamp {
    /// Parse a serialized timestamp; the whole buffer must be consumed
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let timestamp = Self::read(&mut r, 0)?;
        r.expect_eof()?;
        Ok(timestamp)
    }

    fn read(r: &mut Reader<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::proof_format("timestamp nested too deeply"));
        }

        let mut timestamp = Timestamp::default();
        let mut tag = r.read_u8()?;
        while tag == TAG_FORK {
            let item = r.read_u8()?;
            timestamp.read_item(item, r, depth)?;
            tag = r.read_u8()?;
        }
        timestamp.read_item(tag, r, depth)?;
        Ok(timestamp)
    }

    fn read_item(&mut self, tag: u8, r: &mut Reader<'_>, depth: usize) -> Result<()> {
        if tag == TAG_ATTESTATION {
            self.attestations.push(Attestation::read(r)?);
        } else {
            let op = Op::read(tag, r)?;
            let child = Timestamp::read(r, depth + 1)?;
            self.ops.push((op, child));
        }
        Ok(())
    }

    /// Serialize the tree
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let total = self.attestations.len() + self.ops.len();
        if total == 0 {
            return Err(Error::proof_format("timestamp node has no attestations or ops"));
        }

        let mut index = 0;
        for attestation in &self.attestations {
            index += 1;
            if index < total {
                out.push(TAG_FORK);
            }
            out.push(TAG_ATTESTATION);
            attestation.write(out);
        }
        for (op, child) in &self.ops {
            index += 1;
            if index < total {
                out.push(TAG_FORK);
            }
            op.write(out);
            child.write(out)?;
        }
        Ok(())
    }

    /// Merge another tree for the same message into this one
    pub fn merge(&mut self, other: Timestamp) {
        for attestation in other.attestations {
            if !self.attestations.contains(&attestation) {
                self.attestations.push(attestation);
            }
        }
        for (op, child) in other.ops {
            match self.ops.iter_mut().find(|(existing, _)| *existing == op) {
                Some((_, existing)) => existing.merge(child),
                None => self.ops.push((op, child)),
            }
        }
    }

    /// Every attestation in the tree paired with the message it commits to
    pub fn attestations_for(&self, msg: &[u8]) -> Result<Vec<(Vec<u8>, Attestation)>> {
        let mut out = Vec::new();
        self.walk(msg, &mut out)?;
        Ok(out)
    }

    fn walk(&self, msg: &[u8], out: &mut Vec<(Vec<u8>, Attestation)>) -> Result<()> {
        for attestation in &self.attestations {
            out.push((msg.to_vec(), attestation.clone()));
        }
        for (op, child) in &self.ops {
            let next = op.apply(msg)?;
            child.walk(&next, out)?;
        }
        Ok(())
    }
}

/// A timestamp for a file digest, as stored in `.ots` files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedTimestamp {
    pub file_op: Op,
    pub digest: Vec<u8>,
    pub timestamp: Timestamp,
}

impl DetachedTimestamp {
    pub fn new(file_op: Op, digest: Vec<u8>, timestamp: Timestamp) -> Result<Self> {
        match file_op.digest_len() {
            Some(len) if len == digest.len() => Ok(Self {
                file_op,
                digest,
                timestamp,
            }),
            Some(len) => Err(Error::proof_format(format!(
                "digest is {} bytes, expected {}",
                digest.len(),
                len
            ))),
            None => Err(Error::proof_format("file op must be a hash op")),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let magic = r.read_bytes(HEADER_MAGIC.len())?;
        if magic != HEADER_MAGIC {
            return Err(Error::proof_format("not an OpenTimestamps proof"));
        }

        let version = r.read_varuint()?;
        if version != MAJOR_VERSION {
            return Err(Error::proof_format(format!(
                "unsupported major version {}",
                version
            )));
        }

        let tag = r.read_u8()?;
        let file_op = Op::read(tag, &mut r)?;
        let len = file_op
            .digest_len()
            .ok_or_else(|| Error::proof_format("file op must be a hash op"))?;
        let digest = r.read_bytes(len)?.to_vec();

        let timestamp = Timestamp::read(&mut r, 0)?;
        r.expect_eof()?;

        Ok(Self {
            file_op,
            digest,
            timestamp,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_MAGIC.len() + 64);
        out.extend_from_slice(HEADER_MAGIC);
        write_varuint(&mut out, MAJOR_VERSION);
        self.file_op.write(&mut out);
        out.extend_from_slice(&self.digest);
        self.timestamp.write(&mut out)?;
        Ok(out)
    }

    /// Attestations paired with their commitments, starting from the file digest
    pub fn attestations(&self) -> Result<Vec<(Vec<u8>, Attestation)>> {
        self.timestamp.attestations_for(&self.digest)
    }
}

/// Cursor over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::proof_format("unexpected end of proof"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::proof_format("unexpected end of proof"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_varuint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift > 63 || (shift == 63 && byte & 0x7f > 1) {
                return Err(Error::proof_format("varuint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_varbytes(&mut self, min: usize, max: usize) -> Result<Vec<u8>> {
        let len = usize::try_from(self.read_varuint()?)
            .map_err(|_| Error::proof_format("length overflow"))?;
        if len < min || len > max {
            return Err(Error::proof_format(format!(
                "length {} outside {}..={}",
                len, min, max
            )));
        }
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn expect_eof(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::proof_format(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )))
        }
    }
}

fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varuint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(uri: &str) -> Attestation {
        Attestation::Pending {
            uri: uri.to_string(),
        }
    }

    /// append(nonce) -> sha256 -> pending attestation, like a calendar reply
    fn calendar_reply(nonce: &[u8], uri: &str) -> Timestamp {
        Timestamp {
            attestations: vec![],
            ops: vec![(
                Op::Append(nonce.to_vec()),
                Timestamp {
                    attestations: vec![],
                    ops: vec![(
                        Op::Sha256,
                        Timestamp {
                            attestations: vec![pending(uri)],
                            ops: vec![],
                        },
                    )],
                },
            )],
        }
    }

    #[test]
    fn test_varuint_encoding() {
        let mut out = Vec::new();
        write_varuint(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);
        assert_eq!(Reader::new(&out).read_varuint().unwrap(), 300);

        let mut zero = Vec::new();
        write_varuint(&mut zero, 0);
        assert_eq!(zero, vec![0x00]);
    }

    #[test]
    fn test_parse_hand_encoded_reply() {
        let uri = b"https://cal.example";
        let mut bytes = vec![0xf0, 0x01, 0xaa, 0x08, 0x00];
        bytes.extend_from_slice(&PENDING_TAG);
        bytes.push((uri.len() + 1) as u8);
        bytes.push(uri.len() as u8);
        bytes.extend_from_slice(uri);

        let timestamp = Timestamp::parse(&bytes).unwrap();
        assert_eq!(timestamp, calendar_reply(&[0xaa], "https://cal.example"));
        assert_eq!(timestamp.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_commitment_walk() {
        let digest = [7u8; 32];
        let timestamp = calendar_reply(b"nonce", "https://cal.example");

        let found = timestamp.attestations_for(&digest).unwrap();
        assert_eq!(found.len(), 1);

        let expected = Sha256::digest([&digest[..], b"nonce"].concat()).to_vec();
        assert_eq!(found[0].0, expected);
        assert_eq!(found[0].1, pending("https://cal.example"));
    }

    #[test]
    fn test_detached_roundtrip_with_fork() {
        let mut timestamp = calendar_reply(b"n1", "https://a.example");
        timestamp.merge(calendar_reply(b"n2", "https://b.example"));
        assert_eq!(timestamp.ops.len(), 2);

        let detached = DetachedTimestamp::new(Op::Sha256, vec![1u8; 32], timestamp).unwrap();
        let bytes = detached.to_bytes().unwrap();
        assert!(bytes.starts_with(HEADER_MAGIC));

        let parsed = DetachedTimestamp::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, detached);
        assert_eq!(parsed.attestations().unwrap().len(), 2);
    }

    #[test]
    fn test_merge_shares_identical_ops() {
        let mut timestamp = calendar_reply(b"same", "https://a.example");
        timestamp.merge(calendar_reply(b"same", "https://b.example"));
        assert_eq!(timestamp.ops.len(), 1);
        assert_eq!(timestamp.attestations_for(&[0u8; 32]).unwrap().len(), 2);
    }

    #[test]
    fn test_bitcoin_attestation() {
        let timestamp = Timestamp {
            attestations: vec![Attestation::Bitcoin { height: 358_391 }],
            ops: vec![],
        };
        let bytes = timestamp.to_bytes().unwrap();
        assert_eq!(Timestamp::parse(&bytes).unwrap(), timestamp);
    }

    #[test]
    fn test_unknown_attestation_preserved() {
        let timestamp = Timestamp {
            attestations: vec![Attestation::Unknown {
                tag: [1, 2, 3, 4, 5, 6, 7, 8],
                payload: vec![9, 9],
            }],
            ops: vec![],
        };
        let bytes = timestamp.to_bytes().unwrap();
        assert_eq!(Timestamp::parse(&bytes).unwrap(), timestamp);
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(DetachedTimestamp::from_bytes(b"not a proof").is_err());

        let detached =
            DetachedTimestamp::new(Op::Sha256, vec![0u8; 32], calendar_reply(b"x", "https://c.example"))
                .unwrap();
        let mut bytes = detached.to_bytes().unwrap();

        let truncated = &bytes[..bytes.len() - 3];
        assert!(DetachedTimestamp::from_bytes(truncated).is_err());

        bytes.push(0x00);
        assert!(DetachedTimestamp::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_digest_length_checked() {
        assert!(DetachedTimestamp::new(Op::Sha256, vec![0u8; 20], Timestamp::default()).is_err());
        assert!(DetachedTimestamp::new(Op::Reverse, vec![0u8; 32], Timestamp::default()).is_err());
    }

    #[test]
    fn test_unevaluable_op() {
        assert!(Op::Keccak256.apply(b"msg").is_err());
        assert_eq!(Op::Reverse.apply(b"abc").unwrap(), b"cba");
        assert_eq!(Op::Hexlify.apply(&[0xab]).unwrap(), b"ab");
    }

    #[test]
    fn test_empty_node_cannot_serialize() {
        assert!(Timestamp::default().to_bytes().is_err());
    }
}
