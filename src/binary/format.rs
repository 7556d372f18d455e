//! Binary format constants and record codecs.
//!
//! Everything on disk is big-endian; this module is the only place that
//! converts between wire bytes and host integers.

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Magic bytes identifying a location database.
pub const MAGIC: [u8; 7] = *b"LOCDBXX";

/// Current format version. Version 0 is legacy and rejected.
pub const FORMAT_VERSION: u16 = 1;

/// Magic bytes plus the big-endian version word.
pub const MAGIC_SIZE: usize = 9;

/// Size of the v1 header that follows the magic.
pub const HEADER_SIZE: usize = 4160;

/// File offset where section bodies may begin.
pub const SECTIONS_START: usize = MAGIC_SIZE + HEADER_SIZE;

/// Maximum size of one signature body.
pub const MAX_SIGNATURE_SIZE: usize = 2048;

/// File offset of the signature region (both length fields and bodies).
pub const SIGNATURES_OFFSET: usize = MAGIC_SIZE + 60;

/// Size of the signature region.
pub const SIGNATURES_SIZE: usize = 2 * (2 + MAX_SIGNATURE_SIZE);

pub const AS_RECORD_SIZE: usize = 8;
pub const COUNTRY_RECORD_SIZE: usize = 8;
pub const NETWORK_RECORD_SIZE: usize = 8;
pub const TREE_NODE_SIZE: usize = 12;

/// Sentinel child/leaf index meaning "absent".
pub const NODE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Parsed v1 header. Offsets are absolute file offsets; lengths are bytes.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub vendor: u32,
    pub description: u32,
    pub license: u32,
    pub created_at: u64,
    pub pool_offset: u32,
    pub pool_length: u32,
    pub as_offset: u32,
    pub as_length: u32,
    pub tree_offset: u32,
    pub tree_length: u32,
    pub networks_offset: u32,
    pub networks_length: u32,
    pub countries_offset: u32,
    pub countries_length: u32,
    pub signature1: Vec<u8>,
    pub signature2: Vec<u8>,
}

impl Header {
    /// Parse the header from its on-disk bytes (`HEADER_SIZE` of them).
    pub fn parse(data: &[u8]) -> Result<Self> {
        debug_assert!(data.len() >= HEADER_SIZE);

        let signature1_length = BigEndian::read_u16(&data[60..62]) as usize;
        let signature2_length = BigEndian::read_u16(&data[2110..2112]) as usize;
        if signature1_length > MAX_SIGNATURE_SIZE || signature2_length > MAX_SIGNATURE_SIZE {
            return Err(Error::InvalidData(format!(
                "signature length exceeds {MAX_SIGNATURE_SIZE} bytes"
            )));
        }

        Ok(Self {
            vendor: BigEndian::read_u32(&data[0..4]),
            description: BigEndian::read_u32(&data[4..8]),
            license: BigEndian::read_u32(&data[8..12]),
            created_at: BigEndian::read_u64(&data[12..20]),
            pool_offset: BigEndian::read_u32(&data[20..24]),
            pool_length: BigEndian::read_u32(&data[24..28]),
            as_offset: BigEndian::read_u32(&data[28..32]),
            as_length: BigEndian::read_u32(&data[32..36]),
            tree_offset: BigEndian::read_u32(&data[36..40]),
            tree_length: BigEndian::read_u32(&data[40..44]),
            networks_offset: BigEndian::read_u32(&data[44..48]),
            networks_length: BigEndian::read_u32(&data[48..52]),
            countries_offset: BigEndian::read_u32(&data[52..56]),
            countries_length: BigEndian::read_u32(&data[56..60]),
            signature1: data[62..62 + signature1_length].to_vec(),
            signature2: data[2112..2112 + signature2_length].to_vec(),
        })
    }

    /// Encode the header into `out` (`HEADER_SIZE` bytes, zero-filled).
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        debug_assert!(self.signature1.len() <= MAX_SIGNATURE_SIZE);
        debug_assert!(self.signature2.len() <= MAX_SIGNATURE_SIZE);

        out[..HEADER_SIZE].fill(0);
        BigEndian::write_u32(&mut out[0..4], self.vendor);
        BigEndian::write_u32(&mut out[4..8], self.description);
        BigEndian::write_u32(&mut out[8..12], self.license);
        BigEndian::write_u64(&mut out[12..20], self.created_at);
        BigEndian::write_u32(&mut out[20..24], self.pool_offset);
        BigEndian::write_u32(&mut out[24..28], self.pool_length);
        BigEndian::write_u32(&mut out[28..32], self.as_offset);
        BigEndian::write_u32(&mut out[32..36], self.as_length);
        BigEndian::write_u32(&mut out[36..40], self.tree_offset);
        BigEndian::write_u32(&mut out[40..44], self.tree_length);
        BigEndian::write_u32(&mut out[44..48], self.networks_offset);
        BigEndian::write_u32(&mut out[48..52], self.networks_length);
        BigEndian::write_u32(&mut out[52..56], self.countries_offset);
        BigEndian::write_u32(&mut out[56..60], self.countries_length);
        BigEndian::write_u16(&mut out[60..62], self.signature1.len() as u16);
        out[62..62 + self.signature1.len()].copy_from_slice(&self.signature1);
        BigEndian::write_u16(&mut out[2110..2112], self.signature2.len() as u16);
        out[2112..2112 + self.signature2.len()].copy_from_slice(&self.signature2);
    }
}

/// AS record: number plus a string-pool offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AsRecord {
    pub number: u32,
    pub name: u32,
}

impl AsRecord {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            number: BigEndian::read_u32(&data[0..4]),
            name: BigEndian::read_u32(&data[4..8]),
        }
    }

    pub fn encode(&self) -> [u8; AS_RECORD_SIZE] {
        let mut out = [0u8; AS_RECORD_SIZE];
        BigEndian::write_u32(&mut out[0..4], self.number);
        BigEndian::write_u32(&mut out[4..8], self.name);
        out
    }
}

/// Country record: code, continent and a string-pool offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CountryRecord {
    pub code: [u8; 2],
    pub continent: [u8; 2],
    pub name: u32,
}

impl CountryRecord {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            code: [data[0], data[1]],
            continent: [data[2], data[3]],
            name: BigEndian::read_u32(&data[4..8]),
        }
    }

    pub fn encode(&self) -> [u8; COUNTRY_RECORD_SIZE] {
        let mut out = [0u8; COUNTRY_RECORD_SIZE];
        out[0..2].copy_from_slice(&self.code);
        out[2..4].copy_from_slice(&self.continent);
        BigEndian::write_u32(&mut out[4..8], self.name);
        out
    }
}

/// Network leaf payload referenced from tree leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NetworkRecord {
    pub country: [u8; 2],
    pub flags: u16,
    pub asn: u32,
}

impl NetworkRecord {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            country: [data[0], data[1]],
            flags: BigEndian::read_u16(&data[2..4]),
            asn: BigEndian::read_u32(&data[4..8]),
        }
    }

    pub fn encode(&self) -> [u8; NETWORK_RECORD_SIZE] {
        let mut out = [0u8; NETWORK_RECORD_SIZE];
        out[0..2].copy_from_slice(&self.country);
        BigEndian::write_u16(&mut out[2..4], self.flags);
        BigEndian::write_u32(&mut out[4..8], self.asn);
        out
    }
}

/// Radix tree node: two child indices and a network-leaf index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeNode {
    pub zero: u32,
    pub one: u32,
    pub network: u32,
}

impl TreeNode {
    pub fn parse(data: &[u8]) -> Self {
        Self {
            zero: BigEndian::read_u32(&data[0..4]),
            one: BigEndian::read_u32(&data[4..8]),
            network: BigEndian::read_u32(&data[8..12]),
        }
    }

    pub fn encode(&self) -> [u8; TREE_NODE_SIZE] {
        let mut out = [0u8; TREE_NODE_SIZE];
        BigEndian::write_u32(&mut out[0..4], self.zero);
        BigEndian::write_u32(&mut out[4..8], self.one);
        BigEndian::write_u32(&mut out[8..12], self.network);
        out
    }
}

/// SHA-256 over the whole file with the signature region zeroed. The
/// writer signs this digest and `verify` recomputes it, so the layout must
/// never diverge between the two.
pub(crate) fn signature_digest(data: &[u8]) -> [u8; 32] {
    debug_assert!(data.len() >= SECTIONS_START);

    let mut hasher = Sha256::new();
    hasher.update(&data[..SIGNATURES_OFFSET]);
    hasher.update([0u8; SIGNATURES_SIZE]);
    hasher.update(&data[SIGNATURES_OFFSET + SIGNATURES_SIZE..]);
    hasher.finalize().into()
}
