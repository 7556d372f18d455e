//! Database writer.
//!
//! Collects metadata, AS, country and network additions, canonicalises the
//! network tree and serialises everything into the on-disk image. Output
//! is signed when private keys were supplied at construction.

use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey};
use ipnet::IpNet;
use log::{info, warn};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use super::format::{
    AsRecord, CountryRecord, Header, NetworkRecord, FORMAT_VERSION, HEADER_SIZE, MAGIC,
    MAGIC_SIZE, SECTIONS_START,
};
use super::format::signature_digest;
use super::stringpool::StringPool;
use super::tree::{InsertOutcome, TreeBuilder};
use crate::address;
use crate::country;
use crate::error::{Error, Result};
use crate::network::NetworkFlags;

/// Writer for location database files.
pub struct DatabaseWriter {
    vendor: String,
    description: String,
    license: String,
    as_records: Vec<(u32, String)>,
    countries: Vec<([u8; 2], [u8; 2], String)>,
    tree: TreeBuilder,
    key1: Option<SigningKey>,
    key2: Option<SigningKey>,
}

impl DatabaseWriter {
    /// Create a writer. Each key, when present, is a PEM-encoded PKCS#8
    /// Ed25519 private key; without keys the output is unsigned.
    pub fn new(key1_pem: Option<&str>, key2_pem: Option<&str>) -> Result<Self> {
        Ok(Self {
            vendor: String::new(),
            description: String::new(),
            license: String::new(),
            as_records: Vec::new(),
            countries: Vec::new(),
            tree: TreeBuilder::new(),
            key1: parse_key(key1_pem)?,
            key2: parse_key(key2_pem)?,
        })
    }

    pub fn set_vendor(&mut self, vendor: &str) {
        self.vendor = vendor.to_string();
    }

    pub fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    pub fn set_license(&mut self, license: &str) {
        self.license = license.to_string();
    }

    /// Add an autonomous system. Duplicate numbers are rejected when the
    /// table is serialised.
    pub fn add_as(&mut self, number: u32, name: &str) -> Result<()> {
        if number == 0 {
            return Err(Error::InvalidArgument("AS number must not be 0".to_string()));
        }
        self.as_records.push((number, name.to_string()));
        Ok(())
    }

    /// Add a country. The continent is ignored for the reserved special
    /// codes, which carry none.
    pub fn add_country(&mut self, code: &str, continent: &str, name: &str) -> Result<()> {
        let code = country::validate_new_code(code)?;
        let continent = if country::SPECIAL_CODES.contains(&code) {
            [0, 0]
        } else {
            parse_continent(continent)?
        };
        self.countries.push((code, continent, name.to_string()));
        Ok(())
    }

    /// Add a network with its leaf payload. An empty country code stores
    /// zero bytes.
    pub fn add_network(
        &mut self,
        network: IpNet,
        country_code: &str,
        asn: u32,
        flags: NetworkFlags,
    ) -> Result<()> {
        let code = if country_code.is_empty() {
            [0, 0]
        } else {
            country::validate_new_code(country_code)?
        };

        let (addr, prefix) = match network {
            IpNet::V4(v4) => (
                address::canonical(v4.addr().into()),
                v4.prefix_len() + address::V4_MAPPED_PREFIX,
            ),
            IpNet::V6(v6) => (v6.addr(), v6.prefix_len()),
        };
        let bits = u128::from(addr) & address::prefix_to_mask(prefix);

        let record = NetworkRecord {
            country: code,
            flags: flags.bits(),
            asn,
        };
        if self.tree.insert(bits, prefix, record) == InsertOutcome::Replaced {
            warn!("replaced conflicting payload for network {network}");
        }
        Ok(())
    }

    /// Serialise in the latest format version.
    pub fn write<W: Write>(&mut self, sink: &mut W) -> Result<()> {
        self.write_version(sink, FORMAT_VERSION)
    }

    /// Serialise in an explicit format version.
    pub fn write_version<W: Write>(&mut self, sink: &mut W, version: u16) -> Result<()> {
        if version != FORMAT_VERSION {
            return Err(Error::InvalidArgument(format!(
                "cannot write database version {version}"
            )));
        }

        self.tree.canonicalize();
        let (nodes, leaves) = self.tree.serialize();

        let mut as_records = self.as_records.clone();
        as_records.sort_by_key(|(number, _)| *number);
        for pair in as_records.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::DuplicateAs(pair[0].0));
            }
        }

        let mut countries = self.countries.clone();
        countries.sort_by_key(|(code, _, _)| *code);
        for pair in countries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::DuplicateCountry(
                    String::from_utf8_lossy(&pair[0].0).to_string(),
                ));
            }
        }

        let mut pool = StringPool::new();
        let vendor = pool.add(&self.vendor);
        let description = pool.add(&self.description);
        let license = pool.add(&self.license);
        let as_names: Vec<u32> = as_records.iter().map(|(_, name)| pool.add(name)).collect();
        let country_names: Vec<u32> = countries.iter().map(|(_, _, name)| pool.add(name)).collect();

        // Section bodies in file order: pool, AS, networks, tree, countries.
        let mut buffer = Vec::with_capacity(SECTIONS_START + pool.as_bytes().len());
        buffer.extend_from_slice(&MAGIC);
        buffer.extend_from_slice(&version.to_be_bytes());
        buffer.resize(SECTIONS_START, 0);

        let pool_offset = buffer.len() as u32;
        buffer.extend_from_slice(pool.as_bytes());
        let pool_length = buffer.len() as u32 - pool_offset;

        let as_offset = buffer.len() as u32;
        for ((number, _), name) in as_records.iter().zip(&as_names) {
            buffer.extend_from_slice(
                &AsRecord {
                    number: *number,
                    name: *name,
                }
                .encode(),
            );
        }
        let as_length = buffer.len() as u32 - as_offset;

        let networks_offset = buffer.len() as u32;
        for leaf in &leaves {
            buffer.extend_from_slice(&leaf.encode());
        }
        let networks_length = buffer.len() as u32 - networks_offset;

        let tree_offset = buffer.len() as u32;
        for node in &nodes {
            buffer.extend_from_slice(&node.encode());
        }
        let tree_length = buffer.len() as u32 - tree_offset;

        let countries_offset = buffer.len() as u32;
        for ((code, continent, _), name) in countries.iter().zip(&country_names) {
            buffer.extend_from_slice(
                &CountryRecord {
                    code: *code,
                    continent: *continent,
                    name: *name,
                }
                .encode(),
            );
        }
        let countries_length = buffer.len() as u32 - countries_offset;

        if buffer.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument(
                "database exceeds the 4 GiB offset space".to_string(),
            ));
        }

        let mut header = Header {
            vendor,
            description,
            license,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            pool_offset,
            pool_length,
            as_offset,
            as_length,
            tree_offset,
            tree_length,
            networks_offset,
            networks_length,
            countries_offset,
            countries_length,
            signature1: Vec::new(),
            signature2: Vec::new(),
        };
        header.encode(&mut buffer[MAGIC_SIZE..MAGIC_SIZE + HEADER_SIZE]);

        // The digest zeroes the signature region, so signing after the
        // header is in place and re-encoding does not invalidate it.
        let digest = signature_digest(&buffer);
        if let Some(key) = &self.key1 {
            header.signature1 = key.sign(&digest).to_bytes().to_vec();
        }
        if let Some(key) = &self.key2 {
            header.signature2 = key.sign(&digest).to_bytes().to_vec();
        }
        header.encode(&mut buffer[MAGIC_SIZE..MAGIC_SIZE + HEADER_SIZE]);

        sink.write_all(&buffer)?;
        info!(
            "wrote location database: {} bytes, {} networks, {} AS records, {} countries",
            buffer.len(),
            leaves.len(),
            as_records.len(),
            countries.len(),
        );
        Ok(())
    }
}

fn parse_key(pem: Option<&str>) -> Result<Option<SigningKey>> {
    match pem {
        None => Ok(None),
        Some(pem) => SigningKey::from_pkcs8_pem(pem)
            .map(Some)
            .map_err(|err| Error::InvalidArgument(format!("invalid private key: {err}"))),
    }
}

fn parse_continent(continent: &str) -> Result<[u8; 2]> {
    let bytes = continent.as_bytes();
    match bytes {
        [] => Ok([0, 0]),
        [a, b] if bytes.iter().all(|c| c.is_ascii_uppercase()) => Ok([*a, *b]),
        _ => Err(Error::InvalidArgument(format!(
            "invalid continent code: {continent}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_as_rejects_zero() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        assert!(writer.add_as(0, "ZERO").is_err());
        assert!(writer.add_as(65001, "TEST").is_ok());
    }

    #[test]
    fn test_add_country_validation() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        assert!(writer.add_country("DE", "EU", "Germany").is_ok());
        assert!(writer.add_country("de", "EU", "Germany").is_err());
        assert!(writer.add_country("XA", "EU", "Reserved").is_err());
        assert!(writer.add_country("DE", "eu", "Germany").is_err());
    }

    #[test]
    fn test_special_country_drops_continent() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        writer.add_country("A1", "EU", "Anonymous Proxy").unwrap();
        assert_eq!(writer.countries[0].1, [0, 0]);
    }

    #[test]
    fn test_duplicate_as_fails_write() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        writer.add_as(65001, "ONE").unwrap();
        writer.add_as(65001, "TWO").unwrap();
        let mut sink = Vec::new();
        assert!(matches!(
            writer.write(&mut sink),
            Err(Error::DuplicateAs(65001))
        ));
    }

    #[test]
    fn test_duplicate_country_fails_write() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        writer.add_country("DE", "EU", "Germany").unwrap();
        writer.add_country("DE", "EU", "Deutschland").unwrap();
        let mut sink = Vec::new();
        assert!(matches!(
            writer.write(&mut sink),
            Err(Error::DuplicateCountry(_))
        ));
    }

    #[test]
    fn test_writer_usable_after_failed_write() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        writer.add_as(65001, "ONE").unwrap();
        writer.add_as(65001, "TWO").unwrap();
        let mut sink = Vec::new();
        assert!(writer.write(&mut sink).is_err());

        writer.as_records.pop();
        let mut sink = Vec::new();
        assert!(writer.write(&mut sink).is_ok());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut writer = DatabaseWriter::new(None, None).unwrap();
        let mut sink = Vec::new();
        assert!(writer.write_version(&mut sink, 0).is_err());
        assert!(writer.write_version(&mut sink, 2).is_err());
    }

    #[test]
    fn test_invalid_private_key_rejected() {
        assert!(DatabaseWriter::new(Some("not a pem"), None).is_err());
    }
}
