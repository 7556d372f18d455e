//! Database reader with memory-mapping support.
//!
//! An opened database is immutable; every accessor is a pure function over
//! the mapped bytes and safe to call from multiple threads.

use byteorder::{BigEndian, ByteOrder};
use ed25519_dalek::pkcs8::spki::DecodePublicKey;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::{debug, info};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;

use super::format::{
    self, AsRecord, CountryRecord, Header, NetworkRecord, TreeNode, AS_RECORD_SIZE,
    COUNTRY_RECORD_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC, MAGIC_SIZE, NETWORK_RECORD_SIZE,
    NODE_SENTINEL, SECTIONS_START, TREE_NODE_SIZE,
};
use super::stringpool::read_string;
use crate::address::{self, Family};
use crate::autonomous_system::AutonomousSystem;
use crate::country::{self, Country};
use crate::error::{Error, Result};
use crate::network::{Network, NetworkFilter, NetworkFlags};

/// Backing storage for an opened database: the mmap, or a heap buffer when
/// the file cannot be mapped.
enum Backing {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Buffered(buffer) => buffer,
        }
    }
}

/// An opened, validated location database.
pub struct Database {
    backing: Backing,
    // Keeps the duplicated descriptor alive for the lifetime of the mapping.
    _file: Option<File>,
    header: Header,
    vendor: String,
    description: String,
    license: String,
}

impl Database {
    /// Open a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Open a database from a file handle. The handle is duplicated, so the
    /// caller may close theirs independently.
    pub fn from_file(file: &File) -> Result<Self> {
        let mut file = file.try_clone()?;

        let backing = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => {
                #[cfg(unix)]
                if let Err(err) = mmap.advise(memmap2::Advice::Random) {
                    debug!("madvise(MADV_RANDOM) failed: {}", err);
                }
                Backing::Mapped(mmap)
            }
            Err(err) => {
                debug!("mmap failed, falling back to buffered read: {}", err);
                let mut buffer = Vec::new();
                file.read_to_end(&mut buffer)?;
                Backing::Buffered(buffer)
            }
        };

        Self::from_backing(backing, Some(file))
    }

    /// Open a database held entirely in memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_backing(Backing::Buffered(data), None)
    }

    fn from_backing(backing: Backing, file: Option<File>) -> Result<Self> {
        let data = backing.as_slice();

        if data.len() < MAGIC_SIZE || data[..MAGIC.len()] != MAGIC {
            return Err(Error::NotADatabase);
        }
        let version = BigEndian::read_u16(&data[MAGIC.len()..MAGIC_SIZE]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        debug!("magic matches, database version {}", version);

        if data.len() < SECTIONS_START {
            return Err(Error::InvalidData("file too short for header".to_string()));
        }
        let header = Header::parse(&data[MAGIC_SIZE..MAGIC_SIZE + HEADER_SIZE])?;
        validate_sections(&header, data.len())?;
        validate_tables(data, &header)?;

        let pool = section(data, header.pool_offset, header.pool_length);
        let vendor = read_string(pool, header.vendor)?.to_string();
        let description = read_string(pool, header.description)?.to_string();
        let license = read_string(pool, header.license)?.to_string();

        info!(
            "opened location database: {} AS records, {} countries, {} networks",
            header.as_length as usize / AS_RECORD_SIZE,
            header.countries_length as usize / COUNTRY_RECORD_SIZE,
            header.networks_length as usize / NETWORK_RECORD_SIZE,
        );

        Ok(Self {
            backing,
            _file: file,
            header,
            vendor,
            description,
            license,
        })
    }

    fn data(&self) -> &[u8] {
        self.backing.as_slice()
    }

    fn pool(&self) -> &[u8] {
        section(self.data(), self.header.pool_offset, self.header.pool_length)
    }

    fn as_section(&self) -> &[u8] {
        section(self.data(), self.header.as_offset, self.header.as_length)
    }

    fn countries_section(&self) -> &[u8] {
        section(
            self.data(),
            self.header.countries_offset,
            self.header.countries_length,
        )
    }

    fn networks_section(&self) -> &[u8] {
        section(
            self.data(),
            self.header.networks_offset,
            self.header.networks_length,
        )
    }

    fn tree_section(&self) -> &[u8] {
        section(self.data(), self.header.tree_offset, self.header.tree_length)
    }

    /// Vendor string from the header.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Description string from the header.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// License string from the header.
    pub fn license(&self) -> &str {
        &self.license
    }

    /// Creation time, seconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.header.created_at
    }

    /// Number of AS records.
    pub fn count_as(&self) -> usize {
        self.as_section().len() / AS_RECORD_SIZE
    }

    /// Number of country records.
    pub fn count_countries(&self) -> usize {
        self.countries_section().len() / COUNTRY_RECORD_SIZE
    }

    /// Number of network leaves.
    pub fn count_networks(&self) -> usize {
        self.networks_section().len() / NETWORK_RECORD_SIZE
    }

    /// Binary-search the AS table.
    pub fn get_as(&self, number: u32) -> Result<Option<AutonomousSystem>> {
        let table = self.as_section();
        let mut lo = 0usize;
        let mut hi = table.len() / AS_RECORD_SIZE;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let record = AsRecord::parse(&table[mid * AS_RECORD_SIZE..]);
            match record.number.cmp(&number) {
                std::cmp::Ordering::Equal => {
                    let name = read_string(self.pool(), record.name)?.to_string();
                    return Ok(Some(AutonomousSystem::new(number, name)));
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Binary-search the country table by two-letter code.
    pub fn get_country(&self, code: &str) -> Result<Option<Country>> {
        let key = country::parse_code(code)?;
        let table = self.countries_section();
        let mut lo = 0usize;
        let mut hi = table.len() / COUNTRY_RECORD_SIZE;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let record = CountryRecord::parse(&table[mid * COUNTRY_RECORD_SIZE..]);
            match record.code.cmp(&key) {
                std::cmp::Ordering::Equal => {
                    let name = read_string(self.pool(), record.name)?.to_string();
                    return Ok(Some(Country::new(record.code, record.continent, name)));
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Look up the network enclosing an address given in string form.
    pub fn lookup(&self, address: &str) -> Result<Option<Network>> {
        let ip: IpAddr = address.trim().parse().map_err(|_| {
            Error::InvalidArgument(format!("invalid IP address: {address}"))
        })?;
        self.lookup_ip(ip)
    }

    /// Longest-prefix-match lookup: walk the tree along the address bits
    /// and keep the deepest leaf seen.
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<Option<Network>> {
        if self.header.tree_length == 0 {
            return Ok(None);
        }

        let addr = address::canonical(ip);
        let bits = u128::from(addr);
        let mut node_index = 0u32;
        let mut best: Option<(u32, u8)> = None;

        for depth in 0u8..=128 {
            let node = self.tree_node(node_index)?;
            if node.network != NODE_SENTINEL {
                best = Some((node.network, depth));
            }
            if depth == 128 {
                break;
            }
            let next = if address::get_bit(&addr, depth) {
                node.one
            } else {
                node.zero
            };
            if next == NODE_SENTINEL {
                break;
            }
            node_index = next;
        }

        match best {
            Some((leaf, depth)) => {
                let masked = bits & address::prefix_to_mask(depth);
                Ok(Some(self.network_at(leaf, masked, depth)?))
            }
            None => Ok(None),
        }
    }

    /// Enumerate all networks matching `filter`, in ascending address order.
    pub fn list_networks(&self, filter: NetworkFilter) -> NetworkIter<'_> {
        let mut stack = Vec::new();
        if self.header.tree_length > 0 {
            stack.push(Frame {
                node: 0,
                addr: 0,
                depth: 0,
            });
        }
        NetworkIter {
            db: self,
            filter,
            stack,
            done: false,
        }
    }

    /// Enumerate the subtree rooted at `network`, in ascending address
    /// order. The network itself is included when it carries a leaf.
    pub fn subnets(&self, network: &Network, filter: NetworkFilter) -> Result<NetworkIter<'_>> {
        let mut stack = Vec::new();
        if self.header.tree_length > 0 {
            let prefix = network.canonical_prefix();
            let bits = u128::from(network.first_address());
            let mut node_index = 0u32;
            let mut found = true;
            for depth in 0..prefix {
                let node = self.tree_node(node_index)?;
                let next = if bits >> (127 - depth) & 1 == 1 {
                    node.one
                } else {
                    node.zero
                };
                if next == NODE_SENTINEL {
                    found = false;
                    break;
                }
                node_index = next;
            }
            if found {
                stack.push(Frame {
                    node: node_index,
                    addr: bits & address::prefix_to_mask(prefix),
                    depth: prefix,
                });
            }
        }
        Ok(NetworkIter {
            db: self,
            filter,
            stack,
            done: false,
        })
    }

    /// Verify the database signatures against a PEM-encoded Ed25519 public
    /// key. Succeeds when at least one signature verifies.
    pub fn verify(&self, public_key_pem: &str) -> Result<()> {
        let key = VerifyingKey::from_public_key_pem(public_key_pem)
            .map_err(|err| Error::InvalidArgument(format!("invalid public key: {err}")))?;

        let signatures = [&self.header.signature1, &self.header.signature2];
        if signatures.iter().all(|s| s.is_empty()) {
            return Err(Error::NoSignature);
        }

        let digest = format::signature_digest(self.data());
        for raw in signatures.into_iter().filter(|s| !s.is_empty()) {
            if let Ok(signature) = Signature::from_slice(raw) {
                if key.verify(&digest, &signature).is_ok() {
                    debug!("database signature verified");
                    return Ok(());
                }
            }
        }
        Err(Error::BadSignature)
    }

    fn tree_node(&self, index: u32) -> Result<TreeNode> {
        let tree = self.tree_section();
        let start = index as usize * TREE_NODE_SIZE;
        if start + TREE_NODE_SIZE > tree.len() {
            return Err(Error::InvalidData(format!(
                "tree node {index} out of bounds"
            )));
        }
        Ok(TreeNode::parse(&tree[start..]))
    }

    fn network_record(&self, index: u32) -> Result<NetworkRecord> {
        let table = self.networks_section();
        let start = index as usize * NETWORK_RECORD_SIZE;
        if start + NETWORK_RECORD_SIZE > table.len() {
            return Err(Error::InvalidData(format!(
                "network leaf {index} out of bounds"
            )));
        }
        Ok(NetworkRecord::parse(&table[start..]))
    }

    fn network_at(&self, leaf: u32, addr: u128, prefix: u8) -> Result<Network> {
        let record = self.network_record(leaf)?;
        Ok(Network::from_parts(
            Ipv6Addr::from(addr),
            prefix,
            record.country,
            record.asn,
            NetworkFlags::from_bits_truncate(record.flags),
        ))
    }
}

fn section(data: &[u8], offset: u32, length: u32) -> &[u8] {
    &data[offset as usize..offset as usize + length as usize]
}

fn validate_sections(header: &Header, file_len: usize) -> Result<()> {
    let sections = [
        ("string pool", header.pool_offset, header.pool_length, 1),
        ("AS table", header.as_offset, header.as_length, AS_RECORD_SIZE),
        (
            "network table",
            header.networks_offset,
            header.networks_length,
            NETWORK_RECORD_SIZE,
        ),
        (
            "network tree",
            header.tree_offset,
            header.tree_length,
            TREE_NODE_SIZE,
        ),
        (
            "country table",
            header.countries_offset,
            header.countries_length,
            COUNTRY_RECORD_SIZE,
        ),
    ];

    let mut spans: Vec<(u64, u64, &str)> = Vec::new();
    for (name, offset, length, record_size) in sections {
        if length == 0 {
            continue;
        }
        let (offset, length) = (offset as u64, length as u64);
        if length % record_size as u64 != 0 {
            return Err(Error::InvalidData(format!(
                "{name} length {length} is not a multiple of {record_size}"
            )));
        }
        if offset < SECTIONS_START as u64 || offset + length > file_len as u64 {
            return Err(Error::InvalidData(format!("{name} section out of bounds")));
        }
        spans.push((offset, offset + length, name));
    }

    spans.sort();
    for pair in spans.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(Error::InvalidData(format!(
                "{} section overlaps {} section",
                pair[1].2, pair[0].2
            )));
        }
    }
    Ok(())
}

/// Structural checks done once at open so the hot paths can trust the data:
/// table sortedness and tree index bounds.
fn validate_tables(data: &[u8], header: &Header) -> Result<()> {
    let as_table = section(data, header.as_offset, header.as_length);
    let mut previous: Option<u32> = None;
    for chunk in as_table.chunks_exact(AS_RECORD_SIZE) {
        let record = AsRecord::parse(chunk);
        if let Some(prev) = previous {
            if record.number <= prev {
                return Err(Error::InvalidData("AS table is not sorted".to_string()));
            }
        }
        previous = Some(record.number);
    }

    let countries = section(data, header.countries_offset, header.countries_length);
    let mut previous: Option<[u8; 2]> = None;
    for chunk in countries.chunks_exact(COUNTRY_RECORD_SIZE) {
        let record = CountryRecord::parse(chunk);
        if let Some(prev) = previous {
            if record.code <= prev {
                return Err(Error::InvalidData(
                    "country table is not sorted".to_string(),
                ));
            }
        }
        previous = Some(record.code);
    }

    let tree = section(data, header.tree_offset, header.tree_length);
    let node_count = (tree.len() / TREE_NODE_SIZE) as u32;
    let leaf_count = (header.networks_length as usize / NETWORK_RECORD_SIZE) as u32;
    for chunk in tree.chunks_exact(TREE_NODE_SIZE) {
        let node = TreeNode::parse(chunk);
        for child in [node.zero, node.one] {
            if child != NODE_SENTINEL && child >= node_count {
                return Err(Error::InvalidData(format!(
                    "tree child index {child} out of bounds"
                )));
            }
        }
        if node.network != NODE_SENTINEL && node.network >= leaf_count {
            return Err(Error::InvalidData(format!(
                "network leaf index {} out of bounds",
                node.network
            )));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: u32,
    addr: u128,
    depth: u8,
}

/// Lazy network enumerator: pre-order traversal (a node's own network
/// before its zero subtree, then its one subtree) yields networks in
/// ascending address order. Dropping the iterator cancels the walk.
pub struct NetworkIter<'a> {
    db: &'a Database,
    filter: NetworkFilter,
    stack: Vec<Frame>,
    done: bool,
}

impl NetworkIter<'_> {
    /// Whether the subtree entered through `addr`/`depth` can be skipped
    /// for the filter's family restriction.
    fn pruned(&self, addr: u128, depth: u8) -> bool {
        match self.filter.family_filter() {
            None => false,
            Some(Family::V4) => {
                let checked = depth.min(address::V4_MAPPED_PREFIX);
                (addr ^ address::V4_MAPPED_BITS) & address::prefix_to_mask(checked) != 0
            }
            Some(Family::V6) => {
                depth >= address::V4_MAPPED_PREFIX
                    && (addr ^ address::V4_MAPPED_BITS)
                        & address::prefix_to_mask(address::V4_MAPPED_PREFIX)
                        == 0
            }
        }
    }
}

impl Iterator for NetworkIter<'_> {
    type Item = Result<Network>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while let Some(frame) = self.stack.pop() {
            let node = match self.db.tree_node(frame.node) {
                Ok(node) => node,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            if frame.depth < 128 {
                let child_depth = frame.depth + 1;
                if node.one != NODE_SENTINEL {
                    let addr = frame.addr | 1u128 << (127 - frame.depth);
                    if !self.pruned(addr, child_depth) {
                        self.stack.push(Frame {
                            node: node.one,
                            addr,
                            depth: child_depth,
                        });
                    }
                }
                if node.zero != NODE_SENTINEL && !self.pruned(frame.addr, child_depth) {
                    self.stack.push(Frame {
                        node: node.zero,
                        addr: frame.addr,
                        depth: child_depth,
                    });
                }
            }

            if node.network != NODE_SENTINEL {
                let network = match self.db.network_at(node.network, frame.addr, frame.depth) {
                    Ok(network) => network,
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                };
                if self.filter.matches(&network) {
                    return Some(Ok(network));
                }
            }
        }

        self.done = true;
        None
    }
}
