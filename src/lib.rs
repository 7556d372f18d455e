//! locdb - a signed, memory-mapped IP location database.
//!
//! This crate answers geolocation and network-attribution questions about
//! IP addresses: given an IPv4 or IPv6 address, it returns the enclosing
//! network allocation and its metadata (country code, AS number, operator
//! flags). The data lives in a single versioned binary file that is
//! memory-mapped for reading and can carry up to two Ed25519 signatures.
//!
//! # Features
//!
//! - **Longest-prefix match**: radix tree lookups over the full 128-bit
//!   address space, IPv4 embedded at `::ffff:0:0/96`
//! - **Memory-mapped reads**: an opened database is immutable and safe to
//!   share across threads
//! - **Signed files**: Ed25519 signatures over the file digest
//! - **Writer included**: build, canonicalise and sign database files
//!
//! # Quick Start
//!
//! ```ignore
//! use locdb::Database;
//!
//! let db = Database::open("/var/lib/location/database.db")?;
//! if let Some(network) = db.lookup("81.3.27.32")? {
//!     println!("{}: {:?}", network, network.country_code());
//! }
//! ```
//!
//! # Writing a database
//!
//! ```ignore
//! use locdb::{DatabaseWriter, NetworkFlags};
//!
//! let mut writer = DatabaseWriter::new(None, None)?;
//! writer.set_vendor("Example Corp");
//! writer.add_as(65001, "EXAMPLE-AS")?;
//! writer.add_country("DE", "EU", "Germany")?;
//! writer.add_network("2001:db8::/32".parse()?, "DE", 65001, NetworkFlags::empty())?;
//! writer.write(&mut std::fs::File::create("database.db")?)?;
//! ```

pub mod address;
pub mod binary;

mod autonomous_system;
mod country;
mod error;
mod network;

pub use address::Family;
pub use autonomous_system::AutonomousSystem;
pub use binary::{Database, DatabaseWriter, NetworkIter, FORMAT_VERSION};
pub use country::{is_special_code, Country};
pub use error::{Error, Result};
pub use network::{Network, NetworkFilter, NetworkFlags};

/// Default on-disk location of the distributed database.
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/location/database.db";
