//! locdb: query and verify location database files.

use clap::{Parser, Subcommand};
use locdb::{Database, Family, Network, NetworkFilter, NetworkFlags, DEFAULT_DATABASE_PATH};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "locdb")]
#[command(version = "0.1.0")]
#[command(about = "Query and verify location database files", long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(short, long, default_value = DEFAULT_DATABASE_PATH)]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up the network enclosing an address
    Lookup {
        /// IPv4 or IPv6 address
        address: String,
    },

    /// Print database metadata and all networks
    Dump,

    /// List networks matching the given filters
    ListNetworks {
        /// Restrict to one family: ipv4 or ipv6
        #[arg(long)]
        family: Option<String>,

        /// Restrict to one country code
        #[arg(long)]
        country: Option<String>,

        /// Restrict to one AS number
        #[arg(long)]
        asn: Option<u32>,

        /// Require a flag: anonymous-proxy, satellite-provider, anycast, drop
        #[arg(long)]
        flag: Vec<String>,
    },

    /// Verify the database signature against a public key
    Verify {
        /// Path to a PEM-encoded Ed25519 public key
        #[arg(short, long)]
        key: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let db = match Database::open(&cli.database) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("Error: could not open {}: {}", cli.database.display(), err);
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Lookup { address } => lookup(&db, &address),
        Commands::Dump => dump(&db),
        Commands::ListNetworks {
            family,
            country,
            asn,
            flag,
        } => list_networks(&db, family, country, asn, flag),
        Commands::Verify { key } => verify(&db, &key),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::from(1)
        }
    }
}

fn lookup(db: &Database, address: &str) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let Some(network) = db.lookup(address)? else {
        eprintln!("{} was not found", address);
        return Ok(ExitCode::from(2));
    };

    print_network(db, &network)?;
    Ok(ExitCode::SUCCESS)
}

fn dump(db: &Database) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!("Vendor      : {}", db.vendor());
    println!("Description : {}", db.description());
    println!("License     : {}", db.license());
    println!("Created at  : {} (epoch seconds)", db.created_at());
    println!(
        "Contents    : {} networks, {} AS records, {} countries",
        db.count_networks(),
        db.count_as(),
        db.count_countries(),
    );
    println!();

    for network in db.list_networks(NetworkFilter::new()) {
        let network = network?;
        println!("{}", render_network_line(&network));
    }
    Ok(ExitCode::SUCCESS)
}

fn list_networks(
    db: &Database,
    family: Option<String>,
    country: Option<String>,
    asn: Option<u32>,
    flags: Vec<String>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut filter = NetworkFilter::new();

    if let Some(family) = family {
        filter = filter.family(match family.as_str() {
            "ipv4" => Family::V4,
            "ipv6" => Family::V6,
            other => {
                eprintln!("Error: unknown family {other} (expected ipv4 or ipv6)");
                return Ok(ExitCode::from(1));
            }
        });
    }
    if let Some(country) = country {
        filter = filter.country(&country)?;
    }
    if let Some(asn) = asn {
        filter = filter.asn(asn);
    }
    if !flags.is_empty() {
        let mut mask = NetworkFlags::empty();
        for name in &flags {
            match NetworkFlags::from_flag_name(name) {
                Some(flag) => mask |= flag,
                None => {
                    eprintln!("Error: unknown flag {name}");
                    return Ok(ExitCode::from(1));
                }
            }
        }
        filter = filter.flags(mask, mask);
    }

    for network in db.list_networks(filter) {
        println!("{}", render_network_line(&network?));
    }
    Ok(ExitCode::SUCCESS)
}

fn verify(db: &Database, key: &PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let pem = fs::read_to_string(key)?;
    match db.verify(&pem) {
        Ok(()) => {
            println!("Signature OK");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("Error: {}", err);
            Ok(ExitCode::from(1))
        }
    }
}

fn print_network(db: &Database, network: &Network) -> Result<(), Box<dyn std::error::Error>> {
    println!("Network  : {}", network);
    if let Some(code) = network.country_code() {
        match db.get_country(code)? {
            Some(country) => println!("Country  : {} ({})", country.name(), code),
            None => println!("Country  : {}", code),
        }
    }
    if let Some(asn) = network.asn() {
        match db.get_as(asn)? {
            Some(asys) => println!("AS       : {}", asys),
            None => println!("AS       : AS{}", asn),
        }
    }
    if !network.flags().is_empty() {
        println!("Flags    : {:?}", network.flags());
    }
    Ok(())
}

fn render_network_line(network: &Network) -> String {
    let country = network.country_code().unwrap_or("??");
    let asn = network
        .asn()
        .map(|n| format!("AS{n}"))
        .unwrap_or_else(|| "-".to_string());
    format!("{:<44} {} {}", network.to_string(), country, asn)
}
