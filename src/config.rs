//! Configuration file and command-line surface.
//!
//! A `clap`-parsed CLI carries only the path to a `serde_json5` config
//! file; every
//! recognized key has a built-in default so an absent file (or an
//! absent key within one) still produces a usable `Config`.

use std::fs::read_to_string;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

fn default_listen_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_udp_port() -> u16 {
    3478
}

fn default_tcp_port() -> u16 {
    3478
}

fn default_realm() -> String {
    "localhost".to_string()
}

fn default_max_client() -> usize {
    4096
}

fn default_max_relay_per_client() -> usize {
    16
}

fn default_allocation_lifetime() -> u32 {
    600
}

fn default_account_method() -> AccountMethod {
    AccountMethod::File
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountMethod {
    File,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// `listen_address`: the IPv4 address the UDP/TCP sockets bind to.
    #[serde(default = "default_listen_address")]
    pub listen_address: Ipv4Addr,
    /// `listen_addressv6`: optional IPv6 listening address.
    #[serde(default)]
    pub listen_addressv6: Option<Ipv6Addr>,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// `tls`: serve TCP connections wrapped in TLS instead of plaintext.
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub daemon: bool,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_max_client")]
    pub max_client: usize,
    #[serde(default = "default_max_relay_per_client")]
    pub max_relay_per_client: usize,
    #[serde(default = "default_allocation_lifetime")]
    pub allocation_lifetime: u32,
    /// `nonce_key`: server secret mixed into every issued nonce's MAC.
    pub nonce_key: String,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<String>,
    #[serde(default = "default_account_method")]
    pub account_method: AccountMethod,
    pub account_file: String,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Parser, Debug)]
#[command(
    name = "TURN (Traversal Using Relays around NAT)",
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to the serde_json5 configuration file.
    #[arg(long, short)]
    config: PathBuf,
    /// Raise the log level to `debug`, overriding the config file.
    #[arg(long, short)]
    verbose: bool,
}

impl Config {
    /// Parse CLI arguments, then load and fill out the config file they
    /// point to.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let mut config: Config = serde_json5::from_str(&read_to_string(&cli.config)?)?;

        if cli.verbose {
            config.log_level = LogLevel::Debug;
        }

        Ok(config)
    }
}
