// src/config.rs
// Node configuration from the environment, plus startup validation

use crate::anchor::TrackerConfig;
use crate::error::ConfigError;
use crate::ledger::{parse_hash, Ed25519Signatures, Hash, OpaqueSignatures, Validator};
use crate::network::topic_for;
use log::{error, info, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitcoinChain {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl BitcoinChain {
    pub fn default_rpc_port(self) -> u16 {
        match self {
            BitcoinChain::Mainnet => 8332,
            BitcoinChain::Testnet => 18332,
            BitcoinChain::Signet => 38332,
            BitcoinChain::Regtest => 18443,
        }
    }
}

impl FromStr for BitcoinChain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(BitcoinChain::Mainnet),
            "testnet" | "test" => Ok(BitcoinChain::Testnet),
            "signet" => Ok(BitcoinChain::Signet),
            "regtest" => Ok(BitcoinChain::Regtest),
            other => Err(format!("unknown chain '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Signatures are carried but not checked.
    None,
    Ed25519,
}

impl FromStr for SignatureScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "opaque" => Ok(SignatureScheme::None),
            "ed25519" => Ok(SignatureScheme::Ed25519),
            other => Err(format!("unknown signature scheme '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub genesis_txid: String,
    pub genesis_anchor: Hash,
    pub chain: BitcoinChain,
    pub bitcoind_host: String,
    pub bitcoind_port: u16,
    pub bitcoind_user: String,
    pub bitcoind_password: String,
    pub rocksdb_path: PathBuf,
    pub listen_addr: String,
    pub peers: Vec<String>,
    pub anchor_poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub sync_interval: Duration,
    pub signature_scheme: SignatureScheme,
    pub log_level: String,
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(name).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Result<Self, ConfigError> {
        let genesis_txid = get("GENESIS_TX")
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("GENESIS_TX"))?;
        let genesis_anchor = parse_hash(&genesis_txid).map_err(|e| ConfigError::Invalid {
            name: "GENESIS_TX",
            reason: e.to_string(),
        })?;

        let chain: BitcoinChain = parse_var(&get, "BITCOIN_CHAIN", BitcoinChain::Mainnet)?;
        // BITCOIN_PORT is the older name, still found in deployed .env files
        let port_var = match get("BITCOIND_PORT") {
            Some(v) if !v.trim().is_empty() => "BITCOIND_PORT",
            _ => "BITCOIN_PORT",
        };
        let bitcoind_port = parse_var(&get, port_var, chain.default_rpc_port())?;
        let peers = get("PEER_ADDRS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            genesis_txid,
            genesis_anchor,
            chain,
            bitcoind_host: get("BITCOIND_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            bitcoind_port,
            bitcoind_user: get("BITCOIND_USER").unwrap_or_default(),
            bitcoind_password: get("BITCOIND_PASSWORD").unwrap_or_default(),
            rocksdb_path: PathBuf::from(get("ROCKSDB_PATH").unwrap_or_else(|| "./data".into())),
            listen_addr: get("P2P_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:9738".into()),
            peers,
            anchor_poll_interval: Duration::from_secs(parse_var(
                &get,
                "ANCHOR_POLL_INTERVAL_SECS",
                60u64,
            )?),
            rpc_timeout: Duration::from_secs(parse_var(&get, "RPC_TIMEOUT_SECS", 30u64)?),
            sync_interval: Duration::from_secs(parse_var(&get, "SYNC_INTERVAL_SECS", 30u64)?),
            signature_scheme: parse_var(&get, "SIGNATURE_SCHEME", SignatureScheme::None)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        })
    }

    pub fn topic(&self) -> Hash {
        topic_for(&self.genesis_txid)
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            genesis_txid: self.genesis_txid.clone(),
            poll_interval: self.anchor_poll_interval,
            rpc_timeout: self.rpc_timeout,
        }
    }

    pub fn validator(&self) -> Validator {
        match self.signature_scheme {
            SignatureScheme::None => Validator::new(Arc::new(OpaqueSignatures)),
            SignatureScheme::Ed25519 => Validator::new(Arc::new(Ed25519Signatures)),
        }
    }

    /// Check the loaded values before anything is started.
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            validation.add_error(format!(
                "P2P_LISTEN_ADDR has invalid format: '{}' (expected IP:PORT)",
                self.listen_addr
            ));
        }
        for peer in &self.peers {
            if !peer.contains(':') {
                validation.add_error(format!("PEER_ADDRS entry '{}' has no port", peer));
            }
        }
        if self.peers.is_empty() {
            validation.add_warning("PEER_ADDRS not set - only inbound peers will be synced".into());
        }

        if self.bitcoind_user.is_empty() || self.bitcoind_password.is_empty() {
            validation.add_warning(
                "BITCOIND_USER/BITCOIND_PASSWORD not set - RPC calls will likely be refused".into(),
            );
        }

        for (name, d) in [
            ("ANCHOR_POLL_INTERVAL_SECS", self.anchor_poll_interval),
            ("RPC_TIMEOUT_SECS", self.rpc_timeout),
            ("SYNC_INTERVAL_SECS", self.sync_interval),
        ] {
            if d.is_zero() {
                validation.add_error(format!("{} must be greater than zero", name));
            }
        }

        let path = self.rocksdb_path.as_path();
        if !path.exists() {
            if let Err(e) = std::fs::create_dir_all(path) {
                validation.add_error(format!(
                    "Cannot create RocksDB directory '{}': {}",
                    path.display(),
                    e
                ));
            } else {
                info!("Created RocksDB directory: {}", path.display());
            }
        }

        if self.signature_scheme == SignatureScheme::None {
            validation.add_warning(
                "SIGNATURE_SCHEME=none - transaction signatures are not verified".into(),
            );
        }

        validation
    }
}

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}
