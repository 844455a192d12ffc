use std::fs;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::Stake;

pub const DEFAULT_P2P_PORT: u16 = 8122;
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub p2p_listen: SocketAddr,
    #[serde(default)]
    pub advertised_ip: Option<String>,
    #[serde(default)]
    pub neighbor: Option<SocketAddr>,
    pub asset_dir: PathBuf,
    #[serde(default = "default_forging_threshold")]
    pub forging_threshold: usize,
    pub mempool_limit: usize,
    pub max_block_transactions: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
    #[serde(default = "default_pull_timeout_ms")]
    pub pull_timeout_ms: u64,
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    /// Largest peer frame accepted or sent. Chain sync replies carry the
    /// whole chain, so this bounds the chain size a node can serve.
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    pub genesis: GenesisConfig,
}

fn default_forging_threshold() -> usize {
    1
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_upload_timeout_ms() -> u64 {
    60_000
}

fn default_pull_timeout_ms() -> u64 {
    10_000
}

fn default_discovery_interval_ms() -> u64 {
    10_000
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.asset_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.chunk_size == 0 {
            return Err(ChainError::Config("chunk_size must be positive".into()));
        }
        if self.forging_threshold == 0 {
            return Err(ChainError::Config(
                "forging_threshold must be at least 1".into(),
            ));
        }
        if self.max_block_transactions == 0 {
            return Err(ChainError::Config(
                "max_block_transactions must be at least 1".into(),
            ));
        }
        let timers = [
            ("upload_timeout_ms", self.upload_timeout_ms),
            ("pull_timeout_ms", self.pull_timeout_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(ChainError::Config(format!("{name} must be positive")));
            }
        }
        if self.max_frame_length < self.chunk_size {
            return Err(ChainError::Config(
                "max_frame_length must fit at least one chunk".into(),
            ));
        }
        for account in &self.genesis.accounts {
            account.stake_value()?;
        }
        Ok(())
    }

    /// IP that peers use to address this node. A wildcard listen address is
    /// replaced by the address of the interface that routes outbound traffic.
    pub fn advertised_ip(&self) -> String {
        if let Some(ip) = &self.advertised_ip {
            return ip.clone();
        }
        let listen = self.p2p_listen.ip();
        if !listen.is_unspecified() {
            return listen.to_string();
        }
        outbound_interface_ip()
            .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
            .to_string()
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

/// Connecting a UDP socket sends nothing; it only makes the kernel pick the
/// source address it would route through.
fn outbound_interface_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            p2p_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
            advertised_ip: None,
            neighbor: None,
            asset_dir: PathBuf::from("./data/assets"),
            forging_threshold: default_forging_threshold(),
            mempool_limit: 8_192,
            max_block_transactions: 512,
            chunk_size: default_chunk_size(),
            upload_timeout_ms: default_upload_timeout_ms(),
            pull_timeout_ms: default_pull_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            max_frame_length: default_max_frame_length(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub accounts: Vec<GenesisAccount>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "beez-local".to_string(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub public_key: String,
    pub balance: u128,
    pub stake: String,
}

impl GenesisAccount {
    pub fn stake_value(&self) -> ChainResult<Stake> {
        self.stake
            .parse()
            .map_err(|_| ChainError::Config("invalid genesis stake".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrips_through_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config/node.toml");
        let mut config = NodeConfig::default();
        config.neighbor = Some("10.0.0.7:8122".parse().expect("addr"));
        config.genesis.accounts.push(GenesisAccount {
            public_key: "ab".repeat(32),
            balance: 500,
            stake: "10".into(),
        });
        config.save(&path).expect("save");

        let loaded = NodeConfig::load(&path).expect("load");
        assert_eq!(loaded.neighbor, config.neighbor);
        assert_eq!(loaded.genesis.accounts.len(), 1);
        assert_eq!(loaded.upload_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_invalid_genesis_stake() {
        let mut config = NodeConfig::default();
        config.genesis.accounts.push(GenesisAccount {
            public_key: "ab".repeat(32),
            balance: 1,
            stake: "-4".into(),
        });
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn advertised_ip_falls_back_to_listen_address() {
        let mut config = NodeConfig::default();
        config.p2p_listen = "127.0.0.1:9000".parse().expect("addr");
        assert_eq!(config.advertised_ip(), "127.0.0.1");
        config.advertised_ip = Some("192.168.1.4".into());
        assert_eq!(config.advertised_ip(), "192.168.1.4");
    }

    #[test]
    fn wildcard_listen_address_is_never_advertised() {
        let config = NodeConfig::default();
        assert!(config.p2p_listen.ip().is_unspecified());
        let advertised: IpAddr = config.advertised_ip().parse().expect("ip");
        assert!(!advertised.is_unspecified());
    }

    #[test]
    fn rejects_zero_timers_and_tiny_frames() {
        for field in ["upload", "pull", "discovery"] {
            let mut config = NodeConfig::default();
            match field {
                "upload" => config.upload_timeout_ms = 0,
                "pull" => config.pull_timeout_ms = 0,
                _ => config.discovery_interval_ms = 0,
            }
            assert!(
                matches!(config.validate(), Err(ChainError::Config(_))),
                "{field} timer of zero accepted"
            );
        }

        let mut config = NodeConfig::default();
        config.max_frame_length = config.chunk_size - 1;
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
        assert!(NodeConfig::default().validate().is_ok());
    }
}
