//! YAML configuration.
//!
//! Every recognized key has a default where a sane one exists; durations are
//! humantime strings (`"5s"`, `"1m"`). The config file describes the local
//! validator only; the peer relationship is expressed through
//! `validator.failover.peers`.

use {
    crate::{
        error::{Error, Result},
        hooks::FailoverHooks,
        utils,
    },
    log::debug,
    serde::Deserialize,
    std::{collections::BTreeMap, fs, time::Duration},
};

pub const DEFAULT_BIN: &str = "agave-validator";
pub const DEFAULT_CLUSTER: &str = "testnet";
pub const DEFAULT_RPC_ADDRESS: &str = "http://localhost:8899";
pub const DEFAULT_SERVER_PORT: u16 = 9898;
pub const DEFAULT_TOWER_FILE_NAME_TEMPLATE: &str = "tower-1_9-{{ .Identities.Active.PubKey }}.bin";
pub const DEFAULT_SET_IDENTITY_ACTIVE_CMD_TEMPLATE: &str =
    "{{ .Bin }} --ledger {{ .LedgerDir }} set-identity {{ .Identities.Active.KeyFile }} --require-tower";
pub const DEFAULT_SET_IDENTITY_PASSIVE_CMD_TEMPLATE: &str =
    "{{ .Bin }} --ledger {{ .LedgerDir }} set-identity {{ .Identities.Passive.KeyFile }}";

/// Known clusters and their public RPC endpoints.
pub const CLUSTERS: &[(&str, &str)] = &[
    ("mainnet-beta", "https://api.mainnet-beta.solana.com"),
    ("testnet", "https://api.testnet.solana.com"),
    ("devnet", "https://api.devnet.solana.com"),
    ("localnet", "http://localhost:8899"),
];

/// Resolve a cluster name to its network RPC URL.
pub fn cluster_rpc_url(cluster: &str) -> Result<&'static str> {
    CLUSTERS
        .iter()
        .find(|(name, _)| *name == cluster)
        .map(|(_, url)| *url)
        .ok_or_else(|| {
            let names: Vec<&str> = CLUSTERS.iter().map(|(name, _)| *name).collect();
            Error::Configuration(format!(
                "invalid cluster: {cluster}, must be one of: {}",
                names.join(", ")
            ))
        })
}

pub fn default_config_path() -> String {
    "~/solana-validator-failover/solana-validator-failover.yaml".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub validator: ValidatorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_bin")]
    pub bin: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_rpc_address")]
    pub rpc_address: String,
    pub ledger_dir: String,
    pub identities: IdentitiesConfig,
    pub tower: TowerConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    // overrides kept for testing only; auto-detected when absent
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdentitiesConfig {
    pub active: String,
    pub passive: String,
}

#[derive(Debug, Deserialize)]
pub struct TowerConfig {
    pub dir: String,
    #[serde(default)]
    pub auto_empty_when_passive: bool,
    #[serde(default = "default_tower_file_name_template")]
    pub file_name_template: String,
}

#[derive(Debug, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_set_identity_active_cmd_template")]
    pub set_identity_active_cmd_template: String,
    #[serde(default = "default_set_identity_passive_cmd_template")]
    pub set_identity_passive_cmd_template: String,
    #[serde(default = "default_min_time_to_leader_slot", with = "humantime_serde")]
    pub min_time_to_leader_slot: Duration,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerConfig>,
    #[serde(default)]
    pub hooks: FailoverHooks,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PeerConfig {
    pub address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub credit_samples: CreditSamplesConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreditSamplesConfig {
    #[serde(default = "default_credit_samples_count")]
    pub count: usize,
    #[serde(default = "default_credit_samples_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_stream_timeout", with = "humantime_serde")]
    pub stream_timeout: Duration,
}

impl Config {
    /// Load configuration from `path`, falling back to the default location.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let default_path = default_config_path();
        let path = path.unwrap_or(&default_path);
        let resolved = utils::resolve_path(path)?;

        debug!("loading config from {}", resolved.display());
        let contents = fs::read_to_string(&resolved).map_err(|err| {
            Error::Configuration(format!("failed to read config {}: {err}", resolved.display()))
        })?;

        serde_yaml::from_str(&contents).map_err(|err| {
            Error::Configuration(format!("failed to parse config {}: {err}", resolved.display()))
        })
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            set_identity_active_cmd_template: default_set_identity_active_cmd_template(),
            set_identity_passive_cmd_template: default_set_identity_passive_cmd_template(),
            min_time_to_leader_slot: default_min_time_to_leader_slot(),
            monitor: MonitorConfig::default(),
            server: ServerConfig::default(),
            peers: BTreeMap::new(),
            hooks: FailoverHooks::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            credit_samples: CreditSamplesConfig::default(),
        }
    }
}

impl Default for CreditSamplesConfig {
    fn default() -> Self {
        Self {
            count: default_credit_samples_count(),
            interval: default_credit_samples_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            heartbeat_interval: default_heartbeat_interval(),
            stream_timeout: default_stream_timeout(),
        }
    }
}

fn default_bin() -> String {
    DEFAULT_BIN.to_string()
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_string()
}

fn default_rpc_address() -> String {
    DEFAULT_RPC_ADDRESS.to_string()
}

fn default_tower_file_name_template() -> String {
    DEFAULT_TOWER_FILE_NAME_TEMPLATE.to_string()
}

fn default_set_identity_active_cmd_template() -> String {
    DEFAULT_SET_IDENTITY_ACTIVE_CMD_TEMPLATE.to_string()
}

fn default_set_identity_passive_cmd_template() -> String {
    DEFAULT_SET_IDENTITY_PASSIVE_CMD_TEMPLATE.to_string()
}

fn default_min_time_to_leader_slot() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_credit_samples_count() -> usize {
    5
}

fn default_credit_samples_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stream_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_CONFIG: &str = r#"
validator:
  ledger_dir: /mnt/ledger
  identities:
    active: /home/sol/active.json
    passive: /home/sol/passive.json
  tower:
    dir: /mnt/ledger
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL_CONFIG).unwrap();
        let validator = &config.validator;

        assert_eq!(validator.bin, DEFAULT_BIN);
        assert_eq!(validator.cluster, DEFAULT_CLUSTER);
        assert_eq!(validator.rpc_address, DEFAULT_RPC_ADDRESS);
        assert_eq!(
            validator.tower.file_name_template,
            DEFAULT_TOWER_FILE_NAME_TEMPLATE
        );
        assert!(!validator.tower.auto_empty_when_passive);
        assert_eq!(validator.failover.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(
            validator.failover.server.heartbeat_interval,
            Duration::from_secs(5)
        );
        assert_eq!(
            validator.failover.server.stream_timeout,
            Duration::from_secs(300)
        );
        assert_eq!(
            validator.failover.min_time_to_leader_slot,
            Duration::from_secs(300)
        );
        assert_eq!(validator.failover.monitor.credit_samples.count, 5);
        assert_eq!(
            validator.failover.monitor.credit_samples.interval,
            Duration::from_secs(5)
        );
        assert!(validator.failover.peers.is_empty());
        assert!(validator.public_ip.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let yaml = r#"
validator:
  bin: fdctl
  cluster: mainnet-beta
  rpc_address: http://localhost:8899
  ledger_dir: /mnt/ledger
  public_ip: 10.0.0.2
  hostname: validator-b
  identities:
    active: ~/keys/active.json
    passive: ~/keys/passive.json
  tower:
    dir: /mnt/ledger
    auto_empty_when_passive: true
    file_name_template: "tower-1_9-{{ .Identities.Active.PubKey }}.bin"
  failover:
    min_time_to_leader_slot: 10m
    server:
      port: 9999
      heartbeat_interval: 2s
      stream_timeout: 1m
    monitor:
      credit_samples:
        count: 3
        interval: 2s
    peers:
      node-a:
        address: 10.0.0.1:9898
    hooks:
      pre:
        when_passive:
          - name: pagerduty-silence
            command: /usr/local/bin/silence
            args: ["--window", "10m"]
            must_succeed: true
      post:
        when_active:
          - name: announce
            command: /usr/local/bin/announce
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let validator = &config.validator;

        assert_eq!(validator.bin, "fdctl");
        assert_eq!(validator.cluster, "mainnet-beta");
        assert_eq!(validator.public_ip.as_deref(), Some("10.0.0.2"));
        assert!(validator.tower.auto_empty_when_passive);
        assert_eq!(
            validator.failover.min_time_to_leader_slot,
            Duration::from_secs(600)
        );
        assert_eq!(validator.failover.server.port, 9999);
        assert_eq!(validator.failover.monitor.credit_samples.count, 3);
        assert_eq!(
            validator.failover.peers.get("node-a").unwrap().address,
            "10.0.0.1:9898"
        );

        let pre = &validator.failover.hooks.pre.when_passive;
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].name, "pagerduty-silence");
        assert!(pre[0].must_succeed);
        assert_eq!(pre[0].args, vec!["--window", "10m"]);

        let post = &validator.failover.hooks.post.when_active;
        assert_eq!(post.len(), 1);
        assert!(!post[0].must_succeed);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let yaml = r#"
validator:
  ledger_dir: /mnt/ledger
  identities:
    active: a.json
    passive: b.json
  tower:
    dir: /mnt/ledger
  failover:
    min_time_to_leader_slot: not-a-duration
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_cluster_rpc_url() {
        assert_eq!(
            cluster_rpc_url("mainnet-beta").unwrap(),
            "https://api.mainnet-beta.solana.com"
        );
        assert_eq!(cluster_rpc_url("localnet").unwrap(), "http://localhost:8899");
        assert!(cluster_rpc_url("imaginarynet").is_err());
    }
}
