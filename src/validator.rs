//! Local validator context and the failover entry point.
//!
//! Configuration is materialized once at startup: templates are expanded,
//! identities loaded, the public IP discovered, and the local gossip node
//! resolved. The role resolver then compares the gossip-advertised pubkey
//! against the two configured identities to decide which side of the
//! failover this host drives.

use {
    crate::{
        cluster::{ClusterNode, ClusterObserver},
        config::{CreditSamplesConfig, ValidatorConfig},
        confirm::Confirmer,
        error::{Error, Result},
        failover::{
            client::{Client, ClientConfig},
            message::{NodeIdentities, NodeIdentity, NodeInfo},
            server::{Server, ServerConfig},
            NODE_ROLE_ACTIVE, NODE_ROLE_PASSIVE,
        },
        hooks::FailoverHooks,
        identity::IdentityPair,
        new_spinner_progress_bar, style,
        template::{self, TemplateVars},
        utils, APP_VERSION,
    },
    log::{debug, info, warn},
    solana_pubkey::Pubkey,
    std::{
        collections::BTreeMap,
        path::PathBuf,
        sync::Arc,
        time::{Duration, Instant},
    },
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default)]
pub struct FailoverParams {
    /// Real run; identities actually change. Default is a dry run.
    pub not_a_drill: bool,
    pub no_wait_for_healthy: bool,
    pub no_min_time_to_leader_slot: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
    /// The validator has not yet advertised either configured identity to
    /// the cluster. Legal at startup, invalid for failover.
    Neither,
}

/// Pure role resolution: match the gossip-advertised pubkey against the two
/// configured identities.
pub fn resolve_role(gossip_pubkey: &Pubkey, identities: &IdentityPair) -> Role {
    if *gossip_pubkey == identities.active.pubkey() {
        Role::Active
    } else if *gossip_pubkey == identities.passive.pubkey() {
        Role::Passive
    } else {
        Role::Neither
    }
}

#[derive(Clone, Debug)]
pub struct Peer {
    pub name: String,
    pub address: String,
}

pub struct Validator {
    pub bin: String,
    pub ledger_dir: PathBuf,
    pub tower_file: PathBuf,
    pub tower_auto_delete_when_passive: bool,
    pub identities: IdentityPair,
    pub peers: BTreeMap<String, Peer>,
    pub set_identity_active_command: String,
    pub set_identity_passive_command: String,
    pub public_ip: String,
    pub hostname: String,
    pub min_time_to_leader_slot: Duration,
    pub gossip_node: ClusterNode,
    pub server_port: u16,
    pub server_heartbeat_interval: Duration,
    pub server_stream_timeout: Duration,
    pub credit_samples: CreditSamplesConfig,
    pub hooks: FailoverHooks,

    observer: Arc<ClusterObserver>,
    confirmer: Arc<dyn Confirmer>,
}

impl Validator {
    /// Materialize the runtime context from configuration. Fails fast on
    /// anything that would otherwise fail mid-failover.
    pub async fn from_config(
        cfg: &ValidatorConfig,
        confirmer: Arc<dyn Confirmer>,
    ) -> Result<Self> {
        debug!("configuring validator...");

        let network_rpc_url = crate::config::cluster_rpc_url(&cfg.cluster)?;
        if !cfg.rpc_address.contains("://") {
            return Err(Error::Configuration(format!(
                "invalid rpc address: {}, must be a url with a scheme and port",
                cfg.rpc_address
            )));
        }
        let observer = Arc::new(ClusterObserver::new(&cfg.rpc_address, network_rpc_url));
        debug!(
            "rpc clients configured: local={} network={network_rpc_url}",
            cfg.rpc_address
        );

        utils::ensure_bin(&cfg.bin)?;
        let ledger_dir = utils::resolve_and_validate_dir(&cfg.ledger_dir)?;

        let identities = IdentityPair::load(&cfg.identities.active, &cfg.identities.passive)?;
        debug!(
            "identities set: active={} passive={}",
            identities.active.pubkey(),
            identities.passive.pubkey()
        );

        let vars = template_vars(&cfg.bin, &ledger_dir, &identities);

        let tower_dir = utils::resolve_and_validate_dir(&cfg.tower.dir)?;
        let tower_file_name = template::expand(&cfg.tower.file_name_template, &vars)?;
        let tower_file = tower_dir.join(tower_file_name);
        debug!("tower file set: {}", tower_file.display());

        let set_identity_active_command =
            template::expand(&cfg.failover.set_identity_active_cmd_template, &vars)?;
        let set_identity_passive_command =
            template::expand(&cfg.failover.set_identity_passive_cmd_template, &vars)?;
        debug!("set identity active command: {set_identity_active_command}");
        debug!("set identity passive command: {set_identity_passive_command}");
        if set_identity_active_command == set_identity_passive_command {
            warn!("set identity active and passive commands are the same - this could be intentional or a mistake");
        }

        if cfg.failover.peers.is_empty() {
            return Err(Error::Configuration("must have at least one peer".to_string()));
        }
        let mut peers = BTreeMap::new();
        for (name, peer) in &cfg.failover.peers {
            if !utils::is_valid_host_port(&peer.address) {
                return Err(Error::Configuration(format!(
                    "invalid peer address {} for peer {name} - must be host:port",
                    peer.address
                )));
            }
            debug!("registered peer {name} at {}", peer.address);
            peers.insert(
                name.clone(),
                Peer {
                    name: name.clone(),
                    address: peer.address.clone(),
                },
            );
        }

        let public_ip = match &cfg.public_ip {
            Some(ip) => {
                debug!("public ip set in config - a testing hack, likely to break and/or be removed");
                ip.clone()
            }
            None => utils::get_public_ip().await?,
        };

        let hostname = match &cfg.hostname {
            Some(hostname) => hostname.clone(),
            None => hostname::get()
                .map_err(|err| Error::Configuration(format!("failed to get hostname: {err}")))?
                .to_string_lossy()
                .into_owned(),
        };

        let gossip_node = observer.node_from_ip(&public_ip).await?;
        debug!(
            "gossip node set: ip={} pubkey={}",
            gossip_node.gossip_ip, gossip_node.pubkey
        );

        Ok(Self {
            bin: cfg.bin.clone(),
            ledger_dir,
            tower_file,
            tower_auto_delete_when_passive: cfg.tower.auto_empty_when_passive,
            identities,
            peers,
            set_identity_active_command,
            set_identity_passive_command,
            public_ip,
            hostname,
            min_time_to_leader_slot: cfg.failover.min_time_to_leader_slot,
            gossip_node,
            server_port: cfg.failover.server.port,
            server_heartbeat_interval: cfg.failover.server.heartbeat_interval,
            server_stream_timeout: cfg.failover.server.stream_timeout,
            credit_samples: cfg.failover.monitor.credit_samples.clone(),
            hooks: cfg.failover.hooks.clone(),
            observer,
            confirmer,
        })
    }

    pub fn role(&self) -> Role {
        resolve_role(&self.gossip_node.pubkey, &self.identities)
    }

    /// Run a failover, driving whichever side this host's role dictates.
    pub async fn failover(&self, params: FailoverParams) -> Result<()> {
        debug!("running failover with params: {params:?}");

        if params.no_wait_for_healthy {
            debug!("--no-wait-for-healthy flag is set, skipping wait for healthy");
        } else {
            self.wait_until_healthy().await;
        }

        match self.role() {
            Role::Active => self.hand_over(params).await,
            Role::Passive => self.serve_handover(params).await,
            Role::Neither => Err(Error::Admission(format!(
                "this validator advertises {} in gossip, which is neither the active nor the passive identity - cannot failover",
                self.gossip_node.pubkey
            ))),
        }
    }

    fn node_info(&self, set_identity_command: &str) -> NodeInfo {
        NodeInfo {
            public_ip: self.public_ip.clone(),
            hostname: self.hostname.clone(),
            identities: NodeIdentities {
                active: NodeIdentity {
                    key_file: self.identities.active.key_file_string(),
                    pubkey: self.identities.active.pubkey().to_string(),
                },
                passive: NodeIdentity {
                    key_file: self.identities.passive.key_file_string(),
                    pubkey: self.identities.passive.pubkey().to_string(),
                },
            },
            tower_file: self.tower_file.display().to_string(),
            tower_file_bytes: Vec::new(),
            tower_file_hash: String::new(),
            set_identity_command: set_identity_command.to_string(),
            client_version: self.gossip_node.client_version.clone(),
            app_version: APP_VERSION.to_string(),
        }
    }

    /// Passive side: host the handover server and become active.
    async fn serve_handover(&self, params: FailoverParams) -> Result<()> {
        info!(
            "This validator is currently {} - public_ip={} pubkey={}",
            style::render_passive(&NODE_ROLE_PASSIVE.to_uppercase()),
            self.public_ip,
            self.identities.passive.pubkey(),
        );

        apply_passive_tower_policy(&self.tower_file, self.tower_auto_delete_when_passive)?;

        let server = Server::bind(ServerConfig {
            port: self.server_port,
            heartbeat_interval: self.server_heartbeat_interval,
            stream_timeout: self.server_stream_timeout,
            passive_node_info: self.node_info(&self.set_identity_active_command),
            observer: self.observer.clone(),
            is_dry_run: !params.not_a_drill,
            hooks: self.hooks.clone(),
            credit_sample_count: self.credit_samples.count,
            credit_sample_interval: self.credit_samples.interval,
            confirmer: self.confirmer.clone(),
        })?;

        server.serve().await
    }

    /// Active side: dial the passive peer and hand the active identity over.
    async fn hand_over(&self, params: FailoverParams) -> Result<()> {
        info!(
            "This validator is currently {} - public_ip={} pubkey={}",
            style::render_active(&NODE_ROLE_ACTIVE.to_uppercase()),
            self.public_ip,
            self.identities.active.pubkey(),
        );

        if !utils::file_exists(&self.tower_file) {
            return Err(Error::Admission(format!(
                "tower file does not exist: {}",
                self.tower_file.display()
            )));
        }
        if utils::file_size(&self.tower_file) == 0 {
            return Err(Error::Admission(format!(
                "tower file is empty: {}",
                self.tower_file.display()
            )));
        }

        // a real peer must be able to take over before we step down
        self.observer
            .node_from_pubkey(&self.identities.passive.pubkey())
            .await
            .map_err(|err| {
                Error::Admission(format!(
                    "passive peer not found in gossip with pubkey {} from file {}: {err}",
                    self.identities.passive.pubkey(),
                    self.identities.passive.key_file_string(),
                ))
            })?;

        let peer = self.select_peer()?;

        let mut client = Client::connect(ClientConfig {
            server_name: peer.name.clone(),
            server_address: peer.address.clone(),
            active_node_info: self.node_info(&self.set_identity_passive_command),
            min_time_to_leader_slot: self.min_time_to_leader_slot,
            wait_min_time_to_leader_slot: !params.no_min_time_to_leader_slot,
            hooks: self.hooks.clone(),
            observer: self.observer.clone(),
        })
        .await
        .map_err(|err| {
            Error::Protocol(format!("failed to connect to peer {}: {err}", peer.name))
        })?;

        client.start().await.map(|_| ())
    }

    async fn wait_until_healthy(&self) {
        let start = Instant::now();
        let progress = new_spinner_progress_bar();
        progress.set_message("waiting for validator to be healthy and synced...");

        loop {
            if self.observer.is_local_healthy().await {
                progress.abandon_with_message(style::render_active(&format!(
                    "validator is healthy and synced - elapsed time {:?}",
                    start.elapsed()
                )));
                return;
            }
            progress.set_message(style::render_warning(
                "waiting for validator to report healthy...",
            ));
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn select_peer(&self) -> Result<Peer> {
        if self.peers.len() == 1 {
            let peer = self.peers.values().next().expect("one peer").clone();
            debug!("single configured peer {} at {}", peer.name, peer.address);
            return Ok(peer);
        }

        let names: Vec<String> = self.peers.keys().cloned().collect();
        let index = self
            .confirmer
            .select("Select a passive peer to failover to:", &names)
            .map_err(|err| Error::Configuration(format!("failed to select peer: {err}")))?;
        let peer = self.peers[&names[index]].clone();
        debug!("selected peer: {} address: {}", peer.name, peer.address);
        Ok(peer)
    }
}

/// A stale tower on the passive side would poison the arriving identity's
/// lockouts; it must be gone before the failover server starts.
fn apply_passive_tower_policy(tower_file: &std::path::Path, auto_delete: bool) -> Result<()> {
    if !utils::file_exists(tower_file) {
        return Ok(());
    }
    if auto_delete {
        debug!(
            "deleting tower file {} because validator.tower.auto_empty_when_passive is true",
            tower_file.display()
        );
        return Ok(std::fs::remove_file(tower_file)?);
    }
    Err(Error::Admission(format!(
        "tower file exists and validator.tower.auto_empty_when_passive is false - delete it and re-run: {}",
        tower_file.display()
    )))
}

fn template_vars(bin: &str, ledger_dir: &std::path::Path, identities: &IdentityPair) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("Bin", bin.to_string());
    vars.insert("LedgerDir", ledger_dir.display().to_string());
    vars.insert("Identities.Active.KeyFile", identities.active.key_file_string());
    vars.insert("Identities.Active.PubKey", identities.active.pubkey().to_string());
    vars.insert("Identities.Passive.KeyFile", identities.passive.key_file_string());
    vars.insert("Identities.Passive.PubKey", identities.passive.pubkey().to_string());
    vars
}
