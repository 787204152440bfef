//! Active-side failover driver.
//!
//! The departing active node dials the passive peer's server, follows its
//! lead through the exchange, and hands the active identity over. The
//! decisive timing move is slot alignment: the set-identity command is
//! issued right at the start of a slot so the vote gap stays a fraction of
//! one slot.

use {
    super::{
        hook_env_map,
        message::{FailoverMessage, NodeInfo},
        stream::FailoverStream,
        tls, MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST, NODE_ROLE_ACTIVE, NODE_ROLE_PASSIVE,
    },
    crate::{
        cluster::ClusterObserver,
        error::{Error, Result},
        hooks::FailoverHooks,
        new_spinner_progress_bar, style,
    },
    log::{debug, info},
    solana_pubkey::Pubkey,
    std::{
        net::{Ipv4Addr, SocketAddr},
        sync::Arc,
        time::{Duration, SystemTime},
    },
};

const LEADER_SLOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LEADER_SLOT_POLL_RETRIES: usize = 10;

/// Sleep grain for the slot-alignment wait. Coarser sleeps would push the
/// set-identity command deeper into the slot and widen the vote gap.
const SLOT_ALIGNMENT_SLEEP: Duration = Duration::from_micros(10);

pub struct ClientConfig {
    pub server_name: String,
    pub server_address: String,
    pub active_node_info: NodeInfo,
    pub min_time_to_leader_slot: Duration,
    pub wait_min_time_to_leader_slot: bool,
    pub hooks: FailoverHooks,
    pub observer: Arc<ClusterObserver>,
}

pub struct Client {
    // kept so the endpoint driver outlives the connection
    _endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    server_name: String,
    active_node_info: NodeInfo,
    min_time_to_leader_slot: Duration,
    wait_min_time_to_leader_slot: bool,
    hooks: FailoverHooks,
    observer: Arc<ClusterObserver>,
}

impl Client {
    /// Dial the passive peer's failover server.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let server_addr = tokio::net::lookup_host(&config.server_address)
            .await
            .map_err(|err| {
                Error::Configuration(format!(
                    "failed to resolve peer address {}: {err}",
                    config.server_address
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "peer address {} resolved to nothing",
                    config.server_address
                ))
            })?;

        let mut endpoint = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(tls::new_client_config()?);

        let server_host = config
            .server_address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(config.server_address.as_str());

        let connection = endpoint
            .connect(server_addr, server_host)
            .map_err(|err| Error::Protocol(format!("failed to connect to server: {err}")))?
            .await
            .map_err(|err| Error::Protocol(format!("failed to connect to server: {err}")))?;

        debug!("Connected to {}", style::render_passive(&config.server_name));

        Ok(Self {
            _endpoint: endpoint,
            connection,
            server_name: config.server_name,
            active_node_info: config.active_node_info,
            min_time_to_leader_slot: config.min_time_to_leader_slot,
            wait_min_time_to_leader_slot: config.wait_min_time_to_leader_slot,
            hooks: config.hooks,
            observer: config.observer,
        })
    }

    /// Run the active side of the failover to completion, returning the
    /// final exchanged message.
    pub async fn start(&mut self) -> Result<FailoverMessage> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|err| Error::Protocol(format!("failed to open stream: {err}")))?;
        debug!("opened stream to server");

        let mut stream = FailoverStream::new(send, recv);
        stream
            .write_message_type(MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST)
            .await?;

        stream.message.active_node_info = self.active_node_info.clone();
        stream.encode().await?;

        let progress = new_spinner_progress_bar();
        progress.set_message(format!(
            "Waiting for failover signal from {}...",
            style::render_passive(&self.server_name)
        ));
        let admission = stream.decode().await;
        progress.abandon_with_message("received failover signal");
        admission?;

        // both peers must run the same release of this program
        let server_version = stream.message.passive_node_info.app_version.clone();
        let client_version = self.active_node_info.app_version.clone();
        if server_version != client_version {
            return Err(Error::Protocol(format!(
                "server is running a different version of this program: {server_version} (them) != {client_version} (us)"
            )));
        }

        if !stream.message.can_proceed {
            return Err(Error::Admission(stream.message.error_message.clone()));
        }

        self.wait_min_time_to_leader_slot().await?;

        let pre_hook_env = hook_env_map(
            &self.active_node_info,
            &stream.message.passive_node_info,
            NODE_ROLE_ACTIVE,
            NODE_ROLE_PASSIVE,
            stream.message.is_dry_run,
        );
        self.hooks.run_pre_when_active(&pre_hook_env).await?;

        info!("🟢 Failover started");

        let slot = self.observer.current_slot().await?;
        stream.message.failover_start_slot = slot + 1;

        self.wait_until_start_of_next_slot().await?;

        let dry_run_prefix = if stream.message.is_dry_run { " (dry run) " } else { " " };
        info!(
            "👉{dry_run_prefix}Setting identity to {} - {}",
            style::render_passive("PASSIVE"),
            style::render_passive(&self.active_node_info.identities.passive.pubkey),
        );

        stream.message.active_set_identity_start = Some(SystemTime::now());
        let set_identity_command = self.active_node_info.set_identity_command.clone();
        crate::utils::run_command(&set_identity_command, stream.message.is_dry_run)
            .await
            .map_err(|err| {
                Error::Switchover(format!(
                    "failed to set identity to passive with command {set_identity_command}: {err}"
                ))
            })?;
        stream.message.active_set_identity_end = Some(SystemTime::now());

        info!(
            "👉 Sending tower file to {}",
            style::render_passive(&stream.message.passive_node_info.hostname)
        );

        stream.message.active_sync_tower_start = Some(SystemTime::now());
        stream.message.active_node_info.load_tower_file()?;
        stream.message.active_sync_tower_end = Some(SystemTime::now());

        stream.encode().await?;

        stream.decode().await?;
        if !stream.message.is_successfully_completed {
            return Err(Error::Protocol(format!(
                "server failed to complete failover: {}",
                stream.message.error_message
            )));
        }

        info!("🟤 Failover complete");

        // this node is passive now
        let post_hook_env = hook_env_map(
            &self.active_node_info,
            &stream.message.passive_node_info,
            NODE_ROLE_PASSIVE,
            NODE_ROLE_ACTIVE,
            stream.message.is_dry_run,
        );
        self.hooks.run_post_when_passive(&post_hook_env).await;

        self.connection.close(0u32.into(), b"failover complete");
        Ok(stream.message)
    }

    /// Busy-wait (10µs grain) until the current slot is over so the
    /// set-identity command lands at the very start of the next slot.
    async fn wait_until_start_of_next_slot(&self) -> Result<()> {
        debug!("waiting until start of next slot");
        let slot_end = self.observer.current_slot_end_time().await?;

        tokio::task::block_in_place(|| {
            while SystemTime::now() < slot_end {
                std::thread::sleep(SLOT_ALIGNMENT_SLEEP);
            }
        });
        Ok(())
    }

    /// Hold the failover until the active identity's next leader slot is
    /// comfortably far away. Skipped when the identity is not on this
    /// epoch's schedule. Transient RPC failures are tolerated up to 10
    /// retries with 2s backoff.
    async fn wait_min_time_to_leader_slot(&self) -> Result<()> {
        if !self.wait_min_time_to_leader_slot {
            return Ok(());
        }

        debug!(
            "ensuring next leader slot is at least {:?} in the future",
            self.min_time_to_leader_slot
        );

        let pubkey: Pubkey = self
            .active_node_info
            .identities
            .active
            .pubkey
            .parse()
            .map_err(|err| {
                Error::Configuration(format!(
                    "invalid active identity pubkey {}: {err}",
                    self.active_node_info.identities.active.pubkey
                ))
            })?;

        let progress = new_spinner_progress_bar();
        progress.set_message("Checking next leader slot...");
        let mut remaining_retries = LEADER_SLOT_POLL_RETRIES;

        loop {
            match self.observer.time_to_next_leader_slot(&pubkey).await {
                Err(err) => {
                    if remaining_retries == 0 {
                        progress.abandon_with_message("failed to get time to next leader slot");
                        return Err(Error::Admission(format!(
                            "failed to get time to next leader slot: {err}"
                        )));
                    }
                    progress.set_message(style::render_error(&format!(
                        "Failed to get time to next leader slot, retrying in {LEADER_SLOT_POLL_INTERVAL:?} ({remaining_retries} retries left): {err}"
                    )));
                    remaining_retries -= 1;
                }
                Ok((false, _)) => {
                    progress.abandon_with_message(style::render_active(
                        "This validator is not on the leader schedule, skipping wait for next leader slot to pass",
                    ));
                    return Ok(());
                }
                Ok((true, time_to_slot)) if time_to_slot < self.min_time_to_leader_slot => {
                    progress.set_message(style::render_active(&format!(
                        "Next leader slot in {}, waiting for it before proceeding...",
                        humantime::format_duration(Duration::from_secs(time_to_slot.as_secs())),
                    )));
                }
                Ok((true, time_to_slot)) => {
                    progress.abandon_with_message(style::render_active(&format!(
                        "Next leader slot in {} > {}, proceeding...",
                        humantime::format_duration(Duration::from_secs(time_to_slot.as_secs())),
                        humantime::format_duration(self.min_time_to_leader_slot),
                    )));
                    return Ok(());
                }
            }
            tokio::time::sleep(LEADER_SLOT_POLL_INTERVAL).await;
        }
    }
}
