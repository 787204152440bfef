//! Passive-side failover driver.
//!
//! The arriving active node hosts the QUIC listener. One task is spawned per
//! accepted stream so the listener keeps accepting, but a real failover has
//! exactly one; once a failover stream finishes (either way) the listener is
//! closed and its result becomes the server's result.
//!
//! There is deliberately no overall timeout: a partial failover must not
//! time out in the middle - it either completes or forces human
//! intervention.

use {
    super::{
        hook_env_map,
        message::{tower_file_hash, NodeInfo},
        stream::FailoverStream,
        tls, MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST, MESSAGE_TYPE_FILE_TRANSFER,
        NODE_ROLE_ACTIVE, NODE_ROLE_PASSIVE,
    },
    crate::{
        cluster::ClusterObserver,
        confirm::Confirmer,
        error::{Error, Result},
        hooks::FailoverHooks,
        new_spinner_progress_bar, style, utils,
    },
    log::{debug, error, info, warn},
    std::{
        io::Write,
        net::{Ipv4Addr, SocketAddr},
        os::unix::fs::OpenOptionsExt,
        sync::Arc,
        time::{Duration, SystemTime},
    },
    tokio::sync::mpsc,
};

const GOSSIP_CONFIRM_ATTEMPTS: usize = 4;
const GOSSIP_CONFIRM_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct ServerConfig {
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub stream_timeout: Duration,
    pub passive_node_info: NodeInfo,
    pub observer: Arc<ClusterObserver>,
    pub is_dry_run: bool,
    pub hooks: FailoverHooks,
    pub credit_sample_count: usize,
    pub credit_sample_interval: Duration,
    pub confirmer: Arc<dyn Confirmer>,
}

struct ServerState {
    passive_node_info: NodeInfo,
    observer: Arc<ClusterObserver>,
    is_dry_run: bool,
    hooks: FailoverHooks,
    credit_sample_count: usize,
    credit_sample_interval: Duration,
    confirmer: Arc<dyn Confirmer>,
}

pub struct Server {
    endpoint: quinn::Endpoint,
    state: Arc<ServerState>,
    port: u16,
}

impl Server {
    /// Bind the QUIC listener. `config.port` of 0 binds an ephemeral port.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let mut server_config = tls::new_server_config()?;
        let transport = Arc::get_mut(&mut server_config.transport)
            .expect("transport config not yet shared");
        transport.keep_alive_interval(Some(config.heartbeat_interval));
        transport.max_idle_timeout(Some(config.stream_timeout.try_into().map_err(|_| {
            Error::Configuration(format!(
                "stream timeout {:?} is out of range",
                config.stream_timeout
            ))
        })?));

        let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let endpoint = quinn::Endpoint::server(server_config, listen_addr)?;

        Ok(Self {
            endpoint,
            port: config.port,
            state: Arc::new(ServerState {
                passive_node_info: config.passive_node_info,
                observer: config.observer,
                is_dry_run: config.is_dry_run,
                hooks: config.hooks,
                credit_sample_count: config.credit_sample_count,
                credit_sample_interval: config.credit_sample_interval,
                confirmer: config.confirmer,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until one failover stream runs to completion, then
    /// close the listener and return that stream's result.
    pub async fn serve(&self) -> Result<()> {
        info!(
            "Listening on port {} - run this program on the ACTIVE validator to continue",
            self.local_addr().map(|addr| addr.port()).unwrap_or(self.port),
        );

        let (result_tx, mut result_rx) = mpsc::channel::<Result<()>>(1);

        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        // endpoint closed underneath us
                        return Ok(());
                    };
                    match incoming.await {
                        Ok(connection) => {
                            debug!("accepted new connection from {}", connection.remote_address());
                            tokio::spawn(handle_connection(
                                self.state.clone(),
                                connection,
                                result_tx.clone(),
                            ));
                        }
                        Err(err) => {
                            error!("failed to accept connection: {err}");
                        }
                    }
                }
                result = result_rx.recv() => {
                    let result = result.expect("a result sender is always retained");
                    if result.is_err() {
                        // let any in-flight error frame reach the peer first
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    self.endpoint.close(0u32.into(), b"failover complete");
                    self.endpoint.wait_idle().await;
                    return result;
                }
            }
        }
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    connection: quinn::Connection,
    result_tx: mpsc::Sender<Result<()>>,
) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                debug!("accepted new stream from {}", connection.remote_address());
                tokio::spawn(handle_stream(
                    state.clone(),
                    connection.clone(),
                    FailoverStream::new(send, recv),
                    result_tx.clone(),
                ));
            }
            Err(err) => {
                debug!(
                    "stopped accepting streams from {}: {err}",
                    connection.remote_address()
                );
                return;
            }
        }
    }
}

async fn handle_stream(
    state: Arc<ServerState>,
    connection: quinn::Connection,
    mut stream: FailoverStream<quinn::SendStream, quinn::RecvStream>,
    result_tx: mpsc::Sender<Result<()>>,
) {
    match stream.read_message_type().await {
        Ok(MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST) => {
            debug!("received failover initiate request");
            let result = handle_failover_stream(&state, &connection, &mut stream).await;
            if let Err(err) = &result {
                error!("{err}");
            }
            let _ = result_tx.send(result).await;
        }
        Ok(other) => {
            // includes MESSAGE_TYPE_FILE_TRANSFER, which is reserved
            error!(
                "unsupported message type: {other} (file transfer = {MESSAGE_TYPE_FILE_TRANSFER}) - ignoring stream"
            );
        }
        Err(err) => {
            debug!("failed to read message type: {err}");
        }
    }
}

/// Surface an admission failure to the peer before giving up locally.
async fn abort_with_error(
    stream: &mut FailoverStream<quinn::SendStream, quinn::RecvStream>,
    err: Error,
) -> Error {
    stream.message.error_message = err.to_string();
    stream.message.can_proceed = false;
    if let Err(encode_err) = stream.encode().await {
        error!("failed to send error message to client: {encode_err}");
    }
    err
}

async fn handle_failover_stream(
    state: &ServerState,
    connection: &quinn::Connection,
    stream: &mut FailoverStream<quinn::SendStream, quinn::RecvStream>,
) -> Result<()> {
    stream.decode().await?;

    stream.message.passive_node_info = state.passive_node_info.clone();
    stream.message.is_dry_run = state.is_dry_run;

    // both peers must run the same release of this program
    let client_version = stream.message.active_node_info.app_version.clone();
    let server_version = state.passive_node_info.app_version.clone();
    debug!("checking for version mismatch: server={server_version} client={client_version}");
    if client_version != server_version {
        let err = Error::Protocol(format!(
            "Server ({server_version}) and client ({client_version}) version mismatch"
        ));
        return Err(abort_with_error(stream, err).await);
    }

    // the dialer must be the node gossip says holds the active identity
    let active_ip = stream.message.active_node_info.public_ip.clone();
    debug!("querying gossip for active node IP {active_ip}");
    let gossip_node = match state.observer.node_from_ip(&active_ip).await {
        Ok(node) => node,
        Err(err) => {
            let err = Error::Admission(format!("Failed to validate active node: {err}"));
            return Err(abort_with_error(stream, err).await);
        }
    };
    if gossip_node.gossip_ip != active_ip {
        let err = Error::Admission(format!(
            "Failed to validate active node: gossip IP {} does not match expected IP {active_ip}",
            gossip_node.gossip_ip
        ));
        return Err(abort_with_error(stream, err).await);
    }
    if gossip_node.pubkey.to_string() != stream.message.active_node_info.identities.active.pubkey {
        let err = Error::Admission(format!(
            "Failed to validate active node: gossip pubkey {} does not match declared active identity {}",
            gossip_node.pubkey, stream.message.active_node_info.identities.active.pubkey
        ));
        return Err(abort_with_error(stream, err).await);
    }

    // operator sign-off
    let summary = stream
        .message
        .confirmation_summary(&state.passive_node_info.app_version);
    println!("{summary}");
    let confirmer = state.confirmer.clone();
    let confirmed =
        tokio::task::block_in_place(|| confirmer.confirm("Proceed with failover?"))
            .unwrap_or(false);
    if !confirmed {
        let err = Error::Admission("server cancelled failover".to_string());
        return Err(abort_with_error(stream, err).await);
    }

    // baseline credit sample for the active identity, compared post-flight
    debug!("pulling pre-failover vote credits sample...");
    if let Err(err) = stream
        .pull_active_identity_credit_sample(&state.observer)
        .await
    {
        let err = Error::Admission(format!(
            "server failed to pull active identity vote credits sample: {err}"
        ));
        return Err(abort_with_error(stream, err).await);
    }

    // open the tower file now so the write at switchover is one syscall
    let tower_file_path = state.passive_node_info.tower_file.clone();
    let tower_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&tower_file_path);
    let mut tower_file = match tower_file {
        Ok(file) => file,
        Err(err) => {
            let err = Error::Admission(format!(
                "server failed to open its tower file {tower_file_path}: {err}"
            ));
            return Err(abort_with_error(stream, err).await);
        }
    };

    let pre_hook_env = hook_env_map(
        &state.passive_node_info,
        &stream.message.active_node_info,
        NODE_ROLE_PASSIVE,
        NODE_ROLE_ACTIVE,
        state.is_dry_run,
    );
    if let Err(err) = state.hooks.run_pre_when_passive(&pre_hook_env).await {
        let err = Error::Admission(format!("server failed to run its pre-failover hooks: {err}"));
        return Err(abort_with_error(stream, err).await);
    }

    stream.message.can_proceed = true;
    stream.encode().await?;

    info!(
        "🟤 Failover started - waiting for tower file from {}",
        stream.message.active_node_info.hostname
    );
    stream.decode().await?;

    let received_bytes = stream.message.active_node_info.tower_file_bytes.clone();
    let computed_hash = tower_file_hash(&received_bytes);
    let expected_hash = stream.message.active_node_info.tower_file_hash.clone();
    debug!("checking tower file hash - received: {computed_hash} expected: {expected_hash}");
    if computed_hash != expected_hash {
        error!("tower file hash mismatch: (got: {computed_hash}) != (expected: {expected_hash})");
        error!("aborting failover - save it by running:");
        println!(
            "  rsync -avz --no-perms --no-i-r --no-progress --no-motd --no-times -e ssh -i <YOUR-SSH-KEY> -o PubkeyAcceptedKeyTypes=+ssh-ed25519 -o HostKeyAlgorithms=+ssh-ed25519 -o BatchMode=yes -o StrictHostKeyChecking=no {user}@{host}:{remote_tower} {local_tower}",
            user = std::env::var("USER").unwrap_or_default(),
            host = stream.message.active_node_info.hostname,
            remote_tower = stream.message.active_node_info.tower_file,
            local_tower = tower_file_path,
        );
        error!("then run:");
        println!("  {}", stream.message.passive_node_info.set_identity_command);
        return Err(Error::Transfer(format!(
            "tower file hash mismatch: (got: {computed_hash}) != (expected: {expected_hash})"
        )));
    }

    tower_file
        .write_all(&received_bytes)
        .and_then(|_| tower_file.sync_all())
        .map_err(|err| {
            Error::Transfer(format!("failed to write tower file to {tower_file_path}: {err}"))
        })?;
    drop(tower_file);
    stream.message.passive_sync_tower_end = Some(SystemTime::now());
    info!("👉 Received tower file");

    let dry_run_prefix = if state.is_dry_run { " (dry run) " } else { " " };
    info!(
        "👉{dry_run_prefix}Setting identity to {} - {}",
        style::render_active("ACTIVE"),
        style::render_active(&stream.message.passive_node_info.identities.active.pubkey),
    );

    stream.message.passive_set_identity_start = Some(SystemTime::now());
    let set_identity_command = stream.message.passive_node_info.set_identity_command.clone();
    utils::run_command(&set_identity_command, state.is_dry_run)
        .await
        .map_err(|err| {
            Error::Switchover(format!(
                "failed to set identity to active with command {set_identity_command}: {err}"
            ))
        })?;
    stream.message.passive_set_identity_end = Some(SystemTime::now());

    // RPC can lag a slot behind; clamp so the end slot never precedes the start
    match state.observer.current_slot().await {
        Ok(slot) if slot < stream.message.failover_start_slot => {
            stream.message.failover_end_slot = stream.message.failover_start_slot;
        }
        Ok(slot) => stream.message.failover_end_slot = slot,
        Err(err) => warn!("failed to get current slot: {err}"),
    }

    stream.message.is_successfully_completed = true;
    stream.encode().await?;

    info!("🟢 Failover complete:");
    println!("{}", stream.message.state_table());

    let post_hook_env = hook_env_map(
        &state.passive_node_info,
        &stream.message.active_node_info,
        NODE_ROLE_ACTIVE,
        NODE_ROLE_PASSIVE,
        state.is_dry_run,
    );
    state.hooks.run_post_when_active(&post_hook_env).await;

    info!("🕐 Failover timing summary:");
    println!("{}", stream.message.timing_table());

    if !state.is_dry_run {
        confirm_gossip_nodes_post_failover(state, stream).await;
    }

    info!("🩺 Monitoring vote credits post-failover...");
    let progress = new_spinner_progress_bar();
    let sampled = stream
        .pull_active_identity_credit_samples(
            &state.observer,
            state.credit_sample_count,
            state.credit_sample_interval,
            &progress,
        )
        .await;
    progress.abandon_with_message("vote credit sampling done");
    match sampled.and_then(|_| stream.credit_rank_change()) {
        Ok((change, first, last)) => {
            info!("🏁 Vote credit rank change: {change} ({first} -> {last})");
        }
        Err(err) => error!("failed to report vote credit rank change: {err}"),
    }

    connection.close(0u32.into(), b"failover complete");
    Ok(())
}

/// Re-query gossip until it reflects the role swap, or give up loudly.
/// Exhausting retries is reported but never reverses the switchover.
async fn confirm_gossip_nodes_post_failover(
    state: &ServerState,
    stream: &FailoverStream<quinn::SendStream, quinn::RecvStream>,
) {
    let progress = new_spinner_progress_bar();
    progress.set_message("confirming gossip nodes switched roles...");

    let now_active = &stream.message.passive_node_info;
    let now_passive = &stream.message.active_node_info;

    for attempt in 1..=GOSSIP_CONFIRM_ATTEMPTS {
        let has_retries_left = attempt < GOSSIP_CONFIRM_ATTEMPTS;

        let check = async {
            let active_node = state.observer.node_from_ip(&now_active.public_ip).await?;
            let passive_node = state.observer.node_from_ip(&now_passive.public_ip).await?;
            Ok::<_, Error>((active_node, passive_node))
        };

        match check.await {
            Ok((active_node, passive_node)) => {
                let active_switched =
                    active_node.pubkey.to_string() == now_active.identities.active.pubkey;
                let passive_switched =
                    passive_node.pubkey.to_string() == now_passive.identities.passive.pubkey;

                if active_switched && passive_switched {
                    progress.abandon_with_message("gossip confirms role switch");
                    info!("Gossip confirms nodes switched roles successfully");
                    return;
                }

                if has_retries_left {
                    progress.set_message(style::render_warning(&format!(
                        "(attempt {attempt} of {GOSSIP_CONFIRM_ATTEMPTS}) gossip does not reflect role switch yet - retrying in {GOSSIP_CONFIRM_RETRY_DELAY:?}"
                    )));
                } else {
                    progress.abandon_with_message(style::render_error(&format!(
                        "gossip does not reflect role switch after {attempt} attempts"
                    )));
                }
            }
            Err(err) if has_retries_left => {
                progress.set_message(style::render_warning(&format!(
                    "(attempt {attempt} of {GOSSIP_CONFIRM_ATTEMPTS}) failed to refresh node info from gossip - retrying: {err}"
                )));
            }
            Err(err) => {
                progress.abandon_with_message(style::render_error(&format!(
                    "(attempt {attempt} of {GOSSIP_CONFIRM_ATTEMPTS}) failed to refresh node info from gossip - giving up: {err}"
                )));
            }
        }

        if has_retries_left {
            tokio::time::sleep(GOSSIP_CONFIRM_RETRY_DELAY).await;
        }
    }

    error!("failed to confirm gossip nodes switched roles - investigate immediately");
}
