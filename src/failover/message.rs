//! The single mutable message exchanged over the failover stream.
//!
//! The protocol's logical payload is one growing record: admission decision,
//! then tower-file bytes, then timings, then completion. Both sides hold the
//! same structure; each exchange decodes the previous value, mutates it, and
//! encodes the whole message again.

use {
    crate::{
        error::{Error, Result},
        style,
    },
    serde::{Deserialize, Serialize},
    std::{
        collections::BTreeMap,
        fs,
        time::{Duration, SystemTime},
    },
    xxhash_rust::xxh3::xxh3_64,
};

/// Public half of one identity as shipped over the wire. Key-file paths are
/// included (they appear in recovery instructions and hook environments);
/// private key material never crosses the wire.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeIdentity {
    pub key_file: String,
    pub pubkey: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeIdentities {
    pub active: NodeIdentity,
    pub passive: NodeIdentity,
}

/// Everything a peer needs to know about a node to perform a failover.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeInfo {
    pub public_ip: String,
    pub hostname: String,
    pub identities: NodeIdentities,
    pub tower_file: String,
    /// Populated on the active side immediately before the transfer
    /// exchange; cleared once the passive side has written the file.
    pub tower_file_bytes: Vec<u8>,
    pub tower_file_hash: String,
    pub set_identity_command: String,
    pub client_version: String,
    pub app_version: String,
}

impl NodeInfo {
    /// Read the tower file into the message and stamp its hash.
    pub fn load_tower_file(&mut self) -> Result<()> {
        let bytes = fs::read(&self.tower_file).map_err(|err| {
            Error::Transfer(format!("failed to read tower file {}: {err}", self.tower_file))
        })?;
        self.tower_file_hash = tower_file_hash(&bytes);
        self.tower_file_bytes = bytes;
        Ok(())
    }
}

/// Hash label for a tower-file payload: `xxh3:<lowercase-hex>`.
pub fn tower_file_hash(bytes: &[u8]) -> String {
    format!("xxh3:{:x}", xxh3_64(bytes))
}

/// One observation of the active identity's vote standing.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CreditSample {
    pub vote_account_pubkey: String,
    /// 1-indexed; lower is better.
    pub vote_rank: usize,
    /// Credit delta versus the previous epoch entry.
    pub credits: i64,
    pub timestamp: SystemTime,
}

/// Samples keyed by identity pubkey, appended in call order.
pub type CreditSamples = BTreeMap<String, Vec<CreditSample>>;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FailoverMessage {
    pub can_proceed: bool,
    pub error_message: String,
    pub active_node_info: NodeInfo,
    pub passive_node_info: NodeInfo,
    pub is_dry_run: bool,
    pub is_successfully_completed: bool,
    pub active_set_identity_start: Option<SystemTime>,
    pub active_set_identity_end: Option<SystemTime>,
    pub active_sync_tower_start: Option<SystemTime>,
    pub active_sync_tower_end: Option<SystemTime>,
    pub passive_set_identity_start: Option<SystemTime>,
    pub passive_set_identity_end: Option<SystemTime>,
    pub passive_sync_tower_end: Option<SystemTime>,
    pub failover_start_slot: u64,
    pub failover_end_slot: u64,
    pub credit_samples: CreditSamples,
}

fn duration_between(start: Option<SystemTime>, end: Option<SystemTime>) -> Option<Duration> {
    end?.duration_since(start?).ok()
}

fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(duration) => format!("{duration:.3?}"),
        None => "-".to_string(),
    }
}

impl FailoverMessage {
    /// Wall-clock span of the switchover proper: from the active side
    /// starting its set-identity command to the passive side finishing its
    /// own.
    pub fn failover_duration(&self) -> Option<Duration> {
        duration_between(self.active_set_identity_start, self.passive_set_identity_end)
    }

    pub fn failover_slots(&self) -> u64 {
        self.failover_end_slot.saturating_sub(self.failover_start_slot)
    }

    /// Current-role table: who is active and who is passive right now.
    /// After a completed real run the two nodes have swapped.
    pub fn state_table(&self) -> String {
        let swapped = self.is_successfully_completed && !self.is_dry_run;
        let (active, passive) = if swapped {
            (&self.passive_node_info, &self.active_node_info)
        } else {
            (&self.active_node_info, &self.passive_node_info)
        };

        let rows = vec![
            vec![
                style::render_active("active"),
                style::render_active(&active.hostname),
                active.public_ip.clone(),
                active.identities.active.pubkey.clone(),
                active.client_version.clone(),
            ],
            vec![
                style::render_passive("passive"),
                style::render_passive(&passive.hostname),
                passive.public_ip.clone(),
                passive.identities.passive.pubkey.clone(),
                passive.client_version.clone(),
            ],
        ];
        style::render_table(
            &["CurrentRole", "AdvertisedName", "PublicIP", "Pubkey", "ClientVersion"],
            &rows,
        )
    }

    /// Per-stage timing table for the completed failover.
    pub fn timing_table(&self) -> String {
        let rows = vec![
            vec![
                format!(
                    "{} --set-identity--> {}",
                    self.active_node_info.hostname, self.active_node_info.identities.passive.pubkey
                ),
                format_duration(duration_between(
                    self.active_set_identity_start,
                    self.active_set_identity_end,
                )),
                self.failover_start_slot.to_string(),
            ],
            vec![
                format!(
                    "{} ---tower-file---> {}",
                    self.active_node_info.hostname, self.passive_node_info.hostname
                ),
                format!(
                    "{} ({} bytes)",
                    format_duration(duration_between(
                        self.active_sync_tower_start,
                        self.passive_sync_tower_end,
                    )),
                    self.active_node_info.tower_file_bytes.len(),
                ),
                String::new(),
            ],
            vec![
                format!(
                    "{} --set-identity--> {}",
                    self.passive_node_info.hostname, self.passive_node_info.identities.active.pubkey
                ),
                format_duration(duration_between(
                    self.passive_set_identity_start,
                    self.passive_set_identity_end,
                )),
                self.failover_end_slot.to_string(),
            ],
            vec![
                style::render_bold("Total"),
                style::render_bold(&format!(
                    "{} (wall clock)",
                    format_duration(self.failover_duration())
                )),
                style::render_bold(&format!("{} slots", self.failover_slots())),
            ],
        ];
        style::render_table(&["Stage", "Duration", "Slot"], &rows)
    }

    /// Human-readable summary shown to the operator before confirmation.
    pub fn confirmation_summary(&self, app_version: &str) -> String {
        let dry_run_note = if self.is_dry_run {
            format!(
                "{}\n{}",
                style::render_info("INFO: This is a dry run - no identities will be changed on either node"),
                style::render_info("INFO: To run a real failover, re-run with --not-a-drill"),
            )
        } else {
            style::render_warning(
                "WARNING: This is a real failover - identities will be changed on both nodes",
            )
        };
        let step_prefix = if self.is_dry_run { "(dry run) " } else { "" };

        format!(
            "Version: {app_version}\n\
             {state_table}\n\
             {dry_run_note}\n\n\
             Failing over will:\n\
             1. {step_prefix}Set {active_host} (them) to PASSIVE {passive_pubkey} with command:\n\n    {active_cmd}\n\n\
             2. Sync tower file from {active_host} (them) to (us) {passive_host} at:\n\n    {tower_file}\n\n\
             3. {step_prefix}Set {passive_host} (us) to ACTIVE {active_pubkey} with command:\n\n    {passive_cmd}\n\n\
             4. Exit\n",
            state_table = self.state_table(),
            active_host = style::render_active(&self.active_node_info.hostname),
            passive_host = style::render_passive(&self.passive_node_info.hostname),
            passive_pubkey = style::render_passive(&self.active_node_info.identities.passive.pubkey),
            active_pubkey = style::render_active(&self.passive_node_info.identities.active.pubkey),
            active_cmd = self.active_node_info.set_identity_command,
            passive_cmd = self.passive_node_info.set_identity_command,
            tower_file = self.passive_node_info.tower_file,
        )
    }
}
