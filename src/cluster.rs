//! Cluster observation over JSON-RPC.
//!
//! The observer holds two distinct endpoints: `local` (this validator, used
//! only for health probes) and `network` (a cluster-wide endpoint, used for
//! everything else). Conflating the two would be a correctness error: health
//! must reflect this host while cluster state must reflect the cluster.
//!
//! Leader-slot arithmetic follows the RPC shape: the leader schedule is
//! keyed by pubkey with epoch-relative slot indices, so the observer derives
//! `first_slot_of_epoch = absolute_slot - slot_index` from epoch info and
//! converts each index to an absolute slot before comparing with the current
//! slot.

use {
    crate::error::{Error, Result},
    async_trait::async_trait,
    log::debug,
    once_cell::sync::Lazy,
    solana_clock::Slot,
    solana_commitment_config::CommitmentConfig,
    solana_epoch_info::EpochInfo,
    solana_pubkey::Pubkey,
    solana_rpc_client::nonblocking::rpc_client::RpcClient,
    solana_rpc_client_api::response::{RpcContactInfo, RpcPerfSample, RpcVoteAccountInfo},
    std::{
        collections::HashMap,
        sync::{Arc, RwLock},
        time::{Duration, Instant, SystemTime},
    },
};

pub const HEALTH_OK: &str = "ok";

/// Assumed slot duration when the cluster gives us nothing better.
pub const DEFAULT_SLOT_DURATION: Duration = Duration::from_millis(400);

const SLOT_TIME_CACHE_TTL: Duration = Duration::from_secs(30);
const SLOT_TIME_FETCH_RETRIES: usize = 3;
const SLOT_TIME_FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A peer as observed via gossip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub gossip_ip: String,
    pub pubkey: Pubkey,
    pub client_version: String,
}

/// The raw RPC surface the observer needs. Kept as a trait so tests can
/// substitute a canned cluster.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    async fn cluster_nodes(&self) -> Result<Vec<RpcContactInfo>>;
    async fn vote_accounts(&self, commitment: CommitmentConfig)
        -> Result<Vec<RpcVoteAccountInfo>>;
    async fn slot(&self, commitment: CommitmentConfig) -> Result<Slot>;
    async fn leader_schedule(&self) -> Result<Option<HashMap<String, Vec<usize>>>>;
    /// Unix timestamp of the given slot; Err when the cluster has no estimate.
    async fn block_time(&self, slot: Slot) -> Result<i64>;
    async fn health(&self) -> Result<()>;
    async fn epoch_info(&self, commitment: CommitmentConfig) -> Result<EpochInfo>;
    async fn recent_performance_samples(&self, limit: usize) -> Result<Vec<RpcPerfSample>>;
}

/// `ClusterRpc` over a real JSON-RPC endpoint.
pub struct RpcEndpoint {
    client: RpcClient,
}

impl RpcEndpoint {
    pub fn new(url: &str) -> Self {
        Self {
            client: RpcClient::new(url.to_string()),
        }
    }
}

fn rpc_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Rpc(format!("{context}: {err}"))
}

#[async_trait]
impl ClusterRpc for RpcEndpoint {
    async fn cluster_nodes(&self) -> Result<Vec<RpcContactInfo>> {
        self.client
            .get_cluster_nodes()
            .await
            .map_err(|err| rpc_err("getClusterNodes", err))
    }

    async fn vote_accounts(
        &self,
        commitment: CommitmentConfig,
    ) -> Result<Vec<RpcVoteAccountInfo>> {
        self.client
            .get_vote_accounts_with_commitment(commitment)
            .await
            .map(|status| status.current)
            .map_err(|err| rpc_err("getVoteAccounts", err))
    }

    async fn slot(&self, commitment: CommitmentConfig) -> Result<Slot> {
        self.client
            .get_slot_with_commitment(commitment)
            .await
            .map_err(|err| rpc_err("getSlot", err))
    }

    async fn leader_schedule(&self) -> Result<Option<HashMap<String, Vec<usize>>>> {
        self.client
            .get_leader_schedule(None)
            .await
            .map_err(|err| rpc_err("getLeaderSchedule", err))
    }

    async fn block_time(&self, slot: Slot) -> Result<i64> {
        self.client
            .get_block_time(slot)
            .await
            .map_err(|err| rpc_err("getBlockTime", err))
    }

    async fn health(&self) -> Result<()> {
        self.client
            .get_health()
            .await
            .map_err(|err| rpc_err("getHealth", err))
    }

    async fn epoch_info(&self, commitment: CommitmentConfig) -> Result<EpochInfo> {
        self.client
            .get_epoch_info_with_commitment(commitment)
            .await
            .map_err(|err| rpc_err("getEpochInfo", err))
    }

    async fn recent_performance_samples(&self, limit: usize) -> Result<Vec<RpcPerfSample>> {
        self.client
            .get_recent_performance_samples(Some(limit))
            .await
            .map_err(|err| rpc_err("getRecentPerformanceSamples", err))
    }
}

struct SlotTimeCacheEntry {
    slot_time: Duration,
    updated: Instant,
}

// Process-wide so every observer shares one 30s window.
static SLOT_TIME_CACHE: Lazy<RwLock<Option<SlotTimeCacheEntry>>> = Lazy::new(|| RwLock::new(None));

/// Cluster Observer: gossip lookups, health, slot/epoch arithmetic, credit
/// ranking, and slot-time estimation with a bounded cache.
pub struct ClusterObserver {
    local: Arc<dyn ClusterRpc>,
    network: Arc<dyn ClusterRpc>,
}

impl ClusterObserver {
    pub fn new(local_rpc_url: &str, network_rpc_url: &str) -> Self {
        Self {
            local: Arc::new(RpcEndpoint::new(local_rpc_url)),
            network: Arc::new(RpcEndpoint::new(network_rpc_url)),
        }
    }

    /// Build an observer over arbitrary RPC implementations.
    pub fn with_rpc(local: Arc<dyn ClusterRpc>, network: Arc<dyn ClusterRpc>) -> Self {
        Self { local, network }
    }

    /// Health of this host's validator, from the local endpoint only.
    pub async fn local_health(&self) -> Result<String> {
        self.local.health().await?;
        Ok(HEALTH_OK.to_string())
    }

    pub async fn is_local_healthy(&self) -> bool {
        match self.local_health().await {
            Ok(_) => true,
            Err(err) => {
                debug!("local node health: {err}");
                false
            }
        }
    }

    /// Find the gossip node advertising from `ip`.
    pub async fn node_from_ip(&self, ip: &str) -> Result<ClusterNode> {
        let nodes = self.network.cluster_nodes().await?;
        nodes
            .iter()
            .find(|node| {
                node.gossip
                    .map(|gossip| gossip.ip().to_string() == ip)
                    .unwrap_or(false)
            })
            .map(contact_info_to_node)
            .transpose()?
            .ok_or_else(|| Error::Admission(format!("gossip node not found for ip: {ip}")))
    }

    /// Find the gossip node advertising `pubkey`.
    pub async fn node_from_pubkey(&self, pubkey: &Pubkey) -> Result<ClusterNode> {
        let pubkey_string = pubkey.to_string();
        let nodes = self.network.cluster_nodes().await?;
        nodes
            .iter()
            .find(|node| node.pubkey == pubkey_string)
            .map(contact_info_to_node)
            .transpose()?
            .ok_or_else(|| Error::Admission(format!("gossip node not found for pubkey: {pubkey}")))
    }

    pub async fn current_slot(&self) -> Result<Slot> {
        self.network.slot(CommitmentConfig::confirmed()).await
    }

    /// Estimated wall-clock end of the current slot.
    ///
    /// The block-time endpoint rarely has an estimate for the slot in
    /// flight; when it has none we assume the slot ends 400ms from now.
    pub async fn current_slot_end_time(&self) -> Result<SystemTime> {
        let slot = self.current_slot().await?;
        match self.network.block_time(slot).await {
            Ok(timestamp) => Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64)),
            Err(err) => {
                debug!("no block time for slot {slot} ({err}), assuming 400ms from now");
                Ok(SystemTime::now() + DEFAULT_SLOT_DURATION)
            }
        }
    }

    /// Whether `pubkey` is on this epoch's leader schedule, and how far away
    /// its next leader slot is.
    ///
    /// Returns `(false, 0)` when the pubkey is absent from the schedule or
    /// has no future slots left this epoch.
    pub async fn time_to_next_leader_slot(&self, pubkey: &Pubkey) -> Result<(bool, Duration)> {
        let current_slot = self.current_slot().await?;
        let epoch_info = self
            .network
            .epoch_info(CommitmentConfig::processed())
            .await?;
        let first_slot_of_epoch = epoch_info.absolute_slot - epoch_info.slot_index;

        debug!(
            "leader slot calculation: current_slot={current_slot} absolute_slot={} slot_index={} first_slot_of_epoch={first_slot_of_epoch} epoch={}",
            epoch_info.absolute_slot, epoch_info.slot_index, epoch_info.epoch
        );

        let schedule = self.network.leader_schedule().await?.unwrap_or_default();
        let Some(relative_slots) = schedule.get(&pubkey.to_string()) else {
            debug!("{pubkey} not found in leader schedule");
            return Ok((false, Duration::ZERO));
        };

        let next_leader_slot = relative_slots
            .iter()
            .map(|relative| first_slot_of_epoch + *relative as Slot)
            .find(|absolute| *absolute > current_slot);

        let Some(next_leader_slot) = next_leader_slot else {
            debug!("{pubkey} is on the leader schedule but has no future slots this epoch");
            return Ok((false, Duration::ZERO));
        };

        let slots_until_leader = next_leader_slot - current_slot;
        let slot_time = self.average_slot_time().await;
        let time_to_slot = slot_time * slots_until_leader as u32;

        debug!(
            "next leader slot {next_leader_slot} for {pubkey} is {slots_until_leader} slots away ({time_to_slot:?})"
        );

        Ok((true, time_to_slot))
    }

    /// Fetch the vote account for `node_pubkey` along with its credit rank.
    ///
    /// Rank is the 1-indexed position among current (non-delinquent) vote
    /// accounts sorted by recent credit delta, descending; rank 1 is best.
    pub async fn credit_ranked_vote_account(
        &self,
        node_pubkey: &Pubkey,
    ) -> Result<(RpcVoteAccountInfo, usize)> {
        let mut accounts = self
            .network
            .vote_accounts(CommitmentConfig::confirmed())
            .await?;

        // stable sort so equal deltas keep RPC order
        accounts.sort_by(|a, b| epoch_credit_delta(b).cmp(&epoch_credit_delta(a)));

        let node_pubkey = node_pubkey.to_string();
        accounts
            .iter()
            .position(|account| account.node_pubkey == node_pubkey)
            .map(|index| (accounts[index].clone(), index + 1))
            .ok_or_else(|| Error::Rpc(format!("vote account not found for pubkey: {node_pubkey}")))
    }

    /// Average slot time from recent performance samples, cached for 30s
    /// process-wide. Falls back to 400ms when the samples are unusable.
    pub async fn average_slot_time(&self) -> Duration {
        if let Some(entry) = SLOT_TIME_CACHE.read().unwrap().as_ref() {
            if entry.updated.elapsed() < SLOT_TIME_CACHE_TTL {
                return entry.slot_time;
            }
        }

        let fetched = self.fetch_average_slot_time().await;

        let mut cache = SLOT_TIME_CACHE.write().unwrap();
        // another task may have refreshed the window while we were fetching
        if let Some(entry) = cache.as_ref() {
            if entry.updated.elapsed() < SLOT_TIME_CACHE_TTL {
                return entry.slot_time;
            }
        }
        *cache = Some(SlotTimeCacheEntry {
            slot_time: fetched,
            updated: Instant::now(),
        });
        fetched
    }

    async fn fetch_average_slot_time(&self) -> Duration {
        for attempt in 1..=SLOT_TIME_FETCH_RETRIES {
            match self.network.recent_performance_samples(1).await {
                Ok(samples) => {
                    if let Some(sample) = samples.iter().find(|sample| sample.num_slots > 0) {
                        let slot_time = Duration::from_secs_f64(
                            f64::from(sample.sample_period_secs) / sample.num_slots as f64,
                        );
                        debug!("average slot time from performance samples: {slot_time:?}");
                        return slot_time;
                    }
                    debug!("performance samples contained no slots");
                }
                Err(err) => {
                    debug!(
                        "failed to fetch performance samples (attempt {attempt} of {SLOT_TIME_FETCH_RETRIES}): {err}"
                    );
                }
            }
            if attempt < SLOT_TIME_FETCH_RETRIES {
                tokio::time::sleep(SLOT_TIME_FETCH_RETRY_DELAY).await;
            }
        }
        debug!("using default slot time {DEFAULT_SLOT_DURATION:?}");
        DEFAULT_SLOT_DURATION
    }
}

fn contact_info_to_node(info: &RpcContactInfo) -> Result<ClusterNode> {
    let gossip = info
        .gossip
        .ok_or_else(|| Error::Rpc(format!("gossip node {} has no gossip address", info.pubkey)))?;
    let pubkey = info
        .pubkey
        .parse::<Pubkey>()
        .map_err(|err| Error::Rpc(format!("invalid gossip pubkey {}: {err}", info.pubkey)))?;
    Ok(ClusterNode {
        gossip_ip: gossip.ip().to_string(),
        pubkey,
        client_version: info.version.clone().unwrap_or_default(),
    })
}

/// Recent credit delta for one vote account: current epoch credits minus the
/// previous entry's credits, from the last `(epoch, credits, prev_credits)`
/// row.
pub fn epoch_credit_delta(account: &RpcVoteAccountInfo) -> i64 {
    match account.epoch_credits.last() {
        Some((_epoch, credits, prev_credits)) => *credits as i64 - *prev_credits as i64,
        None => 0,
    }
}

/// Canned `ClusterRpc` used by the test suites. Any field left unset makes
/// the corresponding call fail, which doubles as the error-path fixture.
#[derive(Default)]
pub struct MockClusterRpc {
    pub nodes: Vec<RpcContactInfo>,
    pub current_vote_accounts: Vec<RpcVoteAccountInfo>,
    pub slot: Slot,
    pub leader_schedule: Option<HashMap<String, Vec<usize>>>,
    pub block_time: Option<i64>,
    pub healthy: bool,
    pub epoch: Option<EpochInfo>,
    pub perf_samples: Vec<RpcPerfSample>,
}

#[async_trait]
impl ClusterRpc for MockClusterRpc {
    async fn cluster_nodes(&self) -> Result<Vec<RpcContactInfo>> {
        Ok(self.nodes.clone())
    }

    async fn vote_accounts(
        &self,
        _commitment: CommitmentConfig,
    ) -> Result<Vec<RpcVoteAccountInfo>> {
        Ok(self.current_vote_accounts.clone())
    }

    async fn slot(&self, _commitment: CommitmentConfig) -> Result<Slot> {
        Ok(self.slot)
    }

    async fn leader_schedule(&self) -> Result<Option<HashMap<String, Vec<usize>>>> {
        Ok(self.leader_schedule.clone())
    }

    async fn block_time(&self, slot: Slot) -> Result<i64> {
        self.block_time
            .ok_or_else(|| Error::Rpc(format!("block time not available for slot {slot}")))
    }

    async fn health(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(Error::Rpc("node is behind".to_string()))
        }
    }

    async fn epoch_info(&self, _commitment: CommitmentConfig) -> Result<EpochInfo> {
        self.epoch
            .clone()
            .ok_or_else(|| Error::Rpc("epoch info not available".to_string()))
    }

    async fn recent_performance_samples(&self, _limit: usize) -> Result<Vec<RpcPerfSample>> {
        Ok(self.perf_samples.clone())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn contact_info(pubkey: &Pubkey, gossip: &str, version: &str) -> RpcContactInfo {
        serde_json::from_value(json!({
            "pubkey": pubkey.to_string(),
            "gossip": gossip,
            "version": version,
        }))
        .unwrap()
    }

    fn vote_account(node_pubkey: &Pubkey, epoch_credits: Vec<(u64, u64, u64)>) -> RpcVoteAccountInfo {
        serde_json::from_value(json!({
            "votePubkey": Pubkey::new_unique().to_string(),
            "nodePubkey": node_pubkey.to_string(),
            "activatedStake": 1_000_000u64,
            "commission": 5u8,
            "epochVoteAccount": true,
            "epochCredits": epoch_credits,
            "lastVote": 100u64,
            "rootSlot": 90u64,
        }))
        .unwrap()
    }

    fn epoch_info(absolute_slot: Slot, slot_index: Slot) -> EpochInfo {
        EpochInfo {
            epoch: 500,
            slot_index,
            slots_in_epoch: 432_000,
            absolute_slot,
            block_height: absolute_slot,
            transaction_count: None,
        }
    }

    /// Perf sample equal to the 400ms fallback so test ordering cannot skew
    /// the process-wide slot-time cache.
    fn steady_perf_sample() -> RpcPerfSample {
        serde_json::from_value(json!({
            "slot": 1000u64,
            "numTransactions": 1000u64,
            "numSlots": 150u64,
            "samplePeriodSecs": 60u16,
        }))
        .unwrap()
    }

    fn observer(mock: MockClusterRpc) -> ClusterObserver {
        let rpc = Arc::new(mock);
        ClusterObserver::with_rpc(rpc.clone(), rpc)
    }

    #[tokio::test]
    async fn test_node_from_ip() {
        let pubkey = Pubkey::new_unique();
        let mock = MockClusterRpc {
            nodes: vec![
                contact_info(&Pubkey::new_unique(), "192.168.1.101:8001", "2.2.0"),
                contact_info(&pubkey, "192.168.1.100:8001", "2.2.1"),
            ],
            ..MockClusterRpc::default()
        };

        let node = observer(mock).node_from_ip("192.168.1.100").await.unwrap();
        assert_eq!(node.gossip_ip, "192.168.1.100");
        assert_eq!(node.pubkey, pubkey);
        assert_eq!(node.client_version, "2.2.1");
    }

    #[tokio::test]
    async fn test_node_from_ip_not_found() {
        let mock = MockClusterRpc {
            nodes: vec![contact_info(&Pubkey::new_unique(), "10.0.0.1:8001", "2.2.1")],
            ..MockClusterRpc::default()
        };
        let err = observer(mock).node_from_ip("10.9.9.9").await.unwrap_err();
        assert!(err.to_string().contains("gossip node not found for ip"));
    }

    #[tokio::test]
    async fn test_node_from_pubkey() {
        let pubkey = Pubkey::new_unique();
        let mock = MockClusterRpc {
            nodes: vec![contact_info(&pubkey, "10.0.0.1:8001", "2.2.1")],
            ..MockClusterRpc::default()
        };
        let node = observer(mock).node_from_pubkey(&pubkey).await.unwrap();
        assert_eq!(node.gossip_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_local_health() {
        let healthy = observer(MockClusterRpc {
            healthy: true,
            ..MockClusterRpc::default()
        });
        assert_eq!(healthy.local_health().await.unwrap(), HEALTH_OK);
        assert!(healthy.is_local_healthy().await);

        let unhealthy = observer(MockClusterRpc::default());
        assert!(!unhealthy.is_local_healthy().await);
    }

    #[tokio::test]
    async fn test_credit_rank_is_one_indexed_descending() {
        let best = Pubkey::new_unique();
        let middle = Pubkey::new_unique();
        let worst = Pubkey::new_unique();
        let mock = MockClusterRpc {
            current_vote_accounts: vec![
                vote_account(&worst, vec![(499, 1_000, 900)]),
                vote_account(&best, vec![(499, 5_000, 1_000)]),
                vote_account(&middle, vec![(499, 2_000, 1_000)]),
            ],
            ..MockClusterRpc::default()
        };
        let observer = observer(mock);

        let (_, rank) = observer.credit_ranked_vote_account(&best).await.unwrap();
        assert_eq!(rank, 1);
        let (_, rank) = observer.credit_ranked_vote_account(&middle).await.unwrap();
        assert_eq!(rank, 2);
        let (account, rank) = observer.credit_ranked_vote_account(&worst).await.unwrap();
        assert_eq!(rank, 3);
        assert_eq!(epoch_credit_delta(&account), 100);
    }

    #[tokio::test]
    async fn test_credit_rank_unknown_pubkey() {
        let mock = MockClusterRpc {
            current_vote_accounts: vec![vote_account(&Pubkey::new_unique(), vec![(499, 10, 5)])],
            ..MockClusterRpc::default()
        };
        assert!(observer(mock)
            .credit_ranked_vote_account(&Pubkey::new_unique())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_current_slot_end_time_fallback() {
        let mock = MockClusterRpc {
            slot: 1_000,
            block_time: None,
            ..MockClusterRpc::default()
        };
        let before = SystemTime::now();
        let end = observer(mock).current_slot_end_time().await.unwrap();
        assert!(end >= before);
        assert!(end <= SystemTime::now() + DEFAULT_SLOT_DURATION);
    }

    #[tokio::test]
    async fn test_current_slot_end_time_from_block_time() {
        let mock = MockClusterRpc {
            slot: 1_000,
            block_time: Some(1_700_000_000),
            ..MockClusterRpc::default()
        };
        let end = observer(mock).current_slot_end_time().await.unwrap();
        assert_eq!(
            end,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[tokio::test]
    async fn test_leader_slot_pubkey_absent() {
        let mock = MockClusterRpc {
            slot: 216_100,
            epoch: Some(epoch_info(216_100, 100)),
            leader_schedule: Some(HashMap::new()),
            perf_samples: vec![steady_perf_sample()],
            ..MockClusterRpc::default()
        };
        let (on_schedule, wait) = observer(mock)
            .time_to_next_leader_slot(&Pubkey::new_unique())
            .await
            .unwrap();
        assert!(!on_schedule);
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_leader_slot_all_in_past() {
        let pubkey = Pubkey::new_unique();
        let mut schedule = HashMap::new();
        // first slot of epoch is 216_000; relative 50 => absolute 216_050, past
        schedule.insert(pubkey.to_string(), vec![10, 50]);
        let mock = MockClusterRpc {
            slot: 216_100,
            epoch: Some(epoch_info(216_100, 100)),
            leader_schedule: Some(schedule),
            perf_samples: vec![steady_perf_sample()],
            ..MockClusterRpc::default()
        };
        let (on_schedule, wait) = observer(mock)
            .time_to_next_leader_slot(&pubkey)
            .await
            .unwrap();
        assert!(!on_schedule);
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_leader_slot_in_future() {
        let pubkey = Pubkey::new_unique();
        let mut schedule = HashMap::new();
        // relative 250 => absolute 216_250, which is 150 slots ahead
        schedule.insert(pubkey.to_string(), vec![50, 250]);
        let mock = MockClusterRpc {
            slot: 216_100,
            epoch: Some(epoch_info(216_100, 100)),
            leader_schedule: Some(schedule),
            perf_samples: vec![steady_perf_sample()],
            ..MockClusterRpc::default()
        };
        let (on_schedule, wait) = observer(mock)
            .time_to_next_leader_slot(&pubkey)
            .await
            .unwrap();
        assert!(on_schedule);
        // 150 slots at 400ms each
        assert_eq!(wait, Duration::from_millis(150 * 400));
    }

    #[tokio::test]
    async fn test_average_slot_time_uses_cache() {
        let first = observer(MockClusterRpc {
            perf_samples: vec![steady_perf_sample()],
            ..MockClusterRpc::default()
        })
        .average_slot_time()
        .await;
        assert_eq!(first, Duration::from_millis(400));

        // second observer with no samples still sees the cached window
        let second = observer(MockClusterRpc::default()).average_slot_time().await;
        assert_eq!(second, Duration::from_millis(400));
    }
}
