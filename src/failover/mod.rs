//! The two-party failover protocol.
//!
//! The passive node hosts a QUIC server; the departing active node dials it,
//! opens one bidirectional stream, and the two sides exchange a single
//! mutable [`message::FailoverMessage`] in strict ping-pong order until the
//! role swap is complete.

use {
    self::message::NodeInfo,
    crate::hooks::HookEnv,
};

pub mod client;
pub mod message;
pub mod server;
pub mod stream;
pub mod tls;

/// ALPN identifier for the failover channel.
pub const PROTOCOL_ALPN: &[u8] = b"solana-validator-failover";

/// Stream-level message types; one byte written by the client at the start
/// of the stream.
pub const MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST: u8 = 1;
/// Reserved for standalone file transfers; not served yet.
pub const MESSAGE_TYPE_FILE_TRANSFER: u8 = 2;

pub const NODE_ROLE_ACTIVE: &str = "active";
pub const NODE_ROLE_PASSIVE: &str = "passive";

/// Assemble the fixed hook environment for one side of the failover.
///
/// `this_role`/`peer_role` carry the role semantics of the hook phase: in
/// pre hooks they reflect the roles at entry, in post hooks the roles after
/// the switchover. Keypair file paths are exposed for this node only.
pub(crate) fn hook_env_map(
    this_node: &NodeInfo,
    peer_node: &NodeInfo,
    this_role: &str,
    peer_role: &str,
    is_dry_run: bool,
) -> HookEnv {
    let mut env = HookEnv::new();

    env.insert("IS_DRY_RUN_FAILOVER".to_string(), is_dry_run.to_string());

    env.insert("THIS_NODE_ROLE".to_string(), this_role.to_string());
    env.insert("THIS_NODE_NAME".to_string(), this_node.hostname.clone());
    env.insert("THIS_NODE_PUBLIC_IP".to_string(), this_node.public_ip.clone());
    env.insert(
        "THIS_NODE_ACTIVE_IDENTITY_PUBKEY".to_string(),
        this_node.identities.active.pubkey.clone(),
    );
    env.insert(
        "THIS_NODE_ACTIVE_IDENTITY_KEYPAIR_FILE".to_string(),
        this_node.identities.active.key_file.clone(),
    );
    env.insert(
        "THIS_NODE_PASSIVE_IDENTITY_PUBKEY".to_string(),
        this_node.identities.passive.pubkey.clone(),
    );
    env.insert(
        "THIS_NODE_PASSIVE_IDENTITY_KEYPAIR_FILE".to_string(),
        this_node.identities.passive.key_file.clone(),
    );
    env.insert(
        "THIS_NODE_CLIENT_VERSION".to_string(),
        this_node.client_version.clone(),
    );

    env.insert("PEER_NODE_ROLE".to_string(), peer_role.to_string());
    env.insert("PEER_NODE_NAME".to_string(), peer_node.hostname.clone());
    env.insert("PEER_NODE_PUBLIC_IP".to_string(), peer_node.public_ip.clone());
    env.insert(
        "PEER_NODE_ACTIVE_IDENTITY_PUBKEY".to_string(),
        peer_node.identities.active.pubkey.clone(),
    );
    env.insert(
        "PEER_NODE_PASSIVE_IDENTITY_PUBKEY".to_string(),
        peer_node.identities.passive.pubkey.clone(),
    );
    env.insert(
        "PEER_NODE_CLIENT_VERSION".to_string(),
        peer_node.client_version.clone(),
    );

    env
}

#[cfg(test)]
mod tests {
    use {
        super::{message::{NodeIdentities, NodeIdentity}, *},
    };

    fn node_info(name: &str) -> NodeInfo {
        NodeInfo {
            public_ip: format!("10.0.0.{}", if name == "a" { 1 } else { 2 }),
            hostname: format!("node-{name}"),
            identities: NodeIdentities {
                active: NodeIdentity {
                    key_file: "/keys/active.json".to_string(),
                    pubkey: "ActivePubkey".to_string(),
                },
                passive: NodeIdentity {
                    key_file: "/keys/passive.json".to_string(),
                    pubkey: "PassivePubkey".to_string(),
                },
            },
            client_version: "2.2.1".to_string(),
            ..NodeInfo::default()
        }
    }

    #[test]
    fn test_hook_env_roles_and_keys() {
        let env = hook_env_map(
            &node_info("a"),
            &node_info("b"),
            NODE_ROLE_ACTIVE,
            NODE_ROLE_PASSIVE,
            true,
        );

        assert_eq!(env["IS_DRY_RUN_FAILOVER"], "true");
        assert_eq!(env["THIS_NODE_ROLE"], "active");
        assert_eq!(env["PEER_NODE_ROLE"], "passive");
        assert_eq!(env["THIS_NODE_NAME"], "node-a");
        assert_eq!(env["PEER_NODE_NAME"], "node-b");
        assert_eq!(env["THIS_NODE_ACTIVE_IDENTITY_KEYPAIR_FILE"], "/keys/active.json");
        // peers never expose key files
        assert!(!env.contains_key("PEER_NODE_ACTIVE_IDENTITY_KEYPAIR_FILE"));
        assert!(!env.contains_key("PEER_NODE_PASSIVE_IDENTITY_KEYPAIR_FILE"));

        // keys iterate lexicographically
        let keys: Vec<&String> = env.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
