#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cairn_network::{MemorySwitch, Node, NodeConfig, PeerId};
use tycho_crypto::ed25519;

pub fn make_keypair() -> Arc<ed25519::KeyPair> {
    let secret_key = ed25519::SecretKey::from_bytes(rand::random());
    Arc::new(ed25519::KeyPair::from(&secret_key))
}

pub fn make_fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.network.connect_timeout = Duration::from_secs(2);
    config.network.request_timeout = Duration::from_secs(2);
    config.bitswap.blocker_timeout = Duration::from_millis(50);
    config.bitswap.rebroadcast_min_interval = Duration::from_millis(200);
    config.bitswap.rebroadcast_max_interval = Duration::from_secs(1);
    config
}

pub fn make_node(switch: &MemorySwitch, config: NodeConfig) -> Node {
    let keypair = make_keypair();
    let transport = switch.bind(PeerId::from(keypair.public_key));

    Node::builder(keypair)
        .with_config(config)
        .disable_background_tasks()
        .build(transport)
        .unwrap()
}

pub fn make_nodes(switch: &MemorySwitch, count: usize) -> Vec<Node> {
    (0..count)
        .map(|_| make_node(switch, make_fast_config()))
        .collect()
}

/// Makes every node know every other node.
pub fn fill_routing_tables(nodes: &[Node]) {
    for node in nodes {
        for other in nodes {
            if node.peer_id() != other.peer_id() {
                node.dht().add_peer(other.peer_info());
            }
        }
    }
}
