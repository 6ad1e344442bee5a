use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use cairn_util::serde_helpers;
use cairn_util::time::now_sec;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tycho_crypto::ed25519;

use crate::bitswap::{Bitswap, BitswapConfig, BitswapError, BitswapService};
use crate::dht::{DhtClient, DhtConfig, DhtService, RecordError, ipns_key};
use crate::identify::IdentifyService;
use crate::network::{Network, NetworkConfig, Transport};
use crate::proto::dht::SignedValue;
use crate::store::{BlockStore, MemoryBlockStore};
use crate::types::{Block, Cid, PeerId, PeerInfo};
use crate::util::Router;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub dht: DhtConfig,
    pub bitswap: BitswapConfig,
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        serde_helpers::load_json_from_file(path)
    }
}

pub struct NodeBuilder {
    keypair: Arc<ed25519::KeyPair>,
    config: Option<NodeConfig>,
    store: Option<Arc<dyn BlockStore>>,
    bootstrap_peers: Vec<PeerInfo>,
    disable_background_tasks: bool,
}

impl NodeBuilder {
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bootstrap_peers<I>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = PeerInfo>,
    {
        self.bootstrap_peers = peers.into_iter().collect();
        self
    }

    /// Disables periodic DHT maintenance.
    pub fn disable_background_tasks(mut self) -> Self {
        self.disable_background_tasks = true;
        self
    }

    pub fn build<T: Transport>(self, transport: T) -> Result<Node> {
        let local_id = PeerId::from(self.keypair.public_key);
        anyhow::ensure!(
            transport.local_id() == &local_id,
            "transport is bound to {} instead of {local_id}",
            transport.local_id(),
        );

        let config = self.config.unwrap_or_default();
        let store: Arc<dyn BlockStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryBlockStore::new()),
        };

        let local_info = PeerInfo::new(local_id, transport.listen_addresses());

        let (dht_client_builder, dht_service) = DhtService::builder(local_id)
            .with_config(config.dht)
            .with_bootstrap_peers(self.bootstrap_peers)
            .build();

        let (bitswap_client_builder, bitswap_service) = BitswapService::builder(store.clone())
            .with_config(config.bitswap)
            .build();

        let router = Router::builder()
            .route(IdentifyService::new(local_info))
            .route(dht_service)
            .route(bitswap_service)
            .build();

        let network = Network::builder()
            .with_config(config.network)
            .with_transport(transport)
            .build(router);

        let dht_client_builder = if self.disable_background_tasks {
            dht_client_builder.disable_background_tasks()
        } else {
            dht_client_builder
        };
        let dht = dht_client_builder.build(network.clone());

        let bitswap = bitswap_client_builder
            .with_routing(Arc::new(dht.clone()))
            .build(network.clone());

        Ok(Node {
            keypair: self.keypair,
            network,
            dht,
            bitswap,
            store,
        })
    }
}

/// Network, DHT and block exchange of a single peer.
pub struct Node {
    keypair: Arc<ed25519::KeyPair>,
    network: Network,
    dht: DhtClient,
    bitswap: Bitswap,
    store: Arc<dyn BlockStore>,
}

impl Node {
    pub fn builder(keypair: Arc<ed25519::KeyPair>) -> NodeBuilder {
        NodeBuilder {
            keypair,
            config: None,
            store: None,
            bootstrap_peers: Vec::new(),
            disable_background_tasks: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.network.peer_id()
    }

    pub fn peer_info(&self) -> PeerInfo {
        self.network.local_peer_info()
    }

    pub fn keypair(&self) -> &ed25519::KeyPair {
        &self.keypair
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn dht(&self) -> &DhtClient {
        &self.dht
    }

    pub fn bitswap(&self) -> &Bitswap {
        &self.bitswap
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Stores the block locally and advertises it in the DHT.
    pub async fn add_block(&self, block: Block) -> Result<Cid> {
        let cid = *block.cid();
        self.store.put_block(block)?;
        self.dht.provide(&cid).await;
        Ok(cid)
    }

    pub async fn get_block(
        &self,
        cid: &Cid,
        cancelled: &CancellationToken,
    ) -> Result<Block, BitswapError> {
        self.bitswap.get_block(cid, true, cancelled).await
    }

    /// Publishes a signed record under the `/ipns/` key of this node.
    pub async fn publish_name(&self, data: Bytes, seq: u64, ttl: Duration) -> Result<(), RecordError> {
        let expires_at = now_sec().saturating_add(ttl.as_secs() as u32);
        let value = SignedValue::new_signed(&self.keypair, seq, expires_at, data);
        let key = ipns_key(self.peer_id());

        self.dht
            .put_value(key, Bytes::from(tl_proto::serialize(value)))
            .await
    }

    /// Resolves the latest record published by the owner.
    pub async fn resolve_name(&self, owner: &PeerId) -> Option<SignedValue> {
        let record = self.dht.get_value(ipns_key(owner)).await?;
        tl_proto::deserialize(&record.value).ok()
    }

    pub fn shutdown(&self) {
        self.network.shutdown();
    }
}
