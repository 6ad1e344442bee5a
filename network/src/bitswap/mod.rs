use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_util::futures::JoinTask;
use cairn_util::{FastDashMap, FastDashSet};
use futures_util::future::{BoxFuture, Ready};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use self::blocker::Blocker;
use self::engine::BitswapEngine;
use self::manager::BitswapManager;
pub use self::config::BitswapConfig;
pub use self::message::{BitswapMessage, Entry, MessageError, Presence, WantType};
use crate::dht::Routing;
use crate::network::{Network, WeakNetwork};
use crate::proto::bitswap::{self as proto, PROTOCOL_ID};
use crate::store::BlockStore;
use crate::types::{
    Block, Cid, DisconnectReason, PeerEvent, PeerId, Request, Response, Service, ServiceRequest,
};
use crate::util::{NetworkExt, Routable};

mod blocker;
mod config;
mod engine;
mod manager;
mod message;

// Counters
const METRIC_MESSAGES_RECEIVED_TOTAL: &str = "cairn_bitswap_messages_received_total";
const METRIC_BLOCKS_RECEIVED_TOTAL: &str = "cairn_bitswap_blocks_received_total";
const METRIC_BLOCKS_SENT_TOTAL: &str = "cairn_bitswap_blocks_sent_total";
const METRIC_SEND_ERRORS_TOTAL: &str = "cairn_bitswap_send_errors_total";
const METRIC_OUTBOX_DROPPED_TOTAL: &str = "cairn_bitswap_outbox_dropped_total";

/// Block exchange consumed by the DAG layer.
pub trait Exchange: Send + Sync + 'static {
    /// Returns the block from the local store or fetches it from peers.
    fn get_block<'a>(
        &'a self,
        cid: &'a Cid,
        is_root: bool,
        cancelled: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Block, BitswapError>>;

    /// Asks connected peers about the blocks without waiting.
    fn preload(&self, cids: &[Cid]);

    /// Drops all swarm connections.
    fn reset(&self);
}

pub struct BitswapServiceBuilder {
    store: Arc<dyn BlockStore>,
    config: Option<BitswapConfig>,
}

impl BitswapServiceBuilder {
    pub fn with_config(mut self, config: BitswapConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> (BitswapClientBuilder, BitswapService) {
        let config = self.config.unwrap_or_default();
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));

        let inner = Arc::new(BitswapInner {
            engine: BitswapEngine::new(&config, self.store.clone()),
            store: self.store,
            blocker: Blocker::default(),
            pending: Default::default(),
            stats: Default::default(),
            outbox: outbox_tx,
            config,
        });

        let client_builder = BitswapClientBuilder {
            inner: inner.clone(),
            outbox_rx,
            routing: None,
        };

        (client_builder, BitswapService(inner))
    }
}

pub struct BitswapClientBuilder {
    inner: Arc<BitswapInner>,
    outbox_rx: mpsc::Receiver<Outgoing>,
    routing: Option<Arc<dyn Routing>>,
}

impl BitswapClientBuilder {
    /// Enables provider discovery for root blocks.
    pub fn with_routing(mut self, routing: Arc<dyn Routing>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn build(self, network: Network) -> Bitswap {
        let swarm = Arc::new(FastDashSet::default());
        // Subscribe before the initial fill so that no peer is missed.
        let events = network.subscribe();
        for peer_id in network.active_peers().peers() {
            swarm.insert(peer_id);
        }

        let swarm_task = JoinTask::new(track_swarm(
            Network::downgrade(&network),
            swarm.clone(),
            events,
        ));
        let outbox_task = JoinTask::new(send_outgoing(
            Network::downgrade(&network),
            self.inner.clone(),
            self.outbox_rx,
        ));

        let manager = BitswapManager::new(self.inner, network, self.routing, swarm);

        Bitswap(Arc::new(BitswapState {
            manager,
            _swarm_task: swarm_task,
            _outbox_task: outbox_task,
        }))
    }
}

/// Client half of the block exchange.
#[derive(Clone)]
pub struct Bitswap(Arc<BitswapState>);

struct BitswapState {
    manager: BitswapManager,
    _swarm_task: JoinTask<()>,
    _outbox_task: JoinTask<()>,
}

impl Bitswap {
    pub async fn get_block(
        &self,
        cid: &Cid,
        is_root: bool,
        cancelled: &CancellationToken,
    ) -> Result<Block, BitswapError> {
        self.0.manager.get_block(cid, is_root, cancelled).await
    }

    pub fn preload(&self, cids: &[Cid]) {
        self.0.manager.preload(cids);
    }

    pub fn reset(&self) {
        self.0.manager.reset();
    }

    pub fn network(&self) -> &Network {
        self.0.manager.network()
    }

    pub fn stats(&self) -> &BitswapStats {
        &self.0.manager.inner().stats
    }

    /// Peers which are asked for wanted blocks.
    pub fn swarm(&self) -> Vec<PeerId> {
        self.0.manager.swarm()
    }

    /// Returns true while a fetch of the block is waiting for it.
    pub fn is_pending(&self, cid: &Cid) -> bool {
        self.0.manager.inner().pending.contains_key(cid)
    }
}

impl Exchange for Bitswap {
    fn get_block<'a>(
        &'a self,
        cid: &'a Cid,
        is_root: bool,
        cancelled: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Block, BitswapError>> {
        Box::pin(Bitswap::get_block(self, cid, is_root, cancelled))
    }

    fn preload(&self, cids: &[Cid]) {
        Bitswap::preload(self, cids);
    }

    fn reset(&self) {
        Bitswap::reset(self);
    }
}

/// Receives exchange messages of remote peers.
#[derive(Clone)]
pub struct BitswapService(Arc<BitswapInner>);

impl BitswapService {
    pub fn builder(store: Arc<dyn BlockStore>) -> BitswapServiceBuilder {
        BitswapServiceBuilder {
            store,
            config: None,
        }
    }
}

impl Service<ServiceRequest> for BitswapService {
    type QueryResponse = Response;
    type OnQueryFuture = Ready<Option<Self::QueryResponse>>;
    type OnMessageFuture = Ready<()>;

    #[inline]
    fn on_query(&self, _req: ServiceRequest) -> Self::OnQueryFuture {
        futures_util::future::ready(None)
    }

    fn on_message(&self, req: ServiceRequest) -> Self::OnMessageFuture {
        let peer_id = &req.metadata.peer_id;
        let message = req
            .parse_tl::<proto::Message>()
            .map_err(MessageError::from)
            .and_then(BitswapMessage::from_proto);

        match message {
            Ok(message) => self.0.receive(peer_id, message),
            Err(e) => tracing::debug!(%peer_id, "invalid bitswap message: {e}"),
        }
        futures_util::future::ready(())
    }
}

impl Routable for BitswapService {
    fn message_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        [PROTOCOL_ID]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BitswapError {
    #[error("fetch cancelled")]
    Closed,
    #[error("fetch timed out")]
    TimedOut,
    #[error("block store error")]
    Store(#[from] anyhow::Error),
}

/// Exchange counters of a single node.
#[derive(Default)]
pub struct BitswapStats {
    messages_received: AtomicU64,
    blocks_received: AtomicU64,
    duplicate_blocks_received: AtomicU64,
    data_received: AtomicU64,
    blocks_sent: AtomicU64,
    data_sent: AtomicU64,
    want_haves_sent: AtomicU64,
    want_blocks_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BitswapStats {
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn blocks_received(&self) -> u64 {
        self.blocks_received.load(Ordering::Relaxed)
    }

    pub fn duplicate_blocks_received(&self) -> u64 {
        self.duplicate_blocks_received.load(Ordering::Relaxed)
    }

    pub fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::Relaxed)
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    pub fn data_sent(&self) -> u64 {
        self.data_sent.load(Ordering::Relaxed)
    }

    pub fn want_haves_sent(&self) -> u64 {
        self.want_haves_sent.load(Ordering::Relaxed)
    }

    pub fn want_blocks_sent(&self) -> u64 {
        self.want_blocks_sent.load(Ordering::Relaxed)
    }

    /// Outgoing messages dropped on a full outbox.
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}

type Outgoing = (PeerId, BitswapMessage);

pub(crate) struct BitswapInner {
    config: BitswapConfig,
    store: Arc<dyn BlockStore>,
    engine: BitswapEngine,
    blocker: Blocker,
    /// Peers which announced a wanted block, per in-flight fetch.
    pending: FastDashMap<Cid, VecDeque<PeerId>>,
    stats: BitswapStats,
    outbox: mpsc::Sender<Outgoing>,
}

impl BitswapInner {
    fn receive(&self, peer_id: &PeerId, message: BitswapMessage) {
        metrics::counter!(METRIC_MESSAGES_RECEIVED_TOTAL).increment(1);
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            %peer_id,
            wants = message.wantlist().len(),
            blocks = message.blocks().len(),
            presences = message.presences().len(),
            "received bitswap message",
        );

        for block in message.blocks() {
            let cid = *block.cid();
            if let Ok(true) = self.store.has_block(&cid) {
                self.stats
                    .duplicate_blocks_received
                    .fetch_add(1, Ordering::Relaxed);
            }

            if let Err(e) = self.store.put_block(block.clone()) {
                tracing::warn!(%peer_id, %cid, "failed to store block: {e:?}");
                continue;
            }

            metrics::counter!(METRIC_BLOCKS_RECEIVED_TOTAL).increment(1);
            self.stats.blocks_received.fetch_add(1, Ordering::Relaxed);
            self.stats
                .data_received
                .fetch_add(block.len() as u64, Ordering::Relaxed);

            // NOTE: The block must be stored before the entry is removed.
            if self.pending.remove(&cid).is_some() {
                tracing::debug!(%peer_id, %cid, "received wanted block");
            }
            self.blocker.release(&cid);
        }

        for (cid, presence) in message.presences() {
            match presence {
                Presence::Have => {
                    if let Some(mut candidates) = self.pending.get_mut(cid)
                        && !candidates.contains(peer_id)
                    {
                        candidates.push_back(*peer_id);
                    }
                }
                Presence::DontHave => {
                    tracing::trace!(%peer_id, %cid, "peer does not have the block");
                }
            }
        }

        if self.config.engine_active && message.wantlist().len() > 0 {
            match self.engine.handle_wantlist(peer_id, &message) {
                Ok(Some(reply)) => self.send(*peer_id, reply),
                Ok(None) => {}
                Err(e) => tracing::warn!(%peer_id, "failed to handle wantlist: {e:?}"),
            }
        }
    }

    /// Queues the message without waiting for delivery.
    /// The message is dropped when the outbox is full.
    fn send(&self, peer_id: PeerId, message: BitswapMessage) {
        match self.outbox.try_send((peer_id, message)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(METRIC_OUTBOX_DROPPED_TOTAL).increment(1);
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%peer_id, "bitswap outbox is full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(%peer_id, "bitswap client is not running");
            }
        }
    }
}

async fn send_outgoing(
    network: WeakNetwork,
    inner: Arc<BitswapInner>,
    mut outbox: mpsc::Receiver<Outgoing>,
) {
    let semaphore = Arc::new(Semaphore::new(inner.config.connect_concurrency.max(1)));

    while let Some((peer_id, message)) = outbox.recv().await {
        let Some(network) = network.upgrade() else {
            break;
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;

            let blocks = message.blocks().len() as u64;
            let data = message.blocks().map(|block| block.len() as u64).sum::<u64>();
            let request = Request::from_tl(message.to_proto());

            match network.send(&peer_id, PROTOCOL_ID, request).await {
                Ok(()) => {
                    metrics::counter!(METRIC_BLOCKS_SENT_TOTAL).increment(blocks);
                    inner.stats.blocks_sent.fetch_add(blocks, Ordering::Relaxed);
                    inner.stats.data_sent.fetch_add(data, Ordering::Relaxed);
                }
                Err(e) => {
                    metrics::counter!(METRIC_SEND_ERRORS_TOTAL).increment(1);
                    tracing::debug!(%peer_id, "failed to send bitswap message: {e}");
                }
            }
        });
    }

    tracing::debug!("bitswap outbox closed");
}

async fn track_swarm(
    network: WeakNetwork,
    swarm: Arc<FastDashSet<PeerId>>,
    mut events: broadcast::Receiver<PeerEvent>,
) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::NewPeer(peer_id)) => {
                swarm.insert(peer_id);
            }
            // A new connection to the same peer follows.
            Ok(PeerEvent::LostPeer(_, DisconnectReason::Replaced)) => {}
            Ok(PeerEvent::LostPeer(peer_id, _)) => {
                swarm.remove(&peer_id);
            }
            Err(broadcast::error::RecvError::Lagged(lag)) => {
                tracing::warn!(lag, "peer events lagged, resyncing swarm");
                let Some(network) = network.upgrade() else {
                    break;
                };
                let active = network.active_peers().peers();
                swarm.retain(|peer_id| active.contains(peer_id));
                for peer_id in active {
                    swarm.insert(peer_id);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;

    #[test]
    fn full_outbox_drops_messages() {
        let mut config = BitswapConfig::default();
        config.outbox_capacity = 2;

        let (client_builder, service) = BitswapService::builder(Arc::new(MemoryBlockStore::new()))
            .with_config(config)
            .build();
        let inner = &service.0;

        let peer_id = PeerId::random();
        for _ in 0..5 {
            inner.send(peer_id, BitswapMessage::new(false));
        }
        assert_eq!(inner.stats.messages_dropped(), 3);

        let mut outbox = client_builder.outbox_rx;
        let mut queued = 0;
        while let Ok((to, _)) = outbox.try_recv() {
            assert_eq!(to, peer_id);
            queued += 1;
        }
        assert_eq!(queued, 2);

        // The queue has room again.
        inner.send(peer_id, BitswapMessage::new(false));
        assert!(outbox.try_recv().is_ok());
        assert_eq!(inner.stats.messages_dropped(), 3);
    }
}
