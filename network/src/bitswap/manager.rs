use std::sync::Arc;
use std::sync::atomic::Ordering;

use cairn_util::futures::JoinTask;
use cairn_util::metrics::{GaugeGuard, HistogramGuard};
use cairn_util::sync::KeyedMutex;
use cairn_util::{FastDashSet, FastHashSet};
use exponential_backoff::Backoff;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bitswap::blocker::Wake;
use crate::bitswap::message::{BitswapMessage, WantType};
use crate::bitswap::{BitswapError, BitswapInner};
use crate::dht::Routing;
use crate::network::Network;
use crate::types::{Block, Cid, PeerId, PeerInfo};

// Histograms
const METRIC_FETCH_TIME: &str = "cairn_bitswap_fetch_time";

// Counters
const METRIC_FETCHES_TOTAL: &str = "cairn_bitswap_fetches_total";

// Gauges
const METRIC_FETCHES_IN_FLIGHT: &str = "cairn_bitswap_fetches_in_flight";

const WANT_PRIORITY: i32 = 1;

pub(crate) struct BitswapManager {
    inner: Arc<BitswapInner>,
    network: Network,
    routing: Option<Arc<dyn Routing>>,
    swarm: Arc<FastDashSet<PeerId>>,
    fetch_locks: KeyedMutex<Cid>,
}

impl BitswapManager {
    pub fn new(
        inner: Arc<BitswapInner>,
        network: Network,
        routing: Option<Arc<dyn Routing>>,
        swarm: Arc<FastDashSet<PeerId>>,
    ) -> Self {
        Self {
            inner,
            network,
            routing,
            swarm,
            fetch_locks: KeyedMutex::new(),
        }
    }

    pub fn inner(&self) -> &BitswapInner {
        &self.inner
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn swarm(&self) -> Vec<PeerId> {
        self.swarm.iter().map(|peer_id| *peer_id).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%cid, is_root))]
    pub async fn get_block(
        &self,
        cid: &Cid,
        is_root: bool,
        cancelled: &CancellationToken,
    ) -> Result<Block, BitswapError> {
        // Only one fetch of the same block at a time.
        let _guard = tokio::select! {
            guard = self.fetch_locks.lock(*cid) => guard,
            _ = cancelled.cancelled() => return Err(BitswapError::Closed),
        };

        if let Some(block) = self.inner.store.get_block(cid)? {
            return Ok(block);
        }

        metrics::counter!(METRIC_FETCHES_TOTAL).increment(1);
        let _gauge = GaugeGuard::increment(METRIC_FETCHES_IN_FLIGHT, 1);
        let _histogram = HistogramGuard::begin(METRIC_FETCH_TIME);

        let fetch = self.fetch(cid, is_root, cancelled);
        match self.inner.config.fetch_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fetch).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::debug!("fetch timed out");
                    Err(BitswapError::TimedOut)
                }
            },
            None => fetch.await,
        }
    }

    async fn fetch(
        &self,
        cid: &Cid,
        is_root: bool,
        cancelled: &CancellationToken,
    ) -> Result<Block, BitswapError> {
        let _pending = PendingGuard::new(&self.inner, *cid);

        // The block could have arrived before the entry was registered.
        if let Some(block) = self.inner.store.get_block(cid)? {
            return Ok(block);
        }

        // Children rely on the swarm populated by the root fetch.
        let _discovery = if is_root {
            self.start_provider_discovery(*cid)
        } else {
            None
        };

        self.run_want_haves(cid, cancelled).await
    }

    /// Asks the swarm for the block until it lands in the local store.
    async fn run_want_haves(
        &self,
        cid: &Cid,
        cancelled: &CancellationToken,
    ) -> Result<Block, BitswapError> {
        let config = &self.inner.config;
        let stats = &self.inner.stats;

        let backoff = Backoff::new(
            config.rebroadcast_backoff_steps,
            config.rebroadcast_min_interval,
            Some(config.rebroadcast_max_interval),
        );
        let mut rebroadcast_intervals = backoff.iter();
        let mut next_interval = move || {
            rebroadcast_intervals
                .next()
                .unwrap_or(config.rebroadcast_max_interval)
        };
        let mut next_rebroadcast_at = Instant::now() + next_interval();

        // Peers asked since the last rebroadcast.
        let mut asked = FastHashSet::<PeerId>::default();
        // All peers which know about this want.
        let mut contacted = FastHashSet::<PeerId>::default();

        loop {
            if cancelled.is_cancelled() {
                return Err(BitswapError::Closed);
            }
            if !self.inner.pending.contains_key(cid) {
                break;
            }

            if Instant::now() >= next_rebroadcast_at {
                tracing::debug!(asked = asked.len(), "rebroadcasting want-have");
                asked.clear();
                next_rebroadcast_at = Instant::now() + next_interval();
            }

            let new_peers = self
                .swarm
                .iter()
                .map(|peer_id| *peer_id)
                .filter(|peer_id| !asked.contains(peer_id))
                .collect::<Vec<_>>();
            for peer_id in new_peers {
                let mut message = BitswapMessage::new(false);
                message.add_entry(*cid, WANT_PRIORITY, WantType::Have, true);
                self.inner.send(peer_id, message);
                stats.want_haves_sent.fetch_add(1, Ordering::Relaxed);

                asked.insert(peer_id);
                contacted.insert(peer_id);
            }

            let candidate = self
                .inner
                .pending
                .get_mut(cid)
                .and_then(|mut candidates| candidates.pop_front());
            if let Some(peer_id) = candidate {
                tracing::trace!(%peer_id, "sending want-block");
                let mut message = BitswapMessage::new(false);
                message.add_entry(*cid, WANT_PRIORITY, WantType::Block, true);
                self.inner.send(peer_id, message);
                stats.want_blocks_sent.fetch_add(1, Ordering::Relaxed);

                contacted.insert(peer_id);
            }

            let wake = self
                .inner
                .blocker
                .wait(cid, config.blocker_timeout, cancelled)
                .await;
            if wake == Wake::Cancelled {
                return Err(BitswapError::Closed);
            }
        }

        for peer_id in contacted {
            let mut message = BitswapMessage::new(false);
            message.cancel(*cid);
            self.inner.send(peer_id, message);
        }

        match self.inner.store.get_block(cid)? {
            Some(block) => Ok(block),
            None => Err(BitswapError::Store(anyhow::anyhow!(
                "block {cid} is missing after arrival"
            ))),
        }
    }

    /// Searches for providers and adds them to the swarm as they are found.
    fn start_provider_discovery(&self, cid: Cid) -> Option<JoinTask<()>> {
        let routing = self.routing.clone()?;
        let network = self.network.clone();
        let swarm = self.swarm.clone();
        let limit = self.inner.config.provider_search_limit;
        let concurrency = self.inner.config.connect_concurrency.max(1);

        Some(JoinTask::new(async move {
            let (providers_tx, mut providers_rx) = mpsc::unbounded_channel::<PeerInfo>();

            let search = async move {
                let mut on_provider = |info: PeerInfo| {
                    providers_tx.send(info).ok();
                };
                routing.find_providers(&cid, limit, &mut on_provider).await;
            };

            let connect = async {
                let semaphore = Semaphore::new(concurrency);
                let mut futures = FuturesUnordered::new();
                loop {
                    tokio::select! {
                        info = providers_rx.recv() => match info {
                            Some(info) => futures.push(connect_provider(&network, &swarm, &semaphore, info)),
                            None => break,
                        },
                        Some(()) = futures.next() => {}
                    }
                }
                while futures.next().await.is_some() {}
            };

            tokio::join!(search, connect);
            tracing::debug!(%cid, "provider discovery finished");
        }))
    }

    pub fn preload(&self, cids: &[Cid]) {
        if cids.is_empty() {
            return;
        }

        let mut message = BitswapMessage::new(false);
        for cid in cids {
            message.add_entry(*cid, WANT_PRIORITY, WantType::Have, false);
        }

        let peers = self.swarm();
        tracing::debug!(blocks = cids.len(), peers = peers.len(), "preloading blocks");
        for peer_id in peers {
            self.inner.send(peer_id, message.clone());
        }
    }

    pub fn reset(&self) {
        let peers = self.swarm();
        self.swarm.clear();
        for peer_id in &peers {
            self.network.disconnect(peer_id);
        }
        tracing::debug!(count = peers.len(), "swarm reset");
    }
}

async fn connect_provider(
    network: &Network,
    swarm: &FastDashSet<PeerId>,
    semaphore: &Semaphore,
    info: PeerInfo,
) {
    if swarm.contains(&info.id) {
        return;
    }
    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    match network.connect_with_info(&info).await {
        Ok(_) => {
            tracing::debug!(peer_id = %info.id, "connected to provider");
            swarm.insert(info.id);
        }
        Err(e) => tracing::debug!(peer_id = %info.id, "failed to connect to provider: {e}"),
    }
}

/// Keeps the wanted block registered while the fetch is alive.
struct PendingGuard<'a> {
    inner: &'a BitswapInner,
    cid: Cid,
}

impl<'a> PendingGuard<'a> {
    fn new(inner: &'a BitswapInner, cid: Cid) -> Self {
        inner.pending.insert(cid, Default::default());
        Self { inner, cid }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.cid);
        self.inner.blocker.remove(&self.cid);
    }
}
