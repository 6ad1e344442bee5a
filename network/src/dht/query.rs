use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cairn_util::metrics::HistogramGuard;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use indexmap::IndexMap;
use tokio::sync::Semaphore;

use crate::dht::DhtInner;
use crate::dht::peer_set::{PeerState, QueryPeerSet};
use crate::network::{Network, RpcError};
use crate::types::{Key, PeerId, PeerInfo};

// Histograms
const METRIC_LOOKUP_TIME: &str = "cairn_dht_lookup_time";

// Counters
const METRIC_LOOKUPS_TOTAL: &str = "cairn_dht_lookups_total";
const METRIC_LOOKUP_RPC_ERRORS_TOTAL: &str = "cairn_dht_lookup_rpc_errors_total";

/// Why a lookup has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The stop predicate became true.
    Stopped,
    /// No peers left to query.
    Starvation,
    /// The closest peers have all been queried.
    Converged,
}

/// Closest peers to the lookup target, ordered by distance.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub peers: IndexMap<PeerId, (Arc<PeerInfo>, PeerState)>,
    pub termination: Termination,
}

impl LookupResult {
    /// Peers which were discovered but never answered.
    pub fn unqueried(&self) -> impl Iterator<Item = &Arc<PeerInfo>> {
        self.peers
            .values()
            .filter(|(_, state)| matches!(state, PeerState::Heard | PeerState::Waiting))
            .map(|(info, _)| info)
    }

    /// Peers which answered successfully.
    pub fn queried(&self) -> impl Iterator<Item = &Arc<PeerInfo>> {
        self.peers
            .values()
            .filter(|(_, state)| *state == PeerState::Queried)
            .map(|(info, _)| info)
    }
}

type VisitResult = (Arc<PeerInfo>, Result<Vec<PeerInfo>, RpcError>, Duration);

/// A single iterative lookup towards the target key.
///
/// The query function sends one RPC to the peer and returns the closer
/// peers from its response.
pub(crate) struct Query<'a> {
    inner: &'a DhtInner,
    network: &'a Network,
    target: Key,
    converge: bool,
}

impl<'a> Query<'a> {
    pub fn new(inner: &'a DhtInner, network: &'a Network, target: Key) -> Self {
        Self {
            inner,
            network,
            target,
            converge: true,
        }
    }

    /// Keeps querying after the closest peers have answered.
    /// The lookup then ends only on the stop predicate or on starvation.
    pub fn without_convergence(mut self) -> Self {
        self.converge = false;
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(target = %self.target))]
    pub async fn run<F, Fut, S>(&self, seeds: Vec<Arc<PeerInfo>>, query_fn: &F, stop: &S) -> LookupResult
    where
        F: Fn(Arc<PeerInfo>) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<PeerInfo>, RpcError>> + Send,
        S: Fn() -> bool + Sync,
    {
        metrics::counter!(METRIC_LOOKUPS_TOTAL).increment(1);
        let _histogram = HistogramGuard::begin(METRIC_LOOKUP_TIME);

        let local_id = self.network.peer_id();
        let config = &self.inner.config;

        let mut peers = QueryPeerSet::new(self.target);
        for seed in seeds {
            if &seed.id != local_id {
                peers.try_add(seed);
            }
        }

        let mut futures = FuturesUnordered::new();
        let termination = loop {
            if stop() {
                break Termination::Stopped;
            }
            if self.converge && self.is_converged(&peers) {
                break Termination::Converged;
            }

            let capacity = config.alpha.max(1).saturating_sub(peers.num_waiting());
            for (info, _) in peers.closest_in_states(&[PeerState::Heard], capacity) {
                peers.set_state(&info.id, PeerState::Waiting);
                futures.push(visit(query_fn, info));
            }

            if peers.num_waiting() == 0 {
                break Termination::Starvation;
            }

            // NOTE: `futures` is not empty while there are waiting peers.
            let Some((info, res, elapsed)) = futures.next().await else {
                break Termination::Starvation;
            };

            match res {
                Ok(closer_peers) => {
                    tracing::trace!(peer_id = %info.id, count = closer_peers.len(), "peer answered");
                    peers.set_state(&info.id, PeerState::Queried);
                    self.on_peer_answered(&info, elapsed);

                    for peer in closer_peers {
                        if &peer.id == local_id {
                            continue;
                        }
                        self.network.address_book().add_peer_info(&peer);
                        peers.try_add(Arc::new(peer));
                    }
                }
                Err(e) => {
                    tracing::debug!(peer_id = %info.id, "peer failed to answer: {e}");
                    peers.set_state(&info.id, PeerState::Unreachable);
                    self.on_peer_failed(&info.id);
                }
            }
        };

        tracing::debug!(?termination, heard = peers.len(), "lookup finished");

        let peers = peers
            .closest_in_states(
                &[PeerState::Heard, PeerState::Waiting, PeerState::Queried],
                config.max_k,
            )
            .into_iter()
            .map(|(info, state)| (info.id, (info, state)))
            .collect();

        LookupResult { peers, termination }
    }

    /// Sends the query to all discovered but not queried peers of the result.
    #[tracing::instrument(level = "debug", skip_all, fields(target = %self.target))]
    pub async fn follow_up<F, Fut, S>(&self, result: &mut LookupResult, query_fn: &F, stop: &S)
    where
        F: Fn(Arc<PeerInfo>) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<PeerInfo>, RpcError>> + Send,
        S: Fn() -> bool + Sync,
    {
        if stop() {
            return;
        }

        let semaphore = self
            .inner
            .config
            .follow_up_concurrency
            .map(|permits| Semaphore::new(permits.max(1)));

        let unqueried = result.unqueried().cloned().collect::<Vec<_>>();
        let mut futures = unqueried
            .into_iter()
            .map(|info| {
                let semaphore = semaphore.as_ref();
                async move {
                    let _permit = match semaphore {
                        Some(semaphore) => semaphore.acquire().await.ok(),
                        None => None,
                    };
                    if stop() {
                        return None;
                    }
                    Some(visit(query_fn, info).await)
                }
            })
            .collect::<FuturesUnordered<_>>();

        if futures.is_empty() {
            return;
        }
        tracing::debug!(count = futures.len(), "follow-up started");

        while let Some(update) = futures.next().await {
            let (info, state) = match update {
                Some((info, Ok(_), elapsed)) => {
                    self.on_peer_answered(&info, elapsed);
                    (info, PeerState::Queried)
                }
                Some((info, Err(e), _)) => {
                    tracing::debug!(peer_id = %info.id, "peer failed to answer: {e}");
                    self.on_peer_failed(&info.id);
                    (info, PeerState::Unreachable)
                }
                None => continue,
            };
            if let Some((_, entry)) = result.peers.get_mut(&info.id) {
                *entry = state;
            }
        }
    }

    fn is_converged(&self, peers: &QueryPeerSet) -> bool {
        let closest = peers.closest_in_states(
            &[PeerState::Heard, PeerState::Waiting, PeerState::Queried],
            self.inner.config.beta.max(1),
        );
        !closest.is_empty()
            && closest
                .iter()
                .all(|(_, state)| *state == PeerState::Queried)
    }

    fn on_peer_answered(&self, info: &Arc<PeerInfo>, latency: Duration) {
        let info = if info.addresses.is_empty() {
            Arc::new(self.network.address_book().peer_info(&info.id))
        } else {
            info.clone()
        };

        let res = {
            let mut routing_table = self.inner.routing_table.lock();
            let res = routing_table.add(info.clone(), true);
            routing_table.update_latency(&info.id, latency);
            res
        };

        if let Some(evicted) = res.evicted() {
            tracing::debug!(peer_id = %evicted, "peer evicted from the routing table");
            self.network.disconnect(evicted);
        }
    }

    fn on_peer_failed(&self, peer_id: &PeerId) {
        metrics::counter!(METRIC_LOOKUP_RPC_ERRORS_TOTAL).increment(1);
        self.inner.routing_table.lock().remove(peer_id);
        self.network.disconnect(peer_id);
    }
}

async fn visit<F, Fut>(query_fn: &F, info: Arc<PeerInfo>) -> VisitResult
where
    F: Fn(Arc<PeerInfo>) -> Fut,
    Fut: Future<Output = Result<Vec<PeerInfo>, RpcError>>,
{
    let started_at = Instant::now();
    let res = query_fn(info.clone()).await;
    (info, res, started_at.elapsed())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::dht::routing::RoutingTable;
    use crate::dht::storage::Storage;
    use crate::dht::{DhtConfig, SignedRecordValidator};
    use crate::network::MemorySwitch;
    use crate::util::Router;

    fn make_network(switch: &MemorySwitch) -> Network {
        Network::builder()
            .with_transport(switch.bind(PeerId::random()))
            .build(Router::builder().build())
    }

    fn make_dht(network: &Network, config: DhtConfig) -> DhtInner {
        let local_id = *network.peer_id();
        DhtInner {
            local_id,
            routing_table: Mutex::new(RoutingTable::new(local_id, config.max_k)),
            storage: Storage::new(&config, Arc::new(SignedRecordValidator)),
            bootstrap_peers: Vec::new(),
            config,
        }
    }

    fn make_peer() -> Arc<PeerInfo> {
        Arc::new(PeerInfo::without_addresses(PeerId::random()))
    }

    #[tokio::test]
    async fn stopped_lookup_sends_nothing() {
        let switch = MemorySwitch::new();
        let network = make_network(&switch);
        let dht = make_dht(&network, DhtConfig::default());

        let calls = AtomicUsize::new(0);
        let query_fn = |_peer: Arc<PeerInfo>| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, RpcError>(Vec::<PeerInfo>::new()) }
        };

        let seeds = (0..5).map(|_| make_peer()).collect::<Vec<_>>();
        let query = Query::new(&dht, &network, Key::from_raw(b"target"));
        let mut result = query.run(seeds, &query_fn, &|| true).await;
        assert_eq!(result.termination, Termination::Stopped);

        query.follow_up(&mut result, &query_fn, &|| true).await;
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(result.unqueried().count(), 5);
        assert!(dht.routing_table.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_seeds_lead_to_starvation() {
        let switch = MemorySwitch::new();
        let network = make_network(&switch);
        let dht = make_dht(&network, DhtConfig::default());

        let remotes = (0..3).map(|_| make_network(&switch)).collect::<Vec<_>>();
        for remote in &remotes {
            network
                .connect_with_info(&remote.local_peer_info())
                .await
                .unwrap();
            assert!(dht.add_peer(&network, remote.local_peer_info(), false));
        }
        assert!(remotes.iter().all(|remote| network.is_active(remote.peer_id())));

        let calls = AtomicUsize::new(0);
        let query_fn = |_peer: Arc<PeerInfo>| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err::<Vec<PeerInfo>, _>(RpcError::Timeout) }
        };

        let target = Key::from_raw(b"target");
        let seeds = dht.routing_table.lock().nearest_peers(&target, 20);
        let result = Query::new(&dht, &network, target)
            .run(seeds, &query_fn, &|| false)
            .await;

        assert_eq!(result.termination, Termination::Starvation);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert!(result.peers.is_empty());

        // Failed peers are forgotten and disconnected.
        assert!(dht.routing_table.lock().is_empty());
        assert!(remotes.iter().all(|remote| !network.is_active(remote.peer_id())));
    }

    #[tokio::test]
    async fn result_stays_sorted_when_a_seed_fails() {
        let switch = MemorySwitch::new();
        let network = make_network(&switch);
        let dht = make_dht(&network, DhtConfig::default());

        let target = Key::from_raw(b"target");
        let mut seeds = (0..6).map(|_| make_peer()).collect::<Vec<_>>();
        seeds.sort_by_key(|peer| target.distance(&Key::from_peer_id(&peer.id)));
        let failed = seeds[0].id;

        let query_fn = |peer: Arc<PeerInfo>| async move {
            if peer.id == failed {
                Err(RpcError::Timeout)
            } else {
                Ok(Vec::<PeerInfo>::new())
            }
        };

        // Seeds are given in the reverse order.
        let reversed = seeds.iter().rev().cloned().collect::<Vec<_>>();
        let result = Query::new(&dht, &network, target)
            .run(reversed, &query_fn, &|| false)
            .await;

        assert!(!result.peers.contains_key(&failed));
        let ids = result.peers.keys().copied().collect::<Vec<_>>();
        let expected = seeds[1..].iter().map(|peer| peer.id).collect::<Vec<_>>();
        assert_eq!(ids, expected);
        assert!(result.queried().count() >= 1);
    }

    #[tokio::test]
    async fn convergence_can_be_disabled() {
        let switch = MemorySwitch::new();
        let network = make_network(&switch);
        let mut config = DhtConfig::default();
        config.alpha = 1;
        config.beta = 1;
        let dht = make_dht(&network, config);

        let target = Key::from_raw(b"target");
        let mut peers = vec![make_peer(), make_peer()];
        peers.sort_by_key(|peer| target.distance(&Key::from_peer_id(&peer.id)));
        let (near, far) = (peers[0].clone(), peers[1].clone());

        let calls = AtomicUsize::new(0);
        let query_fn = |peer: Arc<PeerInfo>| {
            calls.fetch_add(1, Ordering::Relaxed);
            let closer_peers = if peer.id == near.id {
                vec![far.as_ref().clone()]
            } else {
                Vec::new()
            };
            async move { Ok::<_, RpcError>(closer_peers) }
        };

        // The nearest peer answers first, so a regular lookup is done.
        let result = Query::new(&dht, &network, target)
            .run(vec![near.clone()], &query_fn, &|| false)
            .await;
        assert_eq!(result.termination, Termination::Converged);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(result.unqueried().count(), 1);

        calls.store(0, Ordering::Relaxed);
        let result = Query::new(&dht, &network, target)
            .without_convergence()
            .run(vec![near.clone()], &query_fn, &|| false)
            .await;
        assert_eq!(result.termination, Termination::Starvation);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(result.queried().count(), 2);
    }

    #[tokio::test]
    async fn evicted_peers_are_disconnected() {
        let switch = MemorySwitch::new();
        let network = make_network(&switch);
        let mut config = DhtConfig::default();
        config.max_k = 1;
        let dht = make_dht(&network, config);

        let remote = make_network(&switch);
        network
            .connect_with_info(&remote.local_peer_info())
            .await
            .unwrap();
        let res = dht
            .routing_table
            .lock()
            .add(Arc::new(remote.local_peer_info()), true);
        assert!(res.is_added());

        // A newcomer for the same bucket.
        let local_key = Key::from_peer_id(network.peer_id());
        let cpl = local_key.common_prefix_len(&Key::from_peer_id(remote.peer_id()));
        let newcomer = loop {
            let peer = make_peer();
            if local_key.common_prefix_len(&Key::from_peer_id(&peer.id)) == cpl {
                break peer;
            }
        };

        let query_fn = |_peer: Arc<PeerInfo>| async { Ok::<_, RpcError>(Vec::<PeerInfo>::new()) };
        let result = Query::new(&dht, &network, Key::from_raw(b"target"))
            .run(vec![newcomer.clone()], &query_fn, &|| false)
            .await;
        assert_eq!(result.queried().count(), 1);

        let routing_table = dht.routing_table.lock();
        assert!(routing_table.contains(&newcomer.id));
        assert!(!routing_table.contains(remote.peer_id()));
        assert!(!network.is_active(remote.peer_id()));
    }
}
