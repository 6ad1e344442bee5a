use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_util::FastHashSet;
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, Ready};
use futures_util::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::time::Instant;

use self::query::Query;
use self::routing::RoutingTable;
use self::storage::Storage;
pub use self::config::DhtConfig;
pub use self::peer_set::{PeerState, sort_by_distance};
pub use self::query::{LookupResult, Termination};
pub use self::validator::{
    IPNS_NAMESPACE, RecordError, RecordValidator, SignedRecordValidator, ipns_key,
};
use crate::network::{Network, RpcError};
use crate::proto::dht::{
    NodeResponse, PROTOCOL_ID, ProvidersResponse, Record, ValueFound, ValueResponse, rpc,
};
use crate::types::{Cid, Key, PeerId, PeerInfo, Request, Response, Service, ServiceRequest};
use crate::util::{NetworkExt, Routable};

mod background_tasks;
mod config;
mod peer_set;
mod query;
mod routing;
mod storage;
mod validator;

// Counters
const METRIC_IN_REQUESTS_TOTAL: &str = "cairn_dht_in_requests_total";
const METRIC_STORED_RECORDS_TOTAL: &str = "cairn_dht_stored_records_total";
const METRIC_STORED_PROVIDERS_TOTAL: &str = "cairn_dht_stored_providers_total";

/// Content and record routing consumed by the exchange and naming layers.
pub trait Routing: Send + Sync + 'static {
    /// Reports providers of the content until `limit` of them are found.
    ///
    /// Providers known locally are reported first and count toward `limit`,
    /// so a full local set skips the network lookup.
    fn find_providers<'a>(
        &'a self,
        cid: &'a Cid,
        limit: usize,
        on_provider: &'a mut (dyn FnMut(PeerInfo) + Send),
    ) -> BoxFuture<'a, ()>;

    /// Advertises the local peer as a provider of the content.
    fn provide<'a>(&'a self, cid: &'a Cid) -> BoxFuture<'a, ()>;

    /// Searches for the addresses of the peer.
    fn find_peer<'a>(&'a self, peer_id: &'a PeerId) -> BoxFuture<'a, Option<PeerInfo>>;

    /// Stores the record on the peers closest to its key.
    fn put_value(&self, key: Bytes, value: Bytes) -> BoxFuture<'_, Result<(), RecordError>>;

    /// Reports each strictly better record as it is found.
    /// Returns the best one once the timeout expires or the search runs out of peers.
    fn search_value<'a>(
        &'a self,
        key: Bytes,
        timeout: Duration,
        on_better: &'a mut (dyn FnMut(&Record) + Send),
    ) -> BoxFuture<'a, Option<Record>>;
}

pub struct DhtClientBuilder {
    inner: Arc<DhtInner>,
    disable_background_tasks: bool,
}

impl DhtClientBuilder {
    pub fn disable_background_tasks(mut self) -> Self {
        self.disable_background_tasks = true;
        self
    }

    pub fn build(self, network: Network) -> DhtClient {
        if !self.disable_background_tasks {
            self.inner
                .start_background_tasks(Network::downgrade(&network));
        }

        DhtClient {
            inner: self.inner,
            network,
        }
    }
}

#[derive(Clone)]
pub struct DhtClient {
    inner: Arc<DhtInner>,
    network: Network,
}

impl DhtClient {
    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Adds a trusted peer which is never evicted by newcomers.
    pub fn add_peer(&self, peer: PeerInfo) -> bool {
        self.inner.add_peer(&self.network, peer, false)
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.routing_table.lock().remove(peer_id)
    }

    pub fn routing_table_len(&self) -> usize {
        self.inner.routing_table.lock().len()
    }

    pub fn closest_known_peers(&self, key: &[u8], count: usize) -> Vec<Arc<PeerInfo>> {
        self.inner
            .routing_table
            .lock()
            .nearest_peers(&Key::from_raw(key), count)
    }

    /// Seeds the routing table with the bootstrap peers.
    pub fn bootstrap(&self) -> usize {
        self.inner.bootstrap(&self.network)
    }

    /// Returns the closest peers to the key which answered the lookup.
    pub async fn find_closest_peers(&self, key: &[u8]) -> Vec<Arc<PeerInfo>> {
        self.inner.find_closest_peers(&self.network, key, true).await
    }

    /// Reports each provider at most once, local ones first.
    /// Local providers count toward `limit`.
    pub async fn find_providers<F>(&self, cid: &Cid, limit: usize, on_provider: F)
    where
        F: FnMut(PeerInfo) + Send,
    {
        self.inner
            .find_providers(&self.network, cid, limit, on_provider)
            .await;
    }

    /// Collects up to `limit` providers of the content.
    pub async fn get_providers(&self, cid: &Cid, limit: usize) -> Vec<PeerInfo> {
        let mut result = Vec::new();
        self.find_providers(cid, limit, |info| result.push(info))
            .await;
        result
    }

    pub async fn provide(&self, cid: &Cid) {
        self.inner.provide(&self.network, cid).await;
    }

    pub async fn find_peer(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.inner.find_peer(&self.network, peer_id).await
    }

    pub async fn put_value(&self, key: Bytes, value: Bytes) -> Result<(), RecordError> {
        self.inner.put_value(&self.network, key, value).await
    }

    /// Reports each strictly better record until the timeout expires
    /// or there are no peers left to ask. Returns the best one.
    pub async fn search_value<F>(&self, key: Bytes, timeout: Duration, on_better: F) -> Option<Record>
    where
        F: FnMut(&Record) + Send,
    {
        self.inner
            .search_value(&self.network, key, timeout, on_better)
            .await
    }

    /// Returns the best record found within [`DhtConfig::search_value_timeout`].
    pub async fn get_value(&self, key: Bytes) -> Option<Record> {
        let timeout = self.inner.config.search_value_timeout;
        self.search_value(key, timeout, |_| {}).await
    }
}

impl Routing for DhtClient {
    fn find_providers<'a>(
        &'a self,
        cid: &'a Cid,
        limit: usize,
        on_provider: &'a mut (dyn FnMut(PeerInfo) + Send),
    ) -> BoxFuture<'a, ()> {
        Box::pin(DhtClient::find_providers(self, cid, limit, on_provider))
    }

    fn provide<'a>(&'a self, cid: &'a Cid) -> BoxFuture<'a, ()> {
        Box::pin(DhtClient::provide(self, cid))
    }

    fn find_peer<'a>(&'a self, peer_id: &'a PeerId) -> BoxFuture<'a, Option<PeerInfo>> {
        Box::pin(DhtClient::find_peer(self, peer_id))
    }

    fn put_value(&self, key: Bytes, value: Bytes) -> BoxFuture<'_, Result<(), RecordError>> {
        Box::pin(DhtClient::put_value(self, key, value))
    }

    fn search_value<'a>(
        &'a self,
        key: Bytes,
        timeout: Duration,
        on_better: &'a mut (dyn FnMut(&Record) + Send),
    ) -> BoxFuture<'a, Option<Record>> {
        Box::pin(DhtClient::search_value(self, key, timeout, on_better))
    }
}

pub struct DhtServiceBuilder {
    local_id: PeerId,
    config: Option<DhtConfig>,
    validator: Option<Arc<dyn RecordValidator>>,
    bootstrap_peers: Vec<PeerInfo>,
}

impl DhtServiceBuilder {
    pub fn with_config(mut self, config: DhtConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_validator<V: RecordValidator>(mut self, validator: V) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_bootstrap_peers<I>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = PeerInfo>,
    {
        self.bootstrap_peers = peers.into_iter().collect();
        self
    }

    pub fn build(self) -> (DhtClientBuilder, DhtService) {
        let config = self.config.unwrap_or_default();
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(SignedRecordValidator));

        let inner = Arc::new(DhtInner {
            local_id: self.local_id,
            routing_table: Mutex::new(RoutingTable::new(self.local_id, config.max_k)),
            storage: Storage::new(&config, validator),
            bootstrap_peers: self.bootstrap_peers,
            config,
        });

        let client_builder = DhtClientBuilder {
            inner: inner.clone(),
            disable_background_tasks: false,
        };

        (client_builder, DhtService(inner))
    }
}

/// Answers DHT queries of remote peers.
#[derive(Clone)]
pub struct DhtService(Arc<DhtInner>);

impl DhtService {
    pub fn builder(local_id: PeerId) -> DhtServiceBuilder {
        DhtServiceBuilder {
            local_id,
            config: None,
            validator: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Service<ServiceRequest> for DhtService {
    type QueryResponse = Response;
    type OnQueryFuture = Ready<Option<Self::QueryResponse>>;
    type OnMessageFuture = Ready<()>;

    fn on_query(&self, req: ServiceRequest) -> Self::OnQueryFuture {
        metrics::counter!(METRIC_IN_REQUESTS_TOTAL).increment(1);

        let peer_id = &req.metadata.peer_id;
        let response = crate::match_tl_request!(req.body, {
            rpc::FindNode as r => {
                Some(Response::from_tl(self.0.handle_find_node(peer_id, &r.key)))
            },
            rpc::GetProviders as r => {
                Some(Response::from_tl(self.0.handle_get_providers(peer_id, &r.key)))
            },
            rpc::GetValue as r => {
                Some(Response::from_tl(self.0.handle_get_value(peer_id, &r.key)))
            },
            rpc::PutValue as r => {
                self.0.handle_put_value(peer_id, r.record).map(Response::from_tl)
            },
            rpc::AddProvider as r => {
                self.0.handle_add_provider(peer_id, &r.key, r.provider);
                None
            },
        }, e => {
            tracing::debug!(%peer_id, "failed to deserialize query: {e:?}");
            None
        });

        futures_util::future::ready(response)
    }

    #[inline]
    fn on_message(&self, _req: ServiceRequest) -> Self::OnMessageFuture {
        futures_util::future::ready(())
    }
}

impl Routable for DhtService {
    fn query_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        [PROTOCOL_ID]
    }
}

pub(crate) struct DhtInner {
    local_id: PeerId,
    config: DhtConfig,
    routing_table: Mutex<RoutingTable>,
    storage: Storage,
    bootstrap_peers: Vec<PeerInfo>,
}

impl DhtInner {
    fn add_peer(&self, network: &Network, peer: PeerInfo, replaceable: bool) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        network.address_book().add_peer_info(&peer);

        let res = self.routing_table.lock().add(Arc::new(peer), replaceable);
        if let Some(evicted) = res.evicted() {
            tracing::debug!(peer_id = %evicted, "peer evicted from the routing table");
            network.disconnect(evicted);
        }
        res.is_added()
    }

    fn bootstrap(&self, network: &Network) -> usize {
        let mut count = 0;
        for peer in &self.bootstrap_peers {
            count += self.add_peer(network, peer.clone(), false) as usize;
        }
        tracing::debug!(count, "added bootstrap peers");
        count
    }

    fn ensure_bootstrapped(&self, network: &Network) {
        if self.routing_table.lock().is_empty() {
            self.bootstrap(network);
        }
    }

    /// Runs a lookup and optionally queries the rest of the closest peers.
    async fn run_lookup_with_followup<F, Fut, S>(
        &self,
        network: &Network,
        target: Key,
        query_fn: F,
        stop: S,
        follow_up: bool,
        converge: bool,
    ) -> LookupResult
    where
        F: Fn(Arc<PeerInfo>) -> Fut + Sync,
        Fut: Future<Output = Result<Vec<PeerInfo>, RpcError>> + Send,
        S: Fn() -> bool + Sync,
    {
        self.ensure_bootstrapped(network);

        let seeds = self
            .routing_table
            .lock()
            .nearest_peers(&target, self.config.max_k);

        let mut query = Query::new(self, network, target);
        if !converge {
            query = query.without_convergence();
        }
        let mut result = query.run(seeds, &query_fn, &stop).await;
        if follow_up {
            query.follow_up(&mut result, &query_fn, &stop).await;
        }
        result
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %Key::from_raw(key)))]
    async fn find_closest_peers(
        &self,
        network: &Network,
        key: &[u8],
        follow_up: bool,
    ) -> Vec<Arc<PeerInfo>> {
        let body = Bytes::from(tl_proto::serialize(rpc::FindNode {
            key: Bytes::copy_from_slice(key),
        }));

        let query_fn = |peer: Arc<PeerInfo>| {
            let body = body.clone();
            async move {
                let res = network
                    .query(&peer.id, PROTOCOL_ID, Request { body })
                    .await?;
                Ok::<_, RpcError>(res.parse_tl::<NodeResponse>()?.closer_peers)
            }
        };

        let result = self
            .run_lookup_with_followup(network, Key::from_raw(key), query_fn, || false, follow_up, true)
            .await;

        result.queried().cloned().collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%cid))]
    async fn find_providers<F>(&self, network: &Network, cid: &Cid, limit: usize, on_provider: F)
    where
        F: FnMut(PeerInfo) + Send,
    {
        let key = Bytes::from(cid.to_bytes());
        let on_provider = Mutex::new(on_provider);
        let seen = Mutex::new(FastHashSet::<PeerId>::default());

        let report = |info: PeerInfo| {
            if limit == 0 || info.id == self.local_id {
                return;
            }
            {
                let mut seen = seen.lock();
                if seen.len() >= limit || !seen.insert(info.id) {
                    return;
                }
            }
            network.address_book().add_peer_info(&info);
            (on_provider.lock())(info);
        };

        for info in self.storage.get_providers(&key) {
            report(info);
        }

        let body = Bytes::from(tl_proto::serialize(rpc::GetProviders { key: key.clone() }));
        let query_fn = |peer: Arc<PeerInfo>| {
            let body = body.clone();
            let report = &report;
            async move {
                let res = network
                    .query(&peer.id, PROTOCOL_ID, Request { body })
                    .await?;
                let res = res.parse_tl::<ProvidersResponse>()?;
                for provider in res.providers {
                    report(provider);
                }
                Ok::<_, RpcError>(res.closer_peers)
            }
        };
        let stop = || seen.lock().len() >= limit;

        self.run_lookup_with_followup(network, Key::from_raw(&key), query_fn, stop, true, true)
            .await;

        tracing::debug!(found = seen.lock().len(), "provider search finished");
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%cid))]
    async fn provide(&self, network: &Network, cid: &Cid) {
        let key = Bytes::from(cid.to_bytes());
        let local_info = network.local_peer_info();
        self.storage.add_provider(&key, local_info.clone());

        let peers = self.find_closest_peers(network, &key, true).await;

        let body = Bytes::from(tl_proto::serialize(rpc::AddProvider {
            key,
            provider: local_info,
        }));

        let mut futures = peers
            .iter()
            .map(|peer| {
                let body = body.clone();
                async move {
                    let res = network.send(&peer.id, PROTOCOL_ID, Request { body }).await;
                    (peer.id, res)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut count = 0usize;
        while let Some((peer_id, res)) = futures.next().await {
            match res {
                Ok(()) => count += 1,
                Err(e) => tracing::debug!(%peer_id, "failed to send provider record: {e}"),
            }
        }

        tracing::debug!(count, "provider record sent");
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%peer_id))]
    async fn find_peer(&self, network: &Network, peer_id: &PeerId) -> Option<PeerInfo> {
        let found = Mutex::new(None::<PeerInfo>);

        let body = Bytes::from(tl_proto::serialize(rpc::FindNode {
            key: Bytes::copy_from_slice(peer_id.as_bytes()),
        }));
        let query_fn = |peer: Arc<PeerInfo>| {
            let body = body.clone();
            let found = &found;
            async move {
                let res = network
                    .query(&peer.id, PROTOCOL_ID, Request { body })
                    .await?;
                let closer_peers = res.parse_tl::<NodeResponse>()?.closer_peers;
                if let Some(info) = closer_peers.iter().find(|info| &info.id == peer_id) {
                    found.lock().get_or_insert_with(|| info.clone());
                }
                Ok::<_, RpcError>(closer_peers)
            }
        };
        let stop = || found.lock().is_some();

        self.run_lookup_with_followup(network, Key::from_peer_id(peer_id), query_fn, stop, false, true)
            .await;

        let found = found.into_inner();
        if let Some(info) = &found {
            network.address_book().add_peer_info(info);
        }
        found
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %Key::from_raw(&key)))]
    async fn put_value(&self, network: &Network, key: Bytes, value: Bytes) -> Result<(), RecordError> {
        self.storage.validator().validate(&key, &value)?;

        let record = Record {
            key: key.clone(),
            value,
            received_at: 0,
        };
        self.storage.put_record(record.clone())?;

        let peers = self.find_closest_peers(network, &key, true).await;
        self.send_record(network, &record, peers.iter().map(|peer| peer.id))
            .await;
        Ok(())
    }

    /// Sends the record to the peers, best-effort.
    async fn send_record<I>(&self, network: &Network, record: &Record, peers: I)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let body = Bytes::from(tl_proto::serialize(rpc::PutValue {
            record: record.clone(),
        }));

        let mut futures = peers
            .into_iter()
            .map(|peer_id| {
                let body = body.clone();
                async move {
                    let res = network.query(&peer_id, PROTOCOL_ID, Request { body }).await;
                    let res = res.and_then(|res| res.parse_tl::<Record>().map_err(RpcError::from));
                    (peer_id, res)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut count = 0usize;
        while let Some((peer_id, res)) = futures.next().await {
            match res {
                Ok(echoed) if echoed.key == record.key && echoed.value == record.value => count += 1,
                Ok(_) => tracing::debug!(%peer_id, "peer kept a different record"),
                Err(e) => tracing::debug!(%peer_id, "failed to put record: {e}"),
            }
        }

        tracing::debug!(count, "record sent");
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %Key::from_raw(&key)))]
    async fn search_value<F>(
        &self,
        network: &Network,
        key: Bytes,
        timeout: Duration,
        on_better: F,
    ) -> Option<Record>
    where
        F: FnMut(&Record) + Send,
    {
        struct SearchState<F> {
            best: Option<Record>,
            // Peers which returned something other than the best record.
            outdated: Vec<PeerId>,
            holders: Vec<PeerId>,
            on_better: F,
        }

        let validator = self.storage.validator();
        let state = Mutex::new(SearchState {
            best: None,
            outdated: Vec::new(),
            holders: Vec::new(),
            on_better,
        });

        let offer = |peer_id: Option<PeerId>, record: Record| {
            if record.key != key {
                tracing::debug!(?peer_id, "record key mismatch");
                return;
            }
            if let Err(e) = validator.validate(&record.key, &record.value) {
                tracing::debug!(?peer_id, "invalid record: {e}");
                return;
            }

            let mut state = state.lock();
            let state = &mut *state;
            let is_better = match &state.best {
                None => true,
                Some(best) => matches!(
                    validator.select(&key, &[best.value.as_ref(), record.value.as_ref()]),
                    Ok(1)
                ),
            };

            if is_better {
                (state.on_better)(&record);
                state.best = Some(record);
                state.outdated.append(&mut state.holders);
                state.holders.extend(peer_id);
            } else if state.best.as_ref().map(|best| &best.value) == Some(&record.value) {
                state.holders.extend(peer_id);
            } else {
                state.outdated.extend(peer_id);
            }
        };

        if let Some(record) = self.storage.get_record(&key) {
            offer(None, record);
        }

        let body = Bytes::from(tl_proto::serialize(rpc::GetValue { key: key.clone() }));
        let query_fn = |peer: Arc<PeerInfo>| {
            let body = body.clone();
            let offer = &offer;
            async move {
                let res = network
                    .query(&peer.id, PROTOCOL_ID, Request { body })
                    .await?;
                match res.parse_tl::<ValueResponse>()? {
                    ValueResponse::Found(ValueFound {
                        record,
                        closer_peers,
                    }) => {
                        offer(Some(peer.id), record);
                        Ok::<_, RpcError>(closer_peers)
                    }
                    ValueResponse::NotFound(closer_peers) => Ok(closer_peers),
                }
            }
        };

        // Runs until the deadline or until peers run out.
        let deadline = Instant::now() + timeout;
        let stop = || Instant::now() >= deadline;
        let lookup =
            self.run_lookup_with_followup(network, Key::from_raw(&key), query_fn, stop, true, false);
        if tokio::time::timeout_at(deadline, lookup).await.is_err() {
            tracing::debug!("value search deadline reached");
        }

        let SearchState { best, outdated, .. } = state.into_inner();
        if let Some(best) = &best {
            if !outdated.is_empty() {
                tracing::debug!(count = outdated.len(), "updating outdated records");
                self.send_record(network, best, outdated).await;
            }
        }
        best
    }

    fn closer_peers(&self, requester: &PeerId, key: &Key) -> Vec<PeerInfo> {
        self.routing_table
            .lock()
            .nearest_peers(key, self.config.max_k + 1)
            .into_iter()
            .filter(|info| &info.id != requester)
            .take(self.config.max_k)
            .map(|info| info.as_ref().clone())
            .collect()
    }

    fn handle_find_node(&self, requester: &PeerId, key: &[u8]) -> NodeResponse {
        NodeResponse {
            closer_peers: self.closer_peers(requester, &Key::from_raw(key)),
        }
    }

    fn handle_get_providers(&self, requester: &PeerId, key: &[u8]) -> ProvidersResponse {
        ProvidersResponse {
            providers: self.storage.get_providers(key),
            closer_peers: self.closer_peers(requester, &Key::from_raw(key)),
        }
    }

    fn handle_get_value(&self, requester: &PeerId, key: &[u8]) -> ValueResponse {
        let closer_peers = self.closer_peers(requester, &Key::from_raw(key));
        match self.storage.get_record(key) {
            Some(record) => ValueResponse::Found(ValueFound {
                record,
                closer_peers,
            }),
            None => ValueResponse::NotFound(closer_peers),
        }
    }

    fn handle_put_value(&self, requester: &PeerId, record: Record) -> Option<Record> {
        match self.storage.put_record(record) {
            Ok(kept) => {
                metrics::counter!(METRIC_STORED_RECORDS_TOTAL).increment(1);
                Some(kept)
            }
            Err(e) => {
                tracing::debug!(peer_id = %requester, "rejected record: {e}");
                None
            }
        }
    }

    fn handle_add_provider(&self, requester: &PeerId, key: &[u8], provider: PeerInfo) {
        // Peers may only advertise themselves.
        if &provider.id != requester {
            tracing::debug!(
                peer_id = %requester,
                provider = %provider.id,
                "rejected a provider record for another peer",
            );
            return;
        }

        metrics::counter!(METRIC_STORED_PROVIDERS_TOTAL).increment(1);
        self.storage.add_provider(key, provider);
    }
}
