use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use cairn_network::dht::{RecordError, ipns_key};
use cairn_network::proto::dht::{PROTOCOL_ID, SignedValue};
use cairn_network::{
    Cid, Codec, MemorySwitch, Network, PeerId, Response, Routable, Router, Service, ServiceRequest,
};
use cairn_util::test::init_logger;
use futures_util::future::{Pending, Ready, pending, ready};
use parking_lot::Mutex;

mod common;

/// Accepts DHT queries and never answers them.
#[derive(Clone)]
struct SilentDht;

impl Routable for SilentDht {
    fn query_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        [PROTOCOL_ID]
    }
}

impl Service<ServiceRequest> for SilentDht {
    type QueryResponse = Response;
    type OnQueryFuture = Pending<Option<Response>>;
    type OnMessageFuture = Ready<()>;

    fn on_query(&self, _req: ServiceRequest) -> Self::OnQueryFuture {
        pending()
    }

    fn on_message(&self, _req: ServiceRequest) -> Self::OnMessageFuture {
        ready(())
    }
}

fn make_network(switch: &MemorySwitch, router: Router<Response>) -> Network {
    let keypair = common::make_keypair();
    Network::builder()
        .with_config(common::make_fast_config().network)
        .with_transport(switch.bind(PeerId::from(keypair.public_key)))
        .build(router)
}

#[tokio::test]
async fn find_providers_reports_each_provider_once() -> Result<()> {
    init_logger("find_providers_reports_each_provider_once", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 6);
    common::fill_routing_tables(&nodes);

    let cid = Cid::for_data(Codec::RAW, b"provided content");

    let provider = &nodes[3];
    provider.dht().provide(&cid).await;
    // Provider records are sent without waiting for the remote side.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let found = Arc::new(Mutex::new(Vec::new()));
    nodes[0]
        .dht()
        .find_providers(&cid, 10, {
            let found = found.clone();
            move |info| found.lock().push(info.id)
        })
        .await;

    assert_eq!(*found.lock(), vec![*provider.peer_id()]);
    Ok(())
}

#[tokio::test]
async fn local_providers_count_toward_limit() -> Result<()> {
    init_logger("local_providers_count_toward_limit", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 4);
    common::fill_routing_tables(&nodes);

    let cid = Cid::for_data(Codec::RAW, b"twice provided content");
    nodes[1].dht().provide(&cid).await;
    nodes[2].dht().provide(&cid).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Both provider records are now stored on the first node.
    for node in &nodes[1..] {
        node.shutdown();
    }

    let started_at = Instant::now();
    let providers = nodes[0].dht().get_providers(&cid, 2).await;
    assert_eq!(providers.len(), 2);
    assert!(providers.iter().any(|info| &info.id == nodes[1].peer_id()));
    assert!(providers.iter().any(|info| &info.id == nodes[2].peer_id()));

    let providers = nodes[0].dht().get_providers(&cid, 1).await;
    assert_eq!(providers.len(), 1);

    // No lookup was needed.
    assert!(started_at.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn find_providers_without_providers_is_empty() -> Result<()> {
    init_logger("find_providers_without_providers_is_empty", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 4);
    common::fill_routing_tables(&nodes);

    let cid = Cid::for_data(Codec::RAW, b"nobody has it");
    let providers = nodes[0].dht().get_providers(&cid, 5).await;
    assert!(providers.is_empty());
    Ok(())
}

#[tokio::test]
async fn put_then_search_value() -> Result<()> {
    init_logger("put_then_search_value", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 5);
    common::fill_routing_tables(&nodes);

    let owner = &nodes[1];
    owner
        .publish_name(Bytes::from_static(b"v1"), 1, Duration::from_secs(600))
        .await?;

    let resolved = nodes[4].resolve_name(owner.peer_id()).await.unwrap();
    assert_eq!(resolved.owner, *owner.peer_id());
    assert_eq!(resolved.seq, 1);
    assert_eq!(resolved.data.as_ref(), b"v1");
    Ok(())
}

#[tokio::test]
async fn search_value_reports_newer_records() -> Result<()> {
    init_logger("search_value_reports_newer_records", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 5);
    common::fill_routing_tables(&nodes);

    let owner = &nodes[0];
    let ttl = Duration::from_secs(600);
    owner.publish_name(Bytes::from_static(b"v1"), 1, ttl).await?;
    owner.publish_name(Bytes::from_static(b"v2"), 2, ttl).await?;

    let mut reported = Vec::new();
    let best = nodes[3]
        .dht()
        .search_value(ipns_key(owner.peer_id()), Duration::from_secs(10), |record| {
            let value = tl_proto::deserialize::<SignedValue>(&record.value).unwrap();
            reported.push(value.seq);
        })
        .await
        .unwrap();

    let best = tl_proto::deserialize::<SignedValue>(&best.value)?;
    assert_eq!(best.seq, 2);
    assert_eq!(reported.last(), Some(&2));
    // Every reported record is strictly better than the previous one.
    assert!(reported.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[tokio::test]
async fn invalid_record_is_rejected_locally() -> Result<()> {
    init_logger("invalid_record_is_rejected_locally", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 2);
    common::fill_routing_tables(&nodes);

    let res = nodes[0]
        .dht()
        .put_value(
            Bytes::from_static(b"/unknown/key"),
            Bytes::from_static(b"value"),
        )
        .await;
    assert!(matches!(res, Err(RecordError::UnknownNamespace)));

    // A record signed by someone else cannot be stored under our key.
    let foreign = common::make_keypair();
    let value = SignedValue::new_signed(&foreign, 1, u32::MAX, Bytes::from_static(b"fake"));
    let res = nodes[0]
        .dht()
        .put_value(
            ipns_key(nodes[0].peer_id()),
            Bytes::from(tl_proto::serialize(value)),
        )
        .await;
    assert!(matches!(res, Err(RecordError::KeyMismatch)));

    assert!(nodes[1].resolve_name(nodes[0].peer_id()).await.is_none());
    Ok(())
}

#[tokio::test]
async fn find_peer_through_intermediate() -> Result<()> {
    init_logger("find_peer_through_intermediate", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 3);
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    // a -> b -> c
    a.dht().add_peer(b.peer_info());
    b.dht().add_peer(c.peer_info());
    assert!(a.network().address_book().addresses(c.peer_id()).is_empty());

    let found = a.dht().find_peer(c.peer_id()).await.unwrap();
    assert_eq!(found.id, *c.peer_id());
    assert_eq!(found.addresses, c.network().listen_addresses());
    assert!(!a.network().address_book().addresses(c.peer_id()).is_empty());

    let unknown = common::make_keypair();
    let unknown_id = cairn_network::PeerId::from(unknown.public_key);
    assert!(a.dht().find_peer(&unknown_id).await.is_none());
    Ok(())
}

#[tokio::test]
async fn unreachable_peers_are_evicted() -> Result<()> {
    init_logger("unreachable_peers_are_evicted", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 4);
    common::fill_routing_tables(&nodes);
    assert_eq!(nodes[0].dht().routing_table_len(), 3);

    switch.set_reachable(nodes[2].peer_id(), false);

    let key = b"some lookup key";
    let peers = nodes[0].dht().find_closest_peers(key).await;
    assert_eq!(peers.len(), 2);
    assert!(peers.iter().all(|peer| &peer.id != nodes[2].peer_id()));
    assert_eq!(nodes[0].dht().routing_table_len(), 2);
    Ok(())
}

#[tokio::test]
async fn search_value_returns_best_record_at_deadline() -> Result<()> {
    init_logger("search_value_returns_best_record_at_deadline", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 2);
    let (searcher, owner) = (&nodes[0], &nodes[1]);

    // The owner knows nobody, so the record stays on the owner.
    owner
        .publish_name(Bytes::from_static(b"v1"), 1, Duration::from_secs(600))
        .await?;

    let silent = make_network(&switch, Router::builder().route(SilentDht).build());
    searcher.dht().add_peer(owner.peer_info());
    searcher.dht().add_peer(silent.local_peer_info());

    let started_at = Instant::now();
    let mut reported = 0;
    let best = searcher
        .dht()
        .search_value(ipns_key(owner.peer_id()), Duration::from_millis(500), |_| {
            reported += 1;
        })
        .await
        .unwrap();

    // The silent peer would hold the search until the request timeout.
    assert!(started_at.elapsed() < Duration::from_millis(1500));
    assert_eq!(reported, 1);
    let best = tl_proto::deserialize::<SignedValue>(&best.value)?;
    assert_eq!(best.seq, 1);

    // Nothing is found once the deadline has already passed.
    let stale = searcher
        .dht()
        .search_value(ipns_key(owner.peer_id()), Duration::ZERO, |_| {})
        .await;
    assert!(stale.is_none());
    Ok(())
}

#[tokio::test]
async fn failed_peers_are_disconnected() -> Result<()> {
    init_logger("failed_peers_are_disconnected", "debug");

    let switch = MemorySwitch::new();
    let node = common::make_node(&switch, common::make_fast_config());

    // A peer without the DHT protocol.
    let other = make_network(&switch, Router::builder().build());
    node.network().connect_with_info(&other.local_peer_info()).await?;
    assert!(node.network().is_active(other.peer_id()));

    node.dht().add_peer(other.local_peer_info());
    let peers = node.dht().find_closest_peers(b"some key").await;
    assert!(peers.is_empty());
    assert_eq!(node.dht().routing_table_len(), 0);
    assert!(!node.network().is_active(other.peer_id()));
    Ok(())
}

#[tokio::test]
async fn bootstrap_seeds_empty_table() -> Result<()> {
    init_logger("bootstrap_seeds_empty_table", "debug");

    let switch = MemorySwitch::new();
    let seed = common::make_node(&switch, common::make_fast_config());

    let keypair = common::make_keypair();
    let transport = switch.bind(cairn_network::PeerId::from(keypair.public_key));
    let node = cairn_network::Node::builder(keypair)
        .with_config(common::make_fast_config())
        .with_bootstrap_peers([seed.peer_info()])
        .disable_background_tasks()
        .build(transport)?;

    assert_eq!(node.dht().routing_table_len(), 0);

    // Any operation bootstraps the routing table first.
    let peers = node.dht().find_closest_peers(b"key").await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, *seed.peer_id());
    assert_eq!(node.dht().routing_table_len(), 1);
    Ok(())
}
