use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Distance, KEY_BITS, Key, PeerId, PeerInfo};

pub(crate) struct RoutingTable {
    local_id: PeerId,
    local_key: Key,
    max_k: usize,
    buckets: BTreeMap<usize, Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, max_k: usize) -> Self {
        Self {
            local_id,
            local_key: Key::from_peer_id(&local_id),
            max_k,
            buckets: Default::default(),
        }
    }

    pub fn local_key(&self) -> &Key {
        &self.local_key
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Bucket::is_empty)
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.nodes.len()).sum()
    }

    /// A full bucket gives up its weakest replaceable peer. When there is
    /// no such peer the new one is dropped.
    pub fn add(&mut self, peer: Arc<PeerInfo>, replaceable: bool) -> AddResult {
        if peer.id == self.local_id {
            return AddResult::Rejected;
        }

        let key = Key::from_peer_id(&peer.id);
        let cpl = self.local_key.common_prefix_len(&key);
        self.buckets
            .entry(cpl)
            .or_insert_with(|| Bucket::with_capacity(self.max_k))
            .insert(Node::new(peer, key, replaceable), self.max_k)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        let cpl = self.cpl_of(peer_id);
        let Some(bucket) = self.buckets.get_mut(&cpl) else {
            return false;
        };

        let removed = bucket.remove(peer_id);
        if bucket.is_empty() {
            self.buckets.remove(&cpl);
        }
        removed
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.buckets
            .get(&self.cpl_of(peer_id))
            .map(|bucket| bucket.contains(peer_id))
            .unwrap_or_default()
    }

    /// Remembers the last observed round-trip time of the peer.
    pub fn update_latency(&mut self, peer_id: &PeerId, latency: Duration) {
        let cpl = self.cpl_of(peer_id);
        if let Some(node) = self
            .buckets
            .get_mut(&cpl)
            .and_then(|bucket| bucket.get_mut(peer_id))
        {
            node.latency = Some(latency);
        }
    }

    /// Returns up to `count` peers sorted by distance to `target`.
    pub fn nearest_peers(&self, target: &Key, count: usize) -> Vec<Arc<PeerInfo>> {
        if count == 0 {
            return Vec::new();
        }

        let cpl = self.local_key.common_prefix_len(target);

        let mut result = Vec::with_capacity(count);

        // Peers of the target bucket and of all deeper buckets are closer
        // to the target than any peer of a shallower bucket.
        for (_, bucket) in self.buckets.range(cpl..=KEY_BITS) {
            bucket.collect_distances(target, &mut result);
        }

        // Each shallower bucket is strictly farther than the previous one.
        for (_, bucket) in self.buckets.range(..cpl).rev() {
            if result.len() >= count {
                break;
            }
            bucket.collect_distances(target, &mut result);
        }

        result.sort_by(|(a, _), (b, _)| a.cmp(b));
        result.truncate(count);
        result.into_iter().map(|(_, node)| node.info.clone()).collect()
    }

    /// Common prefix lengths of all non-empty buckets.
    pub fn bucket_cpls(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(cpl, _)| *cpl)
            .collect()
    }

    fn cpl_of(&self, peer_id: &PeerId) -> usize {
        self.local_key
            .common_prefix_len(&Key::from_peer_id(peer_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddResult {
    Added,
    /// Inserted in place of the evicted peer.
    Replaced(PeerId),
    Rejected,
}

impl AddResult {
    pub fn is_added(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    pub fn evicted(&self) -> Option<&PeerId> {
        match self {
            Self::Replaced(peer_id) => Some(peer_id),
            Self::Added | Self::Rejected => None,
        }
    }
}

struct Bucket {
    nodes: VecDeque<Node>,
}

impl Bucket {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
        }
    }

    fn insert(&mut self, node: Node, max_k: usize) -> AddResult {
        if self.contains(&node.info.id) {
            return AddResult::Rejected;
        }

        let mut result = AddResult::Added;
        if self.nodes.len() >= max_k {
            let Some(evicted) = self.weakest().and_then(|index| self.nodes.remove(index)) else {
                return AddResult::Rejected;
            };
            result = AddResult::Replaced(evicted.info.id);
        }

        self.nodes.push_back(node);
        result
    }

    /// Index of the replaceable node with the highest latency.
    /// Nodes with unknown latency are the weakest.
    fn weakest(&self) -> Option<usize> {
        let mut result: Option<(usize, Duration)> = None;
        for (i, node) in self.nodes.iter().enumerate() {
            if !node.replaceable {
                continue;
            }

            let latency = node.latency.unwrap_or(Duration::MAX);
            match result {
                Some((_, weakest)) if weakest >= latency => {}
                _ => result = Some((i, latency)),
            }
        }
        result.map(|(i, _)| i)
    }

    fn collect_distances<'a>(&'a self, target: &Key, result: &mut Vec<(Distance, &'a Node)>) {
        result.extend(self.nodes.iter().map(|node| (target.distance(&node.key), node)));
    }

    fn remove(&mut self, peer_id: &PeerId) -> bool {
        if let Some(index) = self.nodes.iter().position(|node| &node.info.id == peer_id) {
            self.nodes.remove(index);
            true
        } else {
            false
        }
    }

    fn get(&self, peer_id: &PeerId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.info.id == peer_id)
    }

    fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| &node.info.id == peer_id)
    }

    fn contains(&self, peer_id: &PeerId) -> bool {
        self.get(peer_id).is_some()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct Node {
    info: Arc<PeerInfo>,
    key: Key,
    replaceable: bool,
    latency: Option<Duration>,
}

impl Node {
    fn new(info: Arc<PeerInfo>, key: Key, replaceable: bool) -> Self {
        Self {
            info,
            key,
            replaceable,
            latency: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_K: usize = 20;

    fn make_node(id: PeerId) -> Arc<PeerInfo> {
        Arc::new(PeerInfo::without_addresses(id))
    }

    fn node_with_cpl(local_key: &Key, cpl: usize) -> PeerId {
        loop {
            let id = PeerId::random();
            if local_key.common_prefix_len(&Key::from_peer_id(&id)) == cpl {
                break id;
            }
        }
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(PeerId::random(), MAX_K);

        let peer = PeerId::random();
        assert!(table.add(make_node(peer), true).is_added());
        assert!(!table.add(make_node(peer), true).is_added());
        assert_eq!(table.len(), 1);
        assert!(table.contains(&peer));
    }

    #[test]
    fn should_not_add_self() {
        let local_id = PeerId::random();
        let mut table = RoutingTable::new(local_id, MAX_K);

        assert!(!table.add(make_node(local_id), true).is_added());
        assert!(table.is_empty());
    }

    #[test]
    fn replaceable_peers_are_evicted() {
        let k = 4;
        let mut table = RoutingTable::new(PeerId::random(), k);
        let local_key = *table.local_key();

        let peers = (0..=k).map(|_| node_with_cpl(&local_key, 0)).collect::<Vec<_>>();
        for peer in &peers[..k] {
            assert_eq!(table.add(make_node(*peer), true), AddResult::Added);
        }

        // Latency is unknown for all of them, so the first one goes.
        let res = table.add(make_node(peers[k]), true);
        assert_eq!(res.evicted(), Some(&peers[0]));
        assert_eq!(table.len(), k);
        assert!(table.contains(&peers[k]));
        assert!(!table.contains(&peers[0]));
    }

    #[test]
    fn non_replaceable_peers_are_kept() {
        let k = 4;
        let mut table = RoutingTable::new(PeerId::random(), k);
        let local_key = *table.local_key();

        let stable = node_with_cpl(&local_key, 0);
        assert!(table.add(make_node(stable), false).is_added());

        for _ in 0..k * 3 {
            table.add(make_node(node_with_cpl(&local_key, 0)), true);
            assert!(table.contains(&stable));
            assert!(table.len() <= k);
        }

        // A bucket full of non-replaceable peers drops new ones.
        let mut table = RoutingTable::new(PeerId::random(), k);
        let local_key = *table.local_key();
        for _ in 0..k {
            assert!(table.add(make_node(node_with_cpl(&local_key, 0)), false).is_added());
        }
        assert!(!table.add(make_node(node_with_cpl(&local_key, 0)), true).is_added());
        assert_eq!(table.len(), k);
    }

    #[test]
    fn weakest_prefers_highest_latency() {
        let k = 3;
        let mut table = RoutingTable::new(PeerId::random(), k);
        let local_key = *table.local_key();

        let peers = (0..k).map(|_| node_with_cpl(&local_key, 0)).collect::<Vec<_>>();
        for (i, peer) in peers.iter().enumerate() {
            table.add(make_node(*peer), true);
            table.update_latency(peer, Duration::from_millis(10 * (i as u64 + 1)));
        }
        table.update_latency(&peers[0], Duration::from_millis(100));

        let newcomer = node_with_cpl(&local_key, 0);
        assert_eq!(
            table.add(make_node(newcomer), true),
            AddResult::Replaced(peers[0])
        );
        assert!(!table.contains(&peers[0]));
        assert!(table.contains(&peers[1]));
        assert!(table.contains(&peers[2]));
    }

    #[test]
    fn nearest_peers_are_sorted_by_target_distance() {
        let mut table = RoutingTable::new(PeerId::random(), MAX_K);

        let mut peers = Vec::new();
        for _ in 0..100 {
            let peer = PeerId::random();
            if table.add(make_node(peer), false).is_added() {
                peers.push(peer);
            }
        }

        for _ in 0..10 {
            let target = Key::from_peer_id(&PeerId::random());

            let mut expected = peers.clone();
            expected.sort_by_key(|peer| target.distance(&Key::from_peer_id(peer)));

            let nearest = table.nearest_peers(&target, peers.len());
            let nearest = nearest.iter().map(|info| info.id).collect::<Vec<_>>();
            assert_eq!(nearest, expected);

            let nearest = table.nearest_peers(&target, 5);
            let nearest = nearest.iter().map(|info| info.id).collect::<Vec<_>>();
            assert_eq!(nearest, expected[..5]);
        }
    }
}
