use std::sync::Arc;

use cairn_util::time::shifted_interval;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::dht::DhtInner;
use crate::network::{Network, WeakNetwork};
use crate::types::Key;

impl DhtInner {
    pub(crate) fn start_background_tasks(self: &Arc<Self>, network: WeakNetwork) {
        enum Action {
            RefreshRoutingTable,
            RefillBootstrapPeers,
        }

        let mut refresh_routing_table_interval = shifted_interval(
            self.config.routing_table_refresh_period,
            self.config.routing_table_refresh_period_max_jitter,
        );
        let mut refill_bootstrap_peers_interval =
            tokio::time::interval(self.config.bootstrap_refill_period);
        refill_bootstrap_peers_interval
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tracing::debug!("background DHT loop started");

            let mut prev_refresh_routing_table_fut = None::<JoinHandle<()>>;
            loop {
                let action = tokio::select! {
                    _ = refresh_routing_table_interval.tick() => Action::RefreshRoutingTable,
                    _ = refill_bootstrap_peers_interval.tick() => Action::RefillBootstrapPeers,
                };

                let (Some(this), Some(network)) = (this.upgrade(), network.upgrade()) else {
                    break;
                };

                match action {
                    Action::RefreshRoutingTable => {
                        if let Some(fut) = prev_refresh_routing_table_fut.take()
                            && let Err(e) = fut.await
                            && e.is_panic()
                        {
                            std::panic::resume_unwind(e.into_panic());
                        }

                        prev_refresh_routing_table_fut = Some(tokio::spawn(async move {
                            this.refresh_routing_table(&network).await;
                        }));
                    }
                    Action::RefillBootstrapPeers => {
                        this.refill_bootstrap_peers(&network).await;
                    }
                }
            }
            tracing::debug!("background DHT loop finished");
        });
    }

    /// Runs a lookup for a random key in the range of each non-empty bucket.
    #[tracing::instrument(level = "debug", skip_all, fields(local_id = %self.local_id))]
    async fn refresh_routing_table(&self, network: &Network) {
        const PARALLEL_QUERIES: usize = 3;
        // Keys for deeper buckets are too expensive to generate.
        const MAX_REFRESH_CPL: usize = 15;

        let targets = {
            let rng = &mut rand::rng();
            let routing_table = self.routing_table.lock();
            let local_key = *routing_table.local_key();

            routing_table
                .bucket_cpls()
                .into_iter()
                .filter(|cpl| *cpl <= MAX_REFRESH_CPL)
                .map(|cpl| random_raw_key_with_cpl(&local_key, cpl, rng))
                .collect::<Vec<_>>()
        };

        if targets.is_empty() {
            tracing::debug!("routing table is empty");
            return;
        }

        let semaphore = Semaphore::new(PARALLEL_QUERIES);
        let mut futures = targets
            .iter()
            .map(|target| {
                let semaphore = &semaphore;
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    Some(self.find_closest_peers(network, target, false).await.len())
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut found = 0usize;
        while let Some(count) = futures.next().await {
            found += count.unwrap_or_default();
        }

        tracing::debug!(
            lookups = targets.len(),
            found,
            routing_table_len = self.routing_table.lock().len(),
            "routing table refreshed",
        );
    }

    /// Re-seeds an empty routing table with the bootstrap peers.
    #[tracing::instrument(level = "debug", skip_all, fields(local_id = %self.local_id))]
    async fn refill_bootstrap_peers(&self, network: &Network) {
        if !self.routing_table.lock().is_empty() || self.bootstrap_peers.is_empty() {
            return;
        }

        let count = self.bootstrap(network);
        if count == 0 {
            return;
        }

        // Populate the table with the neighbours of the local peer.
        let peers = self
            .find_closest_peers(network, self.local_id.as_bytes(), false)
            .await;

        tracing::debug!(count, found = peers.len(), "refilled bootstrap peers");
    }
}

/// Returns a raw key whose hash has exactly `cpl` common leading bits with `local_key`.
pub(crate) fn random_raw_key_with_cpl(
    local_key: &Key,
    cpl: usize,
    rng: &mut impl Rng,
) -> [u8; 32] {
    loop {
        let raw: [u8; 32] = rng.random();
        if Key::from_raw(&raw).common_prefix_len(local_key) == cpl {
            break raw;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    #[test]
    fn random_key_has_requested_prefix() {
        let local_key = Key::from_peer_id(&PeerId::random());
        let rng = &mut rand::rng();

        for cpl in [0, 1, 5, 10] {
            let raw = random_raw_key_with_cpl(&local_key, cpl, rng);
            assert_eq!(Key::from_raw(&raw).common_prefix_len(&local_key), cpl);
        }
    }
}
