use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;

use crate::dht::config::DhtConfig;
use crate::dht::validator::{RecordError, RecordValidator};
use crate::proto::dht::Record;
use crate::types::{Key, PeerId, PeerInfo};

type StorageKeyId = [u8; 32];

/// Records and provider sets stored by this node on behalf of others.
pub(crate) struct Storage {
    records: Cache<StorageKeyId, Record, ahash::RandomState>,
    providers: Cache<StorageKeyId, Arc<Mutex<Vec<ProviderEntry>>>, ahash::RandomState>,
    validator: Arc<dyn RecordValidator>,
    provider_ttl: Duration,
    max_providers_per_key: usize,
    max_record_size: usize,
}

#[derive(Clone)]
struct ProviderEntry {
    info: PeerInfo,
    added_at: tokio::time::Instant,
}

impl Storage {
    pub fn new(config: &DhtConfig, validator: Arc<dyn RecordValidator>) -> Self {
        Self {
            records: Cache::builder()
                .max_capacity(config.max_storage_capacity)
                .time_to_live(config.max_stored_value_ttl)
                .build_with_hasher(ahash::RandomState::default()),
            providers: Cache::builder()
                .max_capacity(config.max_storage_capacity)
                .time_to_idle(config.provider_ttl)
                .build_with_hasher(ahash::RandomState::default()),
            validator,
            provider_ttl: config.provider_ttl,
            max_providers_per_key: config.max_providers_per_key,
            max_record_size: config.max_record_size.0 as usize,
        }
    }

    pub fn validator(&self) -> &Arc<dyn RecordValidator> {
        &self.validator
    }

    pub fn get_record(&self, key: &[u8]) -> Option<Record> {
        let record = self.records.get(Key::from_raw(key).as_bytes())?;

        // Stored records may expire while in the cache.
        match self.validator.validate(&record.key, &record.value) {
            Ok(()) => Some(record),
            Err(_) => {
                self.records.invalidate(Key::from_raw(key).as_bytes());
                None
            }
        }
    }

    /// Stores the record if it is better than the existing one.
    ///
    /// Returns the record which is kept after the call.
    pub fn put_record(&self, mut record: Record) -> Result<Record, RecordError> {
        if record.key.len() + record.value.len() > self.max_record_size {
            return Err(RecordError::TooLarge);
        }
        self.validator.validate(&record.key, &record.value)?;

        let key = Key::from_raw(&record.key);
        record.received_at = cairn_util::time::now_sec();

        let entry = self.records.entry(*key.as_bytes()).or_insert_with_if(
            || record.clone(),
            |stored| {
                stored.key != record.key
                    || self
                        .validator
                        .validate(&stored.key, &stored.value)
                        .is_err()
                    || matches!(
                        self.validator.select(&record.key, &[&stored.value, &record.value]),
                        Ok(1)
                    )
            },
        );
        Ok(entry.into_value())
    }

    pub fn add_provider(&self, key: &[u8], provider: PeerInfo) {
        let key = Key::from_raw(key);
        let entry = self
            .providers
            .get_with(*key.as_bytes(), Default::default);

        let now = tokio::time::Instant::now();
        let mut providers = entry.lock();
        providers.retain(|item| {
            item.info.id != provider.id && now.duration_since(item.added_at) < self.provider_ttl
        });
        if providers.len() >= self.max_providers_per_key {
            providers.remove(0);
        }
        providers.push(ProviderEntry {
            info: provider,
            added_at: now,
        });
    }

    pub fn get_providers(&self, key: &[u8]) -> Vec<PeerInfo> {
        let Some(entry) = self.providers.get(Key::from_raw(key).as_bytes()) else {
            return Vec::new();
        };

        let now = tokio::time::Instant::now();
        let providers = entry.lock();
        providers
            .iter()
            .filter(|item| now.duration_since(item.added_at) < self.provider_ttl)
            .map(|item| item.info.clone())
            .collect()
    }

    pub fn has_provider(&self, key: &[u8], peer_id: &PeerId) -> bool {
        self.get_providers(key)
            .iter()
            .any(|info| &info.id == peer_id)
    }
}
