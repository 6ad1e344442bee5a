use std::time::Duration;

use bytesize::ByteSize;
use cairn_util::serde_helpers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DhtConfig {
    /// DHT K parameter: bucket size and the size of lookup results.
    ///
    /// Default: 20.
    pub max_k: usize,

    /// Max number of concurrent RPCs of a single lookup.
    ///
    /// Default: 3.
    pub alpha: usize,

    /// A lookup converges once this many closest peers have answered.
    ///
    /// Default: 3.
    pub beta: usize,

    /// Max number of concurrent RPCs during the follow-up pass.
    /// `None` means no limit.
    ///
    /// Default: 20.
    pub follow_up_concurrency: Option<usize>,

    /// Time to live for stored records.
    ///
    /// Default: 36 hours.
    #[serde(with = "serde_helpers::humantime")]
    pub max_stored_value_ttl: Duration,

    /// Time to live for provider records.
    ///
    /// Default: 24 hours.
    #[serde(with = "serde_helpers::humantime")]
    pub provider_ttl: Duration,

    /// How long a value search keeps asking peers for newer records.
    ///
    /// Default: 30 seconds.
    #[serde(with = "serde_helpers::humantime")]
    pub search_value_timeout: Duration,

    /// Max number of stored records and provider sets.
    ///
    /// Default: 10000.
    pub max_storage_capacity: u64,

    /// Max number of providers remembered per key.
    ///
    /// Default: 20.
    pub max_providers_per_key: usize,

    /// Max size of a stored record value.
    ///
    /// Default: 64 KiB.
    pub max_record_size: ByteSize,

    /// Interval between routing table refreshes.
    ///
    /// Default: 10 minutes.
    #[serde(with = "serde_helpers::humantime")]
    pub routing_table_refresh_period: Duration,

    /// Max random delay added to each refresh.
    ///
    /// Default: 1 minute.
    #[serde(with = "serde_helpers::humantime")]
    pub routing_table_refresh_period_max_jitter: Duration,

    /// Interval between checks of an empty routing table.
    ///
    /// Default: 1 minute.
    #[serde(with = "serde_helpers::humantime")]
    pub bootstrap_refill_period: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            max_k: 20,
            alpha: 3,
            beta: 3,
            follow_up_concurrency: Some(20),
            max_stored_value_ttl: Duration::from_secs(36 * 3600),
            provider_ttl: Duration::from_secs(24 * 3600),
            search_value_timeout: Duration::from_secs(30),
            max_storage_capacity: 10000,
            max_providers_per_key: 20,
            max_record_size: ByteSize::kib(64),
            routing_table_refresh_period: Duration::from_secs(600),
            routing_table_refresh_period_max_jitter: Duration::from_secs(60),
            bootstrap_refill_period: Duration::from_secs(60),
        }
    }
}
