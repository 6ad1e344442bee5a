use std::time::Duration;

use bytesize::ByteSize;
use cairn_util::serde_helpers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BitswapConfig {
    /// Whether to answer want-lists of remote peers.
    ///
    /// Default: true.
    pub engine_active: bool,

    /// Blocks up to this size are sent whole even when only
    /// a presence was requested.
    ///
    /// Default: 1 KiB.
    pub small_block_threshold: ByteSize,

    /// Whether to send DONT_HAVE for missing blocks
    /// when the peer did not ask for it.
    ///
    /// Default: false.
    pub send_unsolicited_dont_have: bool,

    /// Max number of concurrent outgoing messages and provider dials.
    ///
    /// Default: 8.
    pub connect_concurrency: usize,

    /// Max number of queued outgoing messages.
    /// New messages are dropped while the queue is full.
    ///
    /// Default: 1024.
    pub outbox_capacity: usize,

    /// Max time a fetch waits for a block before polling again.
    ///
    /// Default: 500 ms.
    #[serde(with = "serde_helpers::humantime")]
    pub blocker_timeout: Duration,

    /// Initial interval between want-have rebroadcasts of a single fetch.
    ///
    /// Default: 1 second.
    #[serde(with = "serde_helpers::humantime")]
    pub rebroadcast_min_interval: Duration,

    /// Max interval between want-have rebroadcasts.
    ///
    /// Default: 30 seconds.
    #[serde(with = "serde_helpers::humantime")]
    pub rebroadcast_max_interval: Duration,

    /// Number of rebroadcasts with a growing interval.
    /// All subsequent rebroadcasts use the max interval.
    ///
    /// Default: 10.
    pub rebroadcast_backoff_steps: u32,

    /// Max duration of a single fetch. `None` means wait until cancelled.
    ///
    /// Default: None.
    #[serde(with = "serde_helpers::humantime")]
    pub fetch_timeout: Option<Duration>,

    /// Max number of providers searched for a root block.
    ///
    /// Default: 20.
    pub provider_search_limit: usize,
}

impl Default for BitswapConfig {
    fn default() -> Self {
        Self {
            engine_active: true,
            small_block_threshold: ByteSize::kib(1),
            send_unsolicited_dont_have: false,
            connect_concurrency: 8,
            outbox_capacity: 1024,
            blocker_timeout: Duration::from_millis(500),
            rebroadcast_min_interval: Duration::from_secs(1),
            rebroadcast_max_interval: Duration::from_secs(30),
            rebroadcast_backoff_steps: 10,
            fetch_timeout: None,
            provider_search_limit: 20,
        }
    }
}
