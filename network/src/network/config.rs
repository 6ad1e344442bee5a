use std::time::Duration;

use bytesize::ByteSize;
use cairn_util::serde_helpers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct NetworkConfig {
    /// Max size of a single length-prefixed frame.
    ///
    /// Default: 4 MiB.
    pub max_frame_size: ByteSize,

    /// Default: 10 seconds.
    #[serde(with = "serde_helpers::humantime")]
    pub connect_timeout: Duration,

    /// Time limit for protocol negotiation and for a response to arrive.
    ///
    /// Default: 10 seconds.
    #[serde(with = "serde_helpers::humantime")]
    pub request_timeout: Duration,

    /// Default: 256.
    pub max_concurrent_requests_per_peer: usize,

    /// Default: 128.
    pub active_peers_event_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_frame_size: ByteSize::mib(4),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_concurrent_requests_per_peer: 256,
            active_peers_event_channel_capacity: 128,
        }
    }
}
