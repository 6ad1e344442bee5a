use bytes::Bytes;
use tl_proto::{TlRead, TlWrite};

/// Negotiated protocol id of the block exchange.
pub const PROTOCOL_ID: &str = "/ipfs/bitswap/1.2.0";

pub const WANT_TYPE_BLOCK: u32 = 0;
pub const WANT_TYPE_HAVE: u32 = 1;

pub const PRESENCE_HAVE: u32 = 0;
pub const PRESENCE_DONT_HAVE: u32 = 1;

/// A one-way exchange message.
#[derive(Debug, Clone, Default, TlRead, TlWrite)]
#[tl(boxed, id = 0x0f3b8e61)]
pub struct Message {
    pub wantlist: Wantlist,
    pub blocks: Vec<BlockPayload>,
    pub block_presences: Vec<BlockPresence>,
    pub pending_bytes: i32,
}

#[derive(Debug, Clone, Default, TlRead, TlWrite)]
pub struct Wantlist {
    pub entries: Vec<WantlistEntry>,
    /// Whether this is the full want-list of the sender rather than a diff.
    pub full: bool,
}

#[derive(Debug, Clone, TlRead, TlWrite)]
pub struct WantlistEntry {
    /// Binary form of the content id.
    pub cid: Bytes,
    pub priority: i32,
    pub cancel: bool,
    pub want_type: u32,
    pub send_dont_have: bool,
}

#[derive(Debug, Clone, TlRead, TlWrite)]
pub struct BlockPayload {
    /// Binary form of the content id prefix (version, codec, hash function).
    pub prefix: Bytes,
    pub data: Bytes,
}

#[derive(Debug, Clone, TlRead, TlWrite)]
pub struct BlockPresence {
    /// Binary form of the content id.
    pub cid: Bytes,
    pub presence: u32,
}
