pub use self::bitswap::{Bitswap, BitswapConfig, BitswapError, BitswapService, Exchange};
pub use self::dht::{DhtClient, DhtConfig, DhtService, Routing};
pub use self::identify::IdentifyService;
pub use self::network::{
    AddressBook, Connection, ConnectionError, MemorySwitch, MemoryTransport, Network,
    NetworkBuilder, NetworkConfig, Peer, RawConnection, RecvStream, RpcError, SendStream,
    Transport, WeakNetwork,
};
pub use self::node::{Node, NodeBuilder, NodeConfig};
pub use self::store::{BlockStore, MemoryBlockStore};
pub use self::util::{NetworkExt, Routable, RouteKind, Router, RouterBuilder};
pub use self::types::{
    Address, Block, Cid, CidError, Codec, Direction, DisconnectReason, Distance,
    InboundRequestMeta, KEY_BITS, Key, PeerEvent, PeerId, PeerInfo, Prefix, Request, Response,
    Service, ServiceExt, ServiceRequest,
};

pub mod bitswap;
pub mod dht;
pub mod proto;
pub mod util;

mod identify;
mod network;
mod node;
mod store;
mod types;

#[doc(hidden)]
pub mod __internal {
    pub use tl_proto;
}
