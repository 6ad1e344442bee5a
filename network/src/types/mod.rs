pub use self::address::Address;
pub use self::cid::{Block, Cid, CidError, Codec, Prefix, Version as CidVersion};
pub use self::key::{Distance, KEY_BITS, Key};
pub use self::peer_event::{DisconnectReason, PeerEvent};
pub use self::peer_id::PeerId;
pub use self::peer_info::PeerInfo;
pub use self::request::{Direction, InboundRequestMeta, Request, Response, ServiceRequest};
pub use self::service::{BoxService, Service, ServiceExt};

mod address;
mod cid;
mod key;
mod peer_event;
mod peer_id;
mod peer_info;
mod request;
mod service;
