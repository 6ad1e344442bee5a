use std::sync::{Arc, Weak};

use cairn_util::futures::JoinTask;
use cairn_util::sync::KeyedMutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use self::address_book::AddressBook;
pub use self::config::NetworkConfig;
pub use self::connection::{Connection, ConnectionError};
pub use self::connection_manager::{ActivePeers, WeakActivePeers};
pub use self::memory::{MemorySwitch, MemoryTransport};
pub use self::peer::{Peer, RpcError};
pub use self::transport::{RawConnection, RecvStream, SendStream, Transport};
use self::request_handler::InboundRequestHandler;
use crate::types::{Address, Direction, DisconnectReason, PeerEvent, PeerId, PeerInfo, Response};
use crate::util::Router;

mod address_book;
mod config;
mod connection;
mod connection_manager;
mod memory;
mod peer;
mod request_handler;
mod transport;
mod wire;

pub struct NetworkBuilder<MandatoryFields = (Arc<dyn Transport>,)> {
    mandatory_fields: MandatoryFields,
    optional_fields: BuilderFields,
}

#[derive(Default)]
struct BuilderFields {
    config: Option<NetworkConfig>,
}

impl<MandatoryFields> NetworkBuilder<MandatoryFields> {
    pub fn with_config(mut self, config: NetworkConfig) -> Self {
        self.optional_fields.config = Some(config);
        self
    }
}

impl NetworkBuilder<((),)> {
    pub fn with_transport<T: Transport>(self, transport: T) -> NetworkBuilder {
        NetworkBuilder {
            mandatory_fields: (Arc::new(transport) as Arc<dyn Transport>,),
            optional_fields: self.optional_fields,
        }
    }
}

impl NetworkBuilder {
    /// Starts accepting connections and routing inbound streams.
    pub fn build(self, router: Router<Response>) -> Network {
        let config = Arc::new(self.optional_fields.config.unwrap_or_default());
        let (transport,) = self.mandatory_fields;

        let inner = Arc::new(NetworkInner {
            local_id: *transport.local_id(),
            active_peers: ActivePeers::new(config.active_peers_event_channel_capacity),
            address_book: AddressBook::new(),
            dial_locks: KeyedMutex::new(),
            cancelled: CancellationToken::new(),
            accept_task: parking_lot::Mutex::new(None),
            config,
            transport,
            router,
        });

        let accept_task = JoinTask::new(accept_loop(Arc::downgrade(&inner)));
        *inner.accept_task.lock() = Some(accept_task);

        tracing::debug!(local_id = %inner.local_id, "network started");
        Network(inner)
    }
}

async fn accept_loop(inner: Weak<NetworkInner>) {
    let (transport, cancelled) = match inner.upgrade() {
        Some(inner) => (inner.transport.clone(), inner.cancelled.clone()),
        None => return,
    };

    loop {
        let raw = tokio::select! {
            _ = cancelled.cancelled() => break,
            raw = transport.accept() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            raw.close();
            break;
        };

        let connection = Connection::new(raw, Direction::Inbound);
        tracing::debug!(peer_id = %connection.peer_id(), "new inbound connection");
        inner.register_connection(connection);
    }

    tracing::debug!("accept loop stopped");
}

#[derive(Clone)]
#[repr(transparent)]
pub struct WeakNetwork(Weak<NetworkInner>);

impl WeakNetwork {
    pub fn upgrade(&self) -> Option<Network> {
        self.0
            .upgrade()
            .map(Network)
            .and_then(|network| (!network.is_closed()).then_some(network))
    }
}

#[derive(Clone)]
#[repr(transparent)]
pub struct Network(Arc<NetworkInner>);

impl Network {
    pub fn builder() -> NetworkBuilder<((),)> {
        NetworkBuilder {
            mandatory_fields: ((),),
            optional_fields: Default::default(),
        }
    }

    /// The local peer id of this node.
    pub fn peer_id(&self) -> &PeerId {
        &self.0.local_id
    }

    /// Addresses on which this node accepts connections.
    pub fn listen_addresses(&self) -> Vec<Address> {
        self.0.transport.listen_addresses()
    }

    /// Peer info of this node.
    pub fn local_peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.0.local_id, self.listen_addresses())
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.0.config
    }

    /// Returns true if the peer is currently connected.
    pub fn is_active(&self, peer_id: &PeerId) -> bool {
        self.0.active_peers.contains(peer_id)
    }

    /// Returns a connection wrapper for the specified peer.
    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.0.peer(peer_id)
    }

    pub fn active_peers(&self) -> &ActivePeers {
        &self.0.active_peers
    }

    /// Known addresses of remote peers.
    pub fn address_book(&self) -> &AddressBook {
        &self.0.address_book
    }

    /// Subscribe to active peer changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.0.active_peers.subscribe()
    }

    /// Returns an existing connection or dials the peer using
    /// the addresses from the address book.
    pub async fn connect(&self, peer_id: &PeerId) -> Result<Peer, ConnectionError> {
        self.0.connect(peer_id).await
    }

    /// Remembers the peer addresses and connects to it.
    pub async fn connect_with_info(&self, peer_info: &PeerInfo) -> Result<Peer, ConnectionError> {
        self.0.address_book.add_peer_info(peer_info);
        self.0.connect(&peer_info.id).await
    }

    /// Asks the peer for its listen addresses.
    pub async fn identify(&self, peer_id: &PeerId) -> Result<PeerInfo, RpcError> {
        crate::identify::identify(self, peer_id).await
    }

    pub fn disconnect(&self, peer_id: &PeerId) {
        self.0.disconnect(peer_id);
    }

    pub fn shutdown(&self) {
        self.0.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.0.cancelled.is_cancelled()
    }

    pub fn downgrade(this: &Self) -> WeakNetwork {
        WeakNetwork(Arc::downgrade(&this.0))
    }

    /// Returns the maximum size which can be sent in a single frame.
    pub fn max_frame_size(&self) -> usize {
        self.0.config.max_frame_size.0 as usize
    }
}

struct NetworkInner {
    config: Arc<NetworkConfig>,
    local_id: PeerId,
    transport: Arc<dyn Transport>,
    router: Router<Response>,
    active_peers: ActivePeers,
    address_book: AddressBook,
    dial_locks: KeyedMutex<PeerId>,
    cancelled: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinTask<()>>>,
}

impl NetworkInner {
    #[tracing::instrument(level = "debug", skip_all, fields(%peer_id))]
    async fn connect(&self, peer_id: &PeerId) -> Result<Peer, ConnectionError> {
        if self.cancelled.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }
        if peer_id == &self.local_id {
            return Err(ConnectionError::DialSelf);
        }

        if let Some(peer) = self.peer(peer_id) {
            return Ok(peer);
        }

        // At most one dial per peer at a time.
        let _guard = self.dial_locks.lock(*peer_id).await;
        if let Some(peer) = self.peer(peer_id) {
            return Ok(peer);
        }

        let addresses = self.address_book.addresses(peer_id);
        if addresses.is_empty() {
            return Err(ConnectionError::NoAddresses(*peer_id));
        }

        let raw = tokio::select! {
            _ = self.cancelled.cancelled() => return Err(ConnectionError::Shutdown),
            res = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(peer_id, &addresses),
            ) => match res {
                Ok(res) => res?,
                Err(_) => return Err(ConnectionError::TimedOut),
            },
        };

        let connection = Connection::new(raw, Direction::Outbound);
        tracing::debug!("new outbound connection");

        match self.register_connection(connection) {
            Some(connection) => Ok(Peer::new(connection, self.config.clone())),
            // Lost the tie-break to a simultaneous inbound connection.
            None => self.peer(peer_id).ok_or(ConnectionError::Closed),
        }
    }

    fn register_connection(&self, connection: Connection) -> Option<Connection> {
        let connection = self.active_peers.add(&self.local_id, connection)?;

        let handler = InboundRequestHandler::new(
            self.config.clone(),
            connection.clone(),
            self.router.clone(),
            self.active_peers.clone(),
        );
        tokio::spawn(handler.start());

        Some(connection)
    }

    fn disconnect(&self, peer_id: &PeerId) {
        self.active_peers
            .remove(peer_id, DisconnectReason::Requested);
    }

    fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        let connection = self.active_peers.get(peer_id)?;
        if connection.is_closed() {
            return None;
        }
        Some(Peer::new(connection, self.config.clone()))
    }

    fn shutdown(&self) {
        if self.cancelled.is_cancelled() {
            return;
        }
        self.cancelled.cancel();
        self.transport.close();
        self.active_peers.clear(DisconnectReason::Requested);
        drop(self.accept_task.lock().take());
        tracing::debug!(local_id = %self.local_id, "network shut down");
    }
}

impl Drop for NetworkInner {
    fn drop(&mut self) {
        self.cancelled.cancel();
        self.transport.close();
        self.active_peers.clear(DisconnectReason::Requested);
        tracing::debug!("network dropped");
    }
}
