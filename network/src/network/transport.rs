use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::network::connection::ConnectionError;
use crate::types::{Address, PeerId};

pub type SendStream = Box<dyn AsyncWrite + Send + Unpin>;
pub type RecvStream = Box<dyn AsyncRead + Send + Unpin>;

/// Secure stream-multiplexed connectivity between peers.
///
/// Implementations authenticate the remote side, so the peer id of every
/// produced connection is trusted.
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    /// Addresses on which this transport accepts connections.
    fn listen_addresses(&self) -> Vec<Address>;

    /// Dials the peer using any of the specified addresses.
    fn connect<'a>(
        &'a self,
        peer_id: &'a PeerId,
        addresses: &'a [Address],
    ) -> BoxFuture<'a, Result<Box<dyn RawConnection>, ConnectionError>>;

    /// Waits for the next inbound connection. Returns `None` when closed.
    fn accept(&self) -> BoxFuture<'_, Option<Box<dyn RawConnection>>>;

    fn close(&self);
}

/// A transport connection with an authenticated remote peer.
pub trait RawConnection: Send + Sync + 'static {
    fn remote_id(&self) -> &PeerId;

    fn open_bi(&self) -> BoxFuture<'_, Result<(SendStream, RecvStream), ConnectionError>>;

    fn accept_bi(&self) -> BoxFuture<'_, Result<(SendStream, RecvStream), ConnectionError>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}
