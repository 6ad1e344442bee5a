//! In-process transport for tests and simulations.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use cairn_util::FastDashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::network::connection::ConnectionError;
use crate::network::transport::{RawConnection, RecvStream, SendStream, Transport};
use crate::types::{Address, PeerId};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A registry of in-memory listeners.
#[derive(Clone, Default)]
pub struct MemorySwitch {
    inner: Arc<SwitchInner>,
}

#[derive(Default)]
struct SwitchInner {
    listeners: FastDashMap<PeerId, Listener>,
    next_port: AtomicU16,
}

struct Listener {
    address: Address,
    reachable: Arc<AtomicBool>,
    incoming_tx: mpsc::UnboundedSender<Box<dyn RawConnection>>,
}

impl MemorySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener with a unique fake address.
    pub fn bind(&self, local_id: PeerId) -> MemoryTransport {
        let port = 1 + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let address = Address::from((Ipv4Addr::LOCALHOST, port));
        let reachable = Arc::new(AtomicBool::new(true));

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        self.inner.listeners.insert(local_id, Listener {
            address,
            reachable: reachable.clone(),
            incoming_tx,
        });

        MemoryTransport {
            local_id,
            address,
            switch: self.clone(),
            incoming_rx: Mutex::new(incoming_rx),
            reachable,
            closed: CancellationToken::new(),
        }
    }

    /// Makes the peer refuse (or accept again) new inbound connections.
    pub fn set_reachable(&self, peer_id: &PeerId, reachable: bool) {
        if let Some(listener) = self.inner.listeners.get(peer_id) {
            listener.reachable.store(reachable, Ordering::Release);
        }
    }

    pub fn address_of(&self, peer_id: &PeerId) -> Option<Address> {
        self.inner.listeners.get(peer_id).map(|item| item.address)
    }
}

pub struct MemoryTransport {
    local_id: PeerId,
    address: Address,
    switch: MemorySwitch,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Box<dyn RawConnection>>>,
    reachable: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn address(&self) -> &Address {
        &self.address
    }

    async fn connect_impl(
        &self,
        peer_id: &PeerId,
        addresses: &[Address],
    ) -> Result<Box<dyn RawConnection>, ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }
        if peer_id == &self.local_id {
            return Err(ConnectionError::DialSelf);
        }
        if addresses.is_empty() {
            return Err(ConnectionError::NoAddresses(*peer_id));
        }

        let listeners = &self.switch.inner.listeners;
        let Some(listener) = listeners.get(peer_id) else {
            return Err(ConnectionError::Unreachable(*peer_id));
        };
        if !addresses.contains(&listener.address) || !listener.reachable.load(Ordering::Acquire) {
            return Err(ConnectionError::Unreachable(*peer_id));
        }

        let (local, remote) = MemoryConnection::pair(self.local_id, *peer_id);
        listener
            .incoming_tx
            .send(Box::new(remote))
            .map_err(|_e| ConnectionError::Unreachable(*peer_id))?;

        Ok(Box::new(local))
    }
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn listen_addresses(&self) -> Vec<Address> {
        vec![self.address]
    }

    fn connect<'a>(
        &'a self,
        peer_id: &'a PeerId,
        addresses: &'a [Address],
    ) -> BoxFuture<'a, Result<Box<dyn RawConnection>, ConnectionError>> {
        Box::pin(self.connect_impl(peer_id, addresses))
    }

    fn accept(&self) -> BoxFuture<'_, Option<Box<dyn RawConnection>>> {
        Box::pin(async move {
            loop {
                let connection = tokio::select! {
                    _ = self.closed.cancelled() => return None,
                    connection = async { self.incoming_rx.lock().await.recv().await } => connection?,
                };

                if self.reachable.load(Ordering::Acquire) {
                    break Some(connection);
                }
                connection.close();
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
        self.switch
            .inner
            .listeners
            .remove_if(&self.local_id, |_, listener| listener.address == self.address);
    }
}

type StreamPair = (SendStream, RecvStream);

struct MemoryConnection {
    remote_id: PeerId,
    outgoing_tx: mpsc::UnboundedSender<StreamPair>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<StreamPair>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    fn pair(left_id: PeerId, right_id: PeerId) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();

        // Both halves share the close signal.
        let closed = CancellationToken::new();

        let left = Self {
            remote_id: right_id,
            outgoing_tx: left_tx,
            incoming_rx: Mutex::new(left_rx),
            closed: closed.clone(),
        };
        let right = Self {
            remote_id: left_id,
            outgoing_tx: right_tx,
            incoming_rx: Mutex::new(right_rx),
            closed,
        };
        (left, right)
    }
}

impl RawConnection for MemoryConnection {
    fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    fn open_bi(&self) -> BoxFuture<'_, Result<StreamPair, ConnectionError>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(ConnectionError::Closed);
            }

            let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
            let (local_rx, local_tx) = tokio::io::split(local);
            let (remote_rx, remote_tx) = tokio::io::split(remote);

            self.outgoing_tx
                .send((Box::new(remote_tx), Box::new(remote_rx)))
                .map_err(|_e| ConnectionError::Closed)?;

            Ok((Box::new(local_tx) as SendStream, Box::new(local_rx) as RecvStream))
        })
    }

    fn accept_bi(&self) -> BoxFuture<'_, Result<StreamPair, ConnectionError>> {
        Box::pin(async move {
            tokio::select! {
                _ = self.closed.cancelled() => Err(ConnectionError::Closed),
                stream = async { self.incoming_rx.lock().await.recv().await } => {
                    stream.ok_or(ConnectionError::Closed)
                }
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn streams_are_delivered_to_the_remote_side() {
        let switch = MemorySwitch::new();
        let left = switch.bind(PeerId::random());
        let right = switch.bind(PeerId::random());

        let connection = left
            .connect(right.local_id(), &right.listen_addresses())
            .await
            .unwrap();
        let accepted = right.accept().await.unwrap();
        assert_eq!(accepted.remote_id(), left.local_id());

        let (mut tx, _rx) = connection.open_bi().await.unwrap();
        tx.write_all(b"ping").await.unwrap();
        tx.shutdown().await.unwrap();

        let (_tx, mut rx) = accepted.accept_bi().await.unwrap();
        let mut data = Vec::new();
        rx.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"ping");

        accepted.close();
        assert!(connection.is_closed());
        assert!(connection.open_bi().await.is_err());
    }

    #[tokio::test]
    async fn unknown_addresses_are_unreachable() {
        let switch = MemorySwitch::new();
        let left = switch.bind(PeerId::random());
        let right = switch.bind(PeerId::random());

        let res = left.connect(right.local_id(), &left.listen_addresses()).await;
        assert!(matches!(res, Err(ConnectionError::Unreachable(_))));

        switch.set_reachable(right.local_id(), false);
        let res = left.connect(right.local_id(), &right.listen_addresses()).await;
        assert!(matches!(res, Err(ConnectionError::Unreachable(_))));

        right.close();
        switch.set_reachable(right.local_id(), true);
        let res = left.connect(right.local_id(), &right.listen_addresses()).await;
        assert!(matches!(res, Err(ConnectionError::Unreachable(_))));
    }
}
