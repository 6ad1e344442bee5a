use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::network::transport::{RawConnection, RecvStream, SendStream};
use crate::types::{Direction, InboundRequestMeta, PeerId};

#[derive(Clone)]
pub struct Connection {
    inner: Arc<dyn RawConnection>,
    request_meta: Arc<InboundRequestMeta>,
    stable_id: usize,
}

impl Connection {
    pub(crate) fn new(inner: Box<dyn RawConnection>, origin: Direction) -> Self {
        static STABLE_ID: AtomicUsize = AtomicUsize::new(0);

        let request_meta = Arc::new(InboundRequestMeta {
            peer_id: *inner.remote_id(),
            origin,
        });
        Self {
            inner: Arc::from(inner),
            request_meta,
            stable_id: STABLE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn request_meta(&self) -> &Arc<InboundRequestMeta> {
        &self.request_meta
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.request_meta.peer_id
    }

    /// Process-wide unique id of this connection.
    pub fn stable_id(&self) -> usize {
        self.stable_id
    }

    pub fn origin(&self) -> Direction {
        self.request_meta.origin
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        self.inner.open_bi().await
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ConnectionError> {
        self.inner.accept_bi().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", self.peer_id())
            .field("origin", &self.origin())
            .field("stable_id", &self.stable_id)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("no known addresses for peer {0}")]
    NoAddresses(PeerId),
    #[error("trying to connect to self")]
    DialSelf,
    #[error("connection timed out")]
    TimedOut,
    #[error("connection closed")]
    Closed,
    #[error("network is shut down")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
