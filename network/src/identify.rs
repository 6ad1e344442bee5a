//! Exchange of listen addresses between connected peers.

use std::sync::Arc;

use futures_util::future::Ready;

use crate::network::{Network, RpcError};
use crate::proto::identify::{IdentifyResponse, PROTOCOL_ID, rpc};
use crate::types::{PeerId, PeerInfo, Request, Response, Service, ServiceRequest};
use crate::util::{NetworkExt, Routable};

/// Answers identify queries with the local peer info.
#[derive(Clone)]
pub struct IdentifyService {
    local_info: Arc<PeerInfo>,
}

impl IdentifyService {
    pub fn new(local_info: PeerInfo) -> Self {
        Self {
            local_info: Arc::new(local_info),
        }
    }
}

impl Routable for IdentifyService {
    fn query_protocols(&self) -> impl IntoIterator<Item = &'static str> {
        [PROTOCOL_ID]
    }
}

impl Service<ServiceRequest> for IdentifyService {
    type QueryResponse = Response;
    type OnQueryFuture = Ready<Option<Response>>;
    type OnMessageFuture = Ready<()>;

    fn on_query(&self, req: ServiceRequest) -> Self::OnQueryFuture {
        let response = match req.parse_tl::<rpc::Identify>() {
            Ok(rpc::Identify) => Some(Response::from_tl(IdentifyResponse {
                info: self.local_info.as_ref().clone(),
            })),
            Err(e) => {
                tracing::debug!(peer_id = %req.metadata.peer_id, "malformed identify query: {e}");
                None
            }
        };
        futures_util::future::ready(response)
    }

    fn on_message(&self, _req: ServiceRequest) -> Self::OnMessageFuture {
        futures_util::future::ready(())
    }
}

/// Asks the peer for its listen addresses and remembers them.
pub async fn identify(network: &Network, peer_id: &PeerId) -> Result<PeerInfo, RpcError> {
    let response = network
        .query(peer_id, PROTOCOL_ID, Request::from_tl(rpc::Identify))
        .await?;
    let IdentifyResponse { info } = response.parse_tl()?;
    if &info.id != peer_id {
        return Err(RpcError::Protocol(format!(
            "identify response for {} from {peer_id}",
            info.id
        )));
    }

    network.address_book().add_peer_info(&info);
    Ok(info)
}
