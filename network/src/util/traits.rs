use std::future::Future;

use crate::network::{Network, RpcError};
use crate::types::{PeerId, Request, Response};

pub trait NetworkExt {
    /// Connects to the peer if needed and sends a query.
    fn query(
        &self,
        peer_id: &PeerId,
        protocol: &'static str,
        request: Request,
    ) -> impl Future<Output = Result<Response, RpcError>> + Send;

    /// Connects to the peer if needed and sends a one-way message.
    fn send(
        &self,
        peer_id: &PeerId,
        protocol: &'static str,
        request: Request,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;
}

impl NetworkExt for Network {
    async fn query(
        &self,
        peer_id: &PeerId,
        protocol: &'static str,
        request: Request,
    ) -> Result<Response, RpcError> {
        let peer = self.connect(peer_id).await?;
        peer.rpc(protocol, request).await
    }

    async fn send(
        &self,
        peer_id: &PeerId,
        protocol: &'static str,
        request: Request,
    ) -> Result<(), RpcError> {
        let peer = self.connect(peer_id).await?;
        peer.send_message(protocol, request).await
    }
}
