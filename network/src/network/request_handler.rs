use std::sync::Arc;

use anyhow::Result;
use futures_util::sink::SinkExt;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::network::config::NetworkConfig;
use crate::network::connection::Connection;
use crate::network::connection_manager::ActivePeers;
use crate::network::transport::{RecvStream, SendStream};
use crate::network::wire::{make_codec, negotiate_inbound, recv_frame, send_frame};
use crate::types::{DisconnectReason, InboundRequestMeta, Response, Service, ServiceRequest};
use crate::util::{RouteKind, Router};

pub(crate) struct InboundRequestHandler {
    config: Arc<NetworkConfig>,
    connection: Connection,
    router: Router<Response>,
    active_peers: ActivePeers,
}

impl InboundRequestHandler {
    pub fn new(
        config: Arc<NetworkConfig>,
        connection: Connection,
        router: Router<Response>,
        active_peers: ActivePeers,
    ) -> Self {
        Self {
            config,
            connection,
            router,
            active_peers,
        }
    }

    pub async fn start(self) {
        tracing::debug!(peer_id = %self.connection.peer_id(), "request handler started");

        let max_inflight = self.config.max_concurrent_requests_per_peer.max(1);
        let mut inflight_requests = JoinSet::<()>::new();

        loop {
            tokio::select! {
                bi = self.connection.accept_bi(), if inflight_requests.len() < max_inflight => match bi {
                    Ok((tx, rx)) => {
                        tracing::trace!("incoming bi stream");
                        let handler = StreamRequestHandler::new(
                            &self.config,
                            self.connection.request_meta().clone(),
                            self.router.clone(),
                            tx,
                            rx,
                        );
                        inflight_requests.spawn(handler.handle());
                    }
                    Err(e) => {
                        tracing::trace!("failed to accept an incoming bi stream: {e:?}");
                        break;
                    }
                },
                Some(req) = inflight_requests.join_next() => match req {
                    Ok(()) => tracing::trace!("request handler task completed"),
                    Err(e) => {
                        if e.is_panic() {
                            std::panic::resume_unwind(e.into_panic());
                        }
                        tracing::trace!("request handler task cancelled");
                    }
                }
            }
        }

        self.active_peers.remove_with_stable_id(
            self.connection.peer_id(),
            self.connection.stable_id(),
            DisconnectReason::ConnectionClosed,
        );

        inflight_requests.shutdown().await;
        tracing::debug!(peer_id = %self.connection.peer_id(), "request handler stopped");
    }
}

struct StreamRequestHandler {
    meta: Arc<InboundRequestMeta>,
    router: Router<Response>,
    request_timeout: std::time::Duration,
    send_stream: FramedWrite<SendStream, LengthDelimitedCodec>,
    recv_stream: FramedRead<RecvStream, LengthDelimitedCodec>,
}

impl StreamRequestHandler {
    fn new(
        config: &NetworkConfig,
        meta: Arc<InboundRequestMeta>,
        router: Router<Response>,
        send_stream: SendStream,
        recv_stream: RecvStream,
    ) -> Self {
        Self {
            meta,
            router,
            request_timeout: config.request_timeout,
            send_stream: FramedWrite::new(send_stream, make_codec(config)),
            recv_stream: FramedRead::new(recv_stream, make_codec(config)),
        }
    }

    async fn handle(self) {
        if let Err(e) = self.do_handle().await {
            tracing::trace!("request handler task failed: {e}");
        }
    }

    async fn do_handle(mut self) -> Result<()> {
        let router = self.router.clone();
        let request_timeout = self.request_timeout;

        let read_request = async {
            let (protocol, kind) =
                negotiate_inbound(&mut self.send_stream, &mut self.recv_stream, |name| {
                    router.resolve(name)
                })
                .await?;
            let body = recv_frame(&mut self.recv_stream).await?;
            Ok::<_, anyhow::Error>((protocol, kind, body))
        };
        let (protocol, kind, body) = tokio::time::timeout(request_timeout, read_request).await??;

        let req = ServiceRequest {
            metadata: self.meta,
            protocol,
            body,
        };

        match kind {
            RouteKind::Query => {
                if let Some(res) = router.on_query(req).await {
                    send_frame(&mut self.send_stream, res.body).await?;
                }
                SinkExt::<bytes::Bytes>::close(&mut self.send_stream).await?;
            }
            RouteKind::Message => {
                SinkExt::<bytes::Bytes>::close(&mut self.send_stream).await?;
                router.on_message(req).await;
            }
        }
        Ok(())
    }
}
