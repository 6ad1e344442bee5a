use std::sync::Arc;

use cairn_util::metrics::{GaugeGuard, HistogramGuard};
use futures_util::sink::SinkExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::network::config::NetworkConfig;
use crate::network::connection::{Connection, ConnectionError};
use crate::network::wire::{WireError, make_codec, negotiate_outbound, recv_frame, send_frame};
use crate::types::{PeerId, Request, Response};

// Histograms
const METRIC_OUT_QUERIES_TIME: &str = "cairn_net_out_queries_time";
const METRIC_OUT_MESSAGES_TIME: &str = "cairn_net_out_messages_time";

// Counters
const METRIC_OUT_QUERIES_TOTAL: &str = "cairn_net_out_queries_total";
const METRIC_OUT_MESSAGES_TOTAL: &str = "cairn_net_out_messages_total";

// Gauges
const METRIC_OUT_QUERIES: &str = "cairn_net_out_queries";
const METRIC_OUT_MESSAGES: &str = "cairn_net_out_messages";

#[derive(Clone)]
pub struct Peer {
    connection: Connection,
    config: Arc<NetworkConfig>,
}

impl Peer {
    pub(crate) fn new(connection: Connection, config: Arc<NetworkConfig>) -> Self {
        Self { connection, config }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.connection.peer_id()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Sends a request over a new stream and waits for a single response.
    pub async fn rpc(&self, protocol: &str, request: Request) -> Result<Response, RpcError> {
        metrics::counter!(METRIC_OUT_QUERIES_TOTAL).increment(1);
        let _gauge = GaugeGuard::increment(METRIC_OUT_QUERIES, 1);
        let _histogram = HistogramGuard::begin(METRIC_OUT_QUERIES_TIME);

        let fut = async {
            let (send_stream, recv_stream) = self.connection.open_bi().await?;
            let mut send_stream = FramedWrite::new(send_stream, make_codec(&self.config));
            let mut recv_stream = FramedRead::new(recv_stream, make_codec(&self.config));

            negotiate_outbound(&mut send_stream, &mut recv_stream, protocol).await?;
            send_frame(&mut send_stream, request.body).await?;
            SinkExt::<bytes::Bytes>::close(&mut send_stream).await.map_err(WireError::from)?;

            let body = recv_frame(&mut recv_stream).await?;
            Ok::<_, RpcError>(Response { body })
        };

        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(RpcError::Timeout),
        }
    }

    /// Sends a one-way message over a new stream.
    pub async fn send_message(&self, protocol: &str, request: Request) -> Result<(), RpcError> {
        metrics::counter!(METRIC_OUT_MESSAGES_TOTAL).increment(1);
        let _gauge = GaugeGuard::increment(METRIC_OUT_MESSAGES, 1);
        let _histogram = HistogramGuard::begin(METRIC_OUT_MESSAGES_TIME);

        let fut = async {
            let (send_stream, recv_stream) = self.connection.open_bi().await?;
            let mut send_stream = FramedWrite::new(send_stream, make_codec(&self.config));
            let mut recv_stream = FramedRead::new(recv_stream, make_codec(&self.config));

            negotiate_outbound(&mut send_stream, &mut recv_stream, protocol).await?;
            send_frame(&mut send_stream, request.body).await?;
            SinkExt::<bytes::Bytes>::close(&mut send_stream).await.map_err(WireError::from)?;
            Ok::<_, RpcError>(())
        };

        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(RpcError::Timeout),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Peer")
            .field(&self.connection.peer_id())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("response exceeds the frame size limit")]
    DataLimit,
    #[error("request timed out")]
    Timeout,
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::FrameTooLarge => Self::DataLimit,
            WireError::Io(e) => Self::Connection(ConnectionError::Io(e)),
            e => Self::Protocol(e.to_string()),
        }
    }
}

impl From<tl_proto::TlError> for RpcError {
    fn from(e: tl_proto::TlError) -> Self {
        Self::Protocol(e.to_string())
    }
}
