use bytes::Bytes;
use futures_util::sink::SinkExt;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::network::config::NetworkConfig;

pub(crate) const MULTISTREAM_HEADER: &str = "/multistream/1.0.0";
pub(crate) const NOT_AVAILABLE: &str = "na";

pub(crate) fn make_codec(config: &NetworkConfig) -> LengthDelimitedCodec {
    let mut builder = LengthDelimitedCodec::builder();

    builder.max_frame_length(config.max_frame_size.0 as usize);

    builder.length_field_length(4).big_endian().new_codec()
}

/// Proposes a protocol on a freshly opened stream.
pub(crate) async fn negotiate_outbound<W, R>(
    send_stream: &mut FramedWrite<W, LengthDelimitedCodec>,
    recv_stream: &mut FramedRead<R, LengthDelimitedCodec>,
    protocol: &str,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send_stream.feed(token(MULTISTREAM_HEADER)).await?;
    send_stream.send(token(protocol)).await?;

    if recv_frame(recv_stream).await? != MULTISTREAM_HEADER.as_bytes() {
        return Err(WireError::InvalidHeader);
    }

    let answer = recv_frame(recv_stream).await?;
    if answer == protocol.as_bytes() {
        Ok(())
    } else if answer == NOT_AVAILABLE.as_bytes() {
        Err(WireError::NotSupported(protocol.to_owned()))
    } else {
        Err(WireError::UnexpectedToken)
    }
}

/// Reads the proposed protocol and accepts it if `resolve` knows it.
pub(crate) async fn negotiate_inbound<W, R, F, T>(
    send_stream: &mut FramedWrite<W, LengthDelimitedCodec>,
    recv_stream: &mut FramedRead<R, LengthDelimitedCodec>,
    resolve: F,
) -> Result<T, WireError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    F: FnOnce(&str) -> Option<T>,
{
    if recv_frame(recv_stream).await? != MULTISTREAM_HEADER.as_bytes() {
        return Err(WireError::InvalidHeader);
    }
    send_stream.feed(token(MULTISTREAM_HEADER)).await?;

    let proposed = recv_frame(recv_stream).await?;
    let proposed = std::str::from_utf8(&proposed).map_err(|_e| WireError::UnexpectedToken)?;

    match resolve(proposed) {
        Some(resolved) => {
            send_stream.send(token(proposed)).await?;
            Ok(resolved)
        }
        None => {
            send_stream.send(token(NOT_AVAILABLE)).await?;
            Err(WireError::NotSupported(proposed.to_owned()))
        }
    }
}

pub(crate) async fn send_frame<W: AsyncWrite + Unpin>(
    send_stream: &mut FramedWrite<W, LengthDelimitedCodec>,
    frame: Bytes,
) -> Result<(), WireError> {
    send_stream.send(frame).await.map_err(WireError::from)
}

pub(crate) async fn recv_frame<R: AsyncRead + Unpin>(
    recv_stream: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Result<Bytes, WireError> {
    match recv_stream.next().await {
        Some(frame) => Ok(frame?.freeze()),
        None => Err(WireError::UnexpectedEof),
    }
}

fn token(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("invalid protocol header")]
    InvalidHeader,
    #[error("protocol `{0}` is not supported")]
    NotSupported(String),
    #[error("unexpected negotiation token")]
    UnexpectedToken,
    #[error("frame is too large")]
    FrameTooLarge,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        let too_large = e
            .get_ref()
            .map(|inner| inner.is::<LengthDelimitedCodecError>())
            .unwrap_or_default();

        if too_large {
            Self::FrameTooLarge
        } else {
            Self::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(
        config: &NetworkConfig,
    ) -> (
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, LengthDelimitedCodec>,
    ) {
        let (left, right) = tokio::io::duplex(1024);
        let (left_rx, left_tx) = tokio::io::split(left);
        let (right_rx, right_tx) = tokio::io::split(right);
        (
            FramedWrite::new(left_tx, make_codec(config)),
            FramedRead::new(left_rx, make_codec(config)),
            FramedWrite::new(right_tx, make_codec(config)),
            FramedRead::new(right_rx, make_codec(config)),
        )
    }

    #[tokio::test]
    async fn negotiation_accepts_known_protocol() {
        let config = NetworkConfig::default();
        let (mut a_tx, mut a_rx, mut b_tx, mut b_rx) = framed(&config);

        let outbound = negotiate_outbound(&mut a_tx, &mut a_rx, "/test/1.0.0");
        let inbound = negotiate_inbound(&mut b_tx, &mut b_rx, |name| {
            (name == "/test/1.0.0").then_some(123)
        });

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        outbound.unwrap();
        assert_eq!(inbound.unwrap(), 123);
    }

    #[tokio::test]
    async fn negotiation_rejects_unknown_protocol() {
        let config = NetworkConfig::default();
        let (mut a_tx, mut a_rx, mut b_tx, mut b_rx) = framed(&config);

        let outbound = negotiate_outbound(&mut a_tx, &mut a_rx, "/unknown/1.0.0");
        let inbound = negotiate_inbound(&mut b_tx, &mut b_rx, |_| None::<()>);

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        assert!(matches!(outbound, Err(WireError::NotSupported(_))));
        assert!(matches!(inbound, Err(WireError::NotSupported(_))));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let config = NetworkConfig {
            max_frame_size: bytesize::ByteSize(16),
            ..Default::default()
        };
        let (mut a_tx, _a_rx, _b_tx, b_rx) = framed(&NetworkConfig::default());
        let mut b_rx = FramedRead::new(b_rx.into_inner(), make_codec(&config));

        send_frame(&mut a_tx, Bytes::from(vec![0u8; 64])).await.unwrap();
        assert!(matches!(
            recv_frame(&mut b_rx).await,
            Err(WireError::FrameTooLarge)
        ));
    }
}
