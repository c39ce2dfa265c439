//! Media session with the media server (VTDU)
//!
//! One connection, one handshake, then a read loop forwarding video payloads
//! until something ends it. No retries here: the orchestrator decides what
//! happens next from the returned [`TerminationReason`].

use crate::negotiator::RelayTarget;
use bytes::Bytes;
use ezviz_proto::{
    codes, Channel, FramingError, Packet, PacketCodec, StreamInfoRequest, StreamInfoResponse,
};
use futures::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a media session ended
#[derive(Debug, Error)]
pub enum TerminationReason {
    #[error("Media server closed the connection")]
    PeerClosed,

    #[error("Framing error: {0}")]
    Framing(FramingError),

    #[error("No packet received within the idle timeout")]
    IdleTimeout,

    #[error("Media server reported error code {code}")]
    ServerError { code: u32 },

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Sink closed: {0}")]
    SinkClosed(io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl From<FramingError> for TerminationReason {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(e) => TerminationReason::Io(e),
            other => TerminationReason::Framing(other),
        }
    }
}

/// Streams video from a media server
#[derive(Debug, Clone)]
pub struct MediaSession {
    connect_timeout: Duration,
    idle_timeout: Duration,
    codec: PacketCodec,
}

impl MediaSession {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
            codec: PacketCodec::new(),
        }
    }

    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Connect to `target` and pass every video payload to `on_bytes`, in
    /// order, until the session ends
    pub async fn run<F>(
        &self,
        target: RelayTarget,
        cancel: &CancellationToken,
        mut on_bytes: F,
    ) -> TerminationReason
    where
        F: FnMut(Bytes) -> io::Result<()>,
    {
        let address = target.media_server.clone();
        let connect = timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        );

        let stream = tokio::select! {
            _ = cancel.cancelled() => return TerminationReason::Cancelled,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return TerminationReason::ConnectFailed(format!("{}: {}", address, e))
                }
                Err(_) => {
                    return TerminationReason::ConnectFailed(format!(
                        "{}: connect timed out",
                        address
                    ))
                }
            },
        };

        let mut framed = Framed::new(stream, self.codec);

        let handshake = StreamInfoRequest::new(target.stream_token).to_bytes();
        if let Err(e) = framed
            .send(Packet::control(0, codes::STREAMINFO_REQ, handshake))
            .await
        {
            return e.into();
        }
        info!("Streaming from media server {}", address);

        let mut warned_encrypted = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return TerminationReason::Cancelled,
                next = timeout(self.idle_timeout, framed.next()) => next,
            };

            let packet = match next {
                Err(_) => return TerminationReason::IdleTimeout,
                Ok(None) => return TerminationReason::PeerClosed,
                Ok(Some(Err(e))) => return e.into(),
                Ok(Some(Ok(packet))) => packet,
            };

            match packet.channel {
                Channel::Video => {
                    if let Err(e) = on_bytes(packet.payload) {
                        return TerminationReason::SinkClosed(e);
                    }
                }
                Channel::Control if packet.message_code == codes::STREAMINFO_RSP => {
                    let response = StreamInfoResponse::parse(&packet.payload);
                    if !response.is_success() {
                        return TerminationReason::ServerError {
                            code: response.result,
                        };
                    }
                    debug!("Stream-info acknowledged");
                }
                Channel::Control => {
                    debug!(
                        "Discarding control packet with code 0x{:x}",
                        packet.message_code
                    );
                }
                Channel::EncryptedControl | Channel::EncryptedVideo => {
                    if !warned_encrypted {
                        warn!("Media server sent encrypted packets, discarding them");
                        warned_encrypted = true;
                    }
                }
            }
        }
    }
}
