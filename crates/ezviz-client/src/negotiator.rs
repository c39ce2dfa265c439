//! Relay negotiation with the directory server (VTM)
//!
//! The directory server answers a stream-info request with a redirect to the
//! media server (VTDU) that will carry the video. It may send housekeeping
//! packets first, which are skipped.

use chrono::Utc;
use ezviz_proto::{
    build_stream_url, codes, Channel, FramingError, MessageError, Packet, PacketCodec,
    ServerAddress, StreamInfoRequest, StreamInfoResponse,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Where and how to open the media session. Used once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub media_server: ServerAddress,
    /// `ysproto://` URL returned by the directory server, sent back verbatim
    /// as the media handshake
    pub stream_token: String,
}

/// Negotiation errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("No redirect within {0:?}")]
    Timeout(Duration),

    #[error("Directory server closed the connection before redirecting")]
    Closed,

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Directory server rejected the request with code {code}")]
    Rejected { code: u32 },

    #[error("Invalid redirect: {0}")]
    InvalidRedirect(#[from] MessageError),
}

impl NegotiationError {
    /// Returns true if the server explicitly refused our credentials, which
    /// means the session has to be re-established
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, NegotiationError::Rejected { code: 401 | 403 })
    }
}

/// Negotiates relay targets with a directory server
#[derive(Debug, Clone)]
pub struct RelayNegotiator {
    connect_timeout: Duration,
    negotiation_timeout: Duration,
    codec: PacketCodec,
}

impl RelayNegotiator {
    pub fn new(connect_timeout: Duration, negotiation_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            negotiation_timeout,
            codec: PacketCodec::new(),
        }
    }

    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Ask `directory` where to stream `serial` from
    pub async fn negotiate(
        &self,
        directory: &ServerAddress,
        relay_token: &str,
        serial: &str,
    ) -> Result<RelayTarget, NegotiationError> {
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((directory.host.as_str(), directory.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NegotiationError::Connect {
                    address: directory.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(NegotiationError::Connect {
                    address: directory.to_string(),
                    reason: "connect timed out".into(),
                })
            }
        };
        debug!("Connected to directory server {}", directory);

        let mut framed = Framed::new(stream, self.codec);

        let stream_url =
            build_stream_url(directory, serial, relay_token, Utc::now().timestamp_millis());
        let request = StreamInfoRequest::new(stream_url).to_bytes();
        framed
            .send(Packet::control(0, codes::STREAMINFO_REQ, request))
            .await?;

        let target = timeout(self.negotiation_timeout, await_redirect(&mut framed))
            .await
            .map_err(|_| NegotiationError::Timeout(self.negotiation_timeout))??;

        info!("Redirected to media server {}", target.media_server);
        Ok(target)
    }
}

async fn await_redirect(
    framed: &mut Framed<TcpStream, PacketCodec>,
) -> Result<RelayTarget, NegotiationError> {
    let mut skipped = 0usize;

    loop {
        let packet = match framed.next().await {
            Some(packet) => packet?,
            None => return Err(NegotiationError::Closed),
        };

        if packet.channel != Channel::Control || packet.message_code != codes::STREAMINFO_RSP {
            skipped += 1;
            debug!(
                "Skipping packet on {:?} with code 0x{:x} ({} skipped)",
                packet.channel, packet.message_code, skipped
            );
            continue;
        }

        let response = StreamInfoResponse::parse(&packet.payload);
        match response.redirect_url {
            Some(url) => {
                let media_server = ServerAddress::from_ysproto_url(&url)?;
                return Ok(RelayTarget {
                    media_server,
                    stream_token: url,
                });
            }
            None if !response.is_success() => {
                return Err(NegotiationError::Rejected {
                    code: response.result,
                })
            }
            None => {
                skipped += 1;
                debug!("Stream-info response without redirect, waiting");
            }
        }
    }
}
