//! EZVIZ relay protocol definitions
//!
//! This crate defines the packet framing and the message payloads spoken to
//! the two relay tiers: the VTM directory server and the VTDU media server.

pub mod messages;
pub mod packet;

pub use messages::{
    build_stream_url, MessageError, ServerAddress, StreamInfoRequest, StreamInfoResponse,
};
pub use packet::{Channel, FramingError, Packet, PacketCodec};

/// Sentinel byte opening every packet header
pub const MAGIC_BYTE: u8 = 0x24;

/// Packet header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Message codes carried in the header
pub mod codes {
    /// Stream-info request, sent to both relay tiers
    pub const STREAMINFO_REQ: u16 = 0x13b;

    /// Stream-info response
    pub const STREAMINFO_RSP: u16 = 0x13c;

    /// Keepalive request. The directory server drops the connection when it
    /// receives one, so the client never sends it.
    pub const KEEPALIVE_REQ: u16 = 0x135;
}
