//! Packet framing for the relay protocol
//!
//! Format: [magic: u8 = 0x24][channel: u8][length: u16][sequence: u16][message_code: u16][payload]
//!
//! All multi-byte header fields are big-endian.

use crate::{HEADER_SIZE, MAGIC_BYTE, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Framing errors. Any of these means the byte stream can no longer be
/// trusted and the connection has to be dropped.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Invalid channel: 0x{0:02x}")]
    InvalidChannel(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Connection closed mid-packet with {0} bytes buffered")]
    Truncated(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Logical sub-stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Control = 0x00,
    Video = 0x01,
    EncryptedControl = 0x0a,
    EncryptedVideo = 0x0b,
}

impl Channel {
    pub fn is_encrypted(self) -> bool {
        matches!(self, Channel::EncryptedControl | Channel::EncryptedVideo)
    }
}

impl TryFrom<u8> for Channel {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Channel::Control),
            0x01 => Ok(Channel::Video),
            0x0a => Ok(Channel::EncryptedControl),
            0x0b => Ok(Channel::EncryptedVideo),
            _ => Err(FramingError::InvalidChannel(value)),
        }
    }
}

/// A single framed packet. The header length is always derived from the
/// payload, so the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: Channel,
    pub sequence: u16,
    pub message_code: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(
        channel: Channel,
        sequence: u16,
        message_code: u16,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            channel,
            sequence,
            message_code,
            payload: payload.into(),
        }
    }

    pub fn control(sequence: u16, message_code: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Channel::Control, sequence, message_code, payload)
    }

    pub fn video(sequence: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Channel::Video, sequence, 0, payload)
    }

    /// Payload length as carried in the header
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Result<Bytes, FramingError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FramingError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FramingError::PayloadTooLarge(payload_len));
        }

        buf.reserve(HEADER_SIZE + payload_len);
        buf.put_u8(MAGIC_BYTE);
        buf.put_u8(self.channel as u8);
        buf.put_u16(payload_len as u16);
        buf.put_u16(self.sequence);
        buf.put_u16(self.message_code);
        buf.put_slice(&self.payload);

        Ok(())
    }
}

/// Packet codec
///
/// Holds no per-connection state: partial packets stay in the caller's
/// buffer until the rest of their bytes arrive.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Lower the accepted payload size. Anything above it is treated as a
    /// desynchronized stream.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(MAX_PAYLOAD_SIZE);
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a packet from its parts
    pub fn encode(
        channel: Channel,
        sequence: u16,
        message_code: u16,
        payload: &[u8],
    ) -> Result<Bytes, FramingError> {
        Packet::new(channel, sequence, message_code, Bytes::copy_from_slice(payload)).encode()
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns Ok(Some(packet)) if a complete packet was decoded,
    /// Ok(None) if more data is needed,
    /// Err if the buffered bytes cannot be a valid packet.
    pub fn decode_packet(&self, buf: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        // Validate as much of the header as has arrived, so a corrupt stream
        // is rejected before waiting on a length read from garbage
        if let Some(&magic) = buf.first() {
            if magic != MAGIC_BYTE {
                return Err(FramingError::InvalidMagic(magic));
            }
        }
        if buf.len() >= 2 {
            Channel::try_from(buf[1])?;
        }
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length > self.max_payload {
            return Err(FramingError::PayloadTooLarge(length));
        }

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(1);
        let channel = Channel::try_from(buf.get_u8())?;
        let _ = buf.get_u16();
        let sequence = buf.get_u16();
        let message_code = buf.get_u16();
        let payload = buf.split_to(length).freeze();

        Ok(Some(Packet {
            channel,
            sequence,
            message_code,
            payload,
        }))
    }

    /// Decode every complete packet in `buf`, leaving any partial tail behind
    pub fn decode_all(&self, buf: &mut BytesMut) -> Result<Vec<Packet>, FramingError> {
        let mut packets = Vec::new();

        while let Some(packet) = self.decode_packet(buf)? {
            packets.push(packet);
        }

        Ok(packets)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        self.decode_packet(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        match self.decode_packet(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::Truncated(src.len())),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FramingError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), FramingError> {
        packet.encode_into(dst)
    }
}
