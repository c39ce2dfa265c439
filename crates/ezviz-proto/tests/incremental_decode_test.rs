//! Incremental decoding behaviour of the packet codec
//!
//! Sockets hand over bytes in arbitrary slices. These tests check that the
//! decoder produces the same packets no matter how the stream is cut.

use bytes::{Bytes, BytesMut};
use ezviz_proto::{codes, Channel, FramingError, Packet, PacketCodec, StreamInfoRequest};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

fn sample_stream() -> (Vec<Packet>, Vec<u8>) {
    let packets = vec![
        Packet::control(
            0,
            codes::STREAMINFO_RSP,
            StreamInfoRequest::new("ysproto://127.0.0.1:1/live").to_bytes(),
        ),
        Packet::video(1, vec![0x47u8; 188]),
        Packet::video(2, Bytes::new()),
        Packet::new(Channel::EncryptedVideo, 3, 0, vec![1u8, 2, 3]),
        Packet::video(4, (0..=255u8).collect::<Vec<_>>()),
    ];

    let mut wire = Vec::new();
    for packet in &packets {
        wire.extend_from_slice(&packet.encode().unwrap());
    }

    (packets, wire)
}

#[test]
fn test_byte_at_a_time_matches_single_shot() {
    let (packets, wire) = sample_stream();
    let codec = PacketCodec::new();

    let mut single = BytesMut::from(wire.as_slice());
    let single_shot = codec.decode_all(&mut single).unwrap();
    assert!(single.is_empty());

    let mut trickle = BytesMut::new();
    let mut trickled = Vec::new();
    for byte in &wire {
        trickle.extend_from_slice(&[*byte]);
        trickled.extend(codec.decode_all(&mut trickle).unwrap());
    }
    assert!(trickle.is_empty());

    assert_eq!(single_shot, packets);
    assert_eq!(trickled, packets);
}

#[test]
fn test_every_split_point_decodes_identically() {
    let (packets, wire) = sample_stream();
    let codec = PacketCodec::new();

    for split in 0..wire.len() {
        let mut buf = BytesMut::from(&wire[..split]);
        let mut decoded = codec.decode_all(&mut buf).unwrap();
        buf.extend_from_slice(&wire[split..]);
        decoded.extend(codec.decode_all(&mut buf).unwrap());

        assert_eq!(decoded, packets, "split at byte {}", split);
    }
}

#[test]
fn test_corruption_never_yields_partial_packet() {
    let (_, wire) = sample_stream();
    let mut corrupted = wire.clone();
    corrupted[0] = 0x00;

    let mut buf = BytesMut::from(corrupted.as_slice());
    let result = PacketCodec::new().decode_all(&mut buf);
    assert!(matches!(result, Err(FramingError::InvalidMagic(0x00))));
}

#[tokio::test]
async fn test_framed_read_over_trickling_socket() {
    let (packets, wire) = sample_stream();
    let (mut writer, reader) = tokio::io::duplex(4);

    let feeder = tokio::spawn(async move {
        for chunk in wire.chunks(3) {
            writer.write_all(chunk).await.unwrap();
        }
    });

    let decoded: Vec<Packet> = FramedRead::new(reader, PacketCodec::new())
        .map(|packet| packet.unwrap())
        .collect()
        .await;

    feeder.await.unwrap();
    assert_eq!(decoded, packets);
}

#[tokio::test]
async fn test_framed_read_reports_truncation() {
    let encoded = Packet::video(9, vec![5u8; 64]).encode().unwrap();
    let (mut writer, reader) = tokio::io::duplex(1024);

    writer.write_all(&encoded[..20]).await.unwrap();
    drop(writer);

    let mut framed = FramedRead::new(reader, PacketCodec::new());
    let result = framed.next().await.unwrap();
    assert!(matches!(result, Err(FramingError::Truncated(20))));
}
