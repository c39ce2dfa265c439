//! Relay negotiation against a fake directory server

use bytes::Bytes;
use ezviz_client::{NegotiationError, RelayNegotiator};
use ezviz_proto::{codes, Channel, Packet, PacketCodec, ServerAddress};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;

const SERIAL: &str = "BD1234567";
const RELAY_TOKEN: &str = "relay-token";
const REDIRECT: &str = "ysproto://127.0.0.1:8554/live?dev=BD1234567&chn=1&stream=1";

// ============================================================================
// Helpers
// ============================================================================

/// Stream-info response payload: result code in field 1, redirect in field 2
fn response_payload(result: u16, redirect: Option<&str>) -> Bytes {
    let mut payload = vec![0x08];
    let mut value = result as u64;
    while value > 0x7f {
        payload.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    payload.push(value as u8);

    if let Some(url) = redirect {
        payload.push(0x12);
        payload.push(url.len() as u8);
        payload.extend_from_slice(url.as_bytes());
    }
    Bytes::from(payload)
}

fn housekeeping(i: u16) -> Packet {
    match i % 3 {
        0 => Packet::control(i, 0x0200, Bytes::from_static(b"status")),
        1 => Packet::new(Channel::EncryptedControl, i, 0x0201, Bytes::from_static(b"enc")),
        _ => Packet::control(i, codes::STREAMINFO_RSP, response_payload(0, None)),
    }
}

/// Accept one connection, check the request, then send `before` and
/// finally `reply` if given. The connection is held open until `release`
/// fires or the test ends.
async fn start_directory(
    before: Vec<Packet>,
    reply: Option<Packet>,
) -> (ServerAddress, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());
    let (release_tx, release_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, PacketCodec::new());

        let request = framed.next().await.unwrap().unwrap();
        assert_eq!(request.channel, Channel::Control);
        assert_eq!(request.message_code, codes::STREAMINFO_REQ);
        let text = String::from_utf8_lossy(&request.payload);
        assert!(text.contains(&format!("dev={}", SERIAL)));
        assert!(text.contains(&format!("ssn={}", RELAY_TOKEN)));

        for packet in before {
            framed.send(packet).await.unwrap();
        }
        if let Some(packet) = reply {
            framed.send(packet).await.unwrap();
        }

        let _ = release_rx.await;
    });

    (address, release_tx)
}

fn negotiator() -> RelayNegotiator {
    RelayNegotiator::new(Duration::from_secs(2), Duration::from_millis(500))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_redirect_after_housekeeping() {
    let before = (0..7).map(housekeeping).collect();
    let reply = Packet::control(9, codes::STREAMINFO_RSP, response_payload(0, Some(REDIRECT)));
    let (directory, _release) = start_directory(before, Some(reply)).await;

    let target = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap();

    assert_eq!(target.media_server, ServerAddress::new("127.0.0.1", 8554));
    assert_eq!(target.stream_token, REDIRECT);
}

#[tokio::test]
async fn test_redirect_with_trailing_nul() {
    let mut payload = response_payload(0, None).to_vec();
    payload.push(0x1a);
    payload.push(REDIRECT.len() as u8 + 3);
    payload.extend_from_slice(REDIRECT.as_bytes());
    payload.extend_from_slice(&[0, 0, 0]);

    let reply = Packet::control(1, codes::STREAMINFO_RSP, payload);
    let (directory, _release) = start_directory(Vec::new(), Some(reply)).await;

    let target = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap();

    assert_eq!(target.stream_token, REDIRECT);
}

#[tokio::test]
async fn test_timeout_without_redirect() {
    let before = (0..3).map(housekeeping).collect();
    let (directory, _release) = start_directory(before, None).await;

    let err = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Timeout(_)));
    assert!(!err.is_auth_rejection());
}

#[tokio::test]
async fn test_auth_rejection() {
    let reply = Packet::control(1, codes::STREAMINFO_RSP, response_payload(401, None));
    let (directory, _release) = start_directory(Vec::new(), Some(reply)).await;

    let err = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Rejected { code: 401 }));
    assert!(err.is_auth_rejection());
}

#[tokio::test]
async fn test_other_rejection_is_not_auth() {
    let reply = Packet::control(1, codes::STREAMINFO_RSP, response_payload(5404, None));
    let (directory, _release) = start_directory(Vec::new(), Some(reply)).await;

    let err = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Rejected { code: 5404 }));
    assert!(!err.is_auth_rejection());
}

#[tokio::test]
async fn test_closed_before_redirect() {
    let (directory, release) = start_directory(vec![housekeeping(0)], None).await;
    release.send(()).unwrap();

    let err = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Closed));
}

#[tokio::test]
async fn test_corrupt_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let directory = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, PacketCodec::new());
        let _ = framed.next().await;
        tokio::io::AsyncWriteExt::write_all(framed.get_mut(), b"HTTP/1.1 400 Bad Request\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let err = negotiator()
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Framing(_)));
}

#[tokio::test]
async fn test_connect_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = negotiator()
        .negotiate(&ServerAddress::new("127.0.0.1", port), RELAY_TOKEN, SERIAL)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::Connect { .. }));
}

#[tokio::test]
async fn test_never_sends_keepalive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let directory = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());
    let (codes_tx, codes_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (socket, _): (TcpStream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, PacketCodec::new());
        let mut seen = Vec::new();

        seen.push(framed.next().await.unwrap().unwrap().message_code);
        for i in 0..5 {
            framed.send(housekeeping(i)).await.unwrap();
        }
        // Give the client time to send anything else it wants to
        if let Ok(Some(Ok(packet))) =
            tokio::time::timeout(Duration::from_millis(200), framed.next()).await
        {
            seen.push(packet.message_code);
        }
        framed
            .send(Packet::control(
                9,
                codes::STREAMINFO_RSP,
                response_payload(0, Some(REDIRECT)),
            ))
            .await
            .unwrap();
        let _ = codes_tx.send(seen);
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    RelayNegotiator::new(Duration::from_secs(2), Duration::from_secs(2))
        .negotiate(&directory, RELAY_TOKEN, SERIAL)
        .await
        .unwrap();

    assert_eq!(codes_rx.await.unwrap(), vec![codes::STREAMINFO_REQ]);
}
