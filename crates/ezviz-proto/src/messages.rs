//! Message payloads exchanged with the relay servers
//!
//! Stream-info messages are small protobuf documents. Requests have a fixed
//! schema; responses are only partly known and are walked field by field.

use bytes::{Buf, Bytes};
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};
use prost::Message;
use std::fmt;
use thiserror::Error;

/// Client version string the relay expects in stream-info requests
pub const CLIENT_VERSION: &str = "v3.6.3.20221124";

/// URL scheme used by both relay tiers
pub const YSPROTO_SCHEME: &str = "ysproto://";

/// Message errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Malformed protobuf payload")]
    MalformedProtobuf,
}

/// Host/port pair of a relay server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Extract the server address from a `ysproto://host:port/...` URL
    pub fn from_ysproto_url(raw: &str) -> Result<Self, MessageError> {
        if !raw.starts_with(YSPROTO_SCHEME) {
            return Err(MessageError::InvalidUrl(raw.to_string()));
        }

        let parsed =
            url::Url::parse(raw).map_err(|e| MessageError::InvalidUrl(format!("{}: {}", raw, e)))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MessageError::InvalidUrl(raw.to_string()))?;
        let port = parsed
            .port()
            .ok_or_else(|| MessageError::InvalidUrl(format!("{}: missing port", raw)))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Build the live stream URL sent to the directory server
pub fn build_stream_url(
    directory: &ServerAddress,
    serial: &str,
    relay_token: &str,
    timestamp_ms: i64,
) -> String {
    format!(
        "{}{}:{}/live?dev={}&chn=1&stream=1&cln=9&isp=0&auth=1&ssn={}&biz=1&vip=0&timestamp={}",
        YSPROTO_SCHEME, directory.host, directory.port, serial, relay_token, timestamp_ms
    )
}

/// Stream-info request
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamInfoRequest {
    #[prost(string, tag = "1")]
    pub stream_url: String,
    #[prost(string, optional, tag = "2")]
    pub vtm_stream_key: Option<String>,
    #[prost(string, tag = "3")]
    pub client_version: String,
    /// Always sent, even though it is zero
    #[prost(uint32, optional, tag = "4")]
    pub proxy_type: Option<u32>,
    #[prost(string, tag = "6")]
    pub sdk_version: String,
}

impl StreamInfoRequest {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            vtm_stream_key: None,
            client_version: CLIENT_VERSION.to_string(),
            proxy_type: Some(0),
            sdk_version: CLIENT_VERSION.to_string(),
        }
    }

    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.vtm_stream_key = Some(key).filter(|k| !k.is_empty());
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}

/// The one response field with a known meaning
#[derive(Clone, PartialEq, prost::Message)]
struct StreamInfoStatus {
    #[prost(uint32, tag = "1")]
    result: u32,
}

/// Stream-info response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfoResponse {
    /// Result code, 0 on success
    pub result: u32,
    /// `ysproto://` URL of the next hop, if the server redirected us
    pub redirect_url: Option<String>,
}

impl StreamInfoResponse {
    /// Parse a response payload.
    ///
    /// The response layout is not documented, so parsing is lenient: field 1
    /// is read as the result code, the first length-delimited field holding
    /// a `ysproto://` URL is the redirect. If the payload is not valid
    /// protobuf the URL is searched for in the raw bytes instead.
    pub fn parse(payload: &[u8]) -> Self {
        let parsed = StreamInfoStatus::decode(payload)
            .map_err(|_| MessageError::MalformedProtobuf)
            .and_then(|status| {
                Ok(StreamInfoResponse {
                    result: status.result,
                    redirect_url: redirect_field(payload)?,
                })
            });

        parsed.unwrap_or_else(|_| StreamInfoResponse {
            result: 0,
            redirect_url: find_ysproto_url(payload),
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}

/// Locate a `ysproto://` URL inside arbitrary bytes.
///
/// The URL ends at the first NUL, whitespace, control or non-ASCII byte.
/// This is stricter than stopping at NUL alone, and never cuts a valid URL
/// short since URLs hold only printable ASCII.
pub fn find_ysproto_url(bytes: &[u8]) -> Option<String> {
    let scheme = YSPROTO_SCHEME.as_bytes();
    let start = bytes.windows(scheme.len()).position(|w| w == scheme)?;
    let tail = &bytes[start..];
    let end = tail
        .iter()
        .position(|&b| !(0x21..=0x7e).contains(&b))
        .unwrap_or(tail.len());

    String::from_utf8(tail[..end].to_vec()).ok()
}

/// Walk the top-level fields and return the first redirect URL found in a
/// length-delimited one. Other fields are skipped.
fn redirect_field(payload: &[u8]) -> Result<Option<String>, MessageError> {
    let mut buf = payload;

    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf).map_err(|_| MessageError::MalformedProtobuf)?;
        if wire_type != WireType::LengthDelimited {
            skip_field(wire_type, tag, &mut buf, DecodeContext::default())
                .map_err(|_| MessageError::MalformedProtobuf)?;
            continue;
        }

        let len = decode_varint(&mut buf).map_err(|_| MessageError::MalformedProtobuf)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= buf.len())
            .ok_or(MessageError::MalformedProtobuf)?;
        let (value, rest) = buf.split_at(len);
        buf = rest;

        if let Some(url) = find_ysproto_url(value) {
            return Ok(Some(url));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A response shaped like the relay's: result, redirect, trailing noise
    #[derive(Clone, PartialEq, prost::Message)]
    struct TestResponse {
        #[prost(uint32, tag = "1")]
        result: u32,
        #[prost(string, optional, tag = "2")]
        url: Option<String>,
        #[prost(fixed64, tag = "5")]
        stamp: u64,
        #[prost(string, tag = "7")]
        trailer: String,
    }

    fn response_payload(result: u32, url: Option<&str>) -> Vec<u8> {
        TestResponse {
            result,
            url: url.map(str::to_string),
            stamp: 0x0102_0304_0506_0708,
            trailer: "trailer".into(),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_request_layout() {
        let encoded = StreamInfoRequest::new("ysproto://a:1/x").to_bytes();

        let mut expected = vec![0x0a, 15];
        expected.extend_from_slice(b"ysproto://a:1/x");
        expected.extend_from_slice(&[0x1a, CLIENT_VERSION.len() as u8]);
        expected.extend_from_slice(CLIENT_VERSION.as_bytes());
        expected.extend_from_slice(&[0x20, 0x00]);
        expected.extend_from_slice(&[0x32, CLIENT_VERSION.len() as u8]);
        expected.extend_from_slice(CLIENT_VERSION.as_bytes());

        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_request_with_stream_key() {
        let encoded = StreamInfoRequest::new("u").with_stream_key("key").to_bytes();
        assert_eq!(&encoded[..8], &[0x0a, 1, b'u', 0x12, 3, b'k', b'e', b'y']);

        let decoded = StreamInfoRequest::decode(encoded).unwrap();
        assert_eq!(decoded.vtm_stream_key.as_deref(), Some("key"));

        let empty = StreamInfoRequest::new("u").with_stream_key("");
        assert!(empty.vtm_stream_key.is_none());
    }

    #[test]
    fn test_long_field_uses_multibyte_varint() {
        let url = "x".repeat(200);
        let encoded = StreamInfoRequest::new(url.clone()).to_bytes();
        assert_eq!(&encoded[..3], &[0x0a, 0xc8, 0x01]);
        assert_eq!(StreamInfoRequest::decode(encoded).unwrap().stream_url, url);
    }

    #[test]
    fn test_parse_redirect_response() {
        let url = "ysproto://10.0.0.5:8554/live?dev=ABC&ssn=t";
        let response = StreamInfoResponse::parse(&response_payload(0, Some(url)));

        assert!(response.is_success());
        assert_eq!(response.redirect_url.as_deref(), Some(url));
    }

    #[test]
    fn test_parse_redirect_in_unknown_field() {
        let mut payload = response_payload(0, None);
        // field 9, length-delimited, URL padded with NULs
        let url = b"ysproto://10.0.0.6:8554/live\x00\x00";
        payload.extend_from_slice(&[0x4a, url.len() as u8]);
        payload.extend_from_slice(url);

        let response = StreamInfoResponse::parse(&payload);
        assert_eq!(
            response.redirect_url.as_deref(),
            Some("ysproto://10.0.0.6:8554/live")
        );
    }

    #[test]
    fn test_parse_rejection() {
        let response = StreamInfoResponse::parse(&response_payload(401, None));

        assert_eq!(response.result, 401);
        assert!(response.redirect_url.is_none());
    }

    #[test]
    fn test_parse_raw_fallback() {
        let mut payload = vec![0xff, 0xff, 0xff];
        payload.extend_from_slice(b"ysproto://1.2.3.4:9000/live\x00\x00junk");

        let response = StreamInfoResponse::parse(&payload);
        assert_eq!(
            response.redirect_url.as_deref(),
            Some("ysproto://1.2.3.4:9000/live")
        );
    }

    #[test]
    fn test_server_address_from_url() {
        let addr = ServerAddress::from_ysproto_url("ysproto://vtdu.example.com:8554/live?x=1").unwrap();
        assert_eq!(addr, ServerAddress::new("vtdu.example.com", 8554));
        assert_eq!(addr.to_string(), "vtdu.example.com:8554");
    }

    #[test]
    fn test_server_address_rejects_bad_urls() {
        assert!(ServerAddress::from_ysproto_url("http://a:1/").is_err());
        assert!(ServerAddress::from_ysproto_url("ysproto://nohost/live").is_err());
    }

    #[test]
    fn test_build_stream_url() {
        let url = build_stream_url(&ServerAddress::new("1.1.1.1", 8554), "C123", "tok", 42);
        assert_eq!(
            url,
            "ysproto://1.1.1.1:8554/live?dev=C123&chn=1&stream=1&cln=9&isp=0&auth=1&ssn=tok&biz=1&vip=0&timestamp=42"
        );
    }
}
