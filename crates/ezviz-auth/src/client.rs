//! Vendor cloud API client
//!
//! Request and response shapes are vendor-defined and change without notice,
//! so responses are parsed leniently: every field the client does not strictly
//! need is optional.

use crate::credentials::{Credentials, Region};
use crate::error::AuthError;
use crate::session::AuthSession;
use async_trait::async_trait;
use base64::Engine;
use ezviz_proto::ServerAddress;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/v3/users/login/v5";
const SERVER_INFO_PATH: &str = "/api/server/info/get";
const PAGE_LIST_PATH: &str = "/v3/userdevices/v1/resources/pagelist";
const RELAY_TOKEN_PATH: &str = "/vtdutoken2";

const CLIENT_TYPE: &str = "9";
const CLIENT_NO: &str = "shipin7";
const CLIENT_VERSION: &str = "2,5,1,2109068";
const CUSTOM_NO: &str = "1000001";
const APP_ID: &str = "ys7";
const FEATURE_CODE: &str = "00000000000000000000000000000000";
const CLIENT_NAME: &[u8] = b"EZVIZ-RE";

/// Vendor meta codes meaning the account or password was rejected
const BAD_CREDENTIAL_CODES: [i64; 2] = [1013, 1014];

/// Meta code meaning the session id is no longer valid
const SESSION_INVALID_CODE: i64 = 401;

/// Operations the session orchestrator needs from the vendor cloud
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Log in and discover the relay token server
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession, AuthError>;

    /// Find the directory server (VTM) serving a camera and check that it
    /// accepts connections
    async fn resolve_directory_server(
        &self,
        session: &AuthSession,
        region: Region,
        serial: &str,
    ) -> Result<ServerAddress, AuthError>;

    /// Fetch a short-lived token addressing the camera through the relay tier
    async fn fetch_relay_credentials(
        &self,
        session: &AuthSession,
        serial: &str,
    ) -> Result<String, AuthError>;
}

/// Camera registered on the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "deviceSerial")]
    pub serial: String,
    #[serde(rename = "deviceType", default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    meta: Meta,
    #[serde(rename = "loginSession", default)]
    login_session: Option<LoginSession>,
}

#[derive(Debug, Deserialize)]
struct LoginSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ServerInfoResponse {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(rename = "serverResp", default)]
    server_resp: Option<ServerResp>,
}

#[derive(Debug, Deserialize)]
struct ServerResp {
    #[serde(rename = "authAddr")]
    auth_addr: String,
}

#[derive(Debug, Deserialize)]
struct PageListResponse {
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(rename = "resourceInfos", default)]
    resource_infos: Vec<ResourceInfo>,
    #[serde(rename = "deviceInfos", default)]
    device_infos: Vec<DeviceInfo>,
    #[serde(rename = "VTM", default)]
    vtm: HashMap<String, VtmInfo>,
}

#[derive(Debug, Deserialize)]
struct ResourceInfo {
    #[serde(rename = "deviceSerial")]
    device_serial: String,
    #[serde(rename = "resourceId")]
    resource_id: String,
    #[serde(rename = "resourceType", default)]
    resource_type: i64,
}

#[derive(Debug, Deserialize)]
struct VtmInfo {
    #[serde(rename = "externalIp")]
    external_ip: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RelayTokenResponse {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    retcode: Option<i64>,
}

/// HTTP client for the vendor cloud API
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    connect_timeout: Duration,
    api_url_override: Option<String>,
}

impl AuthClient {
    /// Create a new client
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .default_headers(client_headers())
            .build()?;

        Ok(Self {
            http,
            connect_timeout,
            api_url_override: None,
        })
    }

    /// Send all API calls to `url` instead of the regional cluster
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url_override = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    fn api_url(&self, region: Region) -> String {
        self.api_url_override
            .clone()
            .unwrap_or_else(|| region.api_url())
    }

    /// Log in and discover the relay token server
    pub async fn login(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        let api_url = self.api_url(credentials.region);
        info!("Logging in as {} ({})", credentials.email, credentials.region);

        let cu_name = base64::engine::general_purpose::STANDARD.encode(CLIENT_NAME);
        let digest = credentials.password_digest();
        let form = [
            ("account", credentials.email.as_str()),
            ("password", digest.as_str()),
            ("featureCode", FEATURE_CODE),
            ("cuName", cu_name.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}{}", api_url, LOGIN_PATH))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AuthError::InvalidCredentials(format!(
                "login rejected with HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AuthError::Api {
                status: status.as_u16(),
                code: 0,
                message: "login failed".into(),
            });
        }

        let body: LoginResponse = parse_json(response).await?;
        match body.meta.code {
            200 => {}
            code if BAD_CREDENTIAL_CODES.contains(&code) => {
                return Err(AuthError::InvalidCredentials(
                    body.meta
                        .message
                        .unwrap_or_else(|| format!("vendor code {}", code)),
                ));
            }
            code => {
                return Err(AuthError::Api {
                    status: status.as_u16(),
                    code,
                    message: body.meta.message.unwrap_or_default(),
                });
            }
        }

        let token = body
            .login_session
            .map(|s| s.session_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("login response has no sessionId".into()))?;

        let auth_addr = self.server_info(&api_url, &token).await?;
        info!("Logged in, relay token server at {}", auth_addr);

        Ok(AuthSession::new(token, api_url, auth_addr))
    }

    async fn server_info(&self, api_url: &str, token: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(format!("{}{}", api_url, SERVER_INFO_PATH))
            .header("sessionId", token)
            .form(&[("sessionId", token), ("clientType", CLIENT_TYPE)])
            .send()
            .await?;

        let status = check_session_status(response.status())?;
        let body: ServerInfoResponse = parse_json(response).await?;
        if let Some(meta) = &body.meta {
            check_meta(status, meta)?;
        }

        body.server_resp
            .map(|r| r.auth_addr)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("server info has no authAddr".into()))
    }

    async fn page_list(
        &self,
        api_url: &str,
        session: &AuthSession,
    ) -> Result<PageListResponse, AuthError> {
        let response = self
            .http
            .get(format!("{}{}", api_url, PAGE_LIST_PATH))
            .header("sessionId", session.token.as_str())
            .query(&[
                ("sessionId", session.token.as_str()),
                ("clientType", CLIENT_TYPE),
                ("clientNo", CLIENT_NO),
                ("clientVersion", CLIENT_VERSION),
                ("groupId", "-1"),
                ("limit", "50"),
                ("offset", "0"),
                ("filter", "VTM"),
            ])
            .send()
            .await?;

        let status = check_session_status(response.status())?;
        let body: PageListResponse = parse_json(response).await?;
        if let Some(meta) = &body.meta {
            check_meta(status, meta)?;
        }

        Ok(body)
    }

    /// Find the directory server serving `serial` and verify it is reachable
    pub async fn resolve_directory_server(
        &self,
        session: &AuthSession,
        region: Region,
        serial: &str,
    ) -> Result<ServerAddress, AuthError> {
        let page = self.page_list(&self.api_url(region), session).await?;

        let resource = page
            .resource_infos
            .iter()
            .find(|r| r.device_serial == serial && r.resource_type > 0)
            .ok_or_else(|| AuthError::DeviceNotFound(serial.to_string()))?;

        let vtm = page.vtm.get(&resource.resource_id).ok_or_else(|| {
            AuthError::InvalidResponse(format!(
                "no VTM entry for resource {}",
                resource.resource_id
            ))
        })?;

        let address = ServerAddress::new(vtm.external_ip.clone(), vtm.port);
        debug!("Directory server for {} is {}", serial, address);

        match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        {
            Ok(Ok(_probe)) => Ok(address),
            Ok(Err(e)) => Err(AuthError::Unreachable {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(AuthError::Unreachable {
                address: address.to_string(),
                reason: "connect timed out".into(),
            }),
        }
    }

    /// Fetch a relay token for `serial`
    pub async fn fetch_relay_credentials(
        &self,
        session: &AuthSession,
        serial: &str,
    ) -> Result<String, AuthError> {
        let sign = session.sign()?;
        let base = if session.auth_addr.contains("://") {
            session.auth_addr.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", session.auth_addr.trim_end_matches('/'))
        };

        debug!("Requesting relay token for {}", serial);
        let response = self
            .http
            .get(format!("{}{}", base, RELAY_TOKEN_PATH))
            .header("sessionId", session.token.as_str())
            .query(&[("ssid", session.token.as_str()), ("sign", sign.as_str())])
            .send()
            .await?;

        let status = check_session_status(response.status())?;
        let body: RelayTokenResponse = parse_json(response).await?;

        match body.retcode {
            Some(SESSION_INVALID_CODE) => {
                return Err(AuthError::SessionExpired(
                    "relay token request rejected the session".into(),
                ))
            }
            Some(code) if code != 0 => {
                warn!("Relay token request returned code {}", code);
            }
            _ => {}
        }

        body.tokens
            .into_iter()
            .find(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Api {
                status: status.as_u16(),
                code: body.retcode.unwrap_or_default(),
                message: "no relay tokens returned".into(),
            })
    }

    /// List cameras registered on the account
    pub async fn list_devices(&self, session: &AuthSession) -> Result<Vec<DeviceInfo>, AuthError> {
        let page = self.page_list(&session.api_url, session).await?;
        Ok(page.device_infos)
    }
}

#[async_trait]
impl CloudApi for AuthClient {
    async fn login(&self, credentials: &Credentials) -> Result<AuthSession, AuthError> {
        AuthClient::login(self, credentials).await
    }

    async fn resolve_directory_server(
        &self,
        session: &AuthSession,
        region: Region,
        serial: &str,
    ) -> Result<ServerAddress, AuthError> {
        AuthClient::resolve_directory_server(self, session, region, serial).await
    }

    async fn fetch_relay_credentials(
        &self,
        session: &AuthSession,
        serial: &str,
    ) -> Result<String, AuthError> {
        AuthClient::fetch_relay_credentials(self, session, serial).await
    }
}

fn client_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    // Header names are case-insensitive; HeaderMap requires them lowercase
    headers.insert("featurecode", HeaderValue::from_static(FEATURE_CODE));
    headers.insert("clienttype", HeaderValue::from_static(CLIENT_TYPE));
    headers.insert("clientversion", HeaderValue::from_static(CLIENT_VERSION));
    headers.insert("customno", HeaderValue::from_static(CUSTOM_NO));
    headers.insert("clientno", HeaderValue::from_static(CLIENT_NO));
    headers.insert("appid", HeaderValue::from_static(APP_ID));
    headers
}

/// Map HTTP statuses on session-scoped calls
fn check_session_status(status: StatusCode) -> Result<StatusCode, AuthError> {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(AuthError::SessionExpired(format!(
            "HTTP {}",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(AuthError::Api {
            status: status.as_u16(),
            code: 0,
            message: status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        });
    }
    Ok(status)
}

fn check_meta(status: StatusCode, meta: &Meta) -> Result<(), AuthError> {
    match meta.code {
        200 => Ok(()),
        SESSION_INVALID_CODE => Err(AuthError::SessionExpired(
            meta.message.clone().unwrap_or_else(|| "session invalid".into()),
        )),
        code => Err(AuthError::Api {
            status: status.as_u16(),
            code,
            message: meta.message.clone().unwrap_or_default(),
        }),
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AuthError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_override() {
        let client = AuthClient::new(Duration::from_secs(5), Duration::from_secs(5))
            .unwrap()
            .with_api_url("http://127.0.0.1:9999/");

        assert_eq!(client.api_url(Region::Asia), "http://127.0.0.1:9999");
    }

    #[test]
    fn test_api_url_from_region() {
        let client = AuthClient::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.api_url(Region::NorthAmerica),
            "https://apiius.ezvizlife.com"
        );
    }

    #[test]
    fn test_session_status_mapping() {
        assert!(matches!(
            check_session_status(StatusCode::UNAUTHORIZED),
            Err(AuthError::SessionExpired(_))
        ));
        assert!(matches!(
            check_session_status(StatusCode::BAD_GATEWAY),
            Err(AuthError::Api { status: 502, .. })
        ));
        assert!(check_session_status(StatusCode::OK).is_ok());
    }

    #[test]
    fn test_page_list_parsing() {
        let json = r#"{
            "meta": {"code": 200},
            "resourceInfos": [{"deviceSerial": "C1", "resourceId": "r1", "resourceType": 1}],
            "deviceInfos": [{"name": "Porch", "deviceSerial": "C1", "deviceType": "CS-C6", "status": 1, "version": "5.3"}],
            "VTM": {"r1": {"externalIp": "10.0.0.1", "port": 8554, "domain": "ignored"}}
        }"#;

        let page: PageListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(page.resource_infos[0].resource_id, "r1");
        assert_eq!(page.vtm["r1"].port, 8554);
        assert_eq!(page.device_infos[0].model.as_deref(), Some("CS-C6"));
    }
}
