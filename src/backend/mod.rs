use crate::error::BackendError;
use crate::model::{PrinterCapabilities, SocketAuth, ZOffset};
use crate::socket::{PrinterBackend, SessionProvider};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const API_KEY_HEADER: &str = "X-Api-Key";
const SOCKET_PATH: &str = "sockjs/websocket";

/// REST side of an OctoPrint instance.
#[derive(Clone, Debug)]
pub struct OctoPrintClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OctoPrintClientBuilder {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OctoPrintClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<OctoPrintClient, BackendError> {
        OctoPrintClient::from_parts(self.base_url, self.api_key, self.timeout)
    }
}

impl OctoPrintClient {
    pub fn builder(base_url: impl Into<String>) -> OctoPrintClientBuilder {
        OctoPrintClientBuilder::new(base_url)
    }

    fn from_parts(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        if api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(BackendError::Config("OctoPrint API key must not be blank"));
        }

        let mut parsed = Url::parse(base_url.trim()).map_err(|err| BackendError::Url(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BackendError::Config("OctoPrint URL must be http or https"));
        }
        if !parsed.path().ends_with('/') {
            let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
            parsed.set_path(&new_path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BackendError::Http)?;

        Ok(Self {
            http,
            base_url: parsed,
            api_key: api_key.map(|key| key.trim().to_string()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Push socket address: same host, `ws`/`wss` scheme, `sockjs/websocket`.
    pub fn socket_url(&self) -> Result<Url, BackendError> {
        let mut url = self
            .base_url
            .join(SOCKET_PATH)
            .map_err(|err| BackendError::Url(err.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| BackendError::Url(format!("cannot use {scheme} scheme for {url}")))?;
        Ok(url)
    }

    pub async fn passive_login(&self) -> Result<SocketAuth, BackendError> {
        let req = self.build_login_request()?;
        let (status, body) = self.execute(req).await?;
        parse_login_response(status, &body)
    }

    pub async fn fetch_connection_state(&self) -> Result<String, BackendError> {
        let req = self.build_connection_request()?;
        let (status, body) = self.execute(req).await?;
        parse_connection_response(status, &body)
    }

    pub async fn fetch_z_offset(&self) -> Result<ZOffset, BackendError> {
        let req = self.build_z_offset_request()?;
        let (status, body) = self.execute(req).await?;
        parse_z_offset_response(status, &body)
    }

    async fn execute(&self, req: Request) -> Result<(StatusCode, String), BackendError> {
        let resp = self.http.execute(req).await.map_err(BackendError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(BackendError::Http)?;
        Ok((status, body))
    }

    pub fn build_login_request(&self) -> Result<Request, BackendError> {
        let body = serde_json::to_vec(&LoginRequest { passive: true }).map_err(BackendError::Json)?;
        self.build_request_builder(Method::POST, "login")?
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(BackendError::Http)
    }

    pub fn build_connection_request(&self) -> Result<Request, BackendError> {
        self.build_request(Method::GET, "connection")
    }

    pub fn build_z_offset_request(&self) -> Result<Request, BackendError> {
        self.build_request(Method::GET, "plugin/z_probe_offset_universal")
    }

    fn build_request(&self, method: Method, path: &str) -> Result<Request, BackendError> {
        self.build_request_builder(method, path)?
            .build()
            .map_err(BackendError::Http)
    }

    fn build_request_builder(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, BackendError> {
        let url = self
            .base_url
            .join(&format!("api/{path}"))
            .map_err(|err| BackendError::Url(err.to_string()))?;
        let headers = self.common_headers()?;
        Ok(self.http.request(method, url).headers(headers))
    }

    fn common_headers(&self) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let mut value = HeaderValue::from_str(api_key).map_err(BackendError::InvalidHeaderValue)?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl SessionProvider for OctoPrintClient {
    async fn session_key(&self) -> Result<SocketAuth, BackendError> {
        self.passive_login().await
    }
}

#[async_trait]
impl PrinterBackend for OctoPrintClient {
    async fn connection_state(&self) -> Result<String, BackendError> {
        self.fetch_connection_state().await
    }

    async fn z_offset(&self) -> Result<ZOffset, BackendError> {
        self.fetch_z_offset().await
    }
}

#[derive(Debug, Clone, Serialize)]
struct LoginRequest {
    passive: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LoginResponse {
    name: String,
    session: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionResponse {
    current: ConnectionCurrent,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectionCurrent {
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ZOffsetResponse {
    z_offset: f64,
}

fn ensure_success(status: StatusCode, body: &str) -> Result<(), BackendError> {
    if status.is_success() {
        return Ok(());
    }
    Err(BackendError::Api {
        status,
        body: body.to_string(),
    })
}

pub fn parse_login_response(status: StatusCode, body: &str) -> Result<SocketAuth, BackendError> {
    ensure_success(status, body)?;
    let login: LoginResponse = serde_json::from_str(body).map_err(BackendError::Json)?;
    Ok(SocketAuth {
        user: login.name,
        session: login.session,
    })
}

pub fn parse_connection_response(status: StatusCode, body: &str) -> Result<String, BackendError> {
    ensure_success(status, body)?;
    let connection: ConnectionResponse = serde_json::from_str(body).map_err(BackendError::Json)?;
    Ok(connection.current.state)
}

/// Capability flags are unknown from this endpoint and stay unset.
pub fn parse_z_offset_response(status: StatusCode, body: &str) -> Result<ZOffset, BackendError> {
    ensure_success(status, body)?;
    let offset: ZOffsetResponse = serde_json::from_str(body).map_err(BackendError::Json)?;
    Ok(ZOffset {
        printer_cap: PrinterCapabilities::default(),
        z_offset: offset.z_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn client() -> OctoPrintClient {
        OctoPrintClient::builder("http://octopi.local:5000")
            .api_key("key-123")
            .build()
            .unwrap()
    }

    #[test]
    fn login_request_is_passive_post_with_api_key() {
        let req = client().build_login_request().unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "http://octopi.local:5000/api/login");
        assert_eq!(
            req.headers().get(API_KEY_HEADER).unwrap(),
            &HeaderValue::from_static("key-123")
        );
        assert_eq!(
            req.headers().get(CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/json")
        );

        let body = req.body().unwrap().as_bytes().unwrap();
        let json: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json, serde_json::json!({"passive": true}));
    }

    #[test]
    fn read_requests_hit_api_paths() {
        let client = client();
        let req = client.build_connection_request().unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().as_str(), "http://octopi.local:5000/api/connection");

        let req = client.build_z_offset_request().unwrap();
        assert_eq!(
            req.url().as_str(),
            "http://octopi.local:5000/api/plugin/z_probe_offset_universal"
        );
    }

    #[test]
    fn base_path_is_kept_behind_a_prefix() {
        let client = OctoPrintClient::builder("https://farm.example.test/printer1")
            .build()
            .unwrap();
        let req = client.build_connection_request().unwrap();
        assert_eq!(
            req.url().as_str(),
            "https://farm.example.test/printer1/api/connection"
        );
        assert!(req.headers().get(API_KEY_HEADER).is_none());
    }

    #[test]
    fn socket_url_swaps_scheme() {
        assert_eq!(
            client().socket_url().unwrap().as_str(),
            "ws://octopi.local:5000/sockjs/websocket"
        );
        let secure = OctoPrintClient::builder("https://farm.example.test/printer1/")
            .build()
            .unwrap();
        assert_eq!(
            secure.socket_url().unwrap().as_str(),
            "wss://farm.example.test/printer1/sockjs/websocket"
        );
    }

    #[test]
    fn rejects_bad_configuration() {
        let err = OctoPrintClient::builder("http://octopi.local")
            .api_key("   ")
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("API key"));
        assert!(OctoPrintClient::builder("ftp://octopi.local").build().is_err());
        assert!(OctoPrintClient::builder("not a url").build().is_err());
    }

    #[test]
    fn parse_login_reads_name_and_session() {
        let auth = parse_login_response(
            StatusCode::OK,
            r#"{"name":"_api","session":"abc123","admin":true,"active":true}"#,
        )
        .unwrap();
        assert_eq!(auth.user, "_api");
        assert_eq!(auth.session, "abc123");
    }

    #[test]
    fn parse_errors_keep_status_and_body() {
        let err = parse_login_response(StatusCode::FORBIDDEN, "Forbidden").unwrap_err();
        match err {
            BackendError::Api { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "Forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_connection_state() {
        let state = parse_connection_response(
            StatusCode::OK,
            r#"{"current":{"state":"Closed","port":null,"baudrate":null},"options":{}}"#,
        )
        .unwrap();
        assert_eq!(state, "Closed");
    }

    #[test]
    fn parse_z_offset_leaves_capabilities_unknown() {
        let offset = parse_z_offset_response(StatusCode::OK, r#"{"z_offset":-1.42}"#).unwrap();
        assert_eq!(offset.z_offset, -1.42);
        assert_eq!(offset.printer_cap, PrinterCapabilities::default());
        assert!(parse_z_offset_response(StatusCode::OK, "{}").is_err());
    }
}
