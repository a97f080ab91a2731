use reqwest::StatusCode;
use thiserror::Error;

/// A socket frame that could not be turned into a protocol message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("config error: {0}")]
    Config(&'static str),
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("api error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket connect failed: {0}")]
    Connect(String),
    #[error("socket send failed: {0}")]
    Send(String),
    #[error("socket transport error: {0}")]
    Transport(String),
    #[error("socket closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error of the bridge process.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("connection was superseded or dropped before the handshake completed")]
    ConnectionAborted,
}
