//! Client error type.

use frames::document::DocError;
use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The grant or the socket upgrade was refused. Never retried.
    #[error("room access refused: {0}")]
    Unauthorized(String),
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("grant request failed with HTTP {0}")]
    GrantFailed(u16),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("timed out waiting for websocket frame")]
    Timeout,
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Doc(#[from] DocError),
}

impl ClientError {
    /// Map a failed upgrade onto `Unauthorized` when the server refused the ticket.
    pub(crate) fn from_ws(error: tungstenite::Error) -> Self {
        if let tungstenite::Error::Http(response) = &error {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                return Self::Unauthorized(format!("websocket upgrade rejected with HTTP {status}"));
            }
        }
        Self::WsConnect(Box::new(error))
    }

    /// Whether reconnecting could ever succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::InvalidBaseUrl(_))
    }
}
