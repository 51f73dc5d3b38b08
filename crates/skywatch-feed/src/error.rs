use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request {request_type} timed out after {timeout_ms}ms")]
    Timeout {
        request_type: String,
        timeout_ms: u64,
    },
    #[error("feed connection closed")]
    Disconnected,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("invalid feed url: {0}")]
    InvalidUrl(String),
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
