use thiserror::Error;

/// Failures talking to the arbitration oracle. Parse trouble is absorbed by
/// the arbitration client itself; these surface to the tick loop's error
/// counter instead.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("oracle response contained no text")]
    EmptyResponse,
}

/// Failures on the upstream audio session. None of these abort playback for
/// a room; callers log and continue on the prior configuration.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("upstream websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid upstream frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("upstream session closed")]
    SessionClosed,
}
