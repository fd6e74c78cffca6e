//! Error taxonomy for the bridge and the close reasons reported to the provider.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine unreachable after {attempts} attempt(s): {last_error}")]
    EngineUnreachable { attempts: u32, last_error: String },

    #[error("engine handshake not received within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transcoding failed in {stage} after {failures} consecutive errors: {last_error}")]
    TranscodeFailed {
        stage: &'static str,
        failures: u32,
        last_error: String,
    },

    #[error("failed to send to engine: {0}")]
    EngineSendFailed(String),

    #[error("failed to send to provider: {0}")]
    ProviderSendFailed(String),

    #[error("{0} closed the connection")]
    RemoteDisconnect(Peer),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream transformer error: {0}")]
    Transformer(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// A fault inside the bridge's own media pipeline, as opposed to a peer
    /// going away. Sessions ending this way finish in `Failed`.
    pub fn is_pipeline_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::TranscodeFailed { .. }
                | BridgeError::Transformer(_)
                | BridgeError::Codec(_)
                | BridgeError::Io(_)
        )
    }
}

/// Which side of the bridge an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Provider,
    Engine,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Peer::Provider => write!(f, "provider"),
            Peer::Engine => write!(f, "engine"),
        }
    }
}

/// Reason sent to the provider in the WebSocket close frame, so operators can
/// tell initialization failures from an ordinary hangup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Shutdown,
    EngineConnectionFailed,
    EngineHandshakeTimeout,
    EngineDisconnected,
    TranscodeFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Shutdown => "shutdown",
            CloseReason::EngineConnectionFailed => "engine_connection_failed",
            CloseReason::EngineHandshakeTimeout => "engine_handshake_timeout",
            CloseReason::EngineDisconnected => "engine_disconnected",
            CloseReason::TranscodeFailed => "transcode_failed",
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::Normal => CloseCode::Normal,
            CloseReason::Shutdown => CloseCode::Away,
            _ => CloseCode::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.close_code() == CloseCode::Error
    }
}

impl From<&BridgeError> for CloseReason {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::EngineUnreachable { .. } => CloseReason::EngineConnectionFailed,
            BridgeError::HandshakeTimeout(_) => CloseReason::EngineHandshakeTimeout,
            BridgeError::TranscodeFailed { .. } => CloseReason::TranscodeFailed,
            BridgeError::RemoteDisconnect(Peer::Provider) => CloseReason::Normal,
            BridgeError::RemoteDisconnect(Peer::Engine)
            | BridgeError::EngineSendFailed(_)
            | BridgeError::WebSocket(_) => CloseReason::EngineDisconnected,
            BridgeError::ProviderSendFailed(_) => CloseReason::Normal,
            BridgeError::Cancelled => CloseReason::Shutdown,
            _ => CloseReason::TranscodeFailed,
        }
    }
}
