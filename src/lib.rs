//! Bridges telephony media streams (JSON + base64 PCM16 over WebSocket) to a
//! full-duplex speech engine speaking tagged binary Opus frames.

pub mod audio;
pub mod config;
pub mod engine_link;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod provider_link;
pub mod queue;
pub mod session;
pub mod text_sink;
pub mod ws;

pub use config::BridgeConfig;
pub use error::{BridgeError, CloseReason};
pub use listener::Listener;
