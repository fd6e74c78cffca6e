//! Wire formats on both sides of the bridge.
//!
//! - Provider: JSON text frames keyed by `event`, audio as base64 PCM16LE.
//! - Engine: binary frames whose first byte is a type tag.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const TAG_HANDSHAKE: u8 = 0x00;
pub const TAG_AUDIO: u8 = 0x01;
pub const TAG_TEXT: u8 = 0x02;

// ======================== Engine frames ========================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFrame {
    /// Sent once by the engine when ready, then periodically by both sides.
    Handshake,
    /// Codec payload.
    Audio(Bytes),
    /// UTF-8 text tokens.
    Text(Bytes),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty engine frame")]
    Empty,
    #[error("unknown engine frame tag 0x{0:02x}")]
    UnknownTag(u8),
}

impl EngineFrame {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (&tag, payload) = data.split_first().ok_or(FrameError::Empty)?;
        match tag {
            TAG_HANDSHAKE => Ok(EngineFrame::Handshake),
            TAG_AUDIO => Ok(EngineFrame::Audio(Bytes::copy_from_slice(payload))),
            TAG_TEXT => Ok(EngineFrame::Text(Bytes::copy_from_slice(payload))),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            EngineFrame::Handshake => Bytes::from_static(&[TAG_HANDSHAKE]),
            EngineFrame::Audio(payload) => tagged(TAG_AUDIO, payload),
            EngineFrame::Text(payload) => tagged(TAG_TEXT, payload),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineFrame::Handshake => "handshake",
            EngineFrame::Audio(_) => "audio",
            EngineFrame::Text(_) => "text",
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}

// ======================== Provider frames ========================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFrame {
    /// Decoded PCM16LE bytes at the provider rate.
    Media(Bytes),
    Start { stream_sid: Option<String> },
    Stop,
    Mark(Option<String>),
}

#[derive(Debug, Error)]
pub enum ProviderFrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("media event without payload")]
    MissingPayload,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unhandled event type: {0}")]
    UnknownEvent(String),
}

/// Raw envelope. Providers add fields freely, so everything but `event` is optional.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    media: Option<MediaBody>,
    #[serde(default)]
    mark: Option<MarkBody>,
    #[serde(default)]
    stream_sid: Option<String>,
    #[serde(default)]
    start: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct MediaBody {
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct OutboundMedia<'a> {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_sid: Option<&'a str>,
    media: OutboundPayload,
}

#[derive(Serialize)]
struct OutboundPayload {
    payload: String,
}

pub fn decode_provider_frame(text: &str) -> Result<ProviderFrame, ProviderFrameError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.event.as_str() {
        "media" => {
            let payload = envelope
                .media
                .and_then(|m| m.payload)
                .filter(|p| !p.is_empty())
                .ok_or(ProviderFrameError::MissingPayload)?;
            Ok(ProviderFrame::Media(Bytes::from(BASE64.decode(payload)?)))
        }
        "start" => {
            // Some providers nest the stream id inside the start body.
            let nested = envelope
                .start
                .as_ref()
                .and_then(|s| s.get("stream_sid"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(ProviderFrame::Start {
                stream_sid: envelope.stream_sid.or(nested),
            })
        }
        "stop" => Ok(ProviderFrame::Stop),
        "mark" => Ok(ProviderFrame::Mark(envelope.mark.and_then(|m| m.name))),
        other => Err(ProviderFrameError::UnknownEvent(other.to_string())),
    }
}

/// Build an outbound `media` text frame for raw PCM16LE bytes.
pub fn encode_media(pcm: &[u8], stream_sid: Option<&str>) -> String {
    let frame = OutboundMedia {
        event: "media",
        stream_sid,
        media: OutboundPayload {
            payload: BASE64.encode(pcm),
        },
    };
    // Serializing plain strings cannot fail.
    serde_json::to_string(&frame).unwrap_or_default()
}
