//! Codec traits for the engine side of the bridge.
//!
//! Implementations own their framing: the encoder accepts arbitrary-length
//! float input and emits zero or more whole packets, buffering the rest until
//! the next call or [`AudioEncoder::flush`].

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

/// Streaming encoder, float32 mono in, codec packets out.
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<Bytes>>;

    /// Pad any buffered partial frame with silence and emit it.
    fn flush(&mut self) -> Result<Vec<Bytes>>;
}

/// Streaming decoder, one codec packet in, float32 mono out.
pub trait AudioDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>>;
}

/// Builds a fresh codec state per session and direction.
pub trait CodecFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn encoder(&self, sample_rate: u32) -> Result<Box<dyn AudioEncoder>>;
    fn decoder(&self, sample_rate: u32) -> Result<Box<dyn AudioDecoder>>;
}

pub type SharedCodec = Arc<dyn CodecFactory>;
