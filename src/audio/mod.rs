//! audio - PCM helpers, the engine codec, and the sample-rate transformer

pub mod codec;
pub mod ogg_opus;
pub mod opus_codec;
pub mod pcm;
pub mod resampler;

pub use codec::{AudioDecoder, AudioEncoder, CodecFactory, SharedCodec};
pub use opus_codec::OpusCodecFactory;
pub use pcm::{AudioChunk, Encoding};
