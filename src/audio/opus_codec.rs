//! Opus encoder/decoder for the engine link.
//!
//! - Encoder: float32 mono → fixed-duration frames → one Opus packet per frame
//! - Decoder: one Opus packet → float32 mono
//!
//! The engine speaks Ogg Opus, so the factory wraps both in the Ogg framing
//! from [`super::ogg_opus`].

use anyhow::{Result, bail};
use bytes::Bytes;

use super::codec::{AudioDecoder, AudioEncoder, CodecFactory};
use super::ogg_opus::{OggOpusDecoder, OggOpusEncoder};

/// Largest packet libopus will produce for one frame.
const MAX_PACKET_BYTES: usize = 4000;

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl OpusEncoder {
    /// * `sample_rate` - Opus codec sample rate (e.g. 24000)
    /// * `frame_ms`    - Frame duration in ms (e.g. 20)
    /// * `bitrate`     - Bitrate in bits/s (e.g. 24000)
    pub fn new(sample_rate: u32, frame_ms: u32, bitrate: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;

        let frame_samples = (sample_rate * frame_ms / 1000) as usize;
        if frame_samples == 0 {
            bail!("frame of {}ms at {}Hz holds no samples", frame_ms, sample_rate);
        }

        Ok(Self {
            encoder,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        })
    }

    /// Number of samples in one encoded frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    fn drain_frames(&mut self) -> Result<Vec<Bytes>> {
        let mut packets = Vec::with_capacity(self.pending.len() / self.frame_samples);
        let mut offset = 0;
        while self.pending.len() - offset >= self.frame_samples {
            let frame = &self.pending[offset..offset + self.frame_samples];
            let packet = self.encoder.encode_vec_float(frame, MAX_PACKET_BYTES)?;
            packets.push(Bytes::from(packet));
            offset += self.frame_samples;
        }
        self.pending.drain(..offset);
        Ok(packets)
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<Bytes>> {
        self.pending.extend_from_slice(pcm);
        self.drain_frames()
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let padded = self.pending.len().div_ceil(self.frame_samples) * self.frame_samples;
        self.pending.resize(padded, 0.0);
        self.drain_frames()
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    max_frame_samples: usize,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)?;
        Ok(Self {
            decoder,
            // 120 ms is the longest packet Opus allows
            max_frame_samples: (sample_rate as usize * 120) / 1000,
        })
    }
}

impl AudioDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        if packet.is_empty() {
            bail!("empty opus packet");
        }
        let mut pcm = vec![0f32; self.max_frame_samples];
        let decoded = self.decoder.decode_float(packet, &mut pcm, false)?;
        pcm.truncate(decoded);
        Ok(pcm)
    }
}

// ======================== Factory ========================

#[derive(Debug, Clone)]
pub struct OpusCodecFactory {
    pub frame_ms: u32,
    pub bitrate: i32,
}

impl CodecFactory for OpusCodecFactory {
    fn name(&self) -> &'static str {
        "ogg-opus"
    }

    fn encoder(&self, sample_rate: u32) -> Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(OggOpusEncoder::new(sample_rate, self.frame_ms, self.bitrate)?))
    }

    fn decoder(&self, sample_rate: u32) -> Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(OggOpusDecoder::new(sample_rate)?))
    }
}
