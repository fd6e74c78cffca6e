//! PCM buffers and the small conversions between pipeline stages.

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Signed 16-bit little-endian.
    Pcm16,
    /// 32-bit float little-endian, nominal range [-1, 1].
    PcmFloat32,
    /// Opaque codec packet.
    Codec,
}

/// An immutable, mono audio buffer tagged with its format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Bytes,
    pub sample_rate: u32,
    pub encoding: Encoding,
    pub channels: u16,
}

impl AudioChunk {
    pub fn pcm16(data: Bytes, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            encoding: Encoding::Pcm16,
            channels: 1,
        }
    }

    pub fn codec(data: Bytes, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            encoding: Encoding::Codec,
            channels: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Playback length. Codec packets carry no length the bridge can see.
    pub fn duration_ms(&self) -> Option<f64> {
        let width = match self.encoding {
            Encoding::Pcm16 => 2,
            Encoding::PcmFloat32 => 4,
            Encoding::Codec => return None,
        };
        if self.sample_rate == 0 {
            return None;
        }
        let samples = self.data.len() / (width * self.channels.max(1) as usize);
        Some(samples as f64 * 1000.0 / self.sample_rate as f64)
    }
}

/// Bytes in `ms` milliseconds of PCM16 mono at `sample_rate`.
pub fn pcm16_bytes_for(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as usize * ms as usize / 1000) * 2
}

pub fn silence(sample_rate: u32, ms: u32) -> Bytes {
    Bytes::from(vec![0u8; pcm16_bytes_for(sample_rate, ms)])
}

/// PCM16LE to float. A trailing odd byte is ignored.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Float to PCM16LE, clipping anything outside the i16 range.
/// Inverse of [`pcm16_to_f32`] for in-range samples.
pub fn f32_to_pcm16(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.freeze()
}

/// Keeps PCM16 chunks sample-aligned when a byte stream splits a sample
/// across reads.
#[derive(Debug, Default)]
pub struct SampleAligner {
    carry: Option<u8>,
}

impl SampleAligner {
    pub fn align(&mut self, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(data.len() + 1);
        if let Some(b) = self.carry.take() {
            buf.extend_from_slice(&[b]);
        }
        buf.extend_from_slice(data);
        if buf.len() % 2 == 1 {
            self.carry = buf.split_off(buf.len() - 1).first().copied();
        }
        buf.freeze()
    }

    pub fn has_carry(&self) -> bool {
        self.carry.is_some()
    }
}

/// Cuts a PCM16 stream into fixed-size frames for the provider.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_bytes: usize,
    min_tail_bytes: usize,
    pending: BytesMut,
}

impl FrameSlicer {
    /// 20 ms frames; on finish a remainder of at least 10 ms is padded out.
    pub fn provider(sample_rate: u32) -> Self {
        Self::new(pcm16_bytes_for(sample_rate, 20), pcm16_bytes_for(sample_rate, 10))
    }

    pub fn new(frame_bytes: usize, min_tail_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(2),
            min_tail_bytes,
            pending: BytesMut::new(),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_bytes);
        while self.pending.len() >= self.frame_bytes {
            frames.push(self.pending.split_to(self.frame_bytes).freeze());
        }
        frames
    }

    /// Flush the remainder. Returns `None` when it is too short to be worth sending.
    pub fn finish(&mut self) -> Option<Bytes> {
        let rest = self.pending.split();
        if rest.is_empty() || rest.len() < self.min_tail_bytes {
            return None;
        }
        let mut frame = rest;
        frame.resize(self.frame_bytes, 0);
        Some(frame.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_conversion_clips() {
        let pcm = f32_to_pcm16(&[0.0, 1.5, -2.0, 0.5]);
        let back: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(back, vec![0, 32767, -32768, 16384]);

        let floats = pcm16_to_f32(&[0x00, 0x80, 0xff, 0x7f, 0x01]);
        assert_eq!(floats.len(), 2);
        assert_eq!(floats[0], -1.0);
        assert!(floats[1] < 1.0 && floats[1] > 0.999);
        assert_eq!(f32_to_pcm16(&floats).as_ref(), &[0x00, 0x80, 0xff, 0x7f]);
    }

    #[test]
    fn durations() {
        let chunk = AudioChunk::pcm16(silence(8000, 20), 8000);
        assert_eq!(chunk.len(), 320);
        assert_eq!(chunk.duration_ms(), Some(20.0));
        assert_eq!(AudioChunk::codec(Bytes::from_static(b"x"), 24000).duration_ms(), None);
    }

    #[test]
    fn aligner_carries_odd_byte() {
        let mut aligner = SampleAligner::default();
        assert_eq!(aligner.align(&[1, 2, 3]).as_ref(), &[1, 2]);
        assert!(aligner.has_carry());
        assert_eq!(aligner.align(&[4]).as_ref(), &[3, 4]);
        assert!(!aligner.has_carry());
    }

    #[test]
    fn slicer_pads_long_tail_and_drops_short_one() {
        let mut slicer = FrameSlicer::provider(8000);
        assert_eq!(slicer.frame_bytes(), 320);
        let frames = slicer.push(&vec![1u8; 700]);
        assert_eq!(frames.len(), 2);
        // 60 bytes left, under the 160 byte minimum
        assert_eq!(slicer.finish(), None);

        let frames = slicer.push(&vec![1u8; 500]);
        assert_eq!(frames.len(), 1);
        let tail = slicer.finish().unwrap();
        assert_eq!(tail.len(), 320);
        assert!(tail[..180].iter().all(|&b| b == 1));
        assert!(tail[180..].iter().all(|&b| b == 0));
        assert_eq!(slicer.finish(), None);
    }
}
