//! Ogg Opus stream framing for the engine link.
//!
//! The engine reads and writes one continuous Ogg Opus stream per call, cut
//! into arbitrary chunks across 0x01 frames. The muxer emits the OpusHead and
//! OpusTags header pages first and then one page per Opus packet. The demuxer
//! keeps a page buffer across chunks, resyncs on the `OggS` capture pattern
//! and decodes every audio packet it extracts.

use anyhow::{Result, bail};
use bytes::{Buf, Bytes, BytesMut};
use ogg::reading::{BasePacketReader, OggPage, PageParser};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use tracing::{debug, warn};

use super::codec::{AudioDecoder, AudioEncoder};
use super::opus_codec::{OpusDecoder, OpusEncoder};

/// Ogg granule positions for Opus always count 48 kHz samples.
const GRANULE_RATE: u64 = 48_000;
/// Encoder delay libopus reports, in 48 kHz samples.
const PRE_SKIP: u16 = 312;
const VENDOR: &str = concat!("call_bridge ", env!("CARGO_PKG_VERSION"));

const CAPTURE: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;
const OPUS_HEAD: &[u8; 8] = b"OpusHead";
const OPUS_TAGS: &[u8; 8] = b"OpusTags";

fn opus_head(sample_rate: u32) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(OPUS_HEAD);
    head.push(1); // version
    head.push(1); // mono
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&sample_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(OPUS_TAGS);
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes()); // no user comments
    tags
}

// ======================== Muxer ========================

pub struct OggOpusEncoder {
    opus: OpusEncoder,
    pages: PacketWriter<'static, Vec<u8>>,
    serial: u32,
    sample_rate: u32,
    granule: u64,
    granule_step: u64,
    headers_sent: bool,
}

impl OggOpusEncoder {
    pub fn new(sample_rate: u32, frame_ms: u32, bitrate: i32) -> Result<Self> {
        let opus = OpusEncoder::new(sample_rate, frame_ms, bitrate)?;
        let granule_step = opus.frame_samples() as u64 * GRANULE_RATE / sample_rate as u64;
        Ok(Self {
            opus,
            pages: PacketWriter::new(Vec::new()),
            serial: uuid::Uuid::new_v4().as_u128() as u32,
            sample_rate,
            granule: 0,
            granule_step,
            headers_sent: false,
        })
    }

    fn write(&mut self, packet: Vec<u8>, end: PacketWriteEndInfo, granule: u64) -> Result<Bytes> {
        self.pages.write_packet(packet, self.serial, end, granule)?;
        Ok(Bytes::from(std::mem::take(self.pages.inner_mut())))
    }

    fn headers(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        self.headers_sent = true;
        out.push(self.write(opus_head(self.sample_rate), PacketWriteEndInfo::EndPage, 0)?);
        out.push(self.write(opus_tags(), PacketWriteEndInfo::EndPage, 0)?);
        debug!(serial = self.serial, "ogg opus headers written");
        Ok(())
    }

    /// One page per packet; with `end_stream` the last page closes the stream.
    fn mux(&mut self, packets: Vec<Bytes>, end_stream: bool, out: &mut Vec<Bytes>) -> Result<()> {
        let count = packets.len();
        for (i, packet) in packets.into_iter().enumerate() {
            self.granule += self.granule_step;
            let end = if end_stream && i + 1 == count {
                PacketWriteEndInfo::EndStream
            } else {
                PacketWriteEndInfo::EndPage
            };
            out.push(self.write(packet.to_vec(), end, self.granule)?);
        }
        Ok(())
    }
}

impl AudioEncoder for OggOpusEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        self.headers(&mut out)?;
        let packets = self.opus.encode(pcm)?;
        self.mux(packets, false, &mut out)?;
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        self.headers(&mut out)?;
        let packets = self.opus.flush()?;
        self.mux(packets, true, &mut out)?;
        Ok(out)
    }
}

// ======================== Demuxer ========================

pub struct OggOpusDecoder {
    opus: OpusDecoder,
    sample_rate: u32,
    buf: BytesMut,
    packets: BasePacketReader,
    /// Output samples still to be discarded at the start of the stream.
    skip: usize,
}

impl OggOpusDecoder {
    pub fn new(sample_rate: u32) -> Result<Self> {
        Ok(Self {
            opus: OpusDecoder::new(sample_rate)?,
            sample_rate,
            buf: BytesMut::new(),
            packets: BasePacketReader::new(),
            skip: 0,
        })
    }

    /// Cut the next complete page off the buffer. Bytes that cannot start a
    /// page are dropped and added to `discarded`.
    fn next_page(&mut self, discarded: &mut usize) -> Option<OggPage> {
        loop {
            match self.buf.windows(CAPTURE.len()).position(|w| w == CAPTURE) {
                Some(0) => {}
                Some(offset) => {
                    *discarded += offset;
                    self.buf.advance(offset);
                }
                None => {
                    // keep a possible partial capture pattern
                    let keep = self.buf.len().min(CAPTURE.len() - 1);
                    let drop = self.buf.len() - keep;
                    *discarded += drop;
                    self.buf.advance(drop);
                    return None;
                }
            }

            if self.buf.len() < PAGE_HEADER_LEN {
                return None;
            }
            let segments = self.buf[PAGE_HEADER_LEN - 1] as usize;
            let header_len = PAGE_HEADER_LEN + segments;
            if self.buf.len() < header_len {
                return None;
            }
            let body_len: usize = self.buf[PAGE_HEADER_LEN..header_len]
                .iter()
                .map(|&b| b as usize)
                .sum();
            if self.buf.len() < header_len + body_len {
                return None;
            }

            let mut header = [0u8; PAGE_HEADER_LEN];
            header.copy_from_slice(&self.buf[..PAGE_HEADER_LEN]);
            let parsed = PageParser::new(header).and_then(|(mut parser, _)| {
                parser.parse_segments(self.buf[PAGE_HEADER_LEN..header_len].to_vec());
                parser.parse_packet_data(self.buf[header_len..header_len + body_len].to_vec())
            });
            match parsed {
                Ok(page) => {
                    self.buf.advance(header_len + body_len);
                    return Some(page);
                }
                Err(e) => {
                    warn!("dropping corrupt ogg page: {}", e);
                    *discarded += CAPTURE.len();
                    self.buf.advance(CAPTURE.len());
                }
            }
        }
    }

    fn decode_packet(&mut self, packet: &[u8], out: &mut Vec<f32>) -> Result<()> {
        if packet.starts_with(OPUS_HEAD) {
            if packet.len() < 12 {
                bail!("truncated OpusHead ({} bytes)", packet.len());
            }
            let pre_skip = u16::from_le_bytes([packet[10], packet[11]]) as u64;
            self.skip = (pre_skip * self.sample_rate as u64 / GRANULE_RATE) as usize;
            debug!(pre_skip, skip = self.skip, "ogg opus stream started");
            return Ok(());
        }
        if packet.starts_with(OPUS_TAGS) {
            return Ok(());
        }

        let mut pcm = self.opus.decode(packet)?;
        if self.skip > 0 {
            let n = self.skip.min(pcm.len());
            pcm.drain(..n);
            self.skip -= n;
        }
        out.extend_from_slice(&pcm);
        Ok(())
    }
}

impl AudioDecoder for OggOpusDecoder {
    /// Accepts any slice of the Ogg stream; returns the audio of every packet
    /// completed by it, possibly none.
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut discarded = 0;
        let mut packets = 0;
        while let Some(page) = self.next_page(&mut discarded) {
            self.packets.push_page(page)?;
            while let Some(packet) = self.packets.read_packet() {
                packets += 1;
                self.decode_packet(&packet.data, &mut out)?;
            }
        }
        if discarded > 0 && packets == 0 {
            bail!("{} bytes of non-Ogg data on the engine audio stream", discarded);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples: usize, rate: u32) -> Vec<f32> {
        (0..samples)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.3)
            .collect()
    }

    fn stream(frames: usize) -> Vec<Bytes> {
        let mut enc = OggOpusEncoder::new(24000, 20, 24000).unwrap();
        let mut out = enc.encode(&tone(frames * 480, 24000)).unwrap();
        out.extend(enc.flush().unwrap());
        out
    }

    #[test]
    fn stream_opens_with_header_pages() {
        let chunks = stream(2);
        // OpusHead, OpusTags, one page per packet
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert!(chunk.starts_with(CAPTURE));
        }
        // one lacing byte, so the packet starts right after the header
        assert_eq!(&chunks[0][PAGE_HEADER_LEN + 1..PAGE_HEADER_LEN + 9], OPUS_HEAD);
        assert_eq!(chunks[0][5] & 0x02, 0x02, "first page carries BOS");
        assert_eq!(&chunks[1][PAGE_HEADER_LEN + 1..PAGE_HEADER_LEN + 9], OPUS_TAGS);
    }

    #[test]
    fn flush_marks_end_of_stream() {
        let mut enc = OggOpusEncoder::new(24000, 20, 24000).unwrap();
        let first = enc.encode(&tone(600, 24000)).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[2][5] & 0x04, 0);

        let last = enc.flush().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0][5] & 0x04, 0x04, "final page carries EOS");
    }

    #[test]
    fn round_trip_through_arbitrary_chunking() {
        let bytes: Vec<u8> = stream(3).concat();
        let mut dec = OggOpusDecoder::new(24000).unwrap();

        let mut pcm = Vec::new();
        for piece in bytes.chunks(7) {
            pcm.extend(dec.decode(piece).unwrap());
        }
        // three 20 ms packets minus the encoder delay
        assert_eq!(pcm.len(), 3 * 480 - 156);
        assert!(pcm.iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn garbage_is_reported_then_stream_recovers() {
        let mut dec = OggOpusDecoder::new(24000).unwrap();
        assert!(dec.decode(b"definitely not an ogg stream").is_err());

        let bytes: Vec<u8> = stream(2).concat();
        let pcm = dec.decode(&bytes).unwrap();
        assert_eq!(pcm.len(), 2 * 480 - 156);
    }

    #[test]
    fn corrupt_page_is_dropped_and_later_pages_decode() {
        let chunks = stream(3);
        let mut damaged = chunks[3].to_vec();
        let last = damaged.len() - 1;
        damaged[last] ^= 0xff;

        let mut dec = OggOpusDecoder::new(24000).unwrap();
        let mut pcm = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk: &[u8] = if i == 3 { &damaged } else { chunk };
            if let Ok(samples) = dec.decode(chunk) {
                pcm.extend(samples);
            }
        }
        // packets 1 and 3 survive; only the first pays the pre-skip
        assert_eq!(pcm.len(), 2 * 480 - 156);
    }
}
