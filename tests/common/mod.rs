#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use call_bridge::audio::pcm;
use call_bridge::audio::{AudioDecoder, AudioEncoder, CodecFactory};
use call_bridge::protocol::{EngineFrame, ProviderFrame, decode_provider_frame, encode_media};
use call_bridge::text_sink::LogTextSink;
use call_bridge::{BridgeConfig, Listener};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Codec whose packets are the PCM16LE bytes themselves, so tests can compare
/// audio end to end byte for byte.
pub struct PcmCodec;

struct PcmEncoder;
struct PcmDecoder;

impl AudioEncoder for PcmEncoder {
    fn encode(&mut self, samples: &[f32]) -> anyhow::Result<Vec<Bytes>> {
        Ok(vec![pcm::f32_to_pcm16(samples)])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<Bytes>> {
        Ok(Vec::new())
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(packet.len() % 2 == 0, "odd packet length {}", packet.len());
        Ok(pcm::pcm16_to_f32(packet))
    }
}

impl CodecFactory for PcmCodec {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn encoder(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(PcmEncoder))
    }

    fn decoder(&self, _sample_rate: u32) -> anyhow::Result<Box<dyn AudioDecoder>> {
        Ok(Box::new(PcmDecoder))
    }
}

/// Loopback config: `cat` as the transformer, equal rates on both sides,
/// no keepalive or heartbeat noise, short timeouts.
pub fn test_config(engine_url: &str) -> BridgeConfig {
    BridgeConfig {
        engine_url: engine_url.to_string(),
        bridge_host: "127.0.0.1".to_string(),
        bridge_port: 0,
        engine_connect_timeout_secs: 1.0,
        engine_connect_attempts: 2,
        engine_retry_base_ms: 20,
        engine_retry_cap_ms: 50,
        handshake_timeout_secs: 2.0,
        keepalive_secs: 0.0,
        heartbeat_secs: 0.0,
        model_sample_rate: 8000,
        provider_sample_rate: 8000,
        resampler_program: "cat".to_string(),
        resampler_args: String::new(),
        stop_silence_tail_ms: 0,
        queue_capacity: 64,
        pre_stream_buffer_frames: 32,
        ..BridgeConfig::default()
    }
}

pub struct Bridge {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: tokio::task::JoinHandle<()>,
}

impl Bridge {
    pub async fn start(config: BridgeConfig) -> Self {
        let listener = Listener::bind(config, Arc::new(PcmCodec), Arc::new(LogTextSink))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            listener.run(token).await.unwrap();
        });
        Self {
            addr,
            shutdown,
            task,
        }
    }

    pub async fn provider(&self) -> Provider {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/media", self.addr))
            .await
            .unwrap();
        Provider { ws }
    }
}

// ======================== Provider side ========================

pub struct Provider {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// What the bridge sent to the provider, in order.
#[derive(Debug)]
pub enum ProviderEvent {
    Media { pcm: Bytes, stream_sid: Option<String> },
    Closed { reason: String },
}

impl Provider {
    pub async fn send_media(&mut self, pcm: &[u8]) {
        self.ws.send(Message::text(encode_media(pcm, None))).await.unwrap();
    }

    pub async fn send_event(&mut self, json: &str) {
        self.ws.send(Message::text(json.to_string())).await.unwrap();
    }

    pub async fn start(&mut self, stream_sid: &str) {
        let json = format!(r#"{{"event":"start","start":{{"stream_sid":"{stream_sid}"}}}}"#);
        self.send_event(&json).await;
    }

    pub async fn stop(&mut self) {
        self.send_event(r#"{"event":"stop"}"#).await;
    }

    /// Next media frame or close frame; `None` if the stream ended without either.
    pub async fn next_event(&mut self) -> Option<ProviderEvent> {
        loop {
            let msg = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("bridge went silent")?;
            match msg {
                Ok(Message::Text(text)) => {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    let stream_sid = value["stream_sid"].as_str().map(str::to_string);
                    match decode_provider_frame(text.as_str()).unwrap() {
                        ProviderFrame::Media(pcm) => {
                            return Some(ProviderEvent::Media { pcm, stream_sid });
                        }
                        other => panic!("unexpected provider frame {:?}", other),
                    }
                }
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                    return Some(ProviderEvent::Closed { reason });
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Skip media until the close frame and return its reason.
    pub async fn close_reason(&mut self) -> String {
        loop {
            match self.next_event().await {
                Some(ProviderEvent::Closed { reason }) => return reason,
                Some(ProviderEvent::Media { .. }) => continue,
                None => panic!("provider socket ended without a close frame"),
            }
        }
    }
}

// ======================== Engine side ========================

/// A speech engine stand-in. Every accepted connection is handed to the test.
pub struct FakeEngine {
    pub url: String,
    conns: mpsc::UnboundedReceiver<EngineConn>,
}

pub struct EngineConn {
    pub ws: WebSocketStream<TcpStream>,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = tx.send(EngineConn { ws });
                    }
                });
            }
        });
        Self {
            url: format!("ws://{addr}/api/chat"),
            conns,
        }
    }

    pub async fn accept(&mut self) -> EngineConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("bridge never dialed the engine")
            .expect("engine listener gone")
    }
}

/// A `ws://` URL nothing is listening on.
pub async fn dead_engine_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/api/chat")
}

impl EngineConn {
    pub async fn handshake(&mut self) {
        self.send(EngineFrame::Handshake).await;
    }

    pub async fn send_audio(&mut self, pcm: &[u8]) {
        self.send(EngineFrame::Audio(Bytes::copy_from_slice(pcm))).await;
    }

    pub async fn send(&mut self, frame: EngineFrame) {
        self.ws.send(Message::Binary(frame.encode())).await.unwrap();
    }

    /// Next frame from the bridge, `None` once the connection is gone.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<EngineFrame> {
        loop {
            let msg = tokio::time::timeout(wait, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Binary(data)) => return Some(EngineFrame::decode(&data).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Collect audio payload bytes until `len` have arrived.
    pub async fn audio_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match self.next_frame(WAIT).await {
                Some(EngineFrame::Audio(p)) => out.extend_from_slice(&p),
                Some(_) => {}
                None => panic!("engine link ended after {} of {} bytes", out.len(), len),
            }
        }
        out
    }
}

/// Distinct 20 ms frames (160 samples at 8 kHz) so reordering shows up.
pub fn numbered_frames(count: u16) -> Vec<Vec<u8>> {
    (0..count)
        .map(|seq| std::iter::repeat_n((seq + 1).to_le_bytes(), 160).flatten().collect())
        .collect()
}
