use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine_link::RetryPolicy;
use crate::error::{BridgeError, Result};
use crate::session::drain::DrainPolicy;

/// Sample rates libopus accepts.
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

const DEFAULT_RESAMPLER_ARGS: &str = "-hide_banner -loglevel error \
     -f s16le -ar {in_rate} -ac 1 -i pipe:0 \
     -f s16le -ar {out_rate} -ac 1 -flush_packets 1 pipe:1";

/// Runtime configuration. Every field can be overridden by the environment
/// variable of the same name in upper case (`ENGINE_URL`, `DRAIN_SECS`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    // Engine
    pub engine_url: String,
    pub voice_prompt: String,
    pub text_prompt: String,
    pub engine_connect_timeout_secs: f64,
    pub engine_connect_attempts: u32,
    pub engine_retry_base_ms: u64,
    pub engine_retry_multiplier: f64,
    pub engine_retry_cap_ms: u64,
    pub handshake_timeout_secs: f64,
    pub keepalive_secs: f64,

    // Listener
    pub bridge_host: String,
    pub bridge_port: u16,

    // Audio
    pub model_sample_rate: u32,
    pub provider_sample_rate: u32,
    pub opus_bitrate: i32,
    pub codec_frame_ms: u32,
    pub resampler_program: String,
    pub resampler_args: String,

    // Session behaviour
    pub queue_capacity: usize,
    pub pre_stream_buffer_frames: usize,
    pub stop_silence_tail_ms: u32,
    pub heartbeat_secs: f64,

    // Post-STOP drain, off by default so the wire behaviour is unchanged
    pub drain_after_stop: bool,
    pub drain_secs: f64,
    pub drain_idle_ms: u64,
    pub send_silence_when_idle: bool,
    pub silence_idle_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine_url: "wss://127.0.0.1:8998/api/chat".to_string(),
            voice_prompt: "NATF0.pt".to_string(),
            text_prompt: "You enjoy having a good conversation.".to_string(),
            engine_connect_timeout_secs: 10.0,
            engine_connect_attempts: 5,
            engine_retry_base_ms: 1000,
            engine_retry_multiplier: 2.0,
            engine_retry_cap_ms: 8000,
            handshake_timeout_secs: 15.0,
            keepalive_secs: 2.0,

            bridge_host: "0.0.0.0".to_string(),
            bridge_port: 5050,

            model_sample_rate: 24000,
            provider_sample_rate: 8000,
            opus_bitrate: 24000,
            codec_frame_ms: 20,
            resampler_program: "ffmpeg".to_string(),
            resampler_args: DEFAULT_RESAMPLER_ARGS.to_string(),

            queue_capacity: 500,
            pre_stream_buffer_frames: 250,
            stop_silence_tail_ms: 500,
            heartbeat_secs: 5.0,

            drain_after_stop: false,
            drain_secs: 8.0,
            drain_idle_ms: 500,
            send_silence_when_idle: false,
            silence_idle_ms: 200,
        }
    }
}

impl BridgeConfig {
    /// Load defaults, then `bridge.toml` if present, then the process environment.
    pub fn load() -> Result<Self> {
        Self::from_sources(Some("bridge"), std::env::vars().collect())
    }

    /// Build a config from an optional file stem and an explicit variable map.
    pub fn from_sources(file: Option<&str>, vars: HashMap<String, String>) -> Result<Self> {
        // Only forward recognised keys so unrelated variables (PATH, HOME, ...)
        // never reach the deserializer.
        let known = Self::known_keys()?;
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| known.contains(&k.to_lowercase()))
            .collect();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(config_err)?);
        if let Some(stem) = file {
            builder = builder.add_source(config::File::with_name(stem).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .source(Some(vars)),
            )
            .build()
            .map_err(config_err)?;

        let config: Self = settings.try_deserialize().map_err(config_err)?;
        config.validate()?;
        Ok(config)
    }

    fn known_keys() -> Result<Vec<String>> {
        let value = serde_json::to_value(Self::default())
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        Ok(value
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge_port == 0 {
            return Err(BridgeError::Config("bridge_port cannot be 0".into()));
        }
        if self.provider_sample_rate == 0 {
            return Err(BridgeError::Config("provider_sample_rate cannot be 0".into()));
        }
        if !OPUS_RATES.contains(&self.model_sample_rate) {
            return Err(BridgeError::Config(format!(
                "model_sample_rate {} is not an Opus rate ({:?})",
                self.model_sample_rate, OPUS_RATES
            )));
        }
        if ![10, 20, 40, 60].contains(&self.codec_frame_ms) {
            return Err(BridgeError::Config(format!(
                "codec_frame_ms {} must be one of 10/20/40/60",
                self.codec_frame_ms
            )));
        }
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config("queue_capacity must be greater than 0".into()));
        }
        if self.engine_connect_attempts == 0 {
            return Err(BridgeError::Config(
                "engine_connect_attempts must be greater than 0".into(),
            ));
        }
        if self.resampler_program.trim().is_empty() {
            return Err(BridgeError::Config("resampler_program cannot be empty".into()));
        }
        self.engine_endpoint()?;
        Ok(())
    }

    /// Engine URL with the persona voice and text prompt appended to the query.
    pub fn engine_endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.engine_url)
            .map_err(|e| BridgeError::Config(format!("engine_url {}: {}", self.engine_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(BridgeError::Config(format!(
                "engine_url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut()
            .append_pair("voice_prompt", &self.voice_prompt)
            .append_pair("text_prompt", &self.text_prompt);
        Ok(url)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bridge_host, self.bridge_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.engine_connect_attempts,
            base_delay: Duration::from_millis(self.engine_retry_base_ms),
            multiplier: self.engine_retry_multiplier,
            max_delay: Duration::from_millis(self.engine_retry_cap_ms),
        }
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        DrainPolicy {
            enabled: self.drain_after_stop,
            budget: secs(self.drain_secs),
            idle_window: Duration::from_millis(self.drain_idle_ms),
            silence_keepalive: self.send_silence_when_idle,
            silence_idle_threshold: Duration::from_millis(self.silence_idle_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.engine_connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }

    /// `None` disables the keepalive task.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        positive_secs(self.keepalive_secs)
    }

    /// `None` disables the heartbeat log.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        positive_secs(self.heartbeat_secs)
    }

    /// Resampler argv for one direction with the rate placeholders filled in.
    pub fn resampler_argv(&self, in_rate: u32, out_rate: u32) -> Vec<String> {
        self.resampler_args
            .split_whitespace()
            .map(|arg| {
                arg.replace("{in_rate}", &in_rate.to_string())
                    .replace("{out_rate}", &out_rate.to_string())
            })
            .collect()
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn positive_secs(value: f64) -> Option<Duration> {
    (value > 0.0).then(|| Duration::from_secs_f64(value))
}

fn config_err(e: config::ConfigError) -> BridgeError {
    BridgeError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_keep_drain_disabled() {
        let config = BridgeConfig::from_sources(None, HashMap::new()).unwrap();
        assert!(!config.drain_after_stop);
        assert!(!config.send_silence_when_idle);
        assert_eq!(config.bridge_port, 5050);
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = BridgeConfig::from_sources(
            None,
            vars(&[
                ("ENGINE_URL", "ws://engine.local:9000/api/chat"),
                ("BRIDGE_PORT", "6060"),
                ("DRAIN_AFTER_STOP", "true"),
                ("DRAIN_SECS", "2.5"),
                ("KEEPALIVE_SECS", "0"),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(config.bridge_port, 6060);
        assert!(config.drain_after_stop);
        assert_eq!(config.drain_policy().budget, Duration::from_millis(2500));
        assert_eq!(config.keepalive_interval(), None);
        assert_eq!(config.engine_url, "ws://engine.local:9000/api/chat");
    }

    #[test]
    fn engine_endpoint_carries_prompts() {
        let config = BridgeConfig {
            engine_url: "ws://engine.local/api/chat?model=a".to_string(),
            voice_prompt: "NATF0.pt".to_string(),
            text_prompt: "be nice & brief".to_string(),
            ..BridgeConfig::default()
        };
        let url = config.engine_endpoint().unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["model"], "a");
        assert_eq!(pairs["voice_prompt"], "NATF0.pt");
        assert_eq!(pairs["text_prompt"], "be nice & brief");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad_rate = BridgeConfig {
            model_sample_rate: 22050,
            ..BridgeConfig::default()
        };
        assert!(bad_rate.validate().is_err());

        let bad_url = BridgeConfig {
            engine_url: "http://engine.local".to_string(),
            ..BridgeConfig::default()
        };
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn resampler_argv_fills_rates() {
        let config = BridgeConfig::default();
        let argv = config.resampler_argv(8000, 24000);
        assert!(argv.windows(2).any(|w| w == ["-ar", "8000"]));
        assert!(argv.windows(2).any(|w| w == ["-ar", "24000"]));
        assert_eq!(argv.last().map(String::as_str), Some("pipe:1"));
    }
}
