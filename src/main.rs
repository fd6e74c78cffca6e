use std::sync::Arc;

use call_bridge::audio::OpusCodecFactory;
use call_bridge::text_sink::LogTextSink;
use call_bridge::{BridgeConfig, Listener};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins; BRIDGE_LOG_LEVEL is the short form for operators
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("BRIDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level.to_lowercase())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BridgeConfig::load()?;
    info!(
        model_rate = config.model_sample_rate,
        provider_rate = config.provider_sample_rate,
        drain = config.drain_after_stop,
        resampler = %config.resampler_program,
        "configuration loaded"
    );

    let codec = Arc::new(OpusCodecFactory {
        frame_ms: config.codec_frame_ms,
        bitrate: config.opus_bitrate,
    });
    let listener = Listener::bind(config, codec, Arc::new(LogTextSink)).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, closing sessions");
                trigger.cancel();
            }
            Err(e) => error!("cannot listen for Ctrl-C: {}", e),
        }
    });

    listener.run(shutdown).await?;
    Ok(())
}
