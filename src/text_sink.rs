use async_trait::async_trait;
use tracing::debug;

/// Receives the engine's text token stream.
#[async_trait]
pub trait TextSink: Send + Sync {
    async fn on_text(&self, session_id: &str, text: &str);
}

/// Default sink: logs tokens at debug level.
#[derive(Debug, Default, Clone)]
pub struct LogTextSink;

#[async_trait]
impl TextSink for LogTextSink {
    async fn on_text(&self, session_id: &str, text: &str) {
        debug!(session = session_id, "engine text: {}", text);
    }
}
