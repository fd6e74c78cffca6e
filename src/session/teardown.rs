//! Single exit path for a session.
//!
//! Every trigger (STOP, drain completion, remote hangup, engine failure,
//! process shutdown) ends up in [`Teardown::close`]; only the first call
//! does any work.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::audio::resampler::TransformerHandle;
use crate::error::{CloseReason, Peer};
use crate::ws::SocketClose;

/// How long cancelled tasks get to exit before they are aborted.
const JOIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct SessionResources {
    pub tasks: Vec<(&'static str, JoinHandle<()>)>,
    pub transformers: Vec<TransformerHandle>,
    pub sockets: Vec<Arc<dyn SocketClose>>,
}

impl SessionResources {
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "task started");
        self.tasks.push((name, tokio::spawn(fut.in_current_span())));
    }
}

pub struct Teardown {
    cancel: CancellationToken,
    resources: Mutex<Option<SessionResources>>,
}

impl Teardown {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            resources: Mutex::new(Some(SessionResources::default())),
        }
    }

    /// Mutate the registered resources. No-op once closed.
    pub fn register(&self, f: impl FnOnce(&mut SessionResources)) {
        if let Ok(mut guard) = self.resources.lock() {
            if let Some(res) = guard.as_mut() {
                f(res);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.resources.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Cancel tasks, close both sockets, release the transformers.
    /// Returns `true` only for the call that did the work.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let taken = match self.resources.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(res) = taken else {
            debug!(reason = reason.as_str(), "teardown already done");
            return false;
        };

        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + JOIN_GRACE;
        for (name, mut handle) in res.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task exited"),
                Ok(Err(e)) if e.is_panic() => warn!(task = name, "task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "task did not stop, aborting");
                    handle.abort();
                }
            }
        }

        // Engine first, so the provider never outlives it.
        let mut sockets = res.sockets;
        sockets.sort_by_key(|s| s.peer() == Peer::Provider);
        for socket in sockets {
            socket.close_socket(Some(close_reason_for(socket.peer(), reason))).await;
        }

        let graceful = reason == CloseReason::Normal;
        for t in res.transformers {
            if graceful {
                t.shutdown().await;
            } else {
                t.kill().await;
            }
        }

        info!(reason = reason.as_str(), "session resources released");
        true
    }
}

/// The provider learns why its call ended; the engine is always released
/// with a plain normal close.
fn close_reason_for(peer: Peer, reason: CloseReason) -> CloseReason {
    match peer {
        Peer::Provider => reason,
        Peer::Engine => CloseReason::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::resampler;
    use crate::ws::tests::{test_sender, test_sender_for};
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn concurrent_close_releases_once() {
        let cancel = CancellationToken::new();
        let teardown = Teardown::new(cancel.clone());
        let (provider, mut provider_rx) = test_sender();
        let provider = Arc::new(provider);

        let (handle, _writer, _reader) = resampler::spawn("cat", &[], "test").unwrap();
        let watched = cancel.clone();
        teardown.register(|res| {
            res.spawn("cooperative", async move { watched.cancelled().await });
            res.spawn("stubborn", std::future::pending());
            res.transformers.push(handle);
            res.sockets.push(provider.clone());
        });

        let (a, b) = tokio::join!(
            teardown.close(CloseReason::EngineDisconnected),
            teardown.close(CloseReason::Normal)
        );
        assert!(a ^ b);
        assert!(teardown.is_closed());
        assert!(cancel.is_cancelled());

        match provider_rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.reason.as_str(), "engine_disconnected")
            }
            other => panic!("expected one close frame, got {:?}", other),
        }
        assert_eq!(provider_rx.recv().await, None);
        assert!(!provider.is_open());

        // registering after close is ignored
        let mut ran = false;
        teardown.register(|_| ran = true);
        assert!(!ran);
        assert!(!teardown.close(CloseReason::Normal).await);
    }

    #[tokio::test]
    async fn engine_gets_normal_close_while_provider_gets_reason() {
        let teardown = Teardown::new(CancellationToken::new());
        let (provider, mut provider_rx) = test_sender();
        let (engine, mut engine_rx) = test_sender_for(Peer::Engine);
        let (provider, engine) = (Arc::new(provider), Arc::new(engine));
        teardown.register(|res| {
            res.sockets.push(provider.clone());
            res.sockets.push(engine.clone());
        });

        assert!(teardown.close(CloseReason::EngineHandshakeTimeout).await);
        let reason = |msg: Option<Message>| match msg {
            Some(Message::Close(Some(frame))) => frame.reason.as_str().to_string(),
            other => panic!("expected close frame, got {:?}", other),
        };
        assert_eq!(reason(engine_rx.recv().await), "normal");
        assert_eq!(reason(provider_rx.recv().await), "engine_handshake_timeout");
    }

    #[tokio::test]
    async fn close_without_resources_is_fine() {
        let teardown = Teardown::new(CancellationToken::new());
        assert!(teardown.close(CloseReason::Shutdown).await);
        assert!(!teardown.close(CloseReason::Shutdown).await);
    }
}
