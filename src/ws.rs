//! Write half of a WebSocket shared between its writer task and teardown.
//!
//! Only the owning writer task sends data frames. Teardown takes the sink out
//! once the writer has stopped and sends the close frame.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tracing::debug;

use crate::error::{BridgeError, CloseReason, Peer};

pub struct WsSender<S> {
    peer: Peer,
    sink: Mutex<Option<S>>,
    open: AtomicBool,
}

impl<S> WsSender<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    pub fn new(peer: Peer, sink: S) -> Self {
        Self {
            peer,
            sink: Mutex::new(Some(sink)),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stop all further sends, e.g. after the peer went away.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub async fn send(&self, msg: Message) -> Result<(), BridgeError> {
        if !self.is_open() {
            return Err(self.send_error("socket closed".to_string()));
        }
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(self.send_error("socket closed".to_string()));
        };
        if let Err(e) = sink.send(msg).await {
            self.mark_closed();
            return Err(self.send_error(e.to_string()));
        }
        Ok(())
    }

    /// Send a close frame (if the socket is still open) and drop the sink.
    /// Returns `true` only for the call that actually closed it.
    pub async fn close(&self, reason: Option<CloseReason>) -> bool {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return false;
        };
        let was_open = self.open.swap(false, Ordering::AcqRel);
        if was_open {
            let frame = reason.map(|r| CloseFrame {
                code: r.close_code(),
                reason: Utf8Bytes::from_static(r.as_str()),
            });
            if let Err(e) = sink.send(Message::Close(frame)).await {
                debug!(peer = %self.peer, "close frame not delivered: {}", e);
            }
        }
        let _ = sink.close().await;
        true
    }

    fn send_error(&self, detail: String) -> BridgeError {
        match self.peer {
            Peer::Provider => BridgeError::ProviderSendFailed(detail),
            Peer::Engine => BridgeError::EngineSendFailed(detail),
        }
    }
}

/// Type-erased close handle for teardown.
#[async_trait]
pub trait SocketClose: Send + Sync {
    fn peer(&self) -> Peer;
    async fn close_socket(&self, reason: Option<CloseReason>) -> bool;
}

#[async_trait]
impl<S> SocketClose for WsSender<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send,
{
    fn peer(&self) -> Peer {
        self.peer
    }

    async fn close_socket(&self, reason: Option<CloseReason>) -> bool {
        self.close(reason).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::sink::SinkMapErr;
    use tokio::sync::mpsc;
    use tokio_util::sync::{PollSendError, PollSender};

    pub(crate) type TestSink = SinkMapErr<PollSender<Message>, fn(PollSendError<Message>) -> WsError>;

    pub(crate) fn test_sender() -> (WsSender<TestSink>, mpsc::Receiver<Message>) {
        test_sender_for(Peer::Provider)
    }

    pub(crate) fn test_sender_for(peer: Peer) -> (WsSender<TestSink>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let map: fn(PollSendError<Message>) -> WsError = |_| WsError::ConnectionClosed;
        (WsSender::new(peer, PollSender::new(tx).sink_map_err(map)), rx)
    }

    #[tokio::test]
    async fn close_runs_once_with_reason() {
        let (sender, mut rx) = test_sender();
        sender.send(Message::text("hi")).await.unwrap();

        let (a, b) = tokio::join!(
            sender.close(Some(CloseReason::EngineHandshakeTimeout)),
            sender.close(Some(CloseReason::Normal))
        );
        assert!(a ^ b);

        assert_eq!(rx.recv().await, Some(Message::text("hi")));
        match rx.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.reason.as_str(), "engine_handshake_timeout")
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        assert_eq!(rx.recv().await, None);
        assert!(sender.send(Message::text("late")).await.is_err());
    }

    #[tokio::test]
    async fn no_close_frame_after_peer_left() {
        let (sender, mut rx) = test_sender();
        sender.mark_closed();
        assert!(matches!(
            sender.send(Message::text("x")).await,
            Err(BridgeError::ProviderSendFailed(_))
        ));
        assert!(sender.close(Some(CloseReason::Normal)).await);
        assert_eq!(rx.recv().await, None);
    }
}
