//! Provider-facing WebSocket server. One session per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::audio::SharedCodec;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::session::controller::BridgeContext;
use crate::session::{Session, SessionReport, run_session};
use crate::text_sink::TextSink;

pub struct Listener {
    listener: TcpListener,
    ctx: Arc<BridgeContext>,
}

impl Listener {
    pub async fn bind(
        config: BridgeConfig,
        codec: SharedCodec,
        text_sink: Arc<dyn TextSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(BridgeContext {
                config: Arc::new(config),
                codec,
                text_sink,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then wait for live sessions to close.
    /// Sessions share a child of `shutdown`, so they see it too.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "bridge listening");
        let mut sessions: JoinSet<SessionReport> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        warn!("session task ended abnormally: {}", e);
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let session = Session::new();
                    let span = info_span!("session", id = %session.id);
                    let ctx = self.ctx.clone();
                    let root = shutdown.clone();
                    sessions.spawn(
                        async move {
                            info!(%peer, "provider connected");
                            handle(stream, session, ctx, root).await
                        }
                        .instrument(span),
                    );
                }
            }
        }

        info!(live = sessions.len(), "shutting down, waiting for sessions");
        while let Some(done) = sessions.join_next().await {
            if let Err(e) = done {
                warn!("session task ended abnormally: {}", e);
            }
        }
        info!("bridge stopped");
        Ok(())
    }
}

async fn handle(
    stream: TcpStream,
    session: Session,
    ctx: Arc<BridgeContext>,
    root: CancellationToken,
) -> SessionReport {
    let _ = stream.set_nodelay(true);
    match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => run_session(session, socket, ctx, root).await,
        Err(e) => {
            debug!("websocket upgrade failed: {}", e);
            SessionReport::rejected(session)
        }
    }
}
