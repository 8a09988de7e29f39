//! Transport seam: frames leaving the pipeline are sent from here.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};

use crate::pipeline::Outgoing;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send to {to} failed: {source}")]
    Send {
        to: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("transport closed")]
    Closed,
}

/// A datagram transport. One frame per call, no delivery guarantee.
pub trait Transport: Send + Sync {
    fn send(&self, to: SocketAddr, bytes: Bytes) -> BoxFuture<'static, Result<(), TransportError>>;
}

/// Drains the pipeline's outgoing queue into a transport until shutdown
/// or until every sender is gone.
pub struct SendWorker {
    transport: Arc<dyn Transport>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        outgoing: mpsc::UnboundedReceiver<Outgoing>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            outgoing,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    return Ok(());
                }

                frame = self.outgoing.recv() => {
                    let Some(Outgoing { to, bytes }) = frame else {
                        tracing::info!("outgoing queue closed, send worker exiting");
                        return Ok(());
                    };
                    let len = bytes.len();
                    let send = self.transport.send(to, bytes);
                    tokio::spawn(async move {
                        match send.await {
                            Ok(()) => tracing::trace!(%to, len, "frame sent"),
                            Err(e) => tracing::debug!(%to, error = %e, "frame not sent"),
                        }
                    });
                }
            }
        }
    }
}
