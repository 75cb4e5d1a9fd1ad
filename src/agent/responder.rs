use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::bind_addr;

/// Accept-and-close listener that makes this agent a probe target.
pub struct ProbeResponder {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ProbeResponder {
    /// Binds `addr` and accepts until `cancel` fires. Every accepted
    /// connection is closed immediately.
    pub async fn start(addr: &str, cancel: CancellationToken) -> Result<Self> {
        let bind = bind_addr(addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("probe responder: listening on {bind}"))?;

        let local_addr = listener
            .local_addr()
            .context("probe responder: getting local address")?;

        let handle = tokio::spawn(async move {
            info!(addr = %local_addr, "probe responder started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "probe accepted");
                            drop(stream);
                        }
                        Err(e) => warn!(error = %e, "probe accept failed"),
                    },
                }
            }
        });

        Ok(Self { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "probe responder task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_accepts_dials() {
        let cancel = CancellationToken::new();
        let responder = ProbeResponder::start("127.0.0.1:0", cancel.clone())
            .await
            .expect("bind");

        for _ in 0..3 {
            TcpStream::connect(responder.local_addr())
                .await
                .expect("dial");
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), responder.join())
            .await
            .expect("stopped");
    }
}
