use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// A running RPC listener.
pub struct RpcServer {
    name: &'static str,
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Binds `addr` and serves `router` until `cancel` fires.
///
/// Binding happens before this returns, so a failure to bind surfaces to the
/// caller. In-flight requests finish during shutdown.
pub async fn serve(
    name: &'static str,
    addr: &str,
    router: Router,
    cancel: CancellationToken,
) -> Result<RpcServer> {
    let bind = bind_addr(addr);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("{name}: listening on {bind}"))?;

    let local_addr = listener
        .local_addr()
        .with_context(|| format!("{name}: getting local address"))?;

    let handle = tokio::spawn(async move {
        tracing::info!(service = name, addr = %local_addr, "rpc server started");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

        if let Err(e) = result {
            tracing::error!(service = name, error = %e, "rpc server error");
        }
    });

    Ok(RpcServer {
        name,
        local_addr,
        handle,
    })
}

impl RpcServer {
    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the server task to finish after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(service = self.name, error = %e, "rpc server task failed");
        }
    }
}
