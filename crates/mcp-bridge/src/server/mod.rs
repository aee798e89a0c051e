//! HTTP app assembly.
//!
//! Binds the listener (walking up to twenty ports past the configured one
//! when it is busy), serves the router, and drives the shutdown cascade on
//! ctrl-c: listener stops, frontends close, supervisors shut their children
//! down.

pub mod frontend;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::bridge::Bridge;
use crate::error::BridgeError;
use frontend::SessionManager;
use routes::AppState;

/// Ports probed past the configured one before giving up.
pub const PORT_PROBE_RANGE: u16 = 20;

/// Knobs for the HTTP surface.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub stateless: bool,
    pub allow_origin: Option<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8080, stateless: false, allow_origin: None }
    }
}

/// Serve the bridge until ctrl-c, then run the shutdown cascade.
pub async fn run(bridge: Arc<Bridge>, options: ServeOptions) -> Result<(), BridgeError> {
    let sessions = SessionManager::new();
    let state = Arc::new(AppState {
        bridge: Arc::clone(&bridge),
        sessions: sessions.clone(),
        stateless: options.stateless,
    });
    let router = routes::create_router(state, options.allow_origin.as_deref());

    let listener = bind_with_probe(&options.host, options.port).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "bridge listening");

    // Frontend sessions must close inside the shutdown future: the serve
    // call below only resolves once every connection is idle, and an open
    // SSE or GET stream stays live until its session's senders drop.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            sessions.close_all().await;
        })
        .await?;

    bridge.shutdown().await;
    Ok(())
}

/// Bind the configured port, or the next free one within the probe range.
async fn bind_with_probe(host: &str, port: u16) -> Result<TcpListener, BridgeError> {
    let end = port.saturating_add(PORT_PROBE_RANGE);
    for candidate in port..=end {
        let addr: SocketAddr = format!("{host}:{candidate}")
            .parse()
            .map_err(|e| BridgeError::Config(crate::error::ConfigError::Invalid(
                format!("invalid listen address {host}:{candidate}: {e}"),
            )))?;
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if candidate != port {
                    tracing::warn!(configured = port, bound = candidate, "port busy, auto-incremented");
                }
                return Ok(listener);
            }
            Err(e) => {
                tracing::debug!(port = candidate, error = %e, "bind failed");
            }
        }
    }
    Err(BridgeError::PortsExhausted { start: port, end })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
    tracing::info!("received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_skips_busy_port() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = first.local_addr().unwrap().port();
        // The next free port is within the probe range almost surely.
        let second = bind_with_probe("127.0.0.1", busy).await.unwrap();
        assert_ne!(second.local_addr().unwrap().port(), busy);
    }

    #[tokio::test]
    async fn invalid_host_is_config_error() {
        let err = bind_with_probe("not a host", 8080).await.unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
