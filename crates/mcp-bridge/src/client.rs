//! Client-side proxy mode.
//!
//! Plays a local stdio MCP server and tunnels every frame to a remote
//! endpoint over SSE or streamable HTTP. Ids pass through untouched: with
//! exactly one peer on each side the remote's correlation already lines up
//! with the local client's.

use std::collections::HashMap;

use crate::error::{TransportError, TransportResult};
use crate::transport::http::HttpOptions;
use crate::transport::{Duplex, http, sse, stdio};

/// Remote transport flavor for client mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTransport {
    Sse,
    StreamableHttp,
}

/// Options for one client-mode run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub transport: RemoteTransport,
    pub headers: HashMap<String, String>,
    /// Re-initialize retry budget on the remote transport.
    pub remote_retries: u32,
}

/// Tunnel this process's stdio to the remote until either side hangs up.
pub async fn run(options: ClientOptions) -> TransportResult<()> {
    tracing::info!(url = %options.url, transport = ?options.transport, "starting client proxy");

    let mut remote = match options.transport {
        RemoteTransport::Sse => {
            sse::connect("remote", &options.url, &options.headers, options.remote_retries).await?
        }
        RemoteTransport::StreamableHttp => http::connect(
            "remote",
            &options.url,
            &options.headers,
            HttpOptions { stateless: false, remote_retries: options.remote_retries },
        )?,
    };
    let mut local = stdio::current_process();

    pump(&mut local, &mut remote).await;
    local.close();
    remote.close();
    Ok(())
}

/// Bidirectional pass-through pump.
async fn pump(local: &mut Duplex, remote: &mut Duplex) {
    // Sink handles up front: each recv() future holds its duplex mutably.
    let to_remote = remote.sender();
    let to_local = local.sender();
    loop {
        tokio::select! {
            message = local.recv() => match message {
                Some(message) => {
                    if to_remote.send(message).await.is_err() {
                        tracing::warn!("remote hung up, stopping");
                        return;
                    }
                }
                None => {
                    tracing::info!("stdin closed, stopping");
                    return;
                }
            },
            message = remote.recv() => match message {
                Some(message) => {
                    if to_local.send(message).await.is_err() {
                        return;
                    }
                }
                None => {
                    tracing::warn!("remote stream ended, stopping");
                    return;
                }
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "ctrl-c handler failed");
                }
                tracing::info!("received shutdown signal");
                return;
            }
        }
    }
}

/// Map a failed remote connect onto the message the operator actually
/// needs: the URL plus a hint.
#[must_use]
pub fn describe_connect_failure(url: &str, error: &TransportError) -> String {
    match error.http_status() {
        Some(status) => {
            format!("cannot reach {url} (HTTP {status}); check backend health/path/auth")
        }
        None => format!("cannot reach {url}: {error}; check backend health/path/auth"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failure_names_url_and_status() {
        let err = TransportError::status(404, "http://up/mcp");
        let text = describe_connect_failure("http://up/mcp", &err);
        assert!(text.contains("http://up/mcp"));
        assert!(text.contains("404"));
        assert!(text.contains("check backend health"));
    }
}
