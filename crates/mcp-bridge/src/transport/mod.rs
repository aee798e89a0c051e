//! Transport adapters.
//!
//! Every transport reduces to the same duplex contract: an inbound stream of
//! parsed messages, an outbound sink, and a close handle. Framing above this
//! layer never sees transport detail.

pub mod http;
pub mod sse;
pub mod stdio;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};
use crate::protocol::Message;

/// Channel depth between a transport's pump tasks and its consumer.
pub const CHANNEL_CAPACITY: usize = 64;

/// Environment variable whose value becomes a bearer `Authorization` header
/// on outbound transports.
pub const API_ACCESS_TOKEN_VAR: &str = "API_ACCESS_TOKEN";

/// Uniform duplex message channel over some transport.
///
/// Dropping the duplex (or calling [`Duplex::close`]) tears the underlying
/// transport down; for child processes that includes the stdin-close → grace
/// → kill sequence.
#[derive(Debug)]
pub struct Duplex {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Duplex {
    /// Assemble from channel halves; used by the adapters in this module.
    #[must_use]
    pub fn from_parts(
        outbound: mpsc::Sender<Message>,
        inbound: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self { outbound, inbound, cancel }
    }

    /// Queue one message for the peer.
    pub async fn send(&self, message: Message) -> TransportResult<()> {
        self.outbound.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Next inbound message; `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// A clonable handle for the outbound sink.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Tear the transport down. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Clone of the close handle, for tasks that outlive the duplex itself.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cross-wired in-memory pair. One side plays the client, the other the
    /// server; used by the session and proxy tests.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_ba, rx_ba) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let a = Self { outbound: tx_ab, inbound: rx_ba, cancel: cancel.clone() };
        let b = Self { outbound: tx_ba, inbound: rx_ab, cancel };
        (a, b)
    }
}

impl Drop for Duplex {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bearer token from `API_ACCESS_TOKEN`, if configured, unless the caller
/// already supplied an `Authorization` header.
pub(crate) fn env_authorization(
    headers: &std::collections::HashMap<String, String>,
) -> Option<String> {
    if headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
        return None;
    }
    std::env::var(API_ACCESS_TOKEN_VAR).ok().map(|token| format!("Bearer {token}"))
}

/// Apply configured headers plus the env bearer token to a reqwest builder,
/// logging each applied header with secrets masked.
pub(crate) fn apply_headers(
    mut request: reqwest::RequestBuilder,
    headers: &std::collections::HashMap<String, String>,
) -> reqwest::RequestBuilder {
    for (key, value) in headers {
        tracing::debug!(header = %key, value = %crate::config::loggable_value(key, value), "applying header");
        request = request.header(key.as_str(), value.as_str());
    }
    if let Some(bearer) = env_authorization(headers) {
        tracing::debug!(header = "Authorization", value = "***", "applying header");
        request = request.header("Authorization", bearer);
    }
    request
}
