//! Outbound streamable-HTTP transport.
//!
//! Both directions ride POSTs against a single URL. A response body is
//! either a single JSON frame or an SSE stream of frames. In stateful mode
//! the server issues an `Mcp-Session-Id` on the initialize response and
//! expects it threaded on every later POST; in stateless mode no session
//! header is ever sent and each request stands alone.
//!
//! Upstreams recycle idle sessions: a POST may come back 404 (or the
//! connection resets) long after a successful handshake. With a retry
//! budget, the adapter clears the cached session id, replays the cached
//! `initialize` handshake, and reissues the failed request once per unit of
//! budget.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CHANNEL_CAPACITY, Duplex, apply_headers};
use crate::config::REMOTE_RETRY_BACKOFF;
use crate::error::{TransportError, TransportResult};
use crate::protocol::{Message, Notification, RpcError, Response, codes, methods};

/// Session id header issued by stateful servers.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Options for one outbound streamable-HTTP connection.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Never send or record a session id.
    pub stateless: bool,
    /// Re-initialize retry budget per failed request.
    pub remote_retries: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self { stateless: false, remote_retries: 0 }
    }
}

struct HttpWorker {
    client: reqwest::Client,
    server: String,
    url: String,
    headers: HashMap<String, String>,
    options: HttpOptions,
    session_id: Option<String>,
    last_initialize: Option<Message>,
    in_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    get_stream_open: bool,
}

/// Wire a streamable-HTTP endpoint into a [`Duplex`]. No I/O happens until
/// the first outbound message (normally `initialize`).
pub fn connect(
    server: &str,
    url: &str,
    headers: &HashMap<String, String>,
    options: HttpOptions,
) -> TransportResult<Duplex> {
    url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    let worker = HttpWorker {
        client,
        server: server.to_string(),
        url: url.to_string(),
        headers: headers.clone(),
        options,
        session_id: None,
        last_initialize: None,
        in_tx,
        cancel: cancel.clone(),
        get_stream_open: false,
    };
    tokio::spawn(worker.run(out_rx));

    Ok(Duplex::from_parts(out_tx, in_rx, cancel))
}

impl HttpWorker {
    async fn run(mut self, mut out_rx: mpsc::Receiver<Message>) {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            if message.method() == Some(methods::INITIALIZE) {
                self.last_initialize = Some(message.clone());
            }
            self.deliver_with_retry(message).await;
        }
    }

    /// Deliver one frame, spending the retry budget on recoverable failures.
    async fn deliver_with_retry(&mut self, message: Message) {
        let mut budget = self.options.remote_retries;
        loop {
            match self.deliver(&message).await {
                Ok(()) => return,
                Err(e) if e.is_recoverable() && budget > 0 && self.last_initialize.is_some() => {
                    budget -= 1;
                    tracing::warn!(
                        server = %self.server,
                        url = %self.url,
                        error = %e,
                        "request failed, re-initializing session"
                    );
                    self.session_id = None;
                    tokio::time::sleep(REMOTE_RETRY_BACKOFF).await;
                    if let Err(re) = self.reinitialize().await {
                        tracing::warn!(
                            server = %self.server,
                            url = %self.url,
                            error = %re,
                            "re-initialize failed; check backend health/path/auth"
                        );
                        self.report_failure(&message, &re).await;
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        server = %self.server,
                        url = %self.url,
                        error = %e,
                        "request failed; check backend health/path/auth"
                    );
                    self.report_failure(&message, &e).await;
                    return;
                }
            }
        }
    }

    async fn deliver(&mut self, message: &Message) -> TransportResult<()> {
        let is_initialize = message.method() == Some(methods::INITIALIZE);
        let response = self.post(message).await?;

        if is_initialize && !self.options.stateless {
            if let Some(id) = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                tracing::debug!(server = %self.server, session_id = %id, "server issued session id");
                self.session_id = Some(id.to_string());
            }
        }

        self.consume_response(response, false).await?;

        if is_initialize && self.session_id.is_some() && !self.get_stream_open {
            self.open_get_stream();
        }
        Ok(())
    }

    async fn post(&self, message: &Message) -> TransportResult<reqwest::Response> {
        let body = message.to_json().map_err(|e| {
            TransportError::InvalidUrl(format!("unserializable frame: {e}"))
        })?;
        let mut request = apply_headers(self.client.post(&self.url), &self.headers)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);
        if !self.options.stateless {
            if let Some(id) = &self.session_id {
                request = request.header(SESSION_ID_HEADER, id);
            }
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(TransportError::status(status.as_u16(), &self.url))
        }
    }

    /// Feed the frames of one response body to the session. With `discard`
    /// the frames are consumed silently (re-initialize replay).
    async fn consume_response(
        &self,
        response: reqwest::Response,
        discard: bool,
    ) -> TransportResult<()> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            if discard {
                // Only the first frame matters for a replayed handshake.
                let mut stream = sse_stream::SseStream::from_byte_stream(response.bytes_stream());
                while let Some(Ok(event)) = stream.next().await {
                    if event.data.is_some() {
                        break;
                    }
                }
                return Ok(());
            }
            let in_tx = self.in_tx.clone();
            let server = self.server.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut stream = sse_stream::SseStream::from_byte_stream(response.bytes_stream());
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => return,
                        event = stream.next() => event,
                    };
                    match event {
                        Some(Ok(event)) => {
                            let kind = event.event.as_deref().unwrap_or("message");
                            let Some(data) = event.data else { continue };
                            let trimmed = data.trim();
                            if kind != "message" || trimmed.is_empty() {
                                continue;
                            }
                            match Message::parse(trimmed) {
                                Ok(message) => {
                                    if in_tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(server = %server, error = %e, "dropping unparseable SSE frame");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(server = %server, error = %e, "response stream error");
                            return;
                        }
                        None => return,
                    }
                }
            });
            return Ok(());
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            // Accepted notification, nothing to read back.
            return Ok(());
        }
        match Message::parse(&String::from_utf8_lossy(&bytes)) {
            Ok(message) => {
                if !discard {
                    let _ = self.in_tx.send(message).await;
                }
            }
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "dropping unparseable response body");
            }
        }
        Ok(())
    }

    /// Replay the cached handshake: POST `initialize`, swallow its result,
    /// then send `notifications/initialized`.
    async fn reinitialize(&mut self) -> TransportResult<()> {
        let init = self.last_initialize.clone().ok_or(TransportError::Closed)?;
        let response = self.post(&init).await?;
        if !self.options.stateless {
            if let Some(id) = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                self.session_id = Some(id.to_string());
            }
        }
        self.consume_response(response, true).await?;

        let initialized: Message = Notification::new(methods::NOTIF_INITIALIZED, None).into();
        let response = self.post(&initialized).await?;
        self.consume_response(response, true).await
    }

    /// Resolve the waiter for a failed request with a synthetic error naming
    /// the upstream; notifications fail silently.
    async fn report_failure(&self, message: &Message, error: &TransportError) {
        let Message::Request(request) = message else { return };
        let mut data = serde_json::json!({
            "unavailable": true,
            "server": self.server,
            "url": self.url,
            "reason": error.to_string(),
            "hint": "check backend health/path/auth",
        });
        if let Some(status) = error.http_status() {
            data["upstream_status"] = status.into();
        }
        let rpc = RpcError::new(codes::SERVER_ERROR, "backend unavailable").with_data(data);
        let _ = self
            .in_tx
            .send(Response::err(request.id.clone(), rpc).into())
            .await;
    }

    /// Long-lived GET stream for server-initiated frames (stateful mode).
    fn open_get_stream(&mut self) {
        self.get_stream_open = true;
        let client = self.client.clone();
        let url = self.url.clone();
        let headers = self.headers.clone();
        let session_id = self.session_id.clone();
        let in_tx = self.in_tx.clone();
        let server = self.server.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut request = apply_headers(client.get(&url), &headers)
                .header("Accept", "text/event-stream");
            if let Some(id) = &session_id {
                request = request.header(SESSION_ID_HEADER, id);
            }
            let response = match request.send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    // Many servers do not offer the GET channel; that is fine.
                    tracing::debug!(server = %server, status = %r.status(), "GET stream unavailable");
                    return;
                }
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "GET stream failed to open");
                    return;
                }
            };
            let mut stream = sse_stream::SseStream::from_byte_stream(response.bytes_stream());
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => return,
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(event)) => {
                        let Some(data) = event.data else { continue };
                        let trimmed = data.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if let Ok(message) = Message::parse(trimmed) {
                            if in_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => return,
                }
            }
        });
    }
}
