//! Outbound SSE transport.
//!
//! Old-style SSE MCP servers work like this: the client opens
//! `GET <url>` with `Accept: text/event-stream`, the server answers with an
//! `endpoint` event naming the POST URL, and from then on server-to-client
//! frames arrive as `message` events while client-to-server frames are
//! POSTed. A 2xx on the POST only acknowledges receipt; the response proper
//! comes back over the stream, correlated by id.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CHANNEL_CAPACITY, Duplex, apply_headers};
use crate::config::REMOTE_RETRY_BACKOFF;
use crate::error::{TransportError, TransportResult};
use crate::protocol::Message;

/// How long the endpoint event may take to arrive.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open the event stream and wire it into a [`Duplex`].
///
/// `remote_retries` bounds the POST retry budget: on a connection reset or a
/// 404 after an idle recycle, the POST is reissued once per unit of budget
/// after a short backoff.
pub async fn connect(
    server: &str,
    url: &str,
    headers: &HashMap<String, String>,
    remote_retries: u32,
) -> TransportResult<Duplex> {
    let base = url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    tracing::debug!(server = %server, %url, "opening SSE stream");
    let request = apply_headers(client.get(base.clone()), headers)
        .header("Accept", "text/event-stream");
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::status(status.as_u16(), url));
    }

    let mut stream = sse_stream::SseStream::from_byte_stream(response.bytes_stream());

    // The first thing a conforming server sends is the POST endpoint.
    let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, wait_for_endpoint(&mut stream, url))
        .await
        .map_err(|_| TransportError::NoEndpoint { url: url.to_string() })??;
    let post_url = base
        .join(endpoint.trim())
        .map_err(|e| TransportError::InvalidUrl(format!("{endpoint}: {e}")))?;
    tracing::debug!(server = %server, post_url = %post_url, "received endpoint event");

    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    {
        let server = server.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            read_events(&mut stream, &in_tx, &cancel, &server).await;
            // Stream gone means the session is gone; wake the writer too.
            cancel.cancel();
        });
    }

    {
        let server = server.to_string();
        let headers = headers.clone();
        let cancel = cancel.clone();
        let post_url = post_url.to_string();
        tokio::spawn(async move {
            post_messages(client, post_url, headers, out_rx, cancel, server, remote_retries).await;
        });
    }

    Ok(Duplex::from_parts(out_tx, in_rx, cancel))
}

async fn wait_for_endpoint<S>(stream: &mut S, url: &str) -> TransportResult<String>
where
    S: futures::Stream<Item = Result<sse_stream::Sse, sse_stream::Error>> + Unpin,
{
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        let kind = event.event.as_deref().unwrap_or("message");
        if kind == "endpoint" {
            if let Some(data) = event.data {
                return Ok(data);
            }
        }
        tracing::debug!(event = %kind, "ignoring pre-endpoint SSE event");
    }
    Err(TransportError::NoEndpoint { url: url.to_string() })
}

/// Forward `message` events to the inbound channel until the stream or the
/// consumer goes away. Malformed payloads are logged and dropped.
async fn read_events<S>(
    stream: &mut S,
    in_tx: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    server: &str,
) where
    S: futures::Stream<Item = Result<sse_stream::Sse, sse_stream::Error>> + Unpin,
{
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let kind = event.event.as_deref().unwrap_or("message");
                if kind != "message" {
                    tracing::debug!(server = %server, event = %kind, "ignoring SSE event");
                    continue;
                }
                let Some(data) = event.data else { continue };
                let trimmed = data.trim();
                if trimmed.is_empty() {
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
                tracing::warn!(server = %server, error = %e, "SSE stream error");
                return;
            }
            None => {
                tracing::debug!(server = %server, "SSE stream ended");
                return;
            }
        }
    }
}

/// POST outbound frames to the messages endpoint. Recoverable failures are
/// retried once per unit of budget after a backoff; anything else tears the
/// transport down so the supervisor can reconnect.
async fn post_messages(
    client: reqwest::Client,
    post_url: String,
    headers: HashMap<String, String>,
    mut out_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    server: String,
    remote_retries: u32,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        let Ok(body) = message.to_json() else { continue };

        let mut attempts_left = remote_retries;
        loop {
            match post_once(&client, &post_url, &headers, &body).await {
                Ok(()) => break,
                Err(e) if e.is_recoverable() && attempts_left > 0 => {
                    attempts_left -= 1;
                    tracing::warn!(server = %server, error = %e, "POST failed, retrying");
                    tokio::time::sleep(REMOTE_RETRY_BACKOFF).await;
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, url = %post_url, "POST failed; check backend health/path/auth");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn post_once(
    client: &reqwest::Client,
    post_url: &str,
    headers: &HashMap<String, String>,
    body: &str,
) -> TransportResult<()> {
    let request = apply_headers(client.post(post_url), headers)
        .header("Content-Type", "application/json")
        .body(body.to_string());
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::status(status.as_u16(), post_url))
    }
}
