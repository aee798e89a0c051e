//! Client-role MCP session over one transport.
//!
//! The session drives the `initialize` handshake, allocates request ids,
//! parks a waiter per outstanding request, and dispatches whatever the peer
//! sends back: responses resolve waiters, requests and notifications go to a
//! registered handler. The handler handle is non-owning so the proxy engine
//! can register itself without creating an ownership cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    Message, Notification, PROTOCOL_VERSION, Request, RequestId, Response, RpcError, methods,
};
use crate::transport::Duplex;

/// Receives peer-initiated traffic (server-to-client requests such as
/// sampling, and notifications).
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Answer a request from the peer. The returned result (or error) is
    /// written back with the peer's id.
    async fn on_request(&self, server: &str, request: Request) -> Result<Value, RpcError>;

    /// Observe a notification from the peer.
    async fn on_notification(&self, server: &str, notification: Notification);
}

type Waiter = oneshot::Sender<SessionResult<Value>>;

struct SessionInner {
    name: String,
    outbound: mpsc::Sender<Message>,
    cancel: tokio_util::sync::CancellationToken,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, Waiter>>,
    closed: AtomicBool,
    initialized: AtomicBool,
    server_info: RwLock<Option<Value>>,
    capabilities: RwLock<Option<Value>>,
    handler: RwLock<Option<Weak<dyn SessionHandler>>>,
}

/// Stateful JSON-RPC peer over one transport.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Wrap a transport and start the inbound dispatch task.
    #[must_use]
    pub fn connect(name: impl Into<String>, duplex: Duplex) -> Self {
        let inner = Arc::new(SessionInner {
            name: name.into(),
            outbound: duplex.sender(),
            cancel: duplex.cancel_token(),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            handler: RwLock::new(None),
        });
        tokio::spawn(dispatch_loop(duplex, Arc::clone(&inner)));
        Self { inner }
    }

    /// Register the peer-traffic handler. Stored as a weak handle; the
    /// handler owns the session, never the reverse.
    pub fn set_handler(&self, handler: &Arc<dyn SessionHandler>) {
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(Arc::downgrade(handler));
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Token that fires when the session (or its transport) dies; the
    /// supervisor selects on this to notice a vanished backend.
    #[must_use]
    pub fn closed_token(&self) -> tokio_util::sync::CancellationToken {
        self.inner.cancel.clone()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// `serverInfo` recorded from the handshake.
    #[must_use]
    pub fn server_info(&self) -> Option<Value> {
        self.inner.server_info.read().ok().and_then(|v| v.clone())
    }

    /// Capabilities the peer advertised in the handshake.
    #[must_use]
    pub fn capabilities(&self) -> Option<Value> {
        self.inner.capabilities.read().ok().and_then(|v| v.clone())
    }

    /// Run the MCP handshake: `initialize`, record the result, then
    /// `notifications/initialized`.
    pub async fn initialize(&self, client_info: Value, timeout: Duration) -> SessionResult<Value> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": client_info,
        });
        let result = self
            .request(methods::INITIALIZE, Some(params), timeout)
            .await
            .map_err(|e| match e {
                SessionError::Rpc(rpc) => SessionError::Handshake(rpc.to_string()),
                other => other,
            })?;

        let version = result.get("protocolVersion").and_then(Value::as_str);
        match version {
            None => {
                return Err(SessionError::Handshake(
                    "initialize result lacks protocolVersion".to_string(),
                ));
            }
            Some(v) if v != PROTOCOL_VERSION => {
                tracing::debug!(server = %self.inner.name, version = %v, "peer negotiated a different protocol revision");
            }
            Some(_) => {}
        }

        if let Ok(mut slot) = self.inner.server_info.write() {
            *slot = result.get("serverInfo").cloned();
        }
        if let Ok(mut slot) = self.inner.capabilities.write() {
            *slot = result.get("capabilities").cloned();
        }

        self.notify(methods::NOTIF_INITIALIZED, None).await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    /// Allocate the next request id. Holes are fine; uniqueness is what
    /// matters.
    #[must_use]
    pub fn allocate_id(&self) -> RequestId {
        RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Issue a request and wait for the matching response, a timeout, or
    /// session close. A timeout does not send a cancellation; a late answer
    /// will simply be dropped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> SessionResult<Value> {
        let id = self.allocate_id();
        self.request_with_id(id, method, params, timeout).await
    }

    /// Like [`ClientSession::request`] with a caller-chosen id, so the
    /// caller can target the in-flight request with [`ClientSession::cancel`].
    pub async fn request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> SessionResult<Value> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.park(id.clone(), tx)?;

        let request: Message = Request::new(id.clone(), method, params).into();
        if self.inner.outbound.send(request).await.is_err() {
            self.unpark(&id);
            return Err(SessionError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without a verdict: the session closed under us.
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.unpark(&id);
                Err(SessionError::Timeout { seconds: timeout.as_secs() })
            }
        }
    }

    /// Fire-and-forget.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let note: Message = Notification::new(method, params).into();
        self.inner
            .outbound
            .send(note)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Drop the waiter for an in-flight request and tell the peer to stop
    /// working on it.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) {
        if let Some(waiter) = self.take_waiter(id) {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }
        let mut params = json!({ "requestId": id });
        if let Some(reason) = reason {
            params["reason"] = reason.into();
        }
        let _ = self.notify(methods::NOTIF_CANCELLED, Some(params)).await;
    }

    /// Close the session: drain every waiter with a synthetic error and tear
    /// the transport down. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        drain_waiters(&self.inner);
        self.inner.cancel.cancel();
        tracing::debug!(server = %self.inner.name, "session closed");
    }

    fn park(&self, id: RequestId, waiter: Waiter) -> SessionResult<()> {
        let mut pending = self.inner.pending.lock().map_err(|_| SessionError::Closed)?;
        pending.insert(id, waiter);
        Ok(())
    }

    fn unpark(&self, id: &RequestId) {
        self.take_waiter(id);
    }

    fn take_waiter(&self, id: &RequestId) -> Option<Waiter> {
        self.inner.pending.lock().ok().and_then(|mut p| p.remove(id))
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn drain_waiters(inner: &SessionInner) {
    let waiters: Vec<Waiter> = match inner.pending.lock() {
        Ok(mut pending) => pending.drain().map(|(_, w)| w).collect(),
        Err(_) => return,
    };
    for waiter in waiters {
        let _ = waiter.send(Err(SessionError::Closed));
    }
}

/// Inbound dispatch: serialized per session. Responses resolve waiters,
/// requests and notifications go to the registered handler.
async fn dispatch_loop(mut duplex: Duplex, inner: Arc<SessionInner>) {
    while let Some(message) = duplex.recv().await {
        match message {
            Message::Response(response) => {
                let waiter = inner.pending.lock().ok().and_then(|mut p| p.remove(&response.id));
                match waiter {
                    Some(waiter) => {
                        let outcome = response.into_result().map_err(SessionError::Rpc);
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        // Never-issued or already-cancelled id: drop, do not
                        // tear the session down.
                        tracing::warn!(server = %inner.name, id = %response.id, "dropping response with unknown id");
                    }
                }
            }
            Message::Request(request) => {
                let handler = current_handler(&inner);
                let reply = match handler {
                    Some(handler) => {
                        match handler.on_request(&inner.name, request.clone()).await {
                            Ok(result) => Response::ok(request.id, result),
                            Err(error) => Response::err(request.id, error),
                        }
                    }
                    None => Response::err(request.id, RpcError::method_not_found(&request.method)),
                };
                if inner.outbound.send(reply.into()).await.is_err() {
                    break;
                }
            }
            Message::Notification(notification) => {
                if let Some(handler) = current_handler(&inner) {
                    handler.on_notification(&inner.name, notification).await;
                } else {
                    tracing::debug!(
                        server = %inner.name,
                        method = %notification.method,
                        "dropping notification without handler"
                    );
                }
            }
        }
    }

    inner.closed.store(true, Ordering::SeqCst);
    drain_waiters(&inner);
    inner.cancel.cancel();
    tracing::debug!(server = %inner.name, "transport ended, session closed");
}

fn current_handler(inner: &SessionInner) -> Option<Arc<dyn SessionHandler>> {
    inner.handler.read().ok().and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;

    /// Minimal in-process MCP server for exercising the session.
    fn serve_echo(mut peer: Duplex) {
        tokio::spawn(async move {
            while let Some(message) = peer.recv().await {
                match message {
                    Message::Request(req) => {
                        let reply = match req.method.as_str() {
                            "initialize" => Response::ok(
                                req.id,
                                json!({
                                    "protocolVersion": PROTOCOL_VERSION,
                                    "capabilities": {"tools": {}},
                                    "serverInfo": {"name": "echo", "version": "0.0.1"},
                                }),
                            ),
                            "echo" => Response::ok(req.id, req.params.unwrap_or(Value::Null)),
                            "slow" => continue, // never answered
                            other => Response::err(req.id, RpcError::method_not_found(other)),
                        };
                        let _ = peer.send(reply.into()).await;
                    }
                    Message::Notification(_) | Message::Response(_) => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn handshake_records_server_info() {
        let (client, server) = Duplex::pair();
        serve_echo(server);
        let session = ClientSession::connect("echo", client);
        let result = session
            .initialize(json!({"name": "test", "version": "0"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["serverInfo"]["name"], "echo");
        assert!(session.is_initialized());
        assert_eq!(session.server_info().unwrap()["name"], "echo");
    }

    #[tokio::test]
    async fn request_round_trip() {
        let (client, server) = Duplex::pair();
        serve_echo(server);
        let session = ClientSession::connect("echo", client);
        let result = session
            .request("echo", Some(json!({"x": "hi"})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["x"], "hi");
    }

    #[tokio::test]
    async fn rpc_errors_pass_through() {
        let (client, server) = Duplex::pair();
        serve_echo(server);
        let session = ClientSession::connect("echo", client);
        let err = session.request("nope", None, Duration::from_secs(5)).await.unwrap_err();
        match err {
            SessionError::Rpc(rpc) => assert_eq!(rpc.code, codes::METHOD_NOT_FOUND),
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_leaves_no_waiter() {
        let (client, server) = Duplex::pair();
        serve_echo(server);
        let session = ClientSession::connect("echo", client);
        let err = session
            .request("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert!(session.inner.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_drains_in_flight_requests() {
        let (client, server) = Duplex::pair();
        serve_echo(server);
        let session = ClientSession::connect("echo", client);
        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                session.request("slow", None, Duration::from_secs(30)).await
            })
        };
        tokio::task::yield_now().await;
        session.close();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn peer_disconnect_closes_session() {
        let (client, server) = Duplex::pair();
        let session = ClientSession::connect("gone", client);
        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_closed());
        let err = session.request("echo", None, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn cancel_sends_notification_and_drops_waiter() {
        let (client, mut server) = Duplex::pair();
        let session = ClientSession::connect("echo", client);

        let id = session.allocate_id();
        let waiting = {
            let session = session.clone();
            let id = id.clone();
            tokio::spawn(async move {
                session.request_with_id(id, "slow", None, Duration::from_secs(30)).await
            })
        };

        // The request frame arrives first.
        let first = server.recv().await.unwrap();
        assert_eq!(first.method(), Some("slow"));

        session.cancel(&id, Some("user asked")).await;
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));

        let second = server.recv().await.unwrap();
        assert_eq!(second.method(), Some(methods::NOTIF_CANCELLED));
        match second {
            Message::Notification(n) => {
                assert_eq!(n.params.unwrap()["requestId"], json!(id));
            }
            other => panic!("expected notification, got {other:?}"),
        }

        // A late answer for the cancelled id is dropped silently.
        let _ = server.send(Response::ok(id, json!({"late": true})).into()).await;
    }
}
