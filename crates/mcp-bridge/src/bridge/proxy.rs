//! Proxy session engine.
//!
//! Sits between attached frontends and the backend set. Frontend requests
//! are re-issued on the owning backend with a fresh id and answered back
//! under the frontend's id; `initialize` never crosses the bridge, it is
//! answered synthetically from the capability union. Cancellations are
//! translated through the correlation table, and backend-initiated traffic
//! flows the other way with the same id discipline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::backend::{BackendStatus, ManagedBackend};
use crate::bridge::aggregate::Aggregator;
use crate::error::SessionError;
use crate::protocol::{
    Message, Notification, Request, RequestId, Response, RpcError, methods,
};
use crate::session::SessionHandler;

/// Delivery seam for server-to-client frames; the HTTP surface implements
/// this per attached frontend.
#[async_trait]
pub trait FrontendSink: Send + Sync {
    /// Deliver one frame. Returns false once the frontend is gone.
    async fn push(&self, message: Message) -> bool;
}

/// What the engine routes against.
enum RouteTarget {
    /// Direct proxy: one backend, transparent pass-through.
    Single(Arc<ManagedBackend>),
    /// Aggregating bridge: union view plus per-name routing.
    Aggregate { backends: HashMap<String, Arc<ManagedBackend>>, aggregator: Arc<Aggregator> },
}

struct FrontendEntry {
    sink: Arc<dyn FrontendSink>,
    initialized: bool,
    /// Wire URIs this frontend subscribed to.
    subscriptions: HashSet<String>,
}

struct Inflight {
    backend: Arc<ManagedBackend>,
    backend_id: RequestId,
}

/// Bi-directional forwarder between frontends and the backend set.
pub struct ProxyEngine {
    target: RouteTarget,
    frontends: Mutex<HashMap<String, FrontendEntry>>,
    /// (frontend, frontend request id) → in-flight backend call.
    inflight: Mutex<HashMap<(String, RequestId), Inflight>>,
    /// Waiters for backend-initiated requests forwarded to a frontend.
    reverse_pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>>,
    next_reverse_id: AtomicI64,
}

impl ProxyEngine {
    /// Direct proxy onto one backend.
    #[must_use]
    pub fn single(backend: Arc<ManagedBackend>) -> Arc<Self> {
        Self::build(RouteTarget::Single(backend))
    }

    /// Aggregating engine over a backend pool.
    #[must_use]
    pub fn aggregate(backends: Vec<Arc<ManagedBackend>>, aggregator: Arc<Aggregator>) -> Arc<Self> {
        let backends = backends
            .into_iter()
            .map(|b| (b.name().to_string(), b))
            .collect();
        Self::build(RouteTarget::Aggregate { backends, aggregator })
    }

    fn build(target: RouteTarget) -> Arc<Self> {
        Arc::new(Self {
            target,
            frontends: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            reverse_pending: Mutex::new(HashMap::new()),
            next_reverse_id: AtomicI64::new(1),
        })
    }

    /// Attach a frontend under its session id.
    pub fn attach(&self, frontend_id: &str, sink: Arc<dyn FrontendSink>) {
        if let Ok(mut frontends) = self.frontends.lock() {
            frontends.insert(
                frontend_id.to_string(),
                FrontendEntry { sink, initialized: false, subscriptions: HashSet::new() },
            );
        }
        tracing::debug!(session_id = %frontend_id, "frontend attached");
    }

    /// Detach a frontend and cancel everything it still has in flight.
    pub async fn detach(&self, frontend_id: &str) {
        if let Ok(mut frontends) = self.frontends.lock() {
            frontends.remove(frontend_id);
        }
        let orphaned: Vec<Inflight> = self
            .inflight
            .lock()
            .map(|mut inflight| {
                let keys: Vec<(String, RequestId)> = inflight
                    .keys()
                    .filter(|(fid, _)| fid == frontend_id)
                    .cloned()
                    .collect();
                keys.into_iter().filter_map(|k| inflight.remove(&k)).collect()
            })
            .unwrap_or_default();
        for entry in orphaned {
            entry.backend.cancel(&entry.backend_id, Some("client disconnected")).await;
        }
        tracing::debug!(session_id = %frontend_id, "frontend detached");
    }

    /// Handle one frontend frame. A request yields the response to deliver;
    /// notifications and responses yield nothing.
    pub async fn handle(&self, frontend_id: &str, message: Message) -> Option<Message> {
        match message {
            Message::Request(request) => self.handle_request(frontend_id, request).await,
            Message::Notification(notification) => {
                self.handle_notification(frontend_id, notification).await;
                None
            }
            Message::Response(response) => {
                // A frontend answering a backend-initiated request.
                self.resolve_reverse(response);
                None
            }
        }
    }

    async fn handle_request(&self, frontend_id: &str, request: Request) -> Option<Message> {
        tracing::debug!(
            session_id = %frontend_id,
            method = %request.method,
            id = %request.id,
            "frontend request"
        );
        match request.method.as_str() {
            // The only intercepted request; everything else, ping included,
            // is forwarded so the frontend sees the backend's own answers.
            methods::INITIALIZE => Some(self.handle_initialize(frontend_id, &request)),
            _ => match &self.target {
                RouteTarget::Single(backend) => {
                    let backend = Arc::clone(backend);
                    self.forward(frontend_id, backend, request.id, &request.method, request.params)
                        .await
                }
                RouteTarget::Aggregate { .. } => self.route_aggregate(frontend_id, request).await,
            },
        }
    }

    /// `initialize` is intercepted: the bridge answers from the union and
    /// absorbs the handshake. A second initialize on the same session is a
    /// protocol violation.
    fn handle_initialize(&self, frontend_id: &str, request: &Request) -> Message {
        let already = self
            .frontends
            .lock()
            .map(|mut frontends| {
                frontends.get_mut(frontend_id).is_some_and(|entry| {
                    std::mem::replace(&mut entry.initialized, true)
                })
            })
            .unwrap_or(false);
        if already {
            return Response::err(
                request.id.clone(),
                RpcError::invalid_request("session already initialized"),
            )
            .into();
        }

        let result = match &self.target {
            RouteTarget::Aggregate { aggregator, .. } => {
                aggregator.snapshot().initialize_result()
            }
            RouteTarget::Single(backend) => {
                let session = backend.current_session();
                json!({
                    "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                    "capabilities": session
                        .as_ref()
                        .and_then(|s| s.capabilities())
                        .unwrap_or_else(|| json!({})),
                    "serverInfo": session
                        .as_ref()
                        .and_then(|s| s.server_info())
                        .unwrap_or_else(|| json!({
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION"),
                        })),
                })
            }
        };
        Response::ok(request.id.clone(), result).into()
    }

    async fn handle_notification(&self, frontend_id: &str, notification: Notification) {
        match notification.method.as_str() {
            // Absorbed: the backends were initialized long ago.
            methods::NOTIF_INITIALIZED => {}
            methods::NOTIF_CANCELLED => {
                let Some(id) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
                else {
                    tracing::debug!(session_id = %frontend_id, "cancellation without requestId");
                    return;
                };
                let reason = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let entry = self
                    .inflight
                    .lock()
                    .ok()
                    .and_then(|mut inflight| inflight.remove(&(frontend_id.to_string(), id)));
                if let Some(entry) = entry {
                    entry.backend.cancel(&entry.backend_id, reason.as_deref()).await;
                }
            }
            _ => match &self.target {
                RouteTarget::Single(backend) => {
                    let _ = backend.notify(&notification.method, notification.params).await;
                }
                RouteTarget::Aggregate { .. } => {
                    tracing::debug!(
                        session_id = %frontend_id,
                        method = %notification.method,
                        "dropping unroutable notification"
                    );
                }
            },
        }
    }

    /// Forward one request to a backend, correlating the frontend id with a
    /// freshly allocated backend id for the round trip.
    async fn forward(
        &self,
        frontend_id: &str,
        backend: Arc<ManagedBackend>,
        frontend_request_id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Option<Message> {
        if backend.status() != BackendStatus::Connected {
            let error = RpcError::backend_unavailable(
                backend.name(),
                format!("backend is {}", backend.status()),
            );
            return Some(Response::err(frontend_request_id, error).into());
        }
        let Some(backend_id) = backend.allocate_id() else {
            let error = RpcError::backend_unavailable(backend.name(), "no live session");
            return Some(Response::err(frontend_request_id, error).into());
        };

        let key = (frontend_id.to_string(), frontend_request_id.clone());
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.insert(
                key.clone(),
                Inflight { backend: Arc::clone(&backend), backend_id: backend_id.clone() },
            );
        }

        let outcome = backend.request_with_id(backend_id, method, params).await;

        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&key);
        }

        match outcome {
            Ok(result) => Some(Response::ok(frontend_request_id, result).into()),
            // Cancelled: the waiter is gone and nobody is owed a response.
            Err(SessionError::Cancelled) => None,
            Err(e) => {
                let error = e.into_rpc_error(backend.name());
                Some(Response::err(frontend_request_id, error).into())
            }
        }
    }

    async fn route_aggregate(&self, frontend_id: &str, request: Request) -> Option<Message> {
        let RouteTarget::Aggregate { backends, aggregator } = &self.target else {
            return Some(
                Response::err(request.id, RpcError::internal("not an aggregate engine")).into(),
            );
        };
        let snapshot = aggregator.snapshot();
        let Request { id, method, params } = request;

        match method.as_str() {
            // Liveness is the backends' to answer: first reachable one wins.
            methods::PING => {
                self.try_by_priority(frontend_id, &snapshot.priority_order, backends, id, &method, params)
                    .await
            }
            methods::TOOLS_LIST => {
                Some(Response::ok(id, json!({ "tools": snapshot.tools })).into())
            }
            methods::RESOURCES_LIST => {
                Some(Response::ok(id, json!({ "resources": snapshot.resources })).into())
            }
            methods::RESOURCES_TEMPLATES_LIST => Some(
                Response::ok(id, json!({ "resourceTemplates": snapshot.resource_templates }))
                    .into(),
            ),
            methods::PROMPTS_LIST => {
                Some(Response::ok(id, json!({ "prompts": snapshot.prompts })).into())
            }
            methods::TOOLS_CALL => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(name) = name else {
                    return Some(
                        Response::err(id, RpcError::invalid_params("missing tool name")).into(),
                    );
                };
                let Some(owner) = snapshot.resolve_tool(&name) else {
                    return Some(Response::err(id, RpcError::method_not_found(&name)).into());
                };
                let Some(backend) = backends.get(&owner.server) else {
                    return Some(
                        Response::err(id, RpcError::backend_unavailable(&owner.server, "not registered"))
                            .into(),
                    );
                };
                let mut params = params.unwrap_or_else(|| json!({}));
                params["name"] = Value::String(owner.original.clone());
                self.forward(frontend_id, Arc::clone(backend), id, methods::TOOLS_CALL, Some(params))
                    .await
            }
            methods::PROMPTS_GET => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(name) = name else {
                    return Some(
                        Response::err(id, RpcError::invalid_params("missing prompt name")).into(),
                    );
                };
                match snapshot.resolve_prompt(&name) {
                    Some(owner) => {
                        let Some(backend) = backends.get(&owner.server) else {
                            return Some(
                                Response::err(
                                    id,
                                    RpcError::backend_unavailable(&owner.server, "not registered"),
                                )
                                .into(),
                            );
                        };
                        let mut params = params.unwrap_or_else(|| json!({}));
                        params["name"] = Value::String(owner.original.clone());
                        self.forward(frontend_id, Arc::clone(backend), id, methods::PROMPTS_GET, Some(params))
                            .await
                    }
                    None => {
                        self.try_by_priority(frontend_id, &snapshot.priority_order, backends, id, &method, params)
                            .await
                    }
                }
            }
            methods::RESOURCES_READ | methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(uri) = uri else {
                    return Some(
                        Response::err(id, RpcError::invalid_params("missing uri")).into(),
                    );
                };
                match snapshot.resolve_resource(&uri) {
                    Some(owner) => {
                        let Some(backend) = backends.get(&owner.server) else {
                            return Some(
                                Response::err(
                                    id,
                                    RpcError::backend_unavailable(&owner.server, "not registered"),
                                )
                                .into(),
                            );
                        };
                        let mut params = params.unwrap_or_else(|| json!({}));
                        params["uri"] = Value::String(owner.original.clone());
                        let reply = self
                            .forward(frontend_id, Arc::clone(backend), id, &method, Some(params))
                            .await;
                        self.track_subscription(frontend_id, &method, &uri, &reply);
                        reply
                    }
                    None => {
                        // Un-namespaced URI: try backends in priority order.
                        self.try_by_priority(frontend_id, &snapshot.priority_order, backends, id, &method, params)
                            .await
                    }
                }
            }
            methods::COMPLETION_COMPLETE => {
                // Route by the namespaced ref name when it resolves.
                let ref_name = params
                    .as_ref()
                    .and_then(|p| p.get("ref"))
                    .and_then(|r| r.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let owner = ref_name.as_deref().and_then(|n| snapshot.resolve_prompt(n)).cloned();
                match owner {
                    Some(owner) => {
                        let Some(backend) = backends.get(&owner.server) else {
                            return Some(
                                Response::err(
                                    id,
                                    RpcError::backend_unavailable(&owner.server, "not registered"),
                                )
                                .into(),
                            );
                        };
                        let mut params = params.unwrap_or_else(|| json!({}));
                        params["ref"]["name"] = Value::String(owner.original.clone());
                        self.forward(frontend_id, Arc::clone(backend), id, &method, Some(params))
                            .await
                    }
                    None => {
                        self.try_by_priority(frontend_id, &snapshot.priority_order, backends, id, &method, params)
                            .await
                    }
                }
            }
            methods::LOGGING_SET_LEVEL => {
                // Broadcast; a backend without logging support is not an error.
                for backend in backends.values() {
                    if backend.status() != BackendStatus::Connected {
                        continue;
                    }
                    if let Err(e) = backend.request(&method, params.clone()).await {
                        tracing::debug!(server = %backend.name(), error = %e, "setLevel not accepted");
                    }
                }
                Some(Response::ok(id, json!({})).into())
            }
            other => Some(Response::err(id, RpcError::method_not_found(other)).into()),
        }
    }

    /// Fallback routing for names without a recognized namespace: try each
    /// backend in priority order, first success wins.
    async fn try_by_priority(
        &self,
        frontend_id: &str,
        order: &[String],
        backends: &HashMap<String, Arc<ManagedBackend>>,
        frontend_request_id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Option<Message> {
        let mut last_error: Option<RpcError> = None;
        for name in order {
            let Some(backend) = backends.get(name) else { continue };
            if backend.status() != BackendStatus::Connected {
                continue;
            }
            let reply = self
                .forward(
                    frontend_id,
                    Arc::clone(backend),
                    frontend_request_id.clone(),
                    method,
                    params.clone(),
                )
                .await;
            match reply {
                Some(Message::Response(response)) => match response.into_result() {
                    Ok(result) => {
                        return Some(Response::ok(frontend_request_id, result).into());
                    }
                    Err(error) => {
                        last_error = Some(error);
                    }
                },
                Some(other) => return Some(other),
                None => return None,
            }
        }
        let error = last_error.unwrap_or_else(|| RpcError::method_not_found(method));
        Some(Response::err(frontend_request_id, error).into())
    }

    fn track_subscription(
        &self,
        frontend_id: &str,
        method: &str,
        wire_uri: &str,
        reply: &Option<Message>,
    ) {
        let succeeded = matches!(
            reply,
            Some(Message::Response(response)) if response.result().is_ok()
        );
        if !succeeded {
            return;
        }
        if let Ok(mut frontends) = self.frontends.lock() {
            if let Some(entry) = frontends.get_mut(frontend_id) {
                match method {
                    methods::RESOURCES_SUBSCRIBE => {
                        entry.subscriptions.insert(wire_uri.to_string());
                    }
                    methods::RESOURCES_UNSUBSCRIBE => {
                        entry.subscriptions.remove(wire_uri);
                    }
                    _ => {}
                }
            }
        }
    }

    fn resolve_reverse(&self, response: Response) {
        let waiter = self
            .reverse_pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&response.id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response.into_result());
            }
            None => {
                tracing::warn!(id = %response.id, "dropping response with unknown id");
            }
        }
    }

    /// Fan a backend notification out to the attached frontends, renaming
    /// resource URIs into wire form. Resource-updated notifications go only
    /// to subscribers.
    pub async fn fan_out(&self, server: &str, mut notification: Notification) {
        let mut only_subscribers: Option<String> = None;
        if notification.method == methods::NOTIF_RESOURCES_UPDATED {
            if let RouteTarget::Aggregate { aggregator, .. } = &self.target {
                let snapshot = aggregator.snapshot();
                if let Some(original) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                {
                    if let Some(wire) = snapshot.wire_resource_uri(server, original) {
                        let wire = wire.to_string();
                        if let Some(params) = notification.params.as_mut() {
                            params["uri"] = Value::String(wire.clone());
                        }
                        only_subscribers = Some(wire);
                    }
                }
            }
        }

        let sinks: Vec<Arc<dyn FrontendSink>> = self
            .frontends
            .lock()
            .map(|frontends| {
                frontends
                    .values()
                    .filter(|entry| match &only_subscribers {
                        Some(uri) => entry.subscriptions.contains(uri),
                        None => true,
                    })
                    .map(|entry| Arc::clone(&entry.sink))
                    .collect()
            })
            .unwrap_or_default();

        let message: Message = notification.into();
        for sink in sinks {
            let _ = sink.push(message.clone()).await;
        }
    }

    /// Push a synthetic list-changed notification to every frontend.
    pub async fn broadcast_method(&self, method: &str) {
        let message: Message = Notification::new(method, None).into();
        let sinks: Vec<Arc<dyn FrontendSink>> = self
            .frontends
            .lock()
            .map(|f| f.values().map(|e| Arc::clone(&e.sink)).collect())
            .unwrap_or_default();
        for sink in sinks {
            let _ = sink.push(message.clone()).await;
        }
    }

    /// Whether any frontend is currently attached.
    #[must_use]
    pub fn has_frontends(&self) -> bool {
        self.frontends.lock().map(|f| !f.is_empty()).unwrap_or(false)
    }

    fn sole_frontend(&self) -> Option<Arc<dyn FrontendSink>> {
        self.frontends
            .lock()
            .ok()
            .and_then(|frontends| {
                if frontends.len() == 1 {
                    frontends.values().next().map(|e| Arc::clone(&e.sink))
                } else {
                    None
                }
            })
    }
}

#[async_trait]
impl SessionHandler for ProxyEngine {
    /// Backend-initiated request (sampling). Forwarded when exactly one
    /// frontend is attached; with zero or several there is no well-defined
    /// responder.
    async fn on_request(&self, server: &str, request: Request) -> Result<Value, RpcError> {
        let Some(sink) = self.sole_frontend() else {
            tracing::debug!(server = %server, method = %request.method, "no unique frontend for backend request");
            return Err(RpcError::method_not_found(&request.method));
        };

        let forward_id = RequestId::Number(self.next_reverse_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.reverse_pending.lock() {
            pending.insert(forward_id.clone(), tx);
        }

        let forwarded: Message =
            Request::new(forward_id.clone(), request.method.clone(), request.params).into();
        if !sink.push(forwarded).await {
            if let Ok(mut pending) = self.reverse_pending.lock() {
                pending.remove(&forward_id);
            }
            return Err(RpcError::backend_unavailable("frontend", "client disconnected"));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::internal("frontend never answered")),
        }
    }

    async fn on_notification(&self, server: &str, notification: Notification) {
        self.fan_out(server, notification).await;
    }
}

impl std::fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.target {
            RouteTarget::Single(b) => format!("single({})", b.name()),
            RouteTarget::Aggregate { backends, .. } => format!("aggregate({})", backends.len()),
        };
        f.debug_struct("ProxyEngine").field("target", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Capabilities;
    use crate::config::{BridgeSettings, ServerConfig};
    use crate::session::ClientSession;
    use crate::transport::Duplex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-process MCP server that answers tool calls by naming itself, and
    /// records every frame it received.
    fn serve_backend(
        mut peer: Duplex,
        who: &'static str,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = peer.recv().await {
                let _ = seen_tx.send(message.clone());
                if let Message::Request(req) = message {
                    let reply = match req.method.as_str() {
                        "initialize" => Response::ok(
                            req.id,
                            json!({
                                "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                                "capabilities": {"tools": {}},
                                "serverInfo": {"name": who, "version": "0"},
                            }),
                        ),
                        "tools/call" => Response::ok(
                            req.id,
                            json!({
                                "content": [{"type": "text", "text": who}],
                                "tool": req.params.and_then(|p| p.get("name").cloned()),
                            }),
                        ),
                        "ping" => Response::ok(req.id, json!({"from": who})),
                        "resources/subscribe" => Response::ok(req.id, json!({})),
                        "slow" => continue,
                        other => Response::err(req.id, RpcError::method_not_found(other)),
                    };
                    let _ = peer.send(reply.into()).await;
                }
            }
        });
        seen_rx
    }

    fn backend_with_tools(
        name: &str,
        who: &'static str,
        tools: Vec<Value>,
    ) -> (Arc<ManagedBackend>, mpsc::UnboundedReceiver<Message>) {
        let (client, server) = Duplex::pair();
        let seen = serve_backend(server, who);
        let session = ClientSession::connect(name, client);
        let (events_tx, _events_rx) = mpsc::channel(32);
        let config = ServerConfig { name: name.into(), command: "test".into(), ..ServerConfig::default() };
        let backend = ManagedBackend::connected_for_tests(config, session, events_tx);
        backend.set_capabilities_for_tests(Capabilities { tools, ..Capabilities::default() });
        (backend, seen)
    }

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": "", "inputSchema": {"type": "object"}})
    }

    struct RecordingSink(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl FrontendSink for RecordingSink {
        async fn push(&self, message: Message) -> bool {
            self.0.send(message).is_ok()
        }
    }

    fn aggregate_engine(
        backends: Vec<Arc<ManagedBackend>>,
        settings: BridgeSettings,
    ) -> Arc<ProxyEngine> {
        let aggregator = Arc::new(Aggregator::new(settings));
        aggregator.rebuild(&backends);
        ProxyEngine::aggregate(backends, aggregator)
    }

    #[tokio::test]
    async fn single_forward_preserves_frontend_id() {
        let (backend, mut seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        let engine = ProxyEngine::single(backend);

        let request = Request::new(7, "tools/call", Some(json!({"name": "echo"})));
        let reply = engine.handle("f1", request.into()).await.unwrap();
        match reply {
            Message::Response(response) => {
                assert_eq!(response.id, RequestId::Number(7));
                let result = response.into_result().unwrap();
                assert_eq!(result["content"][0]["text"], "echo");
            }
            other => panic!("expected response, got {other:?}"),
        }

        // The backend never saw the frontend's id.
        let forwarded = seen.recv().await.unwrap();
        match forwarded {
            Message::Request(req) => assert_ne!(req.id, RequestId::Number(7)),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_forwarded_not_answered_locally() {
        let (backend, mut seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        let engine = ProxyEngine::single(Arc::clone(&backend));

        let reply = engine.handle("f1", Request::new(3, "ping", None).into()).await.unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        assert_eq!(response.id, RequestId::Number(3));
        assert_eq!(response.into_result().unwrap()["from"], "echo");
        let forwarded = seen.recv().await.unwrap();
        assert_eq!(forwarded.method(), Some("ping"));

        // A dead backend must fail the ping, not fake liveness.
        backend.current_session().unwrap().close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = engine.handle("f1", Request::new(4, "ping", None).into()).await.unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, crate::protocol::codes::SERVER_ERROR);
        assert_eq!(err.data.unwrap()["unavailable"], true);
    }

    #[tokio::test]
    async fn aggregate_ping_routes_to_a_reachable_backend() {
        let (a, _seen) = backend_with_tools("a", "server-a", vec![tool("x")]);
        let engine = aggregate_engine(vec![a], BridgeSettings::default());
        let reply = engine.handle("f1", Request::new(1, "ping", None).into()).await.unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        assert_eq!(response.into_result().unwrap()["from"], "server-a");
    }

    #[tokio::test]
    async fn initialize_is_intercepted_and_double_init_rejected() {
        let (backend, mut seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        let engine = aggregate_engine(vec![backend], BridgeSettings::default());
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        engine.attach("f1", Arc::new(RecordingSink(sink_tx)));

        let reply = engine
            .handle("f1", Request::new(1, "initialize", Some(json!({"capabilities": {}}))).into())
            .await
            .unwrap();
        match reply {
            Message::Response(response) => {
                let result = response.into_result().unwrap();
                assert!(result["capabilities"]["tools"].is_object());
            }
            other => panic!("expected response, got {other:?}"),
        }

        // The handshake never crossed the bridge.
        assert!(seen.try_recv().is_err());

        // notifications/initialized is absorbed.
        let absorbed = engine
            .handle("f1", Notification::new("notifications/initialized", None).into())
            .await;
        assert!(absorbed.is_none());

        let second = engine
            .handle("f1", Request::new(2, "initialize", None).into())
            .await
            .unwrap();
        match second {
            Message::Response(response) => {
                let err = response.into_result().unwrap_err();
                assert_eq!(err.code, crate::protocol::codes::INVALID_REQUEST);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aggregate_routes_namespaced_call_to_owner() {
        let (a, mut seen_a) = backend_with_tools("a", "server-a", vec![tool("search")]);
        let (b, _seen_b) = backend_with_tools("b", "server-b", vec![tool("search")]);
        let settings = BridgeSettings { default_namespace: true, ..BridgeSettings::default() };
        let engine = aggregate_engine(vec![a, b], settings);

        // tools/list is served from the union, already namespaced.
        let reply = engine
            .handle("f1", Request::new(1, "tools/list", None).into())
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        let tools = response.into_result().unwrap();
        let names: Vec<&str> =
            tools["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert!(names.contains(&"a.search"));
        assert!(names.contains(&"b.search"));

        // The namespaced call lands on backend a, un-prefixed.
        let reply = engine
            .handle("f1", Request::new(2, "tools/call", Some(json!({"name": "a.search"}))).into())
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        let result = response.into_result().unwrap();
        assert_eq!(result["content"][0]["text"], "server-a");
        assert_eq!(result["tool"], "search");
        let forwarded = seen_a.recv().await.unwrap();
        assert_eq!(
            forwarded.method(),
            Some("tools/call"),
        );

        // The bare name resolves nowhere.
        let reply = engine
            .handle("f1", Request::new(3, "tools/call", Some(json!({"name": "search"}))).into())
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, crate::protocol::codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn cancellation_translates_to_backend_id() {
        let (backend, mut seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        let engine = ProxyEngine::single(backend);

        let pending = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.handle("f1", Request::new(7, "slow", None).into()).await
            })
        };

        // Wait until the backend has the forwarded request.
        let forwarded = seen.recv().await.unwrap();
        let Message::Request(forwarded) = forwarded else { panic!("expected request") };
        assert_ne!(forwarded.id, RequestId::Number(7));

        // Frontend cancels by its own id.
        let cancel = Notification::new(
            "notifications/cancelled",
            Some(json!({"requestId": 7, "reason": "user"})),
        );
        engine.handle("f1", cancel.into()).await;

        // No response reaches the frontend for id 7.
        let reply = pending.await.unwrap();
        assert!(reply.is_none());

        // The backend sees the cancellation under the mapped id.
        let note = seen.recv().await.unwrap();
        let Message::Notification(note) = note else { panic!("expected notification") };
        assert_eq!(note.method, "notifications/cancelled");
        assert_eq!(note.params.unwrap()["requestId"], json!(forwarded.id));
    }

    #[tokio::test]
    async fn backend_error_is_relayed_verbatim() {
        let (backend, _seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        let engine = ProxyEngine::single(backend);
        let reply = engine
            .handle("f1", Request::new(4, "no/such/method", None).into())
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        assert_eq!(response.id, RequestId::Number(4));
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, crate::protocol::codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn fan_out_renames_updated_resource_for_subscribers() {
        let (backend, _seen) = backend_with_tools("fs", "fs", Vec::new());
        backend.set_capabilities_for_tests(Capabilities {
            resources: vec![json!({"uri": "file:///tmp/a", "name": "a"})],
            ..Capabilities::default()
        });
        let settings = BridgeSettings { default_namespace: true, ..BridgeSettings::default() };
        let engine = aggregate_engine(vec![Arc::clone(&backend)], settings);

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        engine.attach("f1", Arc::new(RecordingSink(sink_tx)));

        // Subscribe through the wire name so the engine tracks it.
        let reply = engine
            .handle(
                "f1",
                Request::new(1, "resources/subscribe", Some(json!({"uri": "fs+file:///tmp/a"})))
                    .into(),
            )
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        assert!(response.result().is_ok());

        // The backend reports the original URI; subscribers see the wire one.
        engine
            .fan_out(
                "fs",
                Notification::new(
                    "notifications/resources/updated",
                    Some(json!({"uri": "file:///tmp/a"})),
                ),
            )
            .await;
        let got = sink_rx.recv().await.unwrap();
        let Message::Notification(note) = got else { panic!("expected notification") };
        assert_eq!(note.params.unwrap()["uri"], "fs+file:///tmp/a");

        // List-changed style notifications reach every frontend.
        engine
            .fan_out("fs", Notification::new("notifications/tools/list_changed", None))
            .await;
        let got = sink_rx.recv().await.unwrap();
        assert_eq!(got.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn disconnected_backend_yields_unavailable() {
        let (backend, _seen) = backend_with_tools("echo", "echo", vec![tool("echo")]);
        backend.current_session().unwrap().close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let engine = ProxyEngine::single(Arc::clone(&backend));
        let reply = engine
            .handle("f1", Request::new(9, "tools/call", Some(json!({"name": "echo"}))).into())
            .await
            .unwrap();
        let Message::Response(response) = reply else { panic!("expected response") };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, crate::protocol::codes::SERVER_ERROR);
        assert_eq!(err.data.unwrap()["unavailable"], true);
    }
}
