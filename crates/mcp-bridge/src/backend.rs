//! Managed backend supervisor.
//!
//! One supervisor per configured server. It brings the backend to
//! `connected` through the initialize handshake, primes the capability
//! cache, then watches liveness: health probes on an interval, exponential
//! backoff across reconnect attempts, and a recovery schedule once the
//! failure budget is spent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{FailoverConfig, ServerConfig, TransportType};
use crate::error::{SessionError, SessionResult, TransportError};
use crate::protocol::{Notification, Request, RpcError, methods};
use crate::session::{ClientSession, SessionHandler};
use crate::transport::http::HttpOptions;
use crate::transport::{http, sse, stdio};

/// Cap on the exponential reconnect backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Lifecycle state of one managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Disabled,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Which capability list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    /// The frontend-facing notification for this kind.
    #[must_use]
    pub fn changed_method(self) -> &'static str {
        match self {
            Self::Tools => methods::NOTIF_TOOLS_CHANGED,
            Self::Resources => methods::NOTIF_RESOURCES_CHANGED,
            Self::Prompts => methods::NOTIF_PROMPTS_CHANGED,
        }
    }
}

/// Events the supervisor reports to the bridge.
#[derive(Debug)]
pub enum BackendEvent {
    /// A capability list changed; the union must be rebuilt and the matching
    /// list-changed notification fanned out.
    ListChanged { server: String, kind: ListKind },
    /// Status transition, for the union (connected backends only count) and
    /// the status observer.
    StatusChanged { server: String, status: BackendStatus },
    /// A pass-through notification from the backend (progress, log
    /// messages, resource updates).
    Notification { server: String, notification: Notification },
}

/// Cached capability lists, published as an immutable snapshot.
#[derive(Debug, Default, Clone)]
pub struct Capabilities {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub prompts: Vec<Value>,
}

impl Capabilities {
    fn names(list: &[Value]) -> Vec<String> {
        list.iter()
            .filter_map(|item| item.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn tool_names(&self) -> Vec<String> {
        Self::names(&self.tools)
    }

    #[must_use]
    pub fn prompt_names(&self) -> Vec<String> {
        Self::names(&self.prompts)
    }

    #[must_use]
    pub fn resource_uris(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter_map(|item| item.get("uri").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

/// Host-level knobs that apply to every backend the bridge spawns.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// `--env KEY VAL` pairs, below descriptor env.
    pub extra_env: HashMap<String, String>,
    /// `--pass-environment`: children inherit the full host environment.
    pub pass_environment: bool,
    /// Re-initialize retry budget for outbound remote transports.
    pub remote_retries: u32,
}

/// One backend together with its supervisor state.
pub struct ManagedBackend {
    config: ServerConfig,
    options: RuntimeOptions,
    failover: FailoverConfig,
    status: RwLock<BackendStatus>,
    session: RwLock<Option<ClientSession>>,
    capabilities: RwLock<Arc<Capabilities>>,
    last_seen: RwLock<Option<DateTime<Utc>>>,
    failure_count: AtomicU32,
    last_error: RwLock<Option<String>>,
    /// Upstream handler (the proxy engine) for backend-initiated requests
    /// and pass-through notifications. Non-owning.
    delegate: RwLock<Option<Weak<dyn SessionHandler>>>,
    events: mpsc::Sender<BackendEvent>,
    shutdown: CancellationToken,
}

impl ManagedBackend {
    #[must_use]
    pub fn new(
        config: ServerConfig,
        options: RuntimeOptions,
        failover: FailoverConfig,
        events: mpsc::Sender<BackendEvent>,
    ) -> Arc<Self> {
        let initial = if config.enabled { BackendStatus::Connecting } else { BackendStatus::Disabled };
        Arc::new(Self {
            config,
            options,
            failover,
            status: RwLock::new(initial),
            session: RwLock::new(None),
            capabilities: RwLock::new(Arc::new(Capabilities::default())),
            last_seen: RwLock::new(None),
            failure_count: AtomicU32::new(0),
            last_error: RwLock::new(None),
            delegate: RwLock::new(None),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> BackendStatus {
        self.status.read().map_or(BackendStatus::Failed, |s| *s)
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Lock-free-ish read of the capability snapshot.
    #[must_use]
    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.capabilities
            .read()
            .map_or_else(|_| Arc::new(Capabilities::default()), |c| Arc::clone(&c))
    }

    /// Register the engine that answers backend-initiated requests.
    pub fn set_delegate(&self, delegate: &Arc<dyn SessionHandler>) {
        if let Ok(mut slot) = self.delegate.write() {
            *slot = Some(Arc::downgrade(delegate));
        }
    }

    /// Spawn the supervisor task. Disabled backends stay `disabled` and
    /// never connect.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::info!(server = %self.config.name, "backend disabled, not starting");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    /// Issue one request against the connected session. Resets the failure
    /// count on the first success after a reconnect.
    pub async fn request(&self, method: &str, params: Option<Value>) -> SessionResult<Value> {
        let session = self.current_session().ok_or(SessionError::Closed)?;
        let result = session.request(method, params, self.config.request_timeout()).await;
        if result.is_ok() {
            self.touch();
            self.failure_count.store(0, Ordering::SeqCst);
        }
        result
    }

    /// Like [`ManagedBackend::request`], with a caller-chosen id so the
    /// request stays cancellable.
    pub async fn request_with_id(
        &self,
        id: crate::protocol::RequestId,
        method: &str,
        params: Option<Value>,
    ) -> SessionResult<Value> {
        let session = self.current_session().ok_or(SessionError::Closed)?;
        let result = session
            .request_with_id(id, method, params, self.config.request_timeout())
            .await;
        if result.is_ok() {
            self.touch();
            self.failure_count.store(0, Ordering::SeqCst);
        }
        result
    }

    /// Forward a notification to the backend.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> SessionResult<()> {
        let session = self.current_session().ok_or(SessionError::Closed)?;
        session.notify(method, params).await
    }

    /// Cancel an in-flight request by the id used to issue it.
    pub async fn cancel(&self, id: &crate::protocol::RequestId, reason: Option<&str>) {
        if let Some(session) = self.current_session() {
            session.cancel(id, reason).await;
        }
    }

    /// Allocate an id on the live session, for cancellable requests.
    pub fn allocate_id(&self) -> Option<crate::protocol::RequestId> {
        self.current_session().map(|s| s.allocate_id())
    }

    #[must_use]
    pub fn current_session(&self) -> Option<ClientSession> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    /// Entry for the `/status` document.
    #[must_use]
    pub fn status_entry(&self) -> Value {
        let caps = self.capabilities();
        json!({
            "enabled": self.config.enabled,
            "command": self.config.command,
            "status": self.status(),
            "last_seen": self.last_seen.read().ok().and_then(|t| *t).map(|t| t.to_rfc3339()),
            "failure_count": self.failure_count(),
            "last_error": self.last_error.read().ok().and_then(|e| e.clone()),
            "capabilities": {
                "tools": caps.tool_names(),
                "resources": caps.resource_uris(),
                "prompts": caps.prompt_names(),
            },
            "config": self.config.sanitized(),
        })
    }

    /// Graceful shutdown: stop sending, close the session (children get the
    /// stdin-close → grace → kill sequence from the transport).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(session) = self.take_session() {
            session.close();
        }
        self.set_status(BackendStatus::Disconnected).await;
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(session) = self.connect_with_retries().await {
                self.watch(&session).await;
                if let Some(stale) = self.take_session() {
                    stale.close();
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_status(BackendStatus::Failed).await;
            let recovery = self.failover.recovery_interval_duration();
            tracing::info!(
                server = %self.config.name,
                seconds = recovery.as_secs_f64(),
                "scheduling recovery attempt"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(recovery) => {}
            }
        }
        if let Some(session) = self.take_session() {
            session.close();
        }
        self.set_status(BackendStatus::Disconnected).await;
    }

    /// Try to connect up to `retryAttempts` times with doubling backoff.
    async fn connect_with_retries(self: &Arc<Self>) -> Option<ClientSession> {
        let attempts = self.config.retry_attempts.max(1);
        for attempt in 0..attempts {
            if self.shutdown.is_cancelled() {
                return None;
            }
            self.set_status(BackendStatus::Connecting).await;
            match self.connect_once().await {
                Ok(session) => {
                    self.failure_count.store(0, Ordering::SeqCst);
                    if let Ok(mut slot) = self.last_error.write() {
                        *slot = None;
                    }
                    self.touch();
                    self.set_status(BackendStatus::Connected).await;
                    return Some(session);
                }
                Err(e) => {
                    self.record_failure(&e.to_string());
                    tracing::warn!(
                        server = %self.config.name,
                        attempt = attempt + 1,
                        error = %e,
                        "connect failed"
                    );
                    let backoff = self
                        .config
                        .retry_delay_duration()
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_RETRY_BACKOFF);
                    tokio::select! {
                        () = self.shutdown.cancelled() => return None,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        None
    }

    async fn connect_once(self: &Arc<Self>) -> SessionResult<ClientSession> {
        let duplex = match self.config.transport_type {
            TransportType::Stdio => {
                stdio::spawn(&self.config, &self.options.extra_env, self.options.pass_environment)?
            }
            TransportType::Sse => {
                let url = self.remote_url()?;
                sse::connect(&self.config.name, &url, &self.config.headers, self.options.remote_retries)
                    .await?
            }
            TransportType::Http => {
                let url = self.remote_url()?;
                http::connect(
                    &self.config.name,
                    &url,
                    &self.config.headers,
                    HttpOptions { stateless: false, remote_retries: self.options.remote_retries },
                )?
            }
        };

        let session = ClientSession::connect(&self.config.name, duplex);
        let handler: Arc<dyn SessionHandler> = Arc::clone(self) as Arc<dyn SessionHandler>;
        session.set_handler(&handler);

        let client_info = json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        });
        session
            .initialize(client_info, self.config.request_timeout())
            .await
            .map_err(|e| {
                session.close();
                e
            })?;

        if let Ok(mut slot) = self.session.write() {
            *slot = Some(session.clone());
        }
        self.prime_capabilities(&session).await;
        Ok(session)
    }

    fn remote_url(&self) -> Result<String, TransportError> {
        self.config
            .url
            .clone()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing url", self.config.name)))
    }

    /// Populate the capability cache. A `-32601` means the backend simply
    /// lacks that capability and is not an error.
    async fn prime_capabilities(&self, session: &ClientSession) {
        let tools = self.fetch_list(session, methods::TOOLS_LIST, "tools").await;
        let resources = self.fetch_list(session, methods::RESOURCES_LIST, "resources").await;
        let resource_templates = self
            .fetch_list(session, methods::RESOURCES_TEMPLATES_LIST, "resourceTemplates")
            .await;
        let prompts = self.fetch_list(session, methods::PROMPTS_LIST, "prompts").await;

        tracing::info!(
            server = %self.config.name,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "capabilities primed"
        );
        self.publish_capabilities(Capabilities { tools, resources, resource_templates, prompts });
        for kind in [ListKind::Tools, ListKind::Resources, ListKind::Prompts] {
            self.emit(BackendEvent::ListChanged { server: self.config.name.clone(), kind });
        }
    }

    async fn fetch_list(&self, session: &ClientSession, method: &str, key: &str) -> Vec<Value> {
        match session.request(method, None, self.config.request_timeout()).await {
            Ok(result) => result
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(SessionError::Rpc(e)) if e.is_method_not_found() => Vec::new(),
            Err(e) => {
                tracing::warn!(server = %self.config.name, method = %method, error = %e, "capability probe failed");
                Vec::new()
            }
        }
    }

    /// Re-fetch one list after a list-changed notification.
    async fn refresh_list(&self, kind: ListKind) {
        let Some(session) = self.current_session() else { return };
        let mut caps = (*self.capabilities()).clone();
        match kind {
            ListKind::Tools => {
                caps.tools = self.fetch_list(&session, methods::TOOLS_LIST, "tools").await;
            }
            ListKind::Resources => {
                caps.resources = self.fetch_list(&session, methods::RESOURCES_LIST, "resources").await;
                caps.resource_templates = self
                    .fetch_list(&session, methods::RESOURCES_TEMPLATES_LIST, "resourceTemplates")
                    .await;
            }
            ListKind::Prompts => {
                caps.prompts = self.fetch_list(&session, methods::PROMPTS_LIST, "prompts").await;
            }
        }
        self.publish_capabilities(caps);
        self.emit(BackendEvent::ListChanged { server: self.config.name.clone(), kind });
    }

    fn publish_capabilities(&self, caps: Capabilities) {
        if let Ok(mut slot) = self.capabilities.write() {
            *slot = Arc::new(caps);
        }
    }

    /// Watch a connected session: leave on shutdown, transport death, or a
    /// spent health-failure budget.
    async fn watch(&self, session: &ClientSession) {
        let closed = session.closed_token();
        if !self.config.health_check.enabled {
            tokio::select! {
                () = self.shutdown.cancelled() => {}
                () = closed.cancelled() => {
                    self.record_failure("session closed");
                }
            }
            return;
        }

        let interval = self.config.health_check.interval_duration();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = closed.cancelled() => {
                    self.record_failure("session closed");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
            match self.health_probe(session).await {
                Ok(()) => {
                    self.touch();
                    self.failure_count.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let failures = self.record_failure(&e.to_string());
                    tracing::warn!(
                        server = %self.config.name,
                        failures,
                        error = %e,
                        "health check failed"
                    );
                    if self.failover.enabled && failures >= self.failover.max_failures {
                        return;
                    }
                }
            }
        }
    }

    /// Cheap liveness probe: `ping`, falling back to `tools/list` for
    /// backends that do not implement it.
    async fn health_probe(&self, session: &ClientSession) -> SessionResult<()> {
        let timeout = self.config.health_check.timeout_duration();
        match session.request(methods::PING, None, timeout).await {
            Ok(_) => Ok(()),
            Err(SessionError::Rpc(e)) if e.is_method_not_found() => {
                session.request(methods::TOOLS_LIST, None, timeout).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    fn record_failure(&self, error: &str) -> u32 {
        if let Ok(mut slot) = self.last_error.write() {
            *slot = Some(error.to_string());
        }
        self.failure_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn touch(&self) {
        if let Ok(mut slot) = self.last_seen.write() {
            *slot = Some(Utc::now());
        }
    }

    fn take_session(&self) -> Option<ClientSession> {
        self.session.write().ok().and_then(|mut s| s.take())
    }

    async fn set_status(&self, status: BackendStatus) {
        let changed = self
            .status
            .write()
            .map(|mut slot| {
                let changed = *slot != status;
                *slot = status;
                changed
            })
            .unwrap_or(false);
        if changed {
            tracing::info!(server = %self.config.name, status = %status, "backend status");
            self.emit(BackendEvent::StatusChanged {
                server: self.config.name.clone(),
                status,
            });
        }
    }

    fn emit(&self, event: BackendEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(server = %self.config.name, error = %e, "event channel full or closed");
        }
    }

    fn delegate(&self) -> Option<Arc<dyn SessionHandler>> {
        self.delegate.read().ok().and_then(|slot| slot.as_ref().and_then(Weak::upgrade))
    }
}

#[cfg(test)]
impl ManagedBackend {
    /// Backend already in `connected` state over an injected session, for
    /// engine tests that drive everything through in-memory transports.
    pub(crate) fn connected_for_tests(
        config: ServerConfig,
        session: ClientSession,
        events: mpsc::Sender<BackendEvent>,
    ) -> Arc<Self> {
        let backend =
            Self::new(config, RuntimeOptions::default(), FailoverConfig::default(), events);
        if let Ok(mut slot) = backend.session.write() {
            *slot = Some(session);
        }
        if let Ok(mut slot) = backend.status.write() {
            *slot = BackendStatus::Connected;
        }
        backend
    }

    pub(crate) fn set_capabilities_for_tests(&self, caps: Capabilities) {
        self.publish_capabilities(caps);
    }
}

#[async_trait]
impl SessionHandler for ManagedBackend {
    /// Backend-initiated requests (sampling and friends) go to the proxy
    /// engine when one is attached.
    async fn on_request(&self, server: &str, request: Request) -> Result<Value, RpcError> {
        match self.delegate() {
            Some(delegate) => delegate.on_request(server, request).await,
            None => Err(RpcError::method_not_found(&request.method)),
        }
    }

    async fn on_notification(&self, server: &str, notification: Notification) {
        let kind = match notification.method.as_str() {
            methods::NOTIF_TOOLS_CHANGED => Some(ListKind::Tools),
            methods::NOTIF_RESOURCES_CHANGED => Some(ListKind::Resources),
            methods::NOTIF_PROMPTS_CHANGED => Some(ListKind::Prompts),
            _ => None,
        };
        if let Some(kind) = kind {
            // Invalidate the cache before anyone re-reads the union.
            self.refresh_list(kind).await;
            return;
        }
        self.emit(BackendEvent::Notification {
            server: server.to_string(),
            notification,
        });
    }
}

impl std::fmt::Debug for ManagedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBackend")
            .field("name", &self.config.name)
            .field("status", &self.status())
            .field("failures", &self.failure_count())
            .finish()
    }
}
