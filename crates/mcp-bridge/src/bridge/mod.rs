//! Bridge assembly.
//!
//! Owns the backend pool, the aggregation layer, and the proxy engines (one
//! aggregating engine plus a direct engine per named backend). A single
//! event loop consumes supervisor events: list changes rebuild the union and
//! fan the matching notification out, status changes rebuild the union, and
//! pass-through notifications reach every attached frontend.

pub mod aggregate;
pub mod proxy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendEvent, ListKind, ManagedBackend, RuntimeOptions};
use crate::config::{BridgeSettings, ServerConfig};
use crate::protocol::{Notification, Request, RpcError};
use crate::session::SessionHandler;

use aggregate::Aggregator;
use proxy::ProxyEngine;

/// Depth of the supervisor event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The server-side bridge: backend pool plus aggregation plus engines.
pub struct Bridge {
    backends: Vec<Arc<ManagedBackend>>,
    aggregator: Arc<Aggregator>,
    engine: Arc<ProxyEngine>,
    direct_engines: HashMap<String, Arc<ProxyEngine>>,
    last_activity: RwLock<Option<DateTime<Utc>>>,
    events: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Assemble the bridge from the configured server set. Call
    /// [`Bridge::start`] to actually connect anything.
    #[must_use]
    pub fn new(
        servers: Vec<ServerConfig>,
        settings: BridgeSettings,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let backends: Vec<Arc<ManagedBackend>> = servers
            .into_iter()
            .map(|config| {
                ManagedBackend::new(
                    config,
                    options.clone(),
                    settings.failover.clone(),
                    events_tx.clone(),
                )
            })
            .collect();

        let aggregator = Arc::new(Aggregator::new(settings));
        let engine = ProxyEngine::aggregate(backends.clone(), Arc::clone(&aggregator));
        let direct_engines: HashMap<String, Arc<ProxyEngine>> = backends
            .iter()
            .map(|b| (b.name().to_string(), ProxyEngine::single(Arc::clone(b))))
            .collect();

        let bridge = Arc::new(Self {
            backends,
            aggregator,
            engine,
            direct_engines,
            last_activity: RwLock::new(None),
            events: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        });

        // Backends route their server-initiated traffic through the bridge.
        let handler: Arc<dyn SessionHandler> = Arc::clone(&bridge) as Arc<dyn SessionHandler>;
        for backend in &bridge.backends {
            backend.set_delegate(&handler);
        }
        bridge
    }

    /// Start every enabled supervisor and the event loop.
    pub fn start(self: &Arc<Self>) {
        for backend in &self.backends {
            backend.start();
        }
        if let Some(events) = self.events.lock().ok().and_then(|mut slot| slot.take()) {
            let bridge = Arc::clone(self);
            tokio::spawn(async move { bridge.event_loop(events).await });
        }
    }

    /// The aggregating engine behind `/sse` and `/mcp`.
    #[must_use]
    pub fn engine(&self) -> Arc<ProxyEngine> {
        Arc::clone(&self.engine)
    }

    /// The direct engine behind `/servers/<name>/…`.
    #[must_use]
    pub fn direct_engine(&self, server: &str) -> Option<Arc<ProxyEngine>> {
        self.direct_engines.get(server).map(Arc::clone)
    }

    #[must_use]
    pub fn backend(&self, server: &str) -> Option<Arc<ManagedBackend>> {
        self.backends.iter().find(|b| b.name() == server).map(Arc::clone)
    }

    #[must_use]
    pub fn backends(&self) -> &[Arc<ManagedBackend>] {
        &self.backends
    }

    /// Record frontend activity for the status observer.
    pub fn touch_activity(&self) {
        if let Ok(mut slot) = self.last_activity.write() {
            *slot = Some(Utc::now());
        }
    }

    /// The `/status` introspection document.
    #[must_use]
    pub fn status_document(&self) -> Value {
        let instances: serde_json::Map<String, Value> = self
            .backends
            .iter()
            .map(|b| (b.name().to_string(), b.status_entry()))
            .collect();
        json!({
            "api_last_activity": self
                .last_activity
                .read()
                .ok()
                .and_then(|t| *t)
                .map(|t| t.to_rfc3339()),
            "server_instances": instances,
        })
    }

    /// Shutdown cascade: engines stop fanning out, supervisors close their
    /// children.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for backend in &self.backends {
            backend.shutdown().await;
        }
        tracing::info!("bridge shut down");
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<BackendEvent>) {
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };
            self.on_event(event).await;
        }
    }

    async fn on_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::ListChanged { server, kind } => {
                self.aggregator.rebuild(&self.backends);
                self.engine.broadcast_method(kind.changed_method()).await;
                if let Some(direct) = self.direct_engines.get(&server) {
                    direct.broadcast_method(kind.changed_method()).await;
                }
            }
            BackendEvent::StatusChanged { server, status } => {
                tracing::debug!(server = %server, status = %status, "rebuilding union");
                self.aggregator.rebuild(&self.backends);
                // The union may have gained or lost entries wholesale.
                for kind in [ListKind::Tools, ListKind::Resources, ListKind::Prompts] {
                    self.engine.broadcast_method(kind.changed_method()).await;
                }
            }
            BackendEvent::Notification { server, notification } => {
                self.engine.fan_out(&server, notification.clone()).await;
                if let Some(direct) = self.direct_engines.get(&server) {
                    direct.fan_out(&server, notification).await;
                }
            }
        }
    }
}

#[async_trait]
impl SessionHandler for Bridge {
    /// Backend-initiated requests prefer the backend's direct frontend when
    /// one is attached, falling back to the aggregated surface.
    async fn on_request(&self, server: &str, request: Request) -> Result<Value, RpcError> {
        if let Some(direct) = self.direct_engines.get(server) {
            if direct.has_frontends() {
                return direct.on_request(server, request).await;
            }
        }
        self.engine.on_request(server, request).await
    }

    async fn on_notification(&self, server: &str, notification: Notification) {
        self.engine.fan_out(server, notification.clone()).await;
        if let Some(direct) = self.direct_engines.get(server) {
            direct.fan_out(server, notification).await;
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("backends", &self.backends.len()).finish()
    }
}
