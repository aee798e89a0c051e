//! HTTP handlers.
//!
//! Endpoint map:
//! - `GET /status`: introspection document.
//! - `GET /sse` + `POST /messages/`: aggregated bridge over SSE.
//! - `POST|GET|DELETE /mcp`: aggregated bridge over streamable HTTP.
//! - `/servers/{name}/sse|messages/|mcp`: direct access to one backend,
//!   no aggregation, no namespacing.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::frontend::{FrontendSession, SessionManager};
use crate::bridge::Bridge;
use crate::bridge::proxy::ProxyEngine;
use crate::protocol::{Message, RpcError, codes};

/// Session id header for the streamable-HTTP transport. Emitted exactly in
/// this casing; matched case-insensitively on input as HTTP requires.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub sessions: SessionManager,
    /// Streamable HTTP runs without session ids.
    pub stateless: bool,
}

/// Query parameters for the SSE messages endpoint.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    session_id: Option<String>,
    /// Some SDKs camel-case the parameter.
    #[serde(rename = "sessionId")]
    session_id_camel: Option<String>,
}

impl SessionQuery {
    fn id(&self) -> Option<&str> {
        self.session_id.as_deref().or(self.session_id_camel.as_deref())
    }
}

/// Build the router.
pub fn create_router(state: Arc<AppState>, allow_origin: Option<&str>) -> Router {
    state.sessions.start_cleanup_task();

    let mut router = Router::new()
        .route("/status", get(handle_status))
        .route("/sse", get(handle_sse))
        .route("/messages/", axum::routing::post(handle_messages))
        .route(
            "/mcp",
            axum::routing::post(handle_mcp_post)
                .get(handle_mcp_get)
                .delete(handle_mcp_delete),
        )
        .route("/servers/{name}/sse", get(handle_server_sse))
        .route("/servers/{name}/messages/", axum::routing::post(handle_server_messages))
        .route(
            "/servers/{name}/mcp",
            axum::routing::post(handle_server_mcp_post).get(handle_server_mcp_get),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(origin) = allow_origin {
        let cors = if origin == "*" {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = origin
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };
        router = router.layer(cors);
    }
    router
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bridge.status_document())
}

/// Resolve the engine for an optional `/servers/{name}` scope.
fn engine_for(state: &AppState, server: Option<&str>) -> Result<Arc<ProxyEngine>, HttpResponse> {
    match server {
        None => Ok(state.bridge.engine()),
        Some(name) => state.bridge.direct_engine(name).ok_or_else(|| {
            (StatusCode::NOT_FOUND, format!("unknown server: {name}")).into_response()
        }),
    }
}

// ---------------------------------------------------------------------------
// SSE transport: GET /sse + POST /messages/
// ---------------------------------------------------------------------------

async fn handle_sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResponse {
    match engine_for(&state, None) {
        Ok(engine) => serve_sse(&state, &engine, "", &headers),
        Err(resp) => resp,
    }
}

async fn handle_server_sse(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    match engine_for(&state, Some(&name)) {
        Ok(engine) => serve_sse(&state, &engine, &format!("/servers/{name}"), &headers),
        Err(resp) => resp,
    }
}

fn serve_sse(
    state: &AppState,
    engine: &Arc<ProxyEngine>,
    prefix: &str,
    headers: &HeaderMap,
) -> HttpResponse {
    let last_event_id = parse_last_event_id(headers);
    let session = state.sessions.create(engine);

    tracing::info!(session_id = %session.id, last_event_id, "new SSE frontend");

    let endpoint = format!("{prefix}/messages/?session_id={}", session.id);
    let stream = sse_stream_with_endpoint(session, endpoint, last_event_id);

    (
        [
            ("X-Accel-Buffering", "no"),
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
        ],
        Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")),
    )
        .into_response()
}

fn parse_last_event_id(headers: &HeaderMap) -> u64 {
    headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Initial `endpoint` event, replayed history, then live frames.
fn sse_stream_with_endpoint(
    session: Arc<FrontendSession>,
    endpoint: String,
    last_event_id: u64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let initial = (last_event_id == 0).then(|| {
        Ok::<_, Infallible>(Event::default().id("0").event("endpoint").data(endpoint))
    });

    let replay = stream::iter(
        session
            .events_after(last_event_id)
            .into_iter()
            .map(|e| Ok::<_, Infallible>(e.to_sse_event())),
    );

    let live = BroadcastStream::new(session.subscribe()).filter_map(|result| async move {
        match result {
            Ok(event) => Some(Ok(event.to_sse_event())),
            Err(e) => {
                tracing::debug!(error = %e, "broadcast lag, client will catch up via replay");
                None
            }
        }
    });

    stream::iter(initial).chain(replay).chain(live)
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> HttpResponse {
    accept_message(&state, None, &query, body).await
}

async fn handle_server_messages(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> HttpResponse {
    accept_message(&state, Some(&name), &query, body).await
}

/// POST side of the SSE transport: 202 acknowledges receipt, the answer
/// rides the event stream.
async fn accept_message(
    state: &Arc<AppState>,
    server: Option<&str>,
    query: &SessionQuery,
    body: String,
) -> HttpResponse {
    if let Err(resp) = engine_for(state, server) {
        return resp;
    }
    let Some(session_id) = query.id() else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    let Some(session) = state.sessions.get(session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let Some(engine) = session.engine() else {
        return (StatusCode::NOT_FOUND, "session has no engine").into_response();
    };

    state.bridge.touch_activity();
    session.touch();

    let message = match Message::parse(&body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "dropping unparseable frame");
            let error = RpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(error_frame(&error))).into_response();
        }
    };

    // Handle asynchronously so a long tools/call cannot block the POST, and
    // a later cancellation POST can still land.
    let session = Arc::clone(&session);
    tokio::spawn(async move {
        if let Some(reply) = engine.handle(&session.id, message).await {
            session.push_message(&reply);
        }
    });

    StatusCode::ACCEPTED.into_response()
}

fn error_frame(error: &RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": error.code, "message": error.message },
    })
}

// ---------------------------------------------------------------------------
// Streamable HTTP transport: POST/GET/DELETE /mcp
// ---------------------------------------------------------------------------

async fn handle_mcp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> HttpResponse {
    mcp_post(&state, None, &headers, body).await
}

async fn handle_server_mcp_post(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> HttpResponse {
    mcp_post(&state, Some(&name), &headers, body).await
}

async fn mcp_post(
    state: &Arc<AppState>,
    server: Option<&str>,
    headers: &HeaderMap,
    body: String,
) -> HttpResponse {
    let engine = match engine_for(state, server) {
        Ok(engine) => engine,
        Err(resp) => return resp,
    };
    state.bridge.touch_activity();

    let message = match Message::parse(&body) {
        Ok(m) => m,
        Err(e) => {
            let error = RpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(error_frame(&error))).into_response();
        }
    };

    if state.stateless {
        // Each POST stands alone: ephemeral identity, no session header.
        let frontend_id = format!("stateless-{}", uuid::Uuid::new_v4());
        return match engine.handle(&frontend_id, message).await {
            Some(reply) => json_frame(&reply, None),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    let offered = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let session = state.sessions.get_or_create(offered, &engine);
    session.touch();

    match engine.handle(&session.id, message).await {
        Some(reply) => json_frame(&reply, Some(&session.id)),
        None => {
            let mut response = StatusCode::ACCEPTED.into_response();
            set_session_header(&mut response, &session.id);
            response
        }
    }
}

fn json_frame(message: &Message, session_id: Option<&str>) -> HttpResponse {
    match message.to_json() {
        Ok(body) => {
            let mut response = (
                StatusCode::OK,
                [("Content-Type", "application/json")],
                body,
            )
                .into_response();
            if let Some(id) = session_id {
                set_session_header(&mut response, id);
            }
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response frame");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn set_session_header(response: &mut HttpResponse, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
}

/// GET side of streamable HTTP: the server-initiated frame channel.
async fn handle_mcp_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResponse {
    mcp_get(&state, None, &headers)
}

async fn handle_server_mcp_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    mcp_get(&state, Some(&name), &headers)
}

fn mcp_get(state: &Arc<AppState>, server: Option<&str>, headers: &HeaderMap) -> HttpResponse {
    if let Err(resp) = engine_for(state, server) {
        return resp;
    }
    if state.stateless {
        return (StatusCode::METHOD_NOT_ALLOWED, "stateless mode has no event channel")
            .into_response();
    }
    let Some(session) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|id| state.sessions.get(id))
    else {
        return (StatusCode::BAD_REQUEST, "missing or unknown Mcp-Session-Id").into_response();
    };

    let last_event_id = parse_last_event_id(headers);
    let replay = stream::iter(
        session
            .events_after(last_event_id)
            .into_iter()
            .map(|e| Ok::<_, Infallible>(e.to_sse_event())),
    );
    let live = BroadcastStream::new(session.subscribe())
        .filter_map(|result| async move { result.ok().map(|e| Ok(e.to_sse_event())) });

    let mut response = Sse::new(replay.chain(live))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response();
    set_session_header(&mut response, &session.id);
    response
}

/// DELETE ends a stateful session.
async fn handle_mcp_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResponse {
    let Some(id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id").into_response();
    };
    if state.sessions.remove(id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
