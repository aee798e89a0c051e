//! Outbound remote transports against mock upstreams: the SSE endpoint
//! dance and the streamable-HTTP idle-404 recovery path.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_bridge::error::SessionError;
use mcp_bridge::protocol::codes;
use mcp_bridge::session::ClientSession;
use mcp_bridge::transport::http::{self, HttpOptions};
use mcp_bridge::transport::sse;

const HANDSHAKE: Duration = Duration::from_secs(5);

fn init_result_body(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "upstream", "version": "0"},
        },
    })
    .to_string()
}

#[tokio::test]
async fn sse_transport_resolves_endpoint_and_delivers_frames() {
    let server = MockServer::start().await;

    // The stream opens with the endpoint event, then carries one response
    // frame. The canned body also ends the stream, which must surface as a
    // closed (not wedged) duplex.
    let stream_body = concat!(
        "event: endpoint\n",
        "data: /messages/?session_id=abc\n\n",
        ": keep-alive\n\n",
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(stream_body, "text/event-stream"),
        )
        .mount(&server)
        .await;
    // The resolved POST endpoint; the short-lived canned stream means the
    // writer may already be gone by the time a test frame would be posted,
    // so nothing here insists on traffic.
    Mock::given(method("POST"))
        .and(path("/messages/"))
        .and(query_param("session_id", "abc"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let url = format!("{}/sse", server.uri());
    let mut duplex = sse::connect("up", &url, &HashMap::new(), 0).await.unwrap();

    let frame = tokio::time::timeout(HANDSHAKE, duplex.recv())
        .await
        .expect("timed out")
        .expect("stream closed");
    match frame {
        mcp_bridge::protocol::Message::Response(response) => {
            assert_eq!(response.into_result().unwrap()["ok"], true);
        }
        other => panic!("expected response, got {other:?}"),
    }

    // Stream end closes the inbound side.
    let next = tokio::time::timeout(HANDSHAKE, duplex.recv()).await.expect("timed out");
    assert!(next.is_none());
}

#[tokio::test]
async fn sse_connect_fails_without_endpoint_event() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw("event: message\ndata: {}\n\n", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let url = format!("{}/sse", server.uri());
    let result = sse::connect("up", &url, &HashMap::new(), 0).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn streamable_http_recovers_from_idle_404_with_retry_budget() {
    let server = MockServer::start().await;

    // Handshake: issue a session id. Both the first and the replayed
    // initialize hit this mock; the replay's answer is consumed silently.
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("\"initialize\""))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .insert_header("mcp-session-id", "sess-1")
                .set_body_string(init_result_body(1)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("notifications/initialized"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    // First tools/list hits the recycled session; the retry must succeed.
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("tools/list"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("tools/list"))
        .and(header("mcp-session-id", "sess-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(
                    json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": []}}).to_string(),
                ),
        )
        .mount(&server)
        .await;

    let url = format!("{}/mcp", server.uri());
    let duplex = http::connect(
        "up",
        &url,
        &HashMap::new(),
        HttpOptions { stateless: false, remote_retries: 1 },
    )
    .unwrap();
    let session = ClientSession::connect("up", duplex);

    session
        .initialize(json!({"name": "test", "version": "0"}), HANDSHAKE)
        .await
        .unwrap();

    // One re-init plus one re-POST happen behind this call.
    let result = session
        .request("tools/list", None, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result["tools"], json!([]));
}

#[tokio::test]
async fn streamable_http_surfaces_404_without_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("\"initialize\""))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(init_result_body(1)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("notifications/initialized"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_string_contains("tools/list"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/mcp", server.uri());
    let duplex = http::connect("up", &url, &HashMap::new(), HttpOptions::default()).unwrap();
    let session = ClientSession::connect("up", duplex);

    session
        .initialize(json!({"name": "test", "version": "0"}), HANDSHAKE)
        .await
        .unwrap();

    let err = session
        .request("tools/list", None, Duration::from_secs(10))
        .await
        .unwrap_err();
    match err {
        SessionError::Rpc(rpc) => {
            assert_eq!(rpc.code, codes::SERVER_ERROR);
            let data = rpc.data.unwrap();
            assert_eq!(data["unavailable"], true);
            assert_eq!(data["upstream_status"], 404);
            assert_eq!(data["url"].as_str().unwrap(), url);
        }
        other => panic!("expected synthetic rpc error, got {other:?}"),
    }
}
