//! Integration tests for the protocol client against scripted servers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use conductor_core::config::MalformedLinePolicy;
use conductor_mcp::framing::write_message;
use conductor_mcp::{
    Connection, InProcessServer, McpError, Message, RpcClient, RpcConfig, RpcError, Scope,
    ScopeEnd, ServerHandle,
};
use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinSet;

/// The far end of a duplex pipe, driven step by step by a test.
struct ScriptedServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl ScriptedServer {
    async fn next_request(&mut self) -> Message {
        let line = self.lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, message: &Message) {
        write_message(&mut self.writer, message).await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn scripted() -> (Connection, ScriptedServer) {
    scripted_with_capacity(64 * 1024)
}

fn scripted_with_capacity(capacity: usize) -> (Connection, ScriptedServer) {
    let (client, server) = tokio::io::duplex(capacity);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    (
        Connection::new(BufReader::new(client_read), client_write),
        ScriptedServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        },
    )
}

/// A writer whose every write fails.
struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_write_error_leaves_registry_empty() {
    let (idle_read, _keep_open) = tokio::io::duplex(64);
    let conn = Connection::new(BufReader::new(idle_read), BrokenPipe);
    let scope = Scope::root();
    let (client, _) = RpcClient::start(conn, RpcConfig::default(), scope.clone());

    let err = client.call("anything", None).await.unwrap_err();
    assert!(matches!(err, RpcError::Write(_)));
    assert_eq!(client.pending_count().await, 0);
    assert!(scope.cause().is_some_and(|c| c.is_failure()));

    let err = client.notify("notifications/x", None).await.unwrap_err();
    assert!(matches!(err, RpcError::Write(_)));
}

#[tokio::test(start_paused = true)]
async fn test_many_timeouts_leave_registry_empty() {
    let (conn, _server) = scripted();
    let config = RpcConfig::default().with_timeout(Duration::from_secs(10));
    let (client, _) = RpcClient::start(conn, config, Scope::root());
    let client = Arc::new(client);

    let mut calls = JoinSet::new();
    for i in 0..20 {
        let client = client.clone();
        calls.spawn(async move { client.call(&format!("m{}", i), None).await });
    }

    while let Some(result) = calls.join_next().await {
        assert!(matches!(result.unwrap(), Err(RpcError::Timeout(_))));
    }
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_write_still_completes_its_line() {
    // The pipe holds less than one request, so the first write stalls until
    // the server starts reading, long after the call has timed out.
    let (conn, mut server) = scripted_with_capacity(16);
    let config = RpcConfig::default().with_timeout(Duration::from_secs(1));
    let (client, _) = RpcClient::start(conn, config, Scope::root());

    let err = client.call("first", Some(json!({"pad": "x".repeat(64)}))).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    let (response, _) = tokio::join!(client.call("second", None), async {
        let first = server.next_request().await;
        assert_eq!(first.method.as_deref(), Some("first"));
        let second = server.next_request().await;
        assert_eq!(second.method.as_deref(), Some("second"));
        server
            .send(&Message::response(second.id.unwrap(), json!("ok")))
            .await;
    });

    assert_eq!(response.unwrap().result, Some(json!("ok")));
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let (conn, mut server) = scripted();
    let config = RpcConfig::default().with_route("notifications/progress");
    let (client, mut listeners) = RpcClient::start(conn, config, Scope::root());
    let client = Arc::new(client);
    let mut progress = listeners.remove("notifications/progress").unwrap();

    let mut calls = JoinSet::new();
    for i in 0..3 {
        let client = client.clone();
        calls.spawn(async move {
            let method = format!("method-{}", i);
            let response = client.call(&method, None).await.unwrap();
            (method, response)
        });
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.next_request().await);
    }

    // Answer in reverse order with notifications in between.
    for (n, request) in requests.iter().rev().enumerate() {
        server
            .send(&Message::notification("notifications/progress", Some(json!({"n": n}))))
            .await;
        let method = request.method.clone().unwrap();
        server
            .send(&Message::response(request.id.clone().unwrap(), Value::String(method)))
            .await;
    }

    while let Some(joined) = calls.join_next().await {
        let (method, response) = joined.unwrap();
        assert_eq!(response.result, Some(Value::String(method)));
    }

    for n in 0..3 {
        let note = progress.recv().await.unwrap();
        assert_eq!(note.params, Some(json!({"n": n})));
    }
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_unrouted_notification_does_not_disturb_pending_call() {
    let (conn, mut server) = scripted();
    let (client, _) = RpcClient::start(conn, RpcConfig::default(), Scope::root());

    let (response, _) = tokio::join!(client.call("ping", None), async {
        let request = server.next_request().await;
        server
            .send(&Message::notification("notifications/message", Some(json!({"level": "info"}))))
            .await;
        server
            .send(&Message::response(request.id.unwrap(), json!("pong")))
            .await;
    });

    assert_eq!(response.unwrap().result, Some(json!("pong")));
}

#[tokio::test]
async fn test_garbage_prefix_is_stripped() {
    let (conn, mut server) = scripted();
    let (client, _) = RpcClient::start(conn, RpcConfig::default(), Scope::root());

    let (response, _) = tokio::join!(client.call("ping", None), async {
        let request = server.next_request().await;
        let id = request.id.unwrap().to_string();
        server
            .send_raw(&format!(
                "garbage{{\"jsonrpc\":\"2.0\",\"id\":\"{}\",\"result\":\"pong\"}}\n",
                id
            ))
            .await;
    });

    assert_eq!(response.unwrap().result, Some(json!("pong")));
}

#[tokio::test]
async fn test_malformed_line_fails_the_protocol_scope() {
    let (conn, mut server) = scripted();
    let scope = Scope::root();
    let (client, _) = RpcClient::start(conn, RpcConfig::default(), scope.clone());

    let (response, _) = tokio::join!(client.call("ping", None), async {
        server.next_request().await;
        server.send_raw("this is not json\n").await;
    });

    match response.unwrap_err() {
        RpcError::Cancelled(end) => assert!(end.is_failure()),
        other => panic!("unexpected error: {}", other),
    }
    assert!(scope.cause().is_some_and(|c| c.is_failure()));
}

#[tokio::test]
async fn test_malformed_line_can_be_skipped() {
    let (conn, mut server) = scripted();
    let config = RpcConfig::default().with_malformed_lines(MalformedLinePolicy::Skip);
    let (client, _) = RpcClient::start(conn, config, Scope::root());

    let (response, _) = tokio::join!(client.call("ping", None), async {
        let request = server.next_request().await;
        server.send_raw("this is not json\n").await;
        server
            .send(&Message::response(request.id.unwrap(), json!("pong")))
            .await;
    });

    assert_eq!(response.unwrap().result, Some(json!("pong")));
}

#[tokio::test]
async fn test_eof_closes_scope_without_failure() {
    let (conn, server) = scripted();
    let scope = Scope::root();
    let (client, _) = RpcClient::start(conn, RpcConfig::default(), scope.clone());

    drop(server);
    assert!(matches!(scope.ended().await, ScopeEnd::Closed));
    assert!(client.call("ping", None).await.is_err());
}

fn handshake_server(name: &str) -> InProcessServer {
    InProcessServer::new(name, |m: Message| {
        let id = m.id.clone()?;
        match m.method.as_deref()? {
            "initialize" => Some(Message::response(
                id,
                json!({"protocolVersion": "2024-11-05", "capabilities": {}, "serverInfo": {"name": "stub"}}),
            )),
            "tools/list" => Some(Message::response(
                id,
                json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
            )),
            _ => Some(Message::error_response(id, -32601, "Method not found")),
        }
    })
}

#[tokio::test]
async fn test_server_handle_runs_handshake() {
    let root = Scope::root();
    let handle = ServerHandle::start(&handshake_server("stub"), RpcConfig::default(), &root)
        .await
        .unwrap();

    assert_eq!(handle.name(), "stub");
    assert!(handle.is_live());
    assert_eq!(handle.client().tools()[0].name, "echo");

    handle.shutdown().await;
    assert!(!root.is_cancelled());
}

#[tokio::test]
async fn test_failed_handshake_does_not_cancel_root() {
    let root = Scope::root();
    let broken = InProcessServer::new("broken", |m: Message| {
        m.id.map(|id| Message::error_response(id, -32603, "nope"))
    });

    let err = ServerHandle::start(&broken, RpcConfig::default(), &root)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, McpError::InitializationFailed(_)));
    assert!(!root.is_cancelled());
}

#[tokio::test]
async fn test_banner_line_during_handshake_stays_local() {
    let root = Scope::root();
    let chatty = handshake_server("chatty").with_line_prefix("Starting server v1.0\n");

    // The banner is not JSON, so the handshake dies with a failed protocol scope.
    let started = ServerHandle::start(&chatty, RpcConfig::default(), &root).await;
    assert!(started.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!root.is_cancelled());

    let healthy = ServerHandle::start(&handshake_server("healthy"), RpcConfig::default(), &root)
        .await
        .unwrap();
    assert_eq!(healthy.name(), "healthy");
    assert!(!root.is_cancelled());
    healthy.shutdown().await;
}

#[tokio::test]
async fn test_protocol_failure_cancels_root() {
    let root = Scope::root();
    let noisy = handshake_server("noisy");
    let handle = ServerHandle::start(&noisy, RpcConfig::default(), &root)
        .await
        .unwrap();

    // Stream corruption on one server ends the whole run.
    handle
        .protocol_scope()
        .cancel_with(ScopeEnd::failed(std::io::Error::other("corrupt stream")));
    let end = tokio::time::timeout(Duration::from_secs(1), root.ended())
        .await
        .unwrap();
    assert!(end.is_failure());
}
