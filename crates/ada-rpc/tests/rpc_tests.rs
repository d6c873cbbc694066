//! End-to-end tests over real loopback sockets.
//!
//! Every test binds its own server on an OS-assigned port (or a temporary
//! Unix socket) so tests can run in parallel.

use ada_rpc::{
    create_certificates, ArgumentSchema, Authenticator, Client, CompressedCodec, Context,
    JsonCodec, Payload, Request, Role, RpcConfig, RpcError, Server, Transport,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;

const FAST: Duration = Duration::from_millis(50);

fn echo(args: Payload) -> anyhow::Result<Value> {
    Ok(args.get("text").cloned().unwrap_or(Value::Null))
}

/// A JSON server with `echo {text: required}` and `ping`, bound to a free port.
async fn start_json_server(authenticator: Authenticator) -> (Server, String) {
    let mut server = Server::new(JsonCodec, authenticator)
        .unwrap()
        .with_poll_interval(FAST);
    server
        .add_handler("echo", echo, ArgumentSchema::new().required("text"))
        .unwrap();
    server
        .add_handler("ping", |_| Ok(json!("pong")), ArgumentSchema::new())
        .unwrap();
    server
        .add_handler(
            "fail",
            |_| -> anyhow::Result<Value> { anyhow::bail!("model not loaded") },
            ArgumentSchema::new(),
        )
        .unwrap();
    server.open("tcp://127.0.0.1:0").await.unwrap();
    let address = server.local_endpoint().unwrap().to_string();
    (server, address)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    let response = client.request("echo", json!({"text": "hi"})).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.results(), Some(&Payload::from(json!("hi"))));
    assert!(response.error().is_none());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_extra_argument_is_reported() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    let response = client
        .request("echo", json!({"text": "hi", "extra": 1}))
        .await
        .unwrap();
    assert!(!response.is_success());
    assert_eq!(response.error(), Some("extra arguement extra provided"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_missing_argument_is_reported() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    let response = client.request("echo", json!({})).await.unwrap();
    assert!(!response.is_success());
    assert!(response.error().unwrap().contains("'text'"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_unknown_endpoint_and_handler_error_keep_server_alive() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    let response = client.request("transcribe", json!({})).await.unwrap();
    assert!(!response.is_success());
    assert!(response.error().unwrap().starts_with("HandlerNotFound"));

    let response = client.request("fail", json!({})).await.unwrap();
    assert!(!response.is_success());
    assert_eq!(response.error(), Some("model not loaded"));

    // Still serving.
    let response = client.request("ping", json!({})).await.unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("pong"))));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_undecodable_request_still_gets_a_reply() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let raw = Transport::new(Role::Client, JsonCodec, Authenticator::Null).unwrap();
    raw.open(&address).await.unwrap();

    raw.send_multipart(vec![Bytes::from_static(b"this is not json")])
        .await
        .unwrap();
    match raw.recv().await.unwrap() {
        ada_rpc::Envelope::Response(response) => assert!(!response.is_success()),
        other => panic!("Expected a response, got {:?}", other),
    }

    raw.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_sequential_clients_are_served() {
    let (server, address) = start_json_server(Authenticator::Null).await;

    for text in ["first", "second", "third"] {
        let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();
        let response = client.request("echo", json!({"text": text})).await.unwrap();
        assert_eq!(response.results(), Some(&Payload::from(json!(text))));
        client.close().await;
    }

    server.close().await;
}

#[tokio::test]
async fn test_idle_connected_client_does_not_starve_others() {
    let (server, address) = start_json_server(Authenticator::Null).await;

    let idle: Client<JsonCodec> = Client::plain(&address).await.unwrap();
    let response = idle.request("ping", json!({})).await.unwrap();
    assert!(response.is_success());

    // `idle` stays connected without calling again.
    let other: Client<JsonCodec> = Client::plain(&address).await.unwrap();
    let response = other
        .exchange(Request::new("ping", json!({})), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("pong"))));

    // And the first client is still served afterwards.
    let response = idle.request("echo", json!({"text": "back"})).await.unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("back"))));

    other.close().await;
    idle.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_on_one_client_are_serialized() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    let (a, b) = tokio::join!(
        client.request("echo", json!({"text": "a"})),
        client.request("echo", json!({"text": "b"}))
    );
    assert_eq!(a.unwrap().results(), Some(&Payload::from(json!("a"))));
    assert_eq!(b.unwrap().results(), Some(&Payload::from(json!("b"))));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_client_lifecycle_after_close() {
    let (server, address) = start_json_server(Authenticator::Null).await;
    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();

    client.close().await;
    client.close().await;

    let err = client.request("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport { .. }));

    server.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_curve_authenticated_echo() {
    let keys = TempDir::new().unwrap();
    let (public, secret) = create_certificates(keys.path(), "server").unwrap();

    let (server, address) =
        start_json_server(Authenticator::curve_server(&secret).unwrap()).await;
    let client: Client<JsonCodec> = Client::connect(&address, &public).await.unwrap();

    let response = client.request("echo", json!({"text": "sealed"})).await.unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("sealed"))));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_wrong_pinned_key_fails_open_and_server_keeps_serving() {
    let keys = TempDir::new().unwrap();
    let (public, secret) = create_certificates(keys.path(), "server").unwrap();
    let (impostor, _) = create_certificates(keys.path(), "impostor").unwrap();

    let (server, address) =
        start_json_server(Authenticator::curve_server(&secret).unwrap()).await;

    let result: ada_rpc::Result<Client<JsonCodec>> = Client::connect(&address, &impostor).await;
    assert!(matches!(result, Err(RpcError::Auth { .. })));

    let result: ada_rpc::Result<Client<JsonCodec>> = Client::plain(&address).await;
    assert!(matches!(result, Err(RpcError::Auth { .. })));

    let client: Client<JsonCodec> = Client::connect(&address, &public).await.unwrap();
    let response = client.request("ping", json!({})).await.unwrap();
    assert!(response.is_success());

    client.close().await;
    server.close().await;
}

/// A compressed-framing server that reports how many bytes it was sent.
async fn start_binary_server(authenticator: Authenticator) -> (Server<CompressedCodec>, String) {
    let mut server = Server::new(CompressedCodec, authenticator)
        .unwrap()
        .with_poll_interval(FAST);
    server
        .add_handler(
            "transcribe",
            |clip: Payload| {
                let samples = clip.as_bytes().map(Bytes::len).unwrap_or(0);
                Ok(json!({"samples": samples}))
            },
            ArgumentSchema::new(),
        )
        .unwrap();
    server.set_default_endpoint("transcribe").unwrap();
    server.open("tcp://127.0.0.1:0").await.unwrap();
    let address = server.local_endpoint().unwrap().to_string();
    (server, address)
}

#[tokio::test]
async fn test_compressed_payload_round_trip() {
    let keys = TempDir::new().unwrap();
    let (public, secret) = create_certificates(keys.path(), "server").unwrap();
    let (server, address) =
        start_binary_server(Authenticator::curve_server(&secret).unwrap()).await;

    let client: Client = Client::connect(&address, &public).await.unwrap();
    let clip: Vec<u8> = (0..48_000u32).map(|i| (i % 200) as u8).collect();

    let response = client.call(clip).await.unwrap();
    assert!(response.is_success());
    let body = response.results().and_then(Payload::as_bytes).unwrap();
    let report: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(report, json!({"samples": 48_000}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_compressed_failure_carries_error_text() {
    let mut server = Server::new(CompressedCodec, Authenticator::Null)
        .unwrap()
        .with_poll_interval(FAST);
    server.open("tcp://127.0.0.1:0").await.unwrap();
    let address = server.local_endpoint().unwrap().to_string();

    let client: Client = Client::plain(&address).await.unwrap();
    let response = client.call(b"pcm".to_vec()).await.unwrap();
    assert!(!response.is_success());
    assert!(response.error().unwrap().starts_with("HandlerNotFound"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_compressed_request_cannot_name_an_endpoint() {
    let (server, address) = start_binary_server(Authenticator::Null).await;
    let client: Client = Client::plain(&address).await.unwrap();

    let err = client.request("transcribe", b"abc".to_vec()).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol { .. }));

    // Nothing was sent, so the client can still call the default endpoint.
    let response = client.call(b"abc".to_vec()).await.unwrap();
    let body = response.results().and_then(Payload::as_bytes).unwrap();
    let report: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(report, json!({"samples": 3}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_call_timeout_on_silent_peer() {
    // A bare server transport that never answers.
    let silent = Transport::new(Role::Server, CompressedCodec, Authenticator::Null)
        .unwrap()
        .with_poll_interval(FAST);
    silent.open("tcp://127.0.0.1:0").await.unwrap();
    let address = silent.local_endpoint().unwrap().to_string();

    let client: Client = Client::plain(&address).await.unwrap();
    let err = client
        .call_timeout(b"pcm".to_vec(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport { .. }));

    silent.close().await;
}

#[tokio::test]
async fn test_server_from_config_with_default_endpoint() {
    let mut config = RpcConfig::new("tcp://127.0.0.1:0");
    config.default_endpoint = Some("ping".into());
    config.poll_interval_ms = 50;

    let mut server = Server::from_config(&config, JsonCodec).unwrap();
    server
        .add_handler("ping", |_| Ok(json!("pong")), ArgumentSchema::new())
        .unwrap();
    server.open(&config.endpoint).await.unwrap();

    let mut client_config = config.clone();
    client_config.endpoint = server.local_endpoint().unwrap().to_string();
    let client: Client<JsonCodec> = Client::from_config(&client_config).await.unwrap();

    let response = client
        .exchange(Request::payload(json!({})), None)
        .await
        .unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("pong"))));

    client.close().await;
    server.close().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_echo_over_ipc_socket() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ada.sock");
    let address = format!("ipc://{}", path.display());

    let mut server = Server::new(JsonCodec, Authenticator::Null)
        .unwrap()
        .with_poll_interval(FAST);
    server
        .add_handler("echo", echo, ArgumentSchema::new().required("text"))
        .unwrap();
    server.open(&address).await.unwrap();

    let client: Client<JsonCodec> = Client::plain(&address).await.unwrap();
    let response = client.request("echo", json!({"text": "local"})).await.unwrap();
    assert_eq!(response.results(), Some(&Payload::from(json!("local"))));

    client.close().await;
    server.close().await;
    assert!(!path.exists());
}

#[test]
fn test_blocking_client_shares_global_context() {
    let context = Context::global().unwrap();
    let (server, address) = context.block_on(start_binary_server(Authenticator::Null));

    let client: ada_rpc::blocking::Client = ada_rpc::blocking::Client::plain(&address).unwrap();
    let response = client.call(vec![0u8; 320]).unwrap();
    let body = response.results().and_then(Payload::as_bytes).unwrap();
    let report: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(report, json!({"samples": 320}));

    client.close();
    context.block_on(server.close());
}
