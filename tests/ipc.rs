//! End-to-end client/server tests over a real socket.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use conductor::ipc::server::{IpcServer, MethodError, ServerConfig};
use conductor::ipc::wire;
use conductor::{ClientConfig, IpcClient, IpcError};

fn server_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        socket_path: dir.path().join("test.sock"),
        tcp_port: 0,
    }
}

fn client_config(dir: &tempfile::TempDir, timeout: Duration) -> ClientConfig {
    ClientConfig {
        socket_path: dir.path().join("test.sock"),
        tcp_port: 0,
        timeout,
    }
}

async fn started_server(dir: &tempfile::TempDir) -> Arc<IpcServer> {
    let server = Arc::new(IpcServer::new(server_config(dir)));

    server.register_fn("echo", |params| async move { Ok(params.unwrap_or(Value::Null)) });
    server.register_fn("add", |params| async move {
        let params = params.ok_or_else(|| MethodError::invalid_params("missing params"))?;
        let a = params["a"]
            .as_i64()
            .ok_or_else(|| MethodError::invalid_params("a must be an integer"))?;
        let b = params["b"]
            .as_i64()
            .ok_or_else(|| MethodError::invalid_params("b must be an integer"))?;
        Ok(json!(a + b))
    });
    server.register_fn("fail", |_params| async move {
        Err::<Value, _>(MethodError::server("boom"))
    });
    server.register_fn("slow", |_params| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!("done"))
    });

    server.start().await.unwrap();
    server
}

async fn connected_client(dir: &tempfile::TempDir) -> IpcClient {
    let client = IpcClient::new(client_config(dir, Duration::from_secs(5)));
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn call_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    let result = client
        .call("add", Some(json!({ "a": 2, "b": 40 })))
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn five_concurrent_clients() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;

    let mut tasks = Vec::new();
    for i in 0..5i64 {
        let config = client_config(&dir, Duration::from_secs(5));
        tasks.push(tokio::spawn(async move {
            let client = IpcClient::new(config);
            client.connect().await.unwrap();
            let result = client
                .call("add", Some(json!({ "a": i, "b": 100 })))
                .await
                .unwrap();
            client.disconnect().await;
            result
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(i as i64 + 100));
    }

    server.stop().await;
}

#[tokio::test]
async fn responses_complete_out_of_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = Arc::new(connected_client(&dir).await);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let slow_client = Arc::clone(&client);
    let slow_order = Arc::clone(&order);
    let slow = tokio::spawn(async move {
        slow_client.call("slow", None).await.unwrap();
        slow_order.lock().unwrap().push("slow");
    });

    // Let the slow request hit the wire first.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast_client = Arc::clone(&client);
    let fast_order = Arc::clone(&order);
    let fast = tokio::spawn(async move {
        fast_client.call("echo", Some(json!(1))).await.unwrap();
        fast_order.lock().unwrap().push("fast");
    });

    slow.await.unwrap();
    fast.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn unknown_method_reports_method_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    let err = client.call("nope", None).await.unwrap_err();
    match err {
        IpcError::Rpc { code, .. } => assert_eq!(code, wire::METHOD_NOT_FOUND),
        other => panic!("expected rpc error, got {other:?}"),
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn handler_failure_reaches_the_caller_and_spares_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    let err = client.call("fail", None).await.unwrap_err();
    match err {
        IpcError::Rpc { code, message, .. } => {
            assert_eq!(code, wire::SERVER_ERROR);
            assert_eq!(message, "boom");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
    // The connection survived the handler failure.
    let result = client.call("echo", Some(json!("still here"))).await.unwrap();
    assert_eq!(result, json!("still here"));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn notification_gets_no_response_but_the_channel_stays_usable() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    client.notify("echo", Some(json!("fire and forget"))).await.unwrap();
    // A notification for an unknown method is silently dropped too.
    client.notify("nope", None).await.unwrap();

    let result = client.call("echo", Some(json!(7))).await.unwrap();
    assert_eq!(result, json!(7));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn short_timeout_fails_the_call() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = IpcClient::new(client_config(&dir, Duration::from_millis(20)));
    client.connect().await.unwrap();

    let err = client.call("slow", None).await.unwrap_err();
    match err {
        IpcError::Timeout { method, .. } => assert_eq!(method, "slow"),
        other => panic!("expected timeout, got {other:?}"),
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn server_lifecycle_is_forgiving() {
    let dir = tempfile::tempdir().unwrap();
    let server = IpcServer::new(server_config(&dir));

    // Stop before start is a no-op, and stop is idempotent.
    server.stop().await;
    server.start().await.unwrap();
    assert!(matches!(
        server.start().await.unwrap_err(),
        IpcError::AlreadyStarted
    ));
    server.stop().await;
    server.stop().await;

    // The socket file is gone after stop, so a restart binds cleanly.
    server.start().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn connect_twice_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    assert!(matches!(
        client.connect().await.unwrap_err(),
        IpcError::AlreadyConnected
    ));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn last_registration_wins() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    server.register_fn("versioned", |_params| async move { Ok(json!(1)) });
    server.register_fn("versioned", |_params| async move { Ok(json!(2)) });

    let client = connected_client(&dir).await;
    assert_eq!(client.call("versioned", None).await.unwrap(), json!(2));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn server_stop_fails_pending_calls() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = Arc::new(connected_client(&dir).await);

    let caller = Arc::clone(&client);
    let pending = tokio::spawn(async move { caller.call("slow", None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, IpcError::ConnectionClosed));

    client.disconnect().await;
}

#[tokio::test]
async fn client_disconnect_fails_pending_calls() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = Arc::new(connected_client(&dir).await);

    let caller = Arc::clone(&client);
    let pending = tokio::spawn(async move { caller.call("slow", None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await;

    // The outstanding call fails instead of hanging.
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, IpcError::ConnectionClosed));

    server.stop().await;
}

#[tokio::test]
async fn three_back_to_back_calls_each_get_their_own_result() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    // Issued without any intervening await; correlation sorts them out.
    let (a, b, c) = tokio::join!(
        client.call("add", Some(json!({ "a": 1, "b": 10 }))),
        client.call("echo", Some(json!("middle"))),
        client.call("add", Some(json!({ "a": 2, "b": 20 }))),
    );
    assert_eq!(a.unwrap(), json!(11));
    assert_eq!(b.unwrap(), json!("middle"));
    assert_eq!(c.unwrap(), json!(22));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn calls_after_disconnect_fail_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let server = started_server(&dir).await;
    let client = connected_client(&dir).await;

    client.disconnect().await;
    assert!(matches!(
        client.call("echo", None).await.unwrap_err(),
        IpcError::NotConnected
    ));
    // Disconnect when already disconnected is fine.
    client.disconnect().await;

    server.stop().await;
}
