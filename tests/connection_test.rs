// Transport tests against a scripted snapserver.

mod common;

use common::{init_tracing, MockServer};
use futures_util::future::join_all;
use serde_json::json;
use snapcast_control::{CloseReason, Connection, Method, Notification, SnapError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn open(server: &MockServer) -> Connection {
    Connection::open("127.0.0.1", server.port(), TIMEOUT)
        .await
        .unwrap()
}

#[tokio::test]
async fn responses_in_any_order_reach_their_callers() {
    init_tracing();
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let calls = (0..5).map(|n| {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .call(Method::ClientGetTimeStats, Some(json!({ "id": n })), TIMEOUT)
                .await
        })
    });
    let calls: Vec<_> = calls.collect();

    let mut requests = Vec::new();
    for _ in 0..5 {
        let (id, params) = conn.expect_request("Client.GetTimeStats").await;
        requests.push((id, params["id"].clone()));
    }
    // Answer out of order: 2, 4, 1, 0, 3
    for index in [2, 4, 1, 0, 3] {
        let (id, n) = requests[index].clone();
        conn.respond(id, json!({ "n": n })).await;
    }

    let results = join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        let value = result.unwrap().unwrap();
        assert_eq!(value, json!({ "n": n }));
    }
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn correlation_ids_increase() {
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let first = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (id1, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(id1, json!({ "major": 2, "minor": 0, "patch": 0 })).await;
    first.await.unwrap().unwrap();

    let second = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (id2, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(id2, json!({ "major": 2, "minor": 0, "patch": 0 })).await;
    second.await.unwrap().unwrap();

    assert!(id2 > id1);
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    init_tracing();
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let slow = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call(Method::ServerGetStatus, None, Duration::from_millis(100))
                .await
        }
    });
    let (slow_id, _) = conn.expect_request("Server.GetStatus").await;

    let result = slow.await.unwrap();
    assert!(matches!(result, Err(SnapError::RequestTimeout { id, .. }) if id == slow_id));
    assert_eq!(connection.pending_count(), 0);

    // The late answer must not disturb the next call
    let next = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (next_id, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(slow_id, json!({ "late": true })).await;
    conn.respond(next_id, json!({ "major": 2, "minor": 0, "patch": 0 })).await;

    assert_eq!(
        next.await.unwrap().unwrap(),
        json!({ "major": 2, "minor": 0, "patch": 0 })
    );
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn server_error_is_typed() {
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call(Method::ClientGetTimeStats, Some(json!({ "id": "x" })), TIMEOUT)
                .await
        }
    });
    let (id, _) = conn.expect_request("Client.GetTimeStats").await;
    conn.respond_error(id, -32601, "Method not found").await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_method_not_found());
    assert!(matches!(err, SnapError::Rpc { code: -32601, .. }));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn malformed_data_fails_every_pending_call() {
    init_tracing();
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call(Method::ServerGetStatus, None, TIMEOUT).await })
        })
        .collect();
    for _ in 0..3 {
        conn.expect_request("Server.GetStatus").await;
    }

    conn.send_raw("{\"id\": 1, \"result\": \n").await;

    for result in join_all(calls).await {
        assert!(matches!(result.unwrap(), Err(SnapError::ConnectionClosed)));
    }
    tokio::time::timeout(TIMEOUT, connection.closed()).await.unwrap();
    assert!(matches!(connection.close_reason(), Some(CloseReason::Protocol(_))));
    assert!(matches!(
        connection.call(Method::ServerGetStatus, None, TIMEOUT).await,
        Err(SnapError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn notifications_keep_wire_order_across_registration() {
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    conn.notify("Group.OnMute", json!({ "id": "g", "mute": true })).await;
    conn.notify("Group.OnMute", json!({ "id": "g", "mute": false })).await;

    // Once this answer arrives, both notifications have been read
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (id, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(id, json!({ "major": 2, "minor": 0, "patch": 0 })).await;
    call.await.unwrap().unwrap();

    let seen: Arc<Mutex<Vec<Notification>>> = Arc::default();
    let sink = seen.clone();
    connection.on_notification(Arc::new(move |notification| {
        sink.lock().unwrap().push(notification);
    }));

    conn.notify("Group.OnNameChanged", json!({ "id": "g", "name": "Den" })).await;
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (id, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(id, json!({ "major": 2, "minor": 0, "patch": 0 })).await;
    call.await.unwrap().unwrap();

    let seen = seen.lock().unwrap();
    let methods: Vec<&str> = seen.iter().map(|n| n.method.as_str()).collect();
    assert_eq!(methods, vec!["Group.OnMute", "Group.OnMute", "Group.OnNameChanged"]);
    assert_eq!(seen[0].params["mute"], true);
    assert_eq!(seen[1].params["mute"], false);
}

#[tokio::test]
async fn ordered_result_is_handled_before_the_next_notification() {
    init_tracing();
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = seen.clone();
    connection.on_notification(Arc::new(move |notification| {
        sink.lock().unwrap().push(notification.method);
    }));

    let call = tokio::spawn({
        let connection = connection.clone();
        let sink = seen.clone();
        async move {
            connection
                .call_ordered(Method::ServerGetStatus, None, TIMEOUT, move |result| {
                    sink.lock().unwrap().push(format!("result {}", result["n"]));
                    Ok(())
                })
                .await
        }
    });
    let (id, _) = conn.expect_request("Server.GetStatus").await;
    conn.respond_then_notify(id, json!({ "n": 1 }), "Group.OnMute", json!({ "id": "g", "mute": true }))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!({ "n": 1 }));

    // Once this answer arrives, the notification has been handled too
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetRpcVersion, None, TIMEOUT).await }
    });
    let (id, _) = conn.expect_request("Server.GetRPCVersion").await;
    conn.respond(id, json!({ "major": 2, "minor": 0, "patch": 0 })).await;
    call.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["result 1", "Group.OnMute"]);
}

#[tokio::test]
async fn failing_result_hook_fails_the_call() {
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection
                .call_ordered(Method::ServerGetStatus, None, TIMEOUT, |_| {
                    Err(SnapError::InvalidResponse("unusable".to_string()))
                })
                .await
        }
    });
    let (id, _) = conn.expect_request("Server.GetStatus").await;
    conn.respond(id, json!({})).await;

    assert!(matches!(call.await.unwrap(), Err(SnapError::InvalidResponse(_))));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn close_is_idempotent_and_fails_pending() {
    let mut server = MockServer::start().await;
    let connection = Arc::new(open(&server).await);
    let mut conn = server.accept().await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.call(Method::ServerGetStatus, None, TIMEOUT).await }
    });
    conn.expect_request("Server.GetStatus").await;

    connection.close();
    connection.close();

    assert!(matches!(call.await.unwrap(), Err(SnapError::ConnectionClosed)));
    assert!(connection.is_closed());
    assert_eq!(connection.close_reason(), Some(CloseReason::Local));
    assert!(conn.is_closed_by_client().await);
}

#[tokio::test]
async fn server_hangup_is_reported() {
    let mut server = MockServer::start().await;
    let connection = open(&server).await;
    drop(server.accept().await);

    tokio::time::timeout(TIMEOUT, connection.closed()).await.unwrap();
    assert_eq!(connection.close_reason(), Some(CloseReason::RemoteClosed));
}

#[tokio::test]
async fn refused_connect_is_typed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = Connection::open("127.0.0.1", port, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, SnapError::ConnectRefused { port: p, .. } if p == port));
    assert!(err.is_transient());
}
