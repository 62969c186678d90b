mod support;

use std::time::Duration;

use domain::Role;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use support::{assert_no_frame, next_json, next_of_type, send_json, TestServer, INTERNAL_TOKEN};

#[tokio::test]
async fn health_reports_instance() {
    let server = TestServer::start().await;
    let body: Value = Client::new()
        .get(server.http("/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn handshake_failures_are_http_errors() {
    let server = TestServer::start().await;
    let (_, banned) = server.token("mallory", Role::Banned);
    let (_, expired) = server.token_expiring("old", Role::Member, chrono::Utc::now().timestamp() - 10);

    assert_eq!(server.handshake_status("").await, 401);
    assert_eq!(server.handshake_status("?token=garbage").await, 401);
    assert_eq!(server.handshake_status(&format!("?token={expired}")).await, 401);
    assert_eq!(server.handshake_status(&format!("?token={banned}")).await, 403);
    assert_eq!(server.hub.connection_count(), 0);
}

#[tokio::test]
async fn snapshot_then_presence_lifecycle() {
    let server = TestServer::start().await;
    let client = Client::new();
    let (alice_id, alice) = server.token("alice", Role::Member);

    let mut socket = server.connect(&alice).await;
    let entry: Value = client
        .get(server.http(&format!("/api/v1/presence/{alice_id}")))
        .send()
        .await
        .expect("presence")
        .json()
        .await
        .expect("json");
    assert_eq!(entry["status"], "online");
    assert_eq!(entry["userId"], alice_id.to_string());

    socket.close(None).await.expect("close");

    let mut status = Value::Null;
    for _ in 0..50 {
        let entry: Value = client
            .get(server.http(&format!("/api/v1/presence/{alice_id}")))
            .send()
            .await
            .expect("presence")
            .json()
            .await
            .expect("json");
        status = entry["status"].clone();
        if status == "offline" {
            break;
        }
        sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(status, "offline");
}

#[tokio::test]
async fn internal_event_reaches_room_members() {
    let server = TestServer::start().await;
    let client = Client::new();
    let (_, alice) = server.token("alice", Role::Member);
    let (_, carol) = server.token("carol", Role::Member);

    let mut watcher = server.connect(&alice).await;
    let mut bystander = server.connect(&carol).await;
    send_json(&mut watcher, "join:room", json!({ "room": "post:42" })).await;
    sleep(Duration::from_millis(100)).await;

    let event = json!({ "type": "comment.created", "payload": { "postId": "42", "body": "nice" } });

    let denied = client
        .post(server.http("/api/v1/events"))
        .json(&event)
        .send()
        .await
        .expect("publish");
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let accepted = client
        .post(server.http("/api/v1/events"))
        .header("x-internal-token", INTERNAL_TOKEN)
        .json(&event)
        .send()
        .await
        .expect("publish");
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    let frame = next_of_type(&mut watcher, "comment:created").await;
    assert_eq!(frame["payload"]["body"], "nice");
    assert_no_frame(&mut bystander, "comment:created", Duration::from_millis(200)).await;

    let unroutable = client
        .post(server.http("/api/v1/events"))
        .header("x-internal-token", INTERNAL_TOKEN)
        .json(&json!({ "type": "badge.earned", "payload": {} }))
        .send()
        .await
        .expect("publish");
    assert_eq!(unroutable.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = unroutable.json().await.expect("json");
    assert_eq!(body["code"], "UNROUTABLE");
}

#[tokio::test]
async fn typing_is_relayed_to_other_members_only() {
    let server = TestServer::start().await;
    let (alice_id, alice) = server.token("alice", Role::Member);
    let (_, bob) = server.token("bob", Role::Member);

    let mut alice_socket = server.connect(&alice).await;
    let mut bob_socket = server.connect(&bob).await;
    send_json(&mut alice_socket, "join:room", json!({ "room": "post:7" })).await;
    send_json(&mut bob_socket, "join:room", json!({ "room": "post:7" })).await;
    sleep(Duration::from_millis(100)).await;

    send_json(&mut alice_socket, "typing:start", json!({ "channel": "post:7" })).await;

    let typing = next_of_type(&mut bob_socket, "typing:start").await;
    assert_eq!(typing["payload"]["userId"], alice_id.to_string());
    assert_no_frame(&mut alice_socket, "typing:start", Duration::from_millis(200)).await;
}

#[tokio::test]
async fn invalid_frame_gets_error_reply() {
    let server = TestServer::start().await;
    let (_, alice) = server.token("alice", Role::Member);
    let mut socket = server.connect(&alice).await;

    send_json(&mut socket, "join:room", json!({ "room": "nonsense" })).await;
    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "VALIDATION_FAILED");

    // 连接仍然可用
    send_json(&mut socket, "join:room", json!({ "room": "post:1" })).await;
    assert_no_frame(&mut socket, "error", Duration::from_millis(200)).await;
}

#[tokio::test]
async fn room_members_requires_internal_token() {
    let server = TestServer::start().await;
    let client = Client::new();
    let (alice_id, alice) = server.token("alice", Role::Member);
    let mut socket = server.connect(&alice).await;
    send_json(&mut socket, "join:room", json!({ "room": "group:9" })).await;
    sleep(Duration::from_millis(100)).await;

    let denied = client
        .get(server.http("/api/v1/rooms/group:9/members"))
        .send()
        .await
        .expect("members");
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let body: Value = client
        .get(server.http("/api/v1/rooms/group:9/members"))
        .header("x-internal-token", INTERNAL_TOKEN)
        .send()
        .await
        .expect("members")
        .json()
        .await
        .expect("json");
    assert_eq!(body["room"], "group:9");
    assert_eq!(body["members"], json!([alice_id.to_string()]));
}

#[tokio::test]
async fn shutdown_closes_sockets_with_going_away() {
    let server = TestServer::start().await;
    let (_, alice) = server.token("alice", Role::Member);
    let mut socket = server.connect(&alice).await;

    server.hub.shutdown();

    let frame = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        if let TungsteniteMessage::Close(frame) = message {
            break frame.expect("close frame");
        }
    };
    assert_eq!(u16::from(frame.code), 1001);
    assert_eq!(frame.reason.as_str(), "server shutting down");

    for _ in 0..50 {
        if server.hub.connection_count() == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.hub.connection_count(), 0);
}
