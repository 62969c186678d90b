//! 连接网关端到端流程测试
//!
//! 全部使用内存后端；两个枢纽实例共享同一条内存总线模拟多进程部署。

mod support;

use std::time::Duration;

use application::HubSettings;
use domain::{Envelope, PresenceStatus, Role, RoomName, WatchPartyRecord, WatchPartyStatus};
use serde_json::json;
use support::{settings, Client, Cluster};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_grace_period_emits_single_offline() {
    let cluster = Cluster::new();
    let alice = cluster.sessions.add("alice", Role::Member);
    cluster.sessions.add("bob", Role::Member);
    let hub = cluster.hub(settings());

    let mut bob = Client::connect(&hub, "bob").await;
    bob.send("follow:user", json!({ "userId": alice.to_string() })).await;

    let mut alice_client = Client::connect(&hub, "alice").await;
    let online = bob.received("user:online").await;
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].payload["userId"], alice.to_string());

    alice_client.drain().await;
    alice_client.session.close("client closed").await;

    sleep(Duration::from_secs(5)).await;
    assert!(bob.received("user:offline").await.is_empty(), "still inside grace period");
    assert!(hub.is_online(alice).await.unwrap());

    sleep(Duration::from_secs(6)).await;
    let offline = bob.received("user:offline").await;
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].payload["previous"], "online");
    assert_eq!(hub.presence_of(alice).await.unwrap().status, PresenceStatus::Offline);

    sleep(Duration::from_secs(30)).await;
    assert!(bob.received("user:offline").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace_is_invisible() {
    let cluster = Cluster::new();
    let alice = cluster.sessions.add("alice", Role::Member);
    cluster.sessions.add("bob", Role::Member);
    let hub = cluster.hub(settings());

    let mut bob = Client::connect(&hub, "bob").await;
    bob.send("follow:user", json!({ "userId": alice.to_string() })).await;
    let first = Client::connect(&hub, "alice").await;
    assert_eq!(bob.received("user:online").await.len(), 1);

    first.session.close("network blip").await;
    sleep(Duration::from_secs(3)).await;
    let _second = Client::connect(&hub, "alice").await;

    sleep(Duration::from_secs(20)).await;
    let events = bob.drain().await;
    assert!(
        events
            .iter()
            .all(|e| e.message_type != "user:offline" && e.message_type != "user:online"),
        "no presence flapping: {events:?}"
    );
    assert!(hub.is_online(alice).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_lists_online_users() {
    let cluster = Cluster::new();
    let alice = cluster.sessions.add("alice", Role::Member);
    cluster.sessions.add("bob", Role::Member);
    let hub = cluster.hub(settings());

    let _alice = Client::connect(&hub, "alice").await;
    let mut session = hub.accept("bob").await.unwrap();
    let mut rx = session.take_outbound().unwrap();
    let snapshot = support::next(&mut rx).unwrap();
    assert_eq!(snapshot.message_type, "users:online");
    let users = snapshot.payload["users"].as_array().unwrap();
    assert_eq!(users.len(), 2);
    assert!(users.contains(&json!(alice.to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_typing_suppresses_repeats_and_expires() {
    let cluster = Cluster::new();
    cluster.sessions.add("alice", Role::Member);
    let bob_id = cluster.sessions.add("bob", Role::Member);
    let hub = cluster.hub(settings());

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    for client in [&alice, &bob] {
        client.send("join:room", json!({ "room": "post:7" })).await;
    }
    alice.drain().await;
    bob.drain().await;

    alice.send("typing:start", json!({ "channel": "post:7" })).await;
    sleep(Duration::from_secs(2)).await;
    alice.send("typing:start", json!({ "channel": "post:7" })).await;

    let starts = bob.received("typing:start").await;
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].payload["displayName"], "alice");
    assert!(alice.received("typing:start").await.is_empty(), "sender excluded");

    // 第二次 start 顺延了到期时间
    sleep(Duration::from_secs(2)).await;
    assert!(bob.received("typing:stop").await.is_empty());

    sleep(Duration::from_secs(2)).await;
    let stops = bob.received("typing:stop").await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].payload["reason"], "expired");

    bob.send("typing:start", json!({ "channel": "post:7" })).await;
    bob.send("leave:room", json!({ "room": "post:7" })).await;
    let stops = alice.received("typing:stop").await;
    assert_eq!(stops.len(), 1);
    assert!(!hub.is_typing(bob_id, &RoomName::parse("post:7").unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_join_is_idempotent() {
    let cluster = Cluster::new();
    let alice = cluster.sessions.add("alice", Role::Member);
    let hub = cluster.hub(settings());
    let client = Client::connect(&hub, "alice").await;
    let room = RoomName::parse("group:readers").unwrap();

    client.send("join:room", json!({ "room": "group:readers" })).await;
    client.send("join:room", json!({ "room": "group:readers" })).await;

    assert_eq!(hub.room_members(&room).await.unwrap(), vec![alice]);
    let rooms = client.session.rooms();
    assert_eq!(rooms.iter().filter(|r| **r == room).count(), 1);

    client.send("leave:room", json!({ "room": "group:readers" })).await;
    client.send("leave:room", json!({ "room": "group:readers" })).await;
    assert!(hub.room_members(&room).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_contextual_routing_across_instances() {
    let cluster = Cluster::new();
    cluster.sessions.add("alice", Role::Member);
    cluster.sessions.add("carol", Role::Member);
    let first = cluster.hub(settings());
    let second = cluster.hub(settings());

    let mut alice = Client::connect(&first, "alice").await;
    let mut carol = Client::connect(&second, "carol").await;
    alice.send("join:room", json!({ "room": "post:123" })).await;
    carol.send("join:room", json!({ "room": "post:456" })).await;
    alice.drain().await;
    carol.drain().await;

    let delivered = second
        .publish(Envelope::new(
            "comment.created",
            json!({ "postId": "123", "commentId": "c9", "body": "nice" }),
        ))
        .await
        .unwrap();
    assert_eq!(delivered, 0, "no local subscribers on the publishing instance");

    let comments = alice.received("comment:created").await;
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].payload["commentId"], "c9");
    assert!(carol.received("comment:created").await.is_empty());

    let unroutable = second.publish(Envelope::new("badge.earned", json!({}))).await;
    assert_eq!(unroutable.unwrap_err().code(), "UNROUTABLE");
}

#[tokio::test(start_paused = true)]
async fn test_conversation_message_reaches_members_and_sender() {
    let cluster = Cluster::new();
    cluster.sessions.add("alice", Role::Member);
    cluster.sessions.add("bob", Role::Member);
    let first = cluster.hub(settings());
    let second = cluster.hub(settings());

    let mut alice = Client::connect(&first, "alice").await;
    let mut bob = Client::connect(&second, "bob").await;
    for client in [&alice, &bob] {
        client.send("join:room", json!({ "room": "conversation:dm1" })).await;
    }
    alice.drain().await;
    bob.drain().await;

    alice
        .send(
            "message:send",
            json!({ "conversationId": "dm1", "content": "hi bob", "attachments": [] }),
        )
        .await;

    let own = alice.received("message:new").await;
    let remote = bob.received("message:new").await;
    assert_eq!(own.len(), 1);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].payload["content"], "hi bob");
    assert_eq!(remote[0].payload["senderName"], "alice");
    assert_eq!(remote[0].payload["attachments"], json!([]));
    assert_eq!(remote[0].id, own[0].id);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_excess_actions() {
    let cluster = Cluster::new();
    cluster.sessions.add("alice", Role::Member);
    let hub = cluster.hub(HubSettings {
        rate_budget: 5,
        abuse_threshold: 100,
        ..settings()
    });
    let mut alice = Client::connect(&hub, "alice").await;

    // 建连占用一次
    for _ in 0..4 {
        alice.send("presence:ping", json!({})).await;
    }
    assert!(alice.received("error").await.is_empty());

    alice.send("presence:ping", json!({})).await;
    let errors = alice.received("error").await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["code"], "RATE_LIMITED");

    sleep(Duration::from_secs(61)).await;
    alice.send("presence:ping", json!({})).await;
    assert!(alice.received("error").await.is_empty(), "new window");
}

#[tokio::test(start_paused = true)]
async fn test_watch_party_host_controls_and_teardown() {
    let cluster = Cluster::new();
    let host = cluster.sessions.add("host", Role::Member);
    cluster.sessions.add("guest", Role::Member);
    cluster.sessions.add("viewer", Role::Member);
    cluster.sessions.add("late", Role::Member);
    cluster.parties.insert(WatchPartyRecord {
        id: "p1".into(),
        host_id: host,
        status: WatchPartyStatus::Scheduled,
        requires_approval: false,
    });
    let first = cluster.hub(settings());
    let second = cluster.hub(settings());

    let mut host_client = Client::connect(&first, "host").await;
    let mut guest = Client::connect(&second, "guest").await;
    host_client.send("watchParty:join", json!({ "partyId": "p1" })).await;
    guest.send("join:room", json!({ "room": "watchParty:p1" })).await;
    assert_eq!(host_client.received("watchParty:userJoined").await.len(), 2);
    guest.drain().await;

    let mut viewer = Client::connect(&first, "viewer").await;
    viewer.send("watchParty:join", json!({ "partyId": "p1" })).await;
    assert_eq!(guest.received("watchParty:userJoined").await.len(), 1);
    host_client.drain().await;
    viewer.drain().await;

    host_client.send("watchParty:sync", json!({ "partyId": "p1", "position": 1.0, "isPlaying": true })).await;
    let errors = host_client.received("error").await;
    assert_eq!(errors[0].payload["code"], "CONFLICT", "party is not live yet");

    host_client.send("watchParty:start", json!({ "partyId": "p1" })).await;
    assert_eq!(guest.received("watchParty:started").await.len(), 1);

    guest.send("watchParty:sync", json!({ "partyId": "p1", "position": 99.0, "isPlaying": false })).await;
    let errors = guest.received("error").await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["code"], "PERMISSION_DENIED");
    assert!(host_client.received("watchParty:playbackSync").await.is_empty());

    host_client.send("watchParty:sync", json!({ "partyId": "p1", "position": 42.5, "isPlaying": true })).await;
    let syncs = guest.received("watchParty:playbackSync").await;
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs[0].payload["position"], 42.5);

    host_client.send("watchParty:end", json!({ "partyId": "p1" })).await;
    let room = RoomName::parse("watchParty:p1").unwrap();
    for watcher in [&mut guest, &mut viewer] {
        let sequence: Vec<String> = watcher
            .drain()
            .await
            .iter()
            .map(|e| e.message_type.clone())
            .filter(|t| t == "watchParty:userLeft" || t == "watchParty:ended")
            .collect();
        assert_eq!(
            sequence,
            [
                "watchParty:userLeft",
                "watchParty:userLeft",
                "watchParty:userLeft",
                "watchParty:ended"
            ],
            "every member leaves before the party ends"
        );
        assert!(!watcher.session.rooms().contains(&room));
    }
    assert!(first.room_members(&room).await.unwrap().is_empty());

    let mut late = Client::connect(&second, "late").await;
    late.send("watchParty:join", json!({ "partyId": "p1" })).await;
    let errors = late.received("error").await;
    assert_eq!(errors[0].payload["code"], "CONFLICT");
    assert!(second.room_members(&room).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_watch_party_approval_flow() {
    let cluster = Cluster::new();
    let host = cluster.sessions.add("host", Role::Member);
    let guest_id = cluster.sessions.add("guest", Role::Member);
    cluster.parties.insert(WatchPartyRecord {
        id: "vip".into(),
        host_id: host,
        status: WatchPartyStatus::Live,
        requires_approval: true,
    });
    let hub = cluster.hub(settings());

    let mut host_client = Client::connect(&hub, "host").await;
    let mut guest = Client::connect(&hub, "guest").await;
    host_client.send("watchParty:join", json!({ "partyId": "vip" })).await;
    host_client.drain().await;

    guest.send("watchParty:join", json!({ "partyId": "vip" })).await;
    assert_eq!(guest.received("watchParty:joinPending").await.len(), 1);
    let requests = host_client.received("watchParty:joinRequest").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload["userId"], guest_id.to_string());

    let room = RoomName::parse("watchParty:vip").unwrap();
    assert_eq!(hub.room_members(&room).await.unwrap(), vec![host]);

    guest
        .send("watchParty:approve", json!({ "partyId": "vip", "userId": guest_id.to_string() }))
        .await;
    assert_eq!(guest.received("error").await[0].payload["code"], "PERMISSION_DENIED");

    host_client
        .send("watchParty:approve", json!({ "partyId": "vip", "userId": guest_id.to_string() }))
        .await;
    assert_eq!(guest.received("watchParty:joinApproved").await.len(), 1);

    guest.send("watchParty:join", json!({ "partyId": "vip" })).await;
    assert_eq!(host_client.received("watchParty:userJoined").await.len(), 1);
    assert_eq!(hub.room_members(&room).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expires_connections_of_crashed_instance() {
    let cluster = Cluster::new();
    let alice = cluster.sessions.add("alice", Role::Member);
    let bob_id = cluster.sessions.add("bob", Role::Member);
    let quiet = HubSettings {
        staleness: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(3600),
        ..settings()
    };
    let hub = cluster.hub(quiet.clone());
    let doomed = cluster.hub(quiet);
    let club = RoomName::parse("group:book-club").unwrap();

    let mut bob = Client::connect(&hub, "bob").await;
    bob.send("follow:user", json!({ "userId": alice.to_string() })).await;
    bob.send("join:room", json!({ "room": club.to_string() })).await;

    // alice 连在另一个进程上，随后该进程崩溃：不再续期，也不做断开清理
    let alice_client = Client::connect(&doomed, "alice").await;
    alice_client.send("join:room", json!({ "room": club.to_string() })).await;
    assert_eq!(hub.room_members(&club).await.unwrap().len(), 2);
    doomed.shutdown();
    std::mem::forget(alice_client);
    assert!(hub.is_online(alice).await.unwrap());

    sleep(Duration::from_secs(31)).await;
    assert_eq!(hub.sweep().await, 1);
    assert_eq!(bob.received("user:offline").await.len(), 1);
    assert!(!hub.is_online(alice).await.unwrap());

    // 崩溃连接的房间成员一并回收
    assert_eq!(hub.room_members(&club).await.unwrap(), vec![bob_id]);
    assert_eq!(hub.room_members(&RoomName::followers(alice)).await.unwrap(), vec![bob_id]);
    assert!(hub.room_members(&RoomName::user(alice)).await.unwrap().is_empty());
    assert_eq!(cluster.membership.connection_count(), 1);

    // bob 本人的连接由本进程续期，不受影响
    assert_eq!(hub.sweep().await, 0);
    assert!(hub.is_online(bob_id).await.unwrap());
    assert_eq!(hub.room_members(&club).await.unwrap(), vec![bob_id]);
}

#[tokio::test(start_paused = true)]
async fn test_auth_errors_are_reported() {
    let cluster = Cluster::new();
    cluster.sessions.add("mallory", Role::Banned);
    let hub = cluster.hub(settings());

    let err = hub.accept("nobody").await.err().unwrap();
    assert_eq!(err.code(), "AUTH_FAILED");
    assert!(err.to_string().contains("invalid session token"));

    let err = hub.accept("mallory").await.err().unwrap();
    assert!(err.to_string().contains("banned"));
    assert_eq!(hub.connection_count(), 0);
}
