//! Integration tests for push event routing: device-channel entity
//! updates, per-session fan-out, channel refcounting across sessions and
//! shutdown.
//!
//! Verification command: `cargo test --test push_routing`

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use chime::cache::CollectionEvent;
use chime::client::ChimeClient;
use chime::config::ClientConfig;
use chime::messages::InMemoryLastSeen;
use chime::session::SessionEvent;
use chime::transport::local::LocalTransport;
use chime_proto::event::PushEvent;

type TestClient = ChimeClient<Arc<LocalTransport>, InMemoryLastSeen>;

fn test_config() -> ClientConfig {
    ClientConfig {
        device_channel: "device-1".to_string(),
        profile_id: "me".to_string(),
        display_name: "My Name".to_string(),
        ..ClientConfig::default()
    }
}

fn new_client() -> (
    TestClient,
    mpsc::Receiver<CollectionEvent>,
    mpsc::Receiver<SessionEvent>,
    Arc<LocalTransport>,
) {
    let transport = Arc::new(LocalTransport::new("me"));
    let (client, collections, sessions) =
        ChimeClient::new(test_config(), transport.clone(), InMemoryLastSeen::new());
    (client, collections, sessions, transport)
}

fn room_json(id: &str, name: &str) -> Value {
    json!({
        "Id": id,
        "Name": name,
        "Channel": format!("ch-{id}"),
        "Privacy": "public",
        "Visibility": true,
        "CreatedOn": "2024-01-10T09:00:00Z",
        "UpdatedOn": "2024-01-10T09:00:00Z",
    })
}

fn message_json(id: &str, sender: &str, content: &str, stamp: &str) -> Value {
    json!({
        "MessageId": id,
        "Content": content,
        "Sender": sender,
        "CreatedOn": stamp,
    })
}

fn event(channel: &str, kind: &str, record: Value) -> PushEvent {
    PushEvent {
        channel: channel.to_string(),
        kind: kind.to_string(),
        record,
    }
}

async fn open_room(client: &mut TestClient, transport: &LocalTransport, id: &str) {
    transport.queue_page("/rooms", json!({ "Rooms": [room_json(id, &format!("Room {id}"))] }));
    client.refresh_rooms().await.unwrap();
    transport.queue_page(&format!("/rooms/{id}/messages"), json!({ "Messages": [] }));
    transport.queue_page(&format!("/rooms/{id}/memberships"), json!({ "RoomMemberships": [] }));
    client.join_room(id).await.unwrap();
}

fn drain_sessions(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn device_channel_events_update_only_their_collection() {
    let (mut client, mut collections, _sessions, _transport) = new_client();

    client.handle_push_event(&event("device-1", "Room", room_json("r1", "Engineering")));

    assert_eq!(client.rooms().len(), 1);
    assert_eq!(client.conversations().len(), 0);
    assert!(matches!(
        collections.try_recv().unwrap(),
        CollectionEvent::Created { kind: "Room", .. }
    ));
}

#[tokio::test]
async fn events_on_unsubscribed_channels_are_dropped() {
    let (mut client, mut collections, _sessions, _transport) = new_client();

    client.handle_push_event(&event("ch-unknown", "Room", room_json("r1", "Engineering")));

    assert_eq!(client.rooms().len(), 0);
    assert!(collections.try_recv().is_err());
}

#[tokio::test]
async fn unknown_kind_on_device_channel_is_dropped() {
    let (mut client, mut collections, _sessions, _transport) = new_client();

    client.handle_push_event(&event("device-1", "Typing", json!({})));

    assert!(collections.try_recv().is_err());
}

#[tokio::test]
async fn session_events_reach_only_their_session() {
    let (mut client, _collections, mut sessions, transport) = new_client();
    open_room(&mut client, &transport, "r1").await;
    open_room(&mut client, &transport, "r2").await;
    drain_sessions(&mut sessions);

    client.handle_push_event(&event(
        "ch-r1",
        "RoomMessage",
        message_json("m1", "u1", "for r1", "2024-02-01T12:00:00Z"),
    ));

    let events = drain_sessions(&mut sessions);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        SessionEvent::Message { session, text, .. } if session == "r1" && text == "for r1"
    ));
}

#[tokio::test]
async fn malformed_pushed_record_is_dropped_quietly() {
    let (mut client, mut collections, _sessions, _transport) = new_client();

    client.handle_push_event(&event("device-1", "Room", json!({ "Id": "half-a-room" })));

    assert_eq!(client.rooms().len(), 0);
    assert!(collections.try_recv().is_err());
}

#[tokio::test]
async fn message_event_after_leave_is_ignored() {
    let (mut client, _collections, mut sessions, transport) = new_client();
    open_room(&mut client, &transport, "r1").await;
    client.leave("r1");
    drain_sessions(&mut sessions);

    client.handle_push_event(&event(
        "ch-r1",
        "RoomMessage",
        message_json("m1", "u1", "late", "2024-02-01T12:00:00Z"),
    ));
    assert!(drain_sessions(&mut sessions).is_empty());
}

#[tokio::test]
async fn shutdown_closes_sessions_and_leaves_every_channel() {
    let (mut client, _collections, mut sessions, transport) = new_client();
    open_room(&mut client, &transport, "r1").await;
    open_room(&mut client, &transport, "r2").await;
    drain_sessions(&mut sessions);

    client.shutdown();

    let events = drain_sessions(&mut sessions);
    let closed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Closed { session } => Some(session.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(closed.len(), 2);
    assert!(transport.joined_channels().is_empty());
}

#[tokio::test]
async fn two_sessions_on_one_channel_share_the_join() {
    // Two chats can share a push channel; the transport joins once and
    // leaves only when the last session goes.
    let (mut client, _collections, _sessions, transport) = new_client();

    transport.queue_page(
        "/rooms",
        json!({ "Rooms": [
            room_json("r1", "Engineering"),
            {
                "Id": "r2",
                "Name": "Mirror",
                "Channel": "ch-r1",
                "Privacy": "public",
                "Visibility": true,
                "CreatedOn": "2024-01-10T09:00:00Z",
                "UpdatedOn": "2024-01-10T09:00:00Z",
            },
        ]}),
    );
    client.refresh_rooms().await.unwrap();

    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    transport.queue_page("/rooms/r2/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r2/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r2").await.unwrap();

    assert_eq!(
        transport.joined_channels().iter().filter(|c| *c == "ch-r1").count(),
        1
    );

    client.leave("r1");
    assert!(transport.joined_channels().contains(&"ch-r1".to_string()));
    client.leave("r2");
    assert!(!transport.joined_channels().contains(&"ch-r1".to_string()));
}
