//! Integration tests for the chat session lifecycle: join, history
//! replay, mention round-trips, sending, echo suppression, and leave.
//!
//! Verification command: `cargo test --test chat_session`

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use chime::client::{ChimeClient, ClientError};
use chime::config::ClientConfig;
use chime::messages::InMemoryLastSeen;
use chime::session::{SessionEvent, SessionState};
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
    mpsc::Receiver<SessionEvent>,
    Arc<LocalTransport>,
) {
    let transport = Arc::new(LocalTransport::new("me"));
    let (client, _collections, sessions) =
        ChimeClient::new(test_config(), transport.clone(), InMemoryLastSeen::new());
    (client, sessions, transport)
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

fn membership_json(profile_id: &str, name: &str) -> Value {
    json!({
        "Member": {
            "ProfileId": profile_id,
            "Email": format!("{profile_id}@example.com"),
            "DisplayName": name,
        },
        "Presence": "present",
    })
}

fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Scripts a refresh carrying one room and runs it.
async fn seed_room(client: &mut TestClient, transport: &LocalTransport, id: &str, name: &str) {
    transport.queue_page("/rooms", json!({ "Rooms": [room_json(id, name)] }));
    client.refresh_rooms().await.unwrap();
}

fn messages(events: &[SessionEvent]) -> Vec<(&str, &str, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Message {
                message_id,
                text,
                outbound,
                ..
            } => Some((message_id.as_str(), text.as_str(), *outbound)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn join_replays_history_in_order_with_roster_names() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;

    // History arrives newest first, across two pages.
    transport.queue_page(
        "/rooms/r1/messages",
        json!({
            "Messages": [message_json("m2", "u1", "second", "2024-02-01T12:02:00Z")],
            "NextToken": "t1",
        }),
    );
    transport.queue_page(
        "/rooms/r1/messages",
        json!({ "Messages": [message_json("m1", "u1", "first", "2024-02-01T12:01:00Z")] }),
    );
    transport.queue_page(
        "/rooms/r1/memberships",
        json!({ "RoomMemberships": [membership_json("u1", "Jane Doe")] }),
    );

    client.join_room("r1").await.unwrap();
    assert_eq!(client.session("r1").unwrap().state(), SessionState::Active);

    let events = drain(&mut events);
    assert_eq!(messages(&events), vec![("m1", "first", false), ("m2", "second", false)]);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Message { sender_name, .. } if sender_name == "Jane Doe"
    )));
    assert!(matches!(events.last().unwrap(), SessionEvent::Joined { session } if session == "r1"));
}

#[tokio::test]
async fn join_twice_is_a_noop() {
    let (mut client, _events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));

    client.join_room("r1").await.unwrap();
    let fetches = transport.requests().len();
    client.join_room("r1").await.unwrap();
    assert_eq!(transport.requests().len(), fetches);
}

#[tokio::test]
async fn failed_join_leaves_no_session_or_channel_behind() {
    let (mut client, _events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.fail_next_request();

    assert!(matches!(client.join_room("r1").await, Err(ClientError::Sync(_))));
    assert!(client.session("r1").is_none());
    assert!(!transport.joined_channels().contains(&"ch-r1".to_string()));
}

#[tokio::test]
async fn send_expands_mentions_and_confirms_outbound() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page(
        "/rooms/r1/memberships",
        json!({ "RoomMemberships": [membership_json("u1", "Jane Doe")] }),
    );
    client.join_room("r1").await.unwrap();
    drain(&mut events);

    transport.set_next_created_on("2024-02-01T13:00:00Z");
    client.send("r1", "ping Jane Doe and @all").await.unwrap();

    let posted = transport.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "/rooms/r1/messages");
    assert_eq!(
        posted[0].1["Content"],
        "ping <@u1|Jane Doe> and <@all|All Members>"
    );

    let events = drain(&mut events);
    assert!(matches!(
        &events[0],
        SessionEvent::Message { outbound: true, mentioned: false, text, .. }
            if text == "ping Jane Doe and All Members"
    ));
}

#[tokio::test]
async fn push_echo_of_own_send_is_suppressed() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    drain(&mut events);

    transport.set_next_created_on("2024-02-01T13:00:00Z");
    client.send("r1", "hello").await.unwrap();
    let sent = drain(&mut events);
    assert_eq!(sent.len(), 1);
    let SessionEvent::Message { message_id, .. } = &sent[0] else {
        panic!("expected the outbound message");
    };

    client.handle_push_event(&PushEvent {
        channel: "ch-r1".to_string(),
        kind: "RoomMessage".to_string(),
        record: message_json(message_id, "me", "hello", "2024-02-01T13:00:00Z"),
    });
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn inbound_push_mentioning_me_is_flagged() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page(
        "/rooms/r1/memberships",
        json!({ "RoomMemberships": [membership_json("u1", "Jane Doe")] }),
    );
    client.join_room("r1").await.unwrap();
    drain(&mut events);

    client.handle_push_event(&PushEvent {
        channel: "ch-r1".to_string(),
        kind: "RoomMessage".to_string(),
        record: message_json("m9", "u1", "hey <@me|My Name>", "2024-02-01T13:05:00Z"),
    });

    let events = drain(&mut events);
    assert!(matches!(
        &events[0],
        SessionEvent::Message { mentioned: true, text, sender_name, .. }
            if text == "hey My Name" && sender_name == "Jane Doe"
    ));
}

#[tokio::test]
async fn membership_push_updates_the_roster() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    drain(&mut events);

    client.handle_push_event(&PushEvent {
        channel: "ch-r1".to_string(),
        kind: "RoomMembership".to_string(),
        record: membership_json("u2", "Bob"),
    });

    let events = drain(&mut events);
    assert!(matches!(
        &events[0],
        SessionEvent::Membership { profile_id, active: true, .. } if profile_id == "u2"
    ));
    assert_eq!(client.session("r1").unwrap().members().count(), 2);
}

#[tokio::test]
async fn rejoin_replays_only_messages_newer_than_last_seen() {
    let (mut client, mut events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page(
        "/rooms/r1/messages",
        json!({ "Messages": [message_json("m1", "u1", "old", "2024-02-01T12:01:00Z")] }),
    );
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    drain(&mut events);

    client.leave("r1");
    assert!(client.session("r1").is_none());
    let closed = drain(&mut events);
    assert!(matches!(closed.last().unwrap(), SessionEvent::Closed { session } if session == "r1"));

    // The rejoin backfill carries both the old message and a newer one;
    // only the newer one is replayed.
    transport.queue_page(
        "/rooms/r1/messages",
        json!({ "Messages": [
            message_json("m2", "u1", "new", "2024-02-01T12:05:00Z"),
            message_json("m1", "u1", "old", "2024-02-01T12:01:00Z"),
        ]}),
    );
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();

    let events = drain(&mut events);
    assert_eq!(messages(&events), vec![("m2", "new", false)]);
}

#[tokio::test]
async fn leave_detaches_from_the_room_channel() {
    let (mut client, _events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    assert!(transport.joined_channels().contains(&"ch-r1".to_string()));

    client.leave("r1");
    assert!(!transport.joined_channels().contains(&"ch-r1".to_string()));
    // The device channel stays.
    assert!(transport.joined_channels().contains(&"device-1".to_string()));
}

#[tokio::test]
async fn send_after_leave_fails() {
    let (mut client, _events, transport) = new_client();
    seed_room(&mut client, &transport, "r1", "Engineering").await;
    transport.queue_page("/rooms/r1/messages", json!({ "Messages": [] }));
    transport.queue_page("/rooms/r1/memberships", json!({ "RoomMemberships": [] }));
    client.join_room("r1").await.unwrap();
    client.leave("r1");

    assert!(matches!(
        client.send("r1", "too late").await,
        Err(ClientError::NoSession(_))
    ));
}

#[tokio::test]
async fn conversation_session_resolves_names_from_contacts() {
    let transport = Arc::new(LocalTransport::new("me"));
    let (mut client, _collections, mut events) =
        ChimeClient::new(test_config(), transport.clone(), InMemoryLastSeen::new());

    transport.queue_page(
        "/contacts",
        json!({ "Contacts": [{
            "ProfileId": "u1",
            "Email": "jane@example.com",
            "FullName": "Jane A. Doe",
            "DisplayName": "Jane Doe",
            "PresenceChannel": "ch-presence-u1",
        }]}),
    );
    client.refresh_contacts().await.unwrap();

    transport.queue_page(
        "/conversations",
        json!({ "Conversations": [{
            "ConversationId": "c1",
            "Name": "Jane Doe",
            "Channel": "ch-c1",
            "Favorite": 0,
            "Visibility": 1,
            "CreatedOn": "2024-01-10T09:00:00Z",
            "UpdatedOn": "2024-01-10T09:00:00Z",
            "Preferences": {
                "NotificationPreferences": {
                    "DesktopNotificationPreferences": "always",
                    "MobileNotificationPreferences": "never",
                }
            },
        }]}),
    );
    client.refresh_conversations().await.unwrap();

    transport.queue_page(
        "/conversations/c1/messages",
        json!({ "Messages": [message_json("m1", "u1", "hi there", "2024-02-01T12:00:00Z")] }),
    );
    client.join_conversation("c1").await.unwrap();

    // No roster endpoint was fetched.
    assert!(transport.requests().iter().all(|(path, _)| !path.contains("memberships")));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Message { sender_name, text, .. }
            if sender_name == "Jane Doe" && text == "hi there"
    )));
}
