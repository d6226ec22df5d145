//! The client context.
//!
//! [`ChimeClient`] owns every piece of per-connection state: the four
//! entity collections with their refresh controllers, the push event
//! router, and the open chat sessions. It drives the network through the
//! [`ChimeTransport`] seam and surfaces everything observable on two
//! `mpsc` channels, collection events and session events.
//!
//! All mutation happens through `&mut self`; the embedding application
//! runs the client on one task and fans events out from there.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chime_proto::event::PushEvent;
use chime_proto::record::{MessageRecord, ParseError};

use crate::cache::entities::{Call, Contact, Conversation, Room};
use crate::cache::{CachedEntity, CollectionEvent, EntityCollection};
use crate::config::ClientConfig;
use crate::jugg::{ChannelTransition, JuggRouter};
use crate::messages::LastSeenStore;
use crate::session::{ChatSession, SessionEvent, SessionState};
use crate::sync::{PageOutcome, SyncController, SyncError};
use crate::transport::{ChimeTransport, TransportError};

/// Dispatch targets for routed push events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Room collection updates on the device channel.
    Rooms,
    /// Conversation collection updates on the device channel.
    Conversations,
    /// Call collection updates on the device channel.
    Calls,
    /// Contact collection updates on the device channel.
    Contacts,
    /// Message events for one open session.
    SessionMessages(String),
    /// Membership events for one open session.
    SessionMembership(String),
}

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No cached room or conversation has this id.
    #[error("unknown chat: {0}")]
    UnknownChat(String),

    /// The chat exists but no session is open for it.
    #[error("no open session for chat {0}")]
    NoSession(String),

    /// The session for this chat was already closed.
    #[error("session for chat {0} is closed")]
    SessionClosed(String),

    /// A network operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The service answered a send with a record we cannot parse.
    #[error("malformed send response: {0}")]
    BadResponse(#[from] ParseError),

    /// A refresh pass failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Per-connection client state for the Chime service.
pub struct ChimeClient<T: ChimeTransport, S: LastSeenStore> {
    config: ClientConfig,
    transport: T,
    store: S,
    rooms: EntityCollection<Room>,
    conversations: EntityCollection<Conversation>,
    calls: EntityCollection<Call>,
    contacts: EntityCollection<Contact>,
    rooms_sync: SyncController,
    conversations_sync: SyncController,
    calls_sync: SyncController,
    contacts_sync: SyncController,
    router: JuggRouter<Route>,
    sessions: HashMap<String, ChatSession>,
    session_events: mpsc::Sender<SessionEvent>,
}

impl<T: ChimeTransport, S: LastSeenStore> ChimeClient<T, S> {
    /// Creates a client and subscribes the device channel for entity
    /// updates. Returns the client plus the receivers for collection and
    /// session events.
    pub fn new(
        config: ClientConfig,
        transport: T,
        store: S,
    ) -> (
        Self,
        mpsc::Receiver<CollectionEvent>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (collection_tx, collection_rx) = mpsc::channel(config.event_buffer);
        let (session_tx, session_rx) = mpsc::channel(config.event_buffer);

        let mut router = JuggRouter::new();
        let device = config.device_channel.clone();
        let entity_routes = [
            (Room::ITEM_EVENT, Route::Rooms),
            (Conversation::ITEM_EVENT, Route::Conversations),
            (Call::ITEM_EVENT, Route::Calls),
            (Contact::ITEM_EVENT, Route::Contacts),
        ];
        for (kind, route) in entity_routes {
            if router.subscribe(&device, Some(kind), route) == ChannelTransition::Joined {
                transport.join_channel(&device);
            }
        }
        info!(device_channel = %device, "client context created");

        let max_results = config.max_results;
        let client = Self {
            config,
            transport,
            store,
            rooms: EntityCollection::new(collection_tx.clone()),
            conversations: EntityCollection::new(collection_tx.clone()),
            calls: EntityCollection::new(collection_tx.clone()),
            contacts: EntityCollection::new(collection_tx),
            rooms_sync: SyncController::new(max_results),
            conversations_sync: SyncController::new(max_results),
            calls_sync: SyncController::new(max_results),
            contacts_sync: SyncController::new(max_results),
            router,
            sessions: HashMap::new(),
            session_events: session_tx,
        };
        (client, collection_rx, session_rx)
    }

    /// The resolved configuration this client runs with.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cached rooms.
    #[must_use]
    pub const fn rooms(&self) -> &EntityCollection<Room> {
        &self.rooms
    }

    /// Cached conversations.
    #[must_use]
    pub const fn conversations(&self) -> &EntityCollection<Conversation> {
        &self.conversations
    }

    /// Cached calls.
    #[must_use]
    pub const fn calls(&self) -> &EntityCollection<Call> {
        &self.calls
    }

    /// Cached contacts.
    #[must_use]
    pub const fn contacts(&self) -> &EntityCollection<Contact> {
        &self.contacts
    }

    /// The open session for a chat, if any.
    #[must_use]
    pub fn session(&self, chat_id: &str) -> Option<&ChatSession> {
        self.sessions.get(chat_id)
    }

    /// Refreshes the room collection, then opens any room whose
    /// last-mention marker moved past what the local user has seen.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Sync`] when a page fetch fails or a page is
    /// malformed; an aborted pass leaves the cache unswept.
    pub async fn refresh_rooms(&mut self) -> Result<(), ClientError> {
        let expired = Self::run_refresh(
            &self.transport,
            &mut self.rooms_sync,
            &mut self.rooms,
        )
        .await?;
        for room in expired {
            self.drop_chat_state(&room.id);
        }

        let mentioned: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| {
                room.last_mentioned.is_some_and(|at| {
                    self.store
                        .read(&room.id)
                        .is_none_or(|seen| at > seen.time)
                })
            })
            .map(|room| room.id.clone())
            .collect();
        for room_id in mentioned {
            if !self.sessions.contains_key(&room_id) {
                info!(room = %room_id, "opening room with unseen mention");
                self.join_room(&room_id).await?;
            }
        }
        Ok(())
    }

    /// Refreshes the conversation collection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Sync`] when a page fetch fails or a page is
    /// malformed.
    pub async fn refresh_conversations(&mut self) -> Result<(), ClientError> {
        let expired = Self::run_refresh(
            &self.transport,
            &mut self.conversations_sync,
            &mut self.conversations,
        )
        .await?;
        for conversation in expired {
            self.drop_chat_state(&conversation.id);
        }
        Ok(())
    }

    /// Refreshes the call collection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Sync`] when a page fetch fails or a page is
    /// malformed.
    pub async fn refresh_calls(&mut self) -> Result<(), ClientError> {
        Self::run_refresh(&self.transport, &mut self.calls_sync, &mut self.calls).await?;
        Ok(())
    }

    /// Refreshes the contact collection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Sync`] when a page fetch fails or a page is
    /// malformed.
    pub async fn refresh_contacts(&mut self) -> Result<(), ClientError> {
        Self::run_refresh(&self.transport, &mut self.contacts_sync, &mut self.contacts).await?;
        Ok(())
    }

    /// Opens a session for a cached room, replaying history and the roster.
    /// Joining an already-open room is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownChat`] when the room is not cached,
    /// or a transport/parse error from the join fetches. A failed join
    /// leaves no session behind.
    pub async fn join_room(&mut self, room_id: &str) -> Result<(), ClientError> {
        if self.sessions.contains_key(room_id) {
            return Ok(());
        }
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ClientError::UnknownChat(room_id.to_string()))?;
        let last_seen = self.store.read(room_id);
        let mut session = ChatSession::for_room(
            room,
            &self.config.profile_id,
            last_seen,
            self.session_events.clone(),
        );
        session.seed_member(&self.config.profile_id, &self.config.display_name);

        let channel = session.channel().to_string();
        self.subscribe_session(&channel, room_id);
        self.sessions.insert(room_id.to_string(), session);

        if let Err(err) = self.drive_join(room_id).await {
            self.drop_chat_state(room_id);
            return Err(err);
        }
        self.persist_last_seen(room_id);
        Ok(())
    }

    /// Opens a session for a cached conversation. Joining an already-open
    /// conversation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownChat`] when the conversation is not
    /// cached, or a transport/parse error from the join fetches.
    pub async fn join_conversation(&mut self, conversation_id: &str) -> Result<(), ClientError> {
        if self.sessions.contains_key(conversation_id) {
            return Ok(());
        }
        let conversation = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| ClientError::UnknownChat(conversation_id.to_string()))?;
        let last_seen = self.store.read(conversation_id);
        let mut session = ChatSession::for_conversation(
            conversation,
            &self.config.profile_id,
            last_seen,
            self.session_events.clone(),
        );
        session.seed_member(&self.config.profile_id, &self.config.display_name);
        // Conversations carry no roster endpoint; sender names resolve
        // through the contact cache instead.
        for contact in self.contacts.iter() {
            session.seed_member(&contact.profile_id, &contact.display_name);
        }

        let channel = session.channel().to_string();
        self.subscribe_session(&channel, conversation_id);
        self.sessions.insert(conversation_id.to_string(), session);

        if let Err(err) = self.drive_join(conversation_id).await {
            self.drop_chat_state(conversation_id);
            return Err(err);
        }
        self.persist_last_seen(conversation_id);
        Ok(())
    }

    /// Sends a message to an open chat. Mention shorthand is expanded
    /// against the roster before posting; the confirmed record flows back
    /// as an outbound session event unless its push echo already did.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoSession`] / [`ClientError::SessionClosed`]
    /// for missing or closed sessions, [`ClientError::Transport`] when the
    /// post fails, and [`ClientError::BadResponse`] when the response is
    /// not a message record. Failed sends are not retried.
    pub async fn send(&mut self, chat_id: &str, text: &str) -> Result<(), ClientError> {
        let session = self
            .sessions
            .get_mut(chat_id)
            .ok_or_else(|| ClientError::NoSession(chat_id.to_string()))?;
        if session.state() == SessionState::Closed {
            return Err(ClientError::SessionClosed(chat_id.to_string()));
        }
        let expanded = session.prepare_send(text);
        let body = json!({ "Content": expanded });
        let response = self
            .transport
            .post_message(session.messages_path(), &body)
            .await?;
        let record = MessageRecord::parse(&response)?;
        debug!(chat = %chat_id, id = %record.message_id, "send confirmed");
        session.on_send_complete(record);
        self.persist_last_seen(chat_id);
        Ok(())
    }

    /// Closes the session for a chat and detaches from its channels.
    /// Leaving a chat with no session is a no-op.
    pub fn leave(&mut self, chat_id: &str) {
        self.persist_last_seen(chat_id);
        self.drop_chat_state(chat_id);
    }

    /// Routes one push event to every interested component.
    pub fn handle_push_event(&mut self, event: &PushEvent) {
        let routes = self.router.routes_for(event);
        if routes.is_empty() {
            debug!(channel = %event.channel, kind = %event.kind, "push event with no subscribers");
        }
        for route in routes {
            match route {
                Route::Rooms => Self::upsert_pushed(&mut self.rooms, event),
                Route::Conversations => Self::upsert_pushed(&mut self.conversations, event),
                Route::Calls => Self::upsert_pushed(&mut self.calls, event),
                Route::Contacts => Self::upsert_pushed(&mut self.contacts, event),
                Route::SessionMessages(chat_id) => {
                    if let Some(session) = self.sessions.get_mut(&chat_id) {
                        session.handle_message_record(&event.record);
                        if let Some(marker) = session.last_seen() {
                            let marker = marker.clone();
                            self.store.write(&chat_id, &marker);
                        }
                    }
                }
                Route::SessionMembership(chat_id) => {
                    if let Some(session) = self.sessions.get_mut(&chat_id) {
                        session.handle_membership_record(&event.record);
                    }
                }
            }
        }
    }

    /// Closes every session and detaches from all channels.
    pub fn shutdown(&mut self) {
        let open: Vec<String> = self.sessions.keys().cloned().collect();
        for chat_id in open {
            self.leave(&chat_id);
        }
        for route in [Route::Rooms, Route::Conversations, Route::Calls, Route::Contacts] {
            for channel in self.router.unsubscribe_route(&route) {
                self.transport.leave_channel(&channel);
            }
        }
        info!("client context shut down");
    }

    async fn run_refresh<E: CachedEntity>(
        transport: &T,
        sync: &mut SyncController,
        coll: &mut EntityCollection<E>,
    ) -> Result<Vec<E>, ClientError> {
        let Some(mut page) = sync.request_refresh(coll) else {
            return Ok(Vec::new());
        };
        loop {
            let body = match transport
                .fetch_page(page.path, page.max_results, page.next_token.as_deref())
                .await
            {
                Ok(body) => body,
                Err(err) => {
                    sync.abort();
                    return Err(SyncError::from(err).into());
                }
            };
            match sync.handle_page(coll, &body) {
                Ok(PageOutcome::Next(next) | PageOutcome::Restarted(next)) => page = next,
                Ok(PageOutcome::Complete { expired }) => return Ok(expired),
                Err(err) => {
                    sync.abort();
                    return Err(err.into());
                }
            }
        }
    }

    /// Drives the backfill and roster fetches for a freshly inserted
    /// session until it goes active.
    async fn drive_join(&mut self, chat_id: &str) -> Result<(), ClientError> {
        let Some(session) = self.sessions.get_mut(chat_id) else {
            return Err(ClientError::NoSession(chat_id.to_string()));
        };

        let mut token: Option<String> = None;
        loop {
            let page = self
                .transport
                .fetch_page(
                    session.messages_path(),
                    self.config.max_results,
                    token.as_deref(),
                )
                .await
                .map_err(SyncError::from)?;
            token = session.on_backfill_page(&page)?;
            if token.is_none() {
                break;
            }
        }

        if let Some(path) = session.membership_path().map(str::to_string) {
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .transport
                    .fetch_page(&path, self.config.max_results, token.as_deref())
                    .await
                    .map_err(SyncError::from)?;
                token = session.on_membership_page(&page)?;
                if token.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn subscribe_session(&mut self, channel: &str, chat_id: &str) {
        let subs = [
            ("RoomMessage", Route::SessionMessages(chat_id.to_string())),
            ("RoomMembership", Route::SessionMembership(chat_id.to_string())),
        ];
        for (kind, route) in subs {
            if self.router.subscribe(channel, Some(kind), route) == ChannelTransition::Joined {
                self.transport.join_channel(channel);
            }
        }
    }

    /// Closes and removes the session for a chat, if any, and leaves the
    /// channels it was the last subscriber of.
    fn drop_chat_state(&mut self, chat_id: &str) {
        let mut session = self.sessions.remove(chat_id);
        if let Some(session) = &mut session {
            session.begin_leave();
        }
        let routes = [
            Route::SessionMessages(chat_id.to_string()),
            Route::SessionMembership(chat_id.to_string()),
        ];
        for route in routes {
            for channel in self.router.unsubscribe_route(&route) {
                self.transport.leave_channel(&channel);
            }
        }
        if let Some(mut session) = session {
            session.close();
        }
    }

    fn persist_last_seen(&mut self, chat_id: &str) {
        if let Some(marker) = self
            .sessions
            .get(chat_id)
            .and_then(|session| session.last_seen())
        {
            let marker = marker.clone();
            self.store.write(chat_id, &marker);
        }
    }

    fn upsert_pushed<E: CachedEntity>(coll: &mut EntityCollection<E>, event: &PushEvent) {
        if let Err(err) = coll.upsert(&event.record) {
            warn!(kind = E::KIND, channel = %event.channel, error = %err,
                "dropping malformed pushed record");
        }
    }
}
