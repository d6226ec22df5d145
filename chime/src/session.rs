//! Chat session lifecycle.
//!
//! A [`ChatSession`] is one open room or conversation: it owns the
//! [`MessageStream`] doing history reconciliation, the membership roster,
//! and the mention wiring, and reports everything the application layer
//! should show as [`SessionEvent`]s on an `mpsc` channel.
//!
//! Sessions are pure state plus events; the owning client performs the
//! network work (backfill pages, roster pages, message posts) and feeds
//! the results in.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use chime_proto::mention::{expand_mentions, strip_mentions};
use chime_proto::record::{MembershipRecord, MessageRecord, Presence};

use crate::cache::entities::{Conversation, Room};
use crate::messages::{BackfillStep, Delivery, LastSeen, MessageStream};
use crate::sync::SyncError;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// History and roster are still being fetched.
    Joining,
    /// Fully open; messages flow live.
    Active,
    /// Teardown started; channels are being detached.
    Leaving,
    /// Session is closed and detached from its channels.
    Closed,
}

/// One entry in a session's roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// The member's profile id.
    pub profile_id: String,
    /// Email address, when known.
    pub email: String,
    /// Display name.
    pub display_name: String,
    /// Whether the member is currently present.
    pub present: bool,
    /// Whether the member administers the room.
    pub admin: bool,
}

/// Events emitted by a [`ChatSession`] for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session finished joining and is live.
    Joined {
        /// Session (room or conversation) id.
        session: String,
    },
    /// A message to display.
    Message {
        /// Session id.
        session: String,
        /// Server message id.
        message_id: String,
        /// Readable text, mention tokens stripped.
        text: String,
        /// Sender profile id.
        sender: String,
        /// Sender display name, resolved from the roster.
        sender_name: String,
        /// Whether this is the local user's own send.
        outbound: bool,
        /// Whether an inbound message addressed the local user.
        mentioned: bool,
        /// Server timestamp.
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// A roster entry appeared, changed, or went away.
    Membership {
        /// Session id.
        session: String,
        /// The member's profile id.
        profile_id: String,
        /// The member's display name.
        display_name: String,
        /// Whether the member is present.
        present: bool,
        /// Whether the member administers the room.
        admin: bool,
        /// `false` when the member left the room.
        active: bool,
    },
    /// The session was closed.
    Closed {
        /// Session id.
        session: String,
    },
}

/// One open room or conversation.
pub struct ChatSession {
    id: String,
    channel: String,
    membership_path: Option<String>,
    state: SessionState,
    members: HashMap<String, Member>,
    stream: MessageStream,
    profile_id: String,
    events: mpsc::Sender<SessionEvent>,
}

impl ChatSession {
    /// Opens a session for a room. Rooms have a roster, so delivery waits
    /// for both the message backfill and the first roster sweep.
    #[must_use]
    pub fn for_room(
        room: &Room,
        profile_id: &str,
        last_seen: Option<LastSeen>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id: room.id.clone(),
            channel: room.channel.clone(),
            membership_path: Some(format!("/rooms/{}/memberships", room.id)),
            state: SessionState::Joining,
            members: HashMap::new(),
            stream: MessageStream::new(
                &room.id,
                &format!("/rooms/{}/messages", room.id),
                true,
                last_seen,
            ),
            profile_id: profile_id.to_string(),
            events,
        }
    }

    /// Opens a session for a conversation. Conversations carry no roster;
    /// delivery waits only for the message backfill.
    #[must_use]
    pub fn for_conversation(
        conversation: &Conversation,
        profile_id: &str,
        last_seen: Option<LastSeen>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id: conversation.id.clone(),
            channel: conversation.channel.clone(),
            membership_path: None,
            state: SessionState::Joining,
            members: HashMap::new(),
            stream: MessageStream::new(
                &conversation.id,
                &format!("/conversations/{}/messages", conversation.id),
                false,
                last_seen,
            ),
            profile_id: profile_id.to_string(),
            events,
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push channel this session listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Messages endpoint for this session.
    #[must_use]
    pub fn messages_path(&self) -> &str {
        self.stream.messages_path()
    }

    /// Roster endpoint, present for rooms only.
    #[must_use]
    pub fn membership_path(&self) -> Option<&str> {
        self.membership_path.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Last-seen marker of the underlying stream, for persisting.
    #[must_use]
    pub const fn last_seen(&self) -> Option<&LastSeen> {
        self.stream.last_seen()
    }

    /// Current roster, in unspecified order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Pre-seeds a roster entry without emitting events, e.g. conversation
    /// counterparts resolved from the contact cache.
    pub fn seed_member(&mut self, profile_id: &str, display_name: &str) {
        self.members
            .entry(profile_id.to_string())
            .or_insert_with(|| Member {
                profile_id: profile_id.to_string(),
                email: String::new(),
                display_name: display_name.to_string(),
                present: false,
                admin: false,
            });
    }

    /// Folds one history page into the stream, emitting any messages that
    /// became deliverable. Returns the continuation token when more pages
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingCollection`] on a malformed page.
    pub fn on_backfill_page(&mut self, page: &Value) -> Result<Option<String>, SyncError> {
        match self.stream.on_backfill_page(page)? {
            BackfillStep::Continue(token) => Ok(Some(token)),
            BackfillStep::Done(deliveries) => {
                self.emit_deliveries(deliveries);
                self.maybe_activate();
                Ok(None)
            }
        }
    }

    /// Folds one roster page in, emitting a `Membership` event per entry.
    /// The final page completes the roster sweep, which may release held
    /// backfill messages. Returns the continuation token when more pages
    /// remain.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingCollection`] on a malformed page.
    pub fn on_membership_page(&mut self, page: &Value) -> Result<Option<String>, SyncError> {
        let records = page
            .get("RoomMemberships")
            .and_then(Value::as_array)
            .ok_or(SyncError::MissingCollection {
                key: "RoomMemberships",
            })?;
        for record in records {
            self.handle_membership_record(record);
        }
        if let Some(token) = page.get("NextToken").and_then(Value::as_str) {
            return Ok(Some(token.to_string()));
        }
        let deliveries = self.stream.mark_members_done();
        self.emit_deliveries(deliveries);
        self.maybe_activate();
        Ok(None)
    }

    /// Handles one live message push for this session's channel.
    pub fn handle_message_record(&mut self, record: &Value) {
        if self.is_tearing_down() {
            return;
        }
        if let Some(delivery) = self.stream.on_live_record(record) {
            self.emit_delivery(delivery);
        }
    }

    /// Handles one live membership push, updating the roster.
    pub fn handle_membership_record(&mut self, record: &Value) {
        if self.is_tearing_down() {
            return;
        }
        let parsed = match MembershipRecord::parse(record) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(session = %self.id, error = %err, "dropping malformed membership record");
                return;
            }
        };
        let member = Member {
            profile_id: parsed.profile_id.clone(),
            email: parsed.email,
            display_name: parsed.display_name,
            present: parsed.presence == Presence::Present,
            admin: parsed.admin,
        };
        let unchanged = self.members.get(&parsed.profile_id) == Some(&member);
        if unchanged {
            return;
        }
        let event = SessionEvent::Membership {
            session: self.id.clone(),
            profile_id: member.profile_id.clone(),
            display_name: member.display_name.clone(),
            present: member.present,
            admin: member.admin,
            active: true,
        };
        self.members.insert(parsed.profile_id, member);
        let _ = self.events.try_send(event);
    }

    /// Drops a member from the roster and emits `active: false`.
    ///
    /// The service has no dedicated removal push; callers that learn of a
    /// departure out of band (a roster re-fetch, an admin action) invoke
    /// this directly.
    pub fn remove_member(&mut self, profile_id: &str) {
        if let Some(member) = self.members.remove(profile_id) {
            let _ = self.events.try_send(SessionEvent::Membership {
                session: self.id.clone(),
                profile_id: member.profile_id,
                display_name: member.display_name,
                present: false,
                admin: member.admin,
                active: false,
            });
        }
    }

    /// Expands mention shorthand in outbound text against the roster.
    #[must_use]
    pub fn prepare_send(&self, text: &str) -> String {
        expand_mentions(
            text,
            self.members
                .values()
                .map(|m| (m.display_name.as_str(), m.profile_id.as_str())),
        )
    }

    /// Handles the service response to one of our sends, emitting the
    /// outbound message unless its push echo already arrived.
    pub fn on_send_complete(&mut self, record: MessageRecord) {
        if let Some(delivery) = self.stream.on_send_complete(record) {
            self.emit_delivery(delivery);
        }
    }

    /// Starts teardown: the session stops accepting live records while its
    /// channels are detached. Safe to call even after the underlying room
    /// was already invalidated by a refresh sweep.
    pub fn begin_leave(&mut self) {
        if self.is_tearing_down() {
            warn!(session = %self.id, "leave on session already tearing down");
            return;
        }
        self.state = SessionState::Leaving;
    }

    /// Closes the session. Closing an already-closed session is a warned
    /// no-op.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            warn!(session = %self.id, "close on already-closed session");
            return;
        }
        self.state = SessionState::Closed;
        debug!(session = %self.id, "session closed");
        let _ = self.events.try_send(SessionEvent::Closed {
            session: self.id.clone(),
        });
    }

    const fn is_tearing_down(&self) -> bool {
        matches!(self.state, SessionState::Leaving | SessionState::Closed)
    }

    fn maybe_activate(&mut self) {
        if self.state == SessionState::Joining && self.stream.is_live() {
            self.state = SessionState::Active;
            let _ = self.events.try_send(SessionEvent::Joined {
                session: self.id.clone(),
            });
        }
    }

    fn emit_deliveries(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.emit_delivery(delivery);
        }
    }

    fn emit_delivery(&mut self, delivery: Delivery) {
        let record = delivery.record;
        let (text, mentioned) = strip_mentions(&record.content, &self.profile_id);
        let sender_name = self.members.get(&record.sender).map_or_else(
            || {
                if record.sender == self.profile_id {
                    self.profile_id.clone()
                } else {
                    "Unknown sender".to_string()
                }
            },
            |m| m.display_name.clone(),
        );
        let _ = self.events.try_send(SessionEvent::Message {
            session: self.id.clone(),
            message_id: record.message_id,
            text,
            sender: record.sender,
            sender_name,
            outbound: delivery.outbound,
            // Own sends never count as mentions of oneself.
            mentioned: mentioned && !delivery.outbound,
            timestamp: record.created_on,
        });
    }
}
