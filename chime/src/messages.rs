//! Message history reconciliation.
//!
//! Opening a chat replays history from the messages endpoint while live
//! pushes for the same channel are already flowing. A [`MessageStream`]
//! reconciles the two feeds: while backfill runs, everything lands in an
//! id-keyed holding table so a message seen on both paths is delivered
//! once; when backfill (and, for rooms, the first roster sweep) completes,
//! the table drains in timestamp order and the stream goes live.
//!
//! The stream also suppresses the push echo of the local user's own sends
//! and tracks a durable last-seen marker so reopening a chat replays only
//! what arrived since.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use chime_proto::record::MessageRecord;

use crate::sync::SyncError;

/// Durable marker for the newest message delivered for one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSeen {
    /// Server timestamp of the newest delivered message.
    pub time: DateTime<Utc>,
    /// Id of that message.
    pub message_id: String,
}

/// Storage for last-seen markers, keyed by room or conversation id.
pub trait LastSeenStore: Send {
    /// Reads the marker for a chat, if one was ever written.
    fn read(&self, target: &str) -> Option<LastSeen>;

    /// Writes the marker for a chat, replacing any previous one.
    fn write(&mut self, target: &str, marker: &LastSeen);
}

/// Last-seen markers held in memory, for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct InMemoryLastSeen {
    markers: HashMap<String, LastSeen>,
}

impl InMemoryLastSeen {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LastSeenStore for InMemoryLastSeen {
    fn read(&self, target: &str) -> Option<LastSeen> {
        self.markers.get(target).cloned()
    }

    fn write(&mut self, target: &str, marker: &LastSeen) {
        self.markers.insert(target.to_string(), marker.clone());
    }
}

/// One message ready for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The message record.
    pub record: MessageRecord,
    /// Whether this is the local user's own send being confirmed.
    pub outbound: bool,
}

/// What the backfill driver should do after a page was folded in.
#[derive(Debug)]
pub enum BackfillStep {
    /// Fetch the next page with this continuation token.
    Continue(String),
    /// Backfill is done; these messages are ready (empty while the stream
    /// still waits on the roster sweep).
    Done(Vec<Delivery>),
}

struct Buffered {
    record: MessageRecord,
    arrival: u64,
}

enum StreamState {
    Backfilling {
        buffered: HashMap<String, Buffered>,
        messages_done: bool,
        members_done: bool,
    },
    Live,
}

/// Reconciles the backfill and live message feeds for one chat.
pub struct MessageStream {
    target_id: String,
    messages_path: String,
    state: StreamState,
    pending_sent: HashSet<String>,
    last_seen: Option<LastSeen>,
    arrivals: u64,
}

impl MessageStream {
    /// Opens a stream for the chat with id `target_id` whose history lives
    /// at `messages_path`. Rooms gate delivery on a roster sweep as well;
    /// conversations (`wait_for_members: false`) only on the backfill.
    #[must_use]
    pub fn new(
        target_id: &str,
        messages_path: &str,
        wait_for_members: bool,
        last_seen: Option<LastSeen>,
    ) -> Self {
        Self {
            target_id: target_id.to_string(),
            messages_path: messages_path.to_string(),
            state: StreamState::Backfilling {
                buffered: HashMap::new(),
                messages_done: false,
                members_done: !wait_for_members,
            },
            pending_sent: HashSet::new(),
            last_seen,
            arrivals: 0,
        }
    }

    /// Chat id this stream belongs to.
    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Messages endpoint for this chat.
    #[must_use]
    pub fn messages_path(&self) -> &str {
        &self.messages_path
    }

    /// Whether backfill has finished and messages flow straight through.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.state, StreamState::Live)
    }

    /// Newest delivered marker, for persisting.
    #[must_use]
    pub const fn last_seen(&self) -> Option<&LastSeen> {
        self.last_seen.as_ref()
    }

    /// Folds one backfill page in. Pages arrive newest message first; the
    /// walk stops early once it reaches a message at or before the
    /// last-seen marker, since everything older was already delivered in a
    /// previous run.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingCollection`] when the page has no
    /// `Messages` array.
    pub fn on_backfill_page(&mut self, page: &Value) -> Result<BackfillStep, SyncError> {
        let records = page
            .get("Messages")
            .and_then(Value::as_array)
            .ok_or(SyncError::MissingCollection { key: "Messages" })?;

        let mut reached_boundary = false;
        for record in records {
            let parsed = match MessageRecord::parse(record) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(target = %self.target_id, error = %err, "skipping malformed backfill message");
                    continue;
                }
            };
            if self
                .last_seen
                .as_ref()
                .is_some_and(|seen| parsed.created_on <= seen.time)
            {
                reached_boundary = true;
                break;
            }
            self.buffer(parsed);
        }

        let token = page.get("NextToken").and_then(Value::as_str);
        if let Some(token) = token
            && !reached_boundary
        {
            return Ok(BackfillStep::Continue(token.to_string()));
        }

        match &mut self.state {
            StreamState::Backfilling { messages_done, .. } => *messages_done = true,
            StreamState::Live => {}
        }
        Ok(BackfillStep::Done(self.try_drain()))
    }

    /// Marks the roster sweep complete, draining the holding table if the
    /// message backfill already finished.
    pub fn mark_members_done(&mut self) -> Vec<Delivery> {
        match &mut self.state {
            StreamState::Backfilling { members_done, .. } => *members_done = true,
            StreamState::Live => {}
        }
        self.try_drain()
    }

    /// Handles one live message push. While backfilling, the record joins
    /// the holding table (first sighting of an id wins); once live, it is
    /// delivered immediately unless it is the echo of a pending send.
    pub fn on_live_record(&mut self, record: &Value) -> Option<Delivery> {
        let parsed = match MessageRecord::parse(record) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(target = %self.target_id, error = %err, "dropping malformed live message");
                return None;
            }
        };
        match &mut self.state {
            StreamState::Backfilling { .. } => {
                self.buffer(parsed);
                None
            }
            StreamState::Live => self.deliver(parsed),
        }
    }

    /// Handles the service response to one of our own sends.
    ///
    /// When the push echo already arrived (the last-seen marker is at or
    /// past the record's timestamp) the message was delivered on the live
    /// path and nothing more happens. Otherwise the send is delivered as
    /// outbound now and its id is remembered so the echo gets swallowed.
    pub fn on_send_complete(&mut self, record: MessageRecord) -> Option<Delivery> {
        if self
            .last_seen
            .as_ref()
            .is_some_and(|seen| seen.time >= record.created_on)
        {
            debug!(target = %self.target_id, id = %record.message_id, "send echo already delivered");
            return None;
        }
        self.pending_sent.insert(record.message_id.clone());
        self.advance_last_seen(&record);
        Some(Delivery {
            record,
            outbound: true,
        })
    }

    fn buffer(&mut self, record: MessageRecord) {
        let StreamState::Backfilling { buffered, .. } = &mut self.state else {
            return;
        };
        self.arrivals += 1;
        let arrival = self.arrivals;
        // Duplicate ids overwrite the record but keep the first arrival
        // number, so drain order stays stable.
        match buffered.entry(record.message_id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.get_mut().record = record;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Buffered { record, arrival });
            }
        }
    }

    fn try_drain(&mut self) -> Vec<Delivery> {
        let StreamState::Backfilling {
            buffered,
            messages_done: true,
            members_done: true,
        } = &mut self.state
        else {
            return Vec::new();
        };

        let mut pending: Vec<Buffered> = buffered.drain().map(|(_, b)| b).collect();
        pending.sort_by(|a, b| {
            a.record
                .created_on
                .cmp(&b.record.created_on)
                .then(a.arrival.cmp(&b.arrival))
        });
        self.state = StreamState::Live;
        debug!(target = %self.target_id, count = pending.len(), "message stream going live");

        pending
            .into_iter()
            .filter_map(|b| self.deliver(b.record))
            .collect()
    }

    fn deliver(&mut self, record: MessageRecord) -> Option<Delivery> {
        self.advance_last_seen(&record);
        if self.pending_sent.remove(&record.message_id) {
            return None;
        }
        Some(Delivery {
            record,
            outbound: false,
        })
    }

    fn advance_last_seen(&mut self, record: &MessageRecord) {
        let newer = self
            .last_seen
            .as_ref()
            .is_none_or(|seen| record.created_on > seen.time);
        if newer {
            self.last_seen = Some(LastSeen {
                time: record.created_on,
                message_id: record.message_id.clone(),
            });
        }
    }
}
