//! The four cached entity kinds and their merge rules.
//!
//! Each entity flattens its wire record and carries the refresh generation
//! it was last confirmed in. Merge compares field by field so the cache can
//! report exactly what changed.

use chrono::{DateTime, Utc};
use serde_json::Value;

use chime_proto::record::{
    CallRecord, ContactRecord, ConversationRecord, NotifyPref, ParseError, RoomRecord,
};

use super::CachedEntity;

macro_rules! merge_field {
    ($self:ident, $newer:ident, $changed:ident, $field:ident, $label:literal) => {
        if $self.$field != $newer.$field {
            $self.$field = $newer.$field;
            $changed.push($label);
        }
    };
}

/// A cached chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Push channel carrying this room's events.
    pub channel: String,
    /// Whether the room is private.
    pub private: bool,
    /// Whether the room shows in the roster.
    pub visible: bool,
    /// When the local user was last mentioned here.
    pub last_mentioned: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_on: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_on: DateTime<Utc>,
    generation: u64,
}

impl CachedEntity for Room {
    const KIND: &'static str = "Room";
    const LIST_PATH: &'static str = "/rooms";
    const ARRAY_KEY: &'static str = "Rooms";
    const ITEM_EVENT: &'static str = "Room";

    fn parse(record: &Value) -> Result<Self, ParseError> {
        let r = RoomRecord::parse(record)?;
        Ok(Self {
            id: r.id,
            name: r.name,
            channel: r.channel,
            private: r.private,
            visible: r.visible,
            last_mentioned: r.last_mentioned,
            created_on: r.created_on,
            updated_on: r.updated_on,
            generation: 0,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, newer: Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_field!(self, newer, changed, name, "name");
        merge_field!(self, newer, changed, channel, "channel");
        merge_field!(self, newer, changed, private, "private");
        merge_field!(self, newer, changed, visible, "visible");
        merge_field!(self, newer, changed, last_mentioned, "last-mentioned");
        merge_field!(self, newer, changed, updated_on, "updated-on");
        changed
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

/// A cached 1:1 or group conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Push channel carrying this conversation's events.
    pub channel: String,
    /// Whether the local user favourited this conversation.
    pub favourite: bool,
    /// Whether the conversation shows in the roster.
    pub visible: bool,
    /// When the local user last sent a message here.
    pub last_sent: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_on: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_on: DateTime<Utc>,
    /// Desktop notification preference.
    pub desktop_notify: NotifyPref,
    /// Mobile notification preference.
    pub mobile_notify: NotifyPref,
    generation: u64,
}

impl CachedEntity for Conversation {
    const KIND: &'static str = "Conversation";
    const LIST_PATH: &'static str = "/conversations";
    const ARRAY_KEY: &'static str = "Conversations";
    const ITEM_EVENT: &'static str = "Conversation";

    fn parse(record: &Value) -> Result<Self, ParseError> {
        let c = ConversationRecord::parse(record)?;
        Ok(Self {
            id: c.id,
            name: c.name,
            channel: c.channel,
            favourite: c.favourite,
            visible: c.visible,
            last_sent: c.last_sent,
            created_on: c.created_on,
            updated_on: c.updated_on,
            desktop_notify: c.desktop_notify,
            mobile_notify: c.mobile_notify,
            generation: 0,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, newer: Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_field!(self, newer, changed, name, "name");
        merge_field!(self, newer, changed, channel, "channel");
        merge_field!(self, newer, changed, favourite, "favourite");
        merge_field!(self, newer, changed, visible, "visible");
        merge_field!(self, newer, changed, last_sent, "last-sent");
        merge_field!(self, newer, changed, updated_on, "updated-on");
        merge_field!(self, newer, changed, desktop_notify, "desktop-notify");
        merge_field!(self, newer, changed, mobile_notify, "mobile-notify");
        changed
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

/// A cached audio/video call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Stable identifier.
    pub id: String,
    /// Display name (meeting subject).
    pub name: String,
    /// Push channel carrying call state events.
    pub channel: String,
    /// Push channel carrying roster events.
    pub roster_channel: String,
    /// Profile id of the host.
    pub host: String,
    /// Whether the call is currently running.
    pub ongoing: bool,
    /// Whether the call is being recorded.
    pub recording: bool,
    generation: u64,
}

impl CachedEntity for Call {
    const KIND: &'static str = "Call";
    const LIST_PATH: &'static str = "/calls";
    const ARRAY_KEY: &'static str = "Calls";
    const ITEM_EVENT: &'static str = "Call";

    fn parse(record: &Value) -> Result<Self, ParseError> {
        let c = CallRecord::parse(record)?;
        Ok(Self {
            id: c.id,
            name: c.name,
            channel: c.channel,
            roster_channel: c.roster_channel,
            host: c.host,
            ongoing: c.ongoing,
            recording: c.recording,
            generation: 0,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&mut self, newer: Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_field!(self, newer, changed, name, "name");
        merge_field!(self, newer, changed, channel, "channel");
        merge_field!(self, newer, changed, roster_channel, "roster-channel");
        merge_field!(self, newer, changed, host, "host");
        merge_field!(self, newer, changed, ongoing, "ongoing");
        merge_field!(self, newer, changed, recording, "recording");
        changed
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

/// A cached contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// The contact's profile id.
    pub profile_id: String,
    /// Email address.
    pub email: String,
    /// Full legal name.
    pub full_name: String,
    /// Preferred display name.
    pub display_name: String,
    /// Push channel carrying presence events.
    pub presence_channel: String,
    generation: u64,
}

impl CachedEntity for Contact {
    const KIND: &'static str = "Contact";
    const LIST_PATH: &'static str = "/contacts";
    const ARRAY_KEY: &'static str = "Contacts";
    const ITEM_EVENT: &'static str = "Contact";

    fn parse(record: &Value) -> Result<Self, ParseError> {
        let c = ContactRecord::parse(record)?;
        Ok(Self {
            profile_id: c.profile_id,
            email: c.email,
            full_name: c.full_name,
            display_name: c.display_name,
            presence_channel: c.presence_channel,
            generation: 0,
        })
    }

    fn id(&self) -> &str {
        &self.profile_id
    }

    fn name(&self) -> &str {
        &self.display_name
    }

    fn merge(&mut self, newer: Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        merge_field!(self, newer, changed, email, "email");
        merge_field!(self, newer, changed, full_name, "full-name");
        merge_field!(self, newer, changed, display_name, "display-name");
        merge_field!(self, newer, changed, presence_channel, "presence-channel");
        changed
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}
