//! Typed parsing of Chime service records.
//!
//! Every record type validates all of its required fields before anything is
//! constructed: a malformed record yields a [`ParseError`] and nothing else,
//! so callers can treat parsing as atomic and never end up with a partially
//! populated entity.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Errors produced while parsing a service record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The record is not a JSON object.
    #[error("{record} record is not a JSON object")]
    NotAnObject {
        /// Record type being parsed.
        record: &'static str,
    },

    /// A required field is absent.
    #[error("{record} record is missing required field {field}")]
    MissingField {
        /// Record type being parsed.
        record: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },

    /// A field is present but has the wrong type or an unknown value.
    #[error("{record} record has invalid value for field {field}")]
    InvalidField {
        /// Record type being parsed.
        record: &'static str,
        /// Name of the offending field.
        field: &'static str,
    },

    /// A timestamp field could not be parsed as RFC 3339.
    #[error("{record} record has unparseable timestamp in {field}: {value}")]
    BadTimestamp {
        /// Record type being parsed.
        record: &'static str,
        /// Name of the timestamp field.
        field: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}

fn str_field<'a>(
    value: &'a Value,
    record: &'static str,
    field: &'static str,
) -> Result<&'a str, ParseError> {
    match value.get(field) {
        Some(v) => v
            .as_str()
            .ok_or(ParseError::InvalidField { record, field }),
        None => Err(ParseError::MissingField { record, field }),
    }
}

fn opt_str_field<'a>(value: &'a Value, field: &'static str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// The service emits booleans both as JSON booleans and as 0/1 integers,
/// depending on the endpoint.
fn bool_field(value: &Value, record: &'static str, field: &'static str) -> Result<bool, ParseError> {
    match value.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ParseError::InvalidField { record, field }),
        },
        Some(_) => Err(ParseError::InvalidField { record, field }),
        None => Err(ParseError::MissingField { record, field }),
    }
}

fn time_field(
    value: &Value,
    record: &'static str,
    field: &'static str,
) -> Result<DateTime<Utc>, ParseError> {
    let raw = str_field(value, record, field)?;
    parse_timestamp(raw).ok_or_else(|| ParseError::BadTimestamp {
        record,
        field,
        value: raw.to_string(),
    })
}

fn opt_time_field(
    value: &Value,
    record: &'static str,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ParseError> {
    match opt_str_field(value, field) {
        None => Ok(None),
        Some(raw) => parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| ParseError::BadTimestamp {
                record,
                field,
                value: raw.to_string(),
            }),
    }
}

/// Parses an RFC 3339 timestamp as emitted by the service.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Per-device notification preference, as carried on conversation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPref {
    /// Notify on every message.
    Always,
    /// Notify only on direct mentions.
    DirectOnly,
    /// Never notify.
    Never,
}

impl NotifyPref {
    fn parse(value: &Value, record: &'static str, field: &'static str) -> Result<Self, ParseError> {
        match str_field(value, record, field)? {
            "always" => Ok(Self::Always),
            "directOnly" => Ok(Self::DirectOnly),
            "never" => Ok(Self::Never),
            _ => Err(ParseError::InvalidField { record, field }),
        }
    }
}

/// Presence state carried on membership records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The member is currently present in the room.
    Present,
    /// The member is not present.
    NotPresent,
}

/// A chat room as returned by `/rooms` and pushed on the device channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    /// Server-assigned stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Juggernaut channel carrying this room's events.
    pub channel: String,
    /// Whether the room is private.
    pub private: bool,
    /// Whether the room is visible in the roster.
    pub visible: bool,
    /// When the local user was last mentioned in this room, if ever.
    pub last_mentioned: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_on: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_on: DateTime<Utc>,
}

impl RoomRecord {
    const RECORD: &'static str = "Room";

    /// Parses a room record, validating all required fields first.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any required field is missing or malformed.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        let privacy = match str_field(value, Self::RECORD, "Privacy")? {
            "private" => true,
            "public" => false,
            _ => {
                return Err(ParseError::InvalidField {
                    record: Self::RECORD,
                    field: "Privacy",
                });
            }
        };
        Ok(Self {
            id: str_field(value, Self::RECORD, "Id")?.to_string(),
            name: str_field(value, Self::RECORD, "Name")?.to_string(),
            channel: str_field(value, Self::RECORD, "Channel")?.to_string(),
            private: privacy,
            visible: bool_field(value, Self::RECORD, "Visibility")?,
            last_mentioned: opt_time_field(value, Self::RECORD, "LastMentioned")?,
            created_on: time_field(value, Self::RECORD, "CreatedOn")?,
            updated_on: time_field(value, Self::RECORD, "UpdatedOn")?,
        })
    }
}

/// A 1:1 or group conversation as returned by `/conversations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    /// Server-assigned stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Juggernaut channel carrying this conversation's events.
    pub channel: String,
    /// Whether the local user has favourited this conversation.
    pub favourite: bool,
    /// Whether the conversation is visible in the roster.
    pub visible: bool,
    /// When the local user last sent a message here, if ever.
    pub last_sent: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_on: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_on: DateTime<Utc>,
    /// Desktop notification preference.
    pub desktop_notify: NotifyPref,
    /// Mobile notification preference.
    pub mobile_notify: NotifyPref,
}

impl ConversationRecord {
    const RECORD: &'static str = "Conversation";

    /// Parses a conversation record, including the nested notification
    /// preference block.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any required field is missing or malformed.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        let prefs = value
            .get("Preferences")
            .and_then(|p| p.get("NotificationPreferences"))
            .ok_or(ParseError::MissingField {
                record: Self::RECORD,
                field: "Preferences.NotificationPreferences",
            })?;
        Ok(Self {
            id: str_field(value, Self::RECORD, "ConversationId")?.to_string(),
            name: str_field(value, Self::RECORD, "Name")?.to_string(),
            channel: str_field(value, Self::RECORD, "Channel")?.to_string(),
            favourite: bool_field(value, Self::RECORD, "Favorite")?,
            visible: bool_field(value, Self::RECORD, "Visibility")?,
            last_sent: opt_time_field(value, Self::RECORD, "LastSent")?,
            created_on: time_field(value, Self::RECORD, "CreatedOn")?,
            updated_on: time_field(value, Self::RECORD, "UpdatedOn")?,
            desktop_notify: NotifyPref::parse(
                prefs,
                Self::RECORD,
                "DesktopNotificationPreferences",
            )?,
            mobile_notify: NotifyPref::parse(prefs, Self::RECORD, "MobileNotificationPreferences")?,
        })
    }
}

/// An audio/video call as returned by `/calls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Server-assigned stable identifier.
    pub id: String,
    /// Display name (meeting subject).
    pub name: String,
    /// Juggernaut channel carrying call state events.
    pub channel: String,
    /// Juggernaut channel carrying roster events.
    pub roster_channel: String,
    /// Profile id of the call host.
    pub host: String,
    /// Whether the call is currently running.
    pub ongoing: bool,
    /// Whether the call is being recorded.
    pub recording: bool,
}

impl CallRecord {
    const RECORD: &'static str = "Call";

    /// Parses a call record.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any required field is missing or malformed.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        Ok(Self {
            id: str_field(value, Self::RECORD, "Id")?.to_string(),
            name: str_field(value, Self::RECORD, "Name")?.to_string(),
            channel: str_field(value, Self::RECORD, "Channel")?.to_string(),
            roster_channel: str_field(value, Self::RECORD, "RosterChannel")?.to_string(),
            host: str_field(value, Self::RECORD, "Host")?.to_string(),
            ongoing: bool_field(value, Self::RECORD, "Ongoing")?,
            recording: bool_field(value, Self::RECORD, "IsRecording")?,
        })
    }
}

/// A contact (buddy) as returned by `/contacts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    /// The contact's profile id.
    pub profile_id: String,
    /// Email address.
    pub email: String,
    /// Full legal name.
    pub full_name: String,
    /// Preferred display name.
    pub display_name: String,
    /// Juggernaut channel carrying this contact's presence events.
    pub presence_channel: String,
}

impl ContactRecord {
    const RECORD: &'static str = "Contact";

    /// Parses a contact record.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any required field is missing or malformed.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        Ok(Self {
            profile_id: str_field(value, Self::RECORD, "ProfileId")?.to_string(),
            email: str_field(value, Self::RECORD, "Email")?.to_string(),
            full_name: str_field(value, Self::RECORD, "FullName")?.to_string(),
            display_name: str_field(value, Self::RECORD, "DisplayName")?.to_string(),
            presence_channel: str_field(value, Self::RECORD, "PresenceChannel")?.to_string(),
        })
    }
}

/// A chat message, identical in shape on the backfill and push paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server-assigned message identifier; the identity used for dedup.
    pub message_id: String,
    /// Message body in wire form (mention tokens unexpanded).
    pub content: String,
    /// Profile id of the sender.
    pub sender: String,
    /// Server-assigned creation timestamp.
    pub created_on: DateTime<Utc>,
}

impl MessageRecord {
    const RECORD: &'static str = "Message";

    /// Parses a message record.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if any required field is missing or malformed.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        Ok(Self {
            message_id: str_field(value, Self::RECORD, "MessageId")?.to_string(),
            content: str_field(value, Self::RECORD, "Content")?.to_string(),
            sender: str_field(value, Self::RECORD, "Sender")?.to_string(),
            created_on: time_field(value, Self::RECORD, "CreatedOn")?,
        })
    }
}

/// A room membership entry from `/rooms/{id}/memberships` or a
/// `RoomMembership` push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    /// The member's profile id.
    pub profile_id: String,
    /// The member's email address.
    pub email: String,
    /// The member's display name.
    pub display_name: String,
    /// Current presence in the room.
    pub presence: Presence,
    /// Whether the member administers the room.
    pub admin: bool,
}

impl MembershipRecord {
    const RECORD: &'static str = "Membership";

    /// Parses a membership record. The member identity lives in a nested
    /// `Member` object; presence and role sit alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the `Member` object or any required field is
    /// missing, or if `Presence` has an unknown value.
    pub fn parse(value: &Value) -> Result<Self, ParseError> {
        if !value.is_object() {
            return Err(ParseError::NotAnObject {
                record: Self::RECORD,
            });
        }
        let member = value.get("Member").ok_or(ParseError::MissingField {
            record: Self::RECORD,
            field: "Member",
        })?;
        let presence = match str_field(value, Self::RECORD, "Presence")? {
            "present" => Presence::Present,
            "notPresent" => Presence::NotPresent,
            _ => {
                return Err(ParseError::InvalidField {
                    record: Self::RECORD,
                    field: "Presence",
                });
            }
        };
        let admin = opt_str_field(value, "Role") == Some("administrator");
        Ok(Self {
            profile_id: str_field(member, Self::RECORD, "ProfileId")?.to_string(),
            email: str_field(member, Self::RECORD, "Email")?.to_string(),
            display_name: str_field(member, Self::RECORD, "DisplayName")?.to_string(),
            presence,
            admin,
        })
    }
}
