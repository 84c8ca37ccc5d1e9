use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ProfileId);
id_newtype!(DeviceId);
id_newtype!(SessionId);
id_newtype!(ConversationId);
id_newtype!(EventId);
id_newtype!(MessageId);
id_newtype!(ParticipantId);
id_newtype!(FileId);

impl DeviceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Server-assigned, per-conversation ordering key (`conversationEventId`).
pub type Sequence = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub profile_id: ProfileId,
    pub device_id: DeviceId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.active || self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Attachment {
        file_id: FileId,
        filename: String,
        size_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    MessageCreated {
        message_id: MessageId,
        sender_id: ParticipantId,
        parts: Vec<ContentPart>,
        sent_at: DateTime<Utc>,
    },
    MessageEdited {
        message_id: MessageId,
        parts: Vec<ContentPart>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    StatusChanged {
        message_id: MessageId,
        participant_id: ParticipantId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    },
    /// A kind this client does not understand, whatever its payload. It still
    /// occupies its sequence number and is applied as a no-op.
    Unrecognized,
}

const KNOWN_EVENT_KINDS: &[&str] = &[
    "message_created",
    "message_edited",
    "message_deleted",
    "status_changed",
];

#[derive(Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum KnownEventKind {
    MessageCreated {
        message_id: MessageId,
        sender_id: ParticipantId,
        parts: Vec<ContentPart>,
        sent_at: DateTime<Utc>,
    },
    MessageEdited {
        message_id: MessageId,
        parts: Vec<ContentPart>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    StatusChanged {
        message_id: MessageId,
        participant_id: ParticipantId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireEventKind {
    Known(KnownEventKind),
    Other {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl From<KnownEventKind> for EventKind {
    fn from(value: KnownEventKind) -> Self {
        match value {
            KnownEventKind::MessageCreated {
                message_id,
                sender_id,
                parts,
                sent_at,
            } => Self::MessageCreated {
                message_id,
                sender_id,
                parts,
                sent_at,
            },
            KnownEventKind::MessageEdited { message_id, parts } => {
                Self::MessageEdited { message_id, parts }
            }
            KnownEventKind::MessageDeleted { message_id } => Self::MessageDeleted { message_id },
            KnownEventKind::StatusChanged {
                message_id,
                participant_id,
                status,
                at,
            } => Self::StatusChanged {
                message_id,
                participant_id,
                status,
                at,
            },
        }
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match WireEventKind::deserialize(deserializer)? {
            WireEventKind::Known(known) => Ok(known.into()),
            // A known kind only lands here when its payload is malformed.
            WireEventKind::Other { kind } if KNOWN_EVENT_KINDS.contains(&kind.as_str()) => Err(
                de::Error::custom(format!("malformed payload for event kind '{kind}'")),
            ),
            WireEventKind::Other { .. } => Ok(Self::Unrecognized),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub conversation_id: ConversationId,
    pub event_id: EventId,
    pub sequence: Sequence,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    /// Sequence number of the creation event; the message's position in the view.
    pub sequence: Sequence,
    pub parts: Vec<ContentPart>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub statuses: BTreeMap<ParticipantId, Vec<StatusEntry>>,
}

impl Message {
    /// Records a status for a participant. A status already present keeps its
    /// first timestamp so that replays leave the map unchanged.
    pub fn record_status(
        &mut self,
        participant_id: ParticipantId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> bool {
        let entries = self.statuses.entry(participant_id).or_default();
        if entries.iter().any(|entry| entry.status == status) {
            return false;
        }
        entries.push(StatusEntry { status, at });
        entries.sort_by_key(|entry| entry.status);
        true
    }

    pub fn status_of(
        &self,
        participant_id: &ParticipantId,
        status: DeliveryStatus,
    ) -> Option<DateTime<Utc>> {
        self.statuses
            .get(participant_id)?
            .iter()
            .find(|entry| entry.status == status)
            .map(|entry| entry.at)
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
