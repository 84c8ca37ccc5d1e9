use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationEvent, ConversationId, DeviceId, Message, Sequence, Session},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub device_id: DeviceId,
    pub platform: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub token: String,
    pub session: Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionValidity {
    Valid,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub validity: SessionValidity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPageQuery {
    pub page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Sequence>,
}

/// One page of pulled history. `earliest_event_id` is the lowest sequence
/// covered by the page and is the cursor for the next older page; zero means
/// the page carries no marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub earliest_event_id: Sequence,
    #[serde(default)]
    pub orphaned_events: Vec<ConversationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { conversation_id: ConversationId },
    Unsubscribe { conversation_id: ConversationId },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerPush {
    ConversationEvent { event: ConversationEvent },
    SessionExpired,
    Pong,
    Error(ApiError),
}
