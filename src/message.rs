#![forbid(unsafe_code)]

// Outbound units and the chat/ack wire payloads

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::LoadResult;

const SEQ_PREFIX: &str = "seq:";
const SEQ_DELIMITER: char = '|';

/// Kind of chat message carried by a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Text,
    Join,
    Leave,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [MessageKind::Text, MessageKind::Join, MessageKind::Leave];

    /// Draws a kind from the fixed 90/5/5 TEXT/JOIN/LEAVE distribution.
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_roll(rng.gen_range(0..100))
    }

    /// Maps a roll in `0..100` onto the weighted distribution.
    pub fn from_roll(roll: u32) -> Self {
        match roll {
            0..=89 => MessageKind::Text,
            90..=94 => MessageKind::Join,
            _ => MessageKind::Leave,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
        }
    }
}

/// One synthetic message plus its retry attempt count.
///
/// Units are immutable: a retry is a new unit produced by [`OutboundUnit::next_attempt`]
/// that keeps the sequence id, which is the only handle used to correlate the ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundUnit {
    seq_id: u64,
    user_id: u32,
    username: String,
    text: String,
    room_id: u32,
    kind: MessageKind,
    created_at: DateTime<Utc>,
    attempt: u32,
}

impl OutboundUnit {
    pub fn new(
        seq_id: u64,
        user_id: u32,
        username: impl Into<String>,
        text: impl Into<String>,
        room_id: u32,
        kind: MessageKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq_id,
            user_id,
            username: username.into(),
            text: text.into(),
            room_id,
            kind,
            created_at,
            attempt: 0,
        }
    }

    pub fn seq_id(&self) -> u64 {
        self.seq_id
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn room_id(&self) -> u32 {
        self.room_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns a copy of this unit with the attempt counter incremented.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Builds the wire payload, embedding the sequence id in the message text.
    pub fn to_payload(&self) -> ChatPayload {
        ChatPayload {
            user_id: self.user_id.to_string(),
            username: self.username.clone(),
            message: tag_with_seq(self.seq_id, &self.text),
            timestamp: self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            message_type: self.kind,
        }
    }

    pub fn to_wire_json(&self) -> LoadResult<String> {
        Ok(serde_json::to_string(&self.to_payload())?)
    }
}

/// Client-to-server chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: String,
    pub message_type: MessageKind,
}

/// Status reported by the service in an ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Error,
    Unknown,
}

impl AckStatus {
    fn parse(status: Option<&str>) -> Self {
        match status {
            Some("OK") => AckStatus::Ok,
            Some("ERROR") => AckStatus::Error,
            _ => AckStatus::Unknown,
        }
    }
}

/// Server-to-client ack/response frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub server_timestamp: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl AckFrame {
    pub fn parse(text: &str) -> LoadResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// OK ack echoing the given payload back in `data`, as the chat service does.
    pub fn echo(payload: &ChatPayload) -> LoadResult<Self> {
        Ok(Self {
            status: Some("OK".to_string()),
            server_timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            data: Some(serde_json::to_value(payload)?),
            errors: None,
        })
    }

    /// Sequence id embedded in the echoed `data.message`, if any.
    pub fn seq_id(&self) -> Option<u64> {
        let message = self.data.as_ref()?.get("message")?.as_str()?;
        parse_seq_tag(message)
    }

    pub fn status(&self) -> AckStatus {
        AckStatus::parse(self.status.as_deref())
    }
}

/// Prefixes `text` with the `seq:<id>|` correlation tag.
pub fn tag_with_seq(seq_id: u64, text: &str) -> String {
    format!("{SEQ_PREFIX}{seq_id}{SEQ_DELIMITER}{text}")
}

/// Extracts the id from a message formatted as `seq:<id>|...`.
pub fn parse_seq_tag(message: &str) -> Option<u64> {
    let start = message.find(SEQ_PREFIX)? + SEQ_PREFIX.len();
    let rest = &message[start..];
    let end = rest.find(SEQ_DELIMITER)?;
    rest[..end].trim().parse().ok()
}
