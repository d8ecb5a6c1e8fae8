/// Shared data model: users, sessions, messages, typing flags
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Separator between the two participant ids inside a session key.
/// Participant ids must not contain this character.
const SESSION_KEY_SEPARATOR: char = ':';

// ─── Users ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
}

/// A registered user as stored in the user directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub presence: Presence,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.firstname, self.lastname)
            .trim()
            .to_string()
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

/// Deterministic identifier of a two-party chat session.
///
/// Derived from the unordered pair of participant ids, so both sides
/// compute the same key no matter who initiates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Key for an unordered id pair: `for_pair(a, b) == for_pair(b, a)`.
    pub fn for_pair(id_a: &str, id_b: &str) -> Self {
        let (lo, hi) = if id_a <= id_b { (id_a, id_b) } else { (id_b, id_a) };
        Self(format!("{}{}{}", lo, SESSION_KEY_SEPARATOR, hi))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A two-party chat session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    /// Participant ids, sorted.
    pub participants: [String; 2],
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id_a: &str, id_b: &str, now: DateTime<Utc>) -> Self {
        let (lo, hi) = if id_a <= id_b { (id_a, id_b) } else { (id_b, id_a) };
        Self {
            key: SessionKey::for_pair(id_a, id_b),
            participants: [lo.to_string(), hi.to_string()],
            created_at: now,
            last_activity: now,
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The other participant, or `None` if `user_id` is not a member.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if !self.has_participant(user_id) {
            return None;
        }
        self.participants
            .iter()
            .find(|p| p.as_str() != user_id)
            .map(|p| p.as_str())
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Delivery status of a message. Advances strictly forward; a patch that
/// would regress it is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub fn can_advance_to(self, to: DeliveryStatus) -> bool {
        to.rank() > self.rank()
    }
}

/// Self-contained attachment payload: a `data:` URI plus its media type.
/// The core never interprets the encoded bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub data: String,
    pub media_type: String,
}

impl Attachment {
    pub fn from_bytes(bytes: &[u8], media_type: &str) -> Self {
        let encoded = general_purpose::STANDARD.encode(bytes);
        Self {
            data: format!("data:{};base64,{}", media_type, encoded),
            media_type: media_type.to_string(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session: SessionKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub deleted: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_outgoing(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Body as it may be shown to any reader. The deleted flag takes
    /// precedence over whatever the record still carries.
    pub fn rendered_body<'a>(&'a self, placeholder: &'a str) -> Option<&'a str> {
        if self.deleted {
            Some(placeholder)
        } else {
            self.body.as_deref()
        }
    }

    /// Attachment as it may be shown to any reader.
    pub fn rendered_attachment(&self) -> Option<&Attachment> {
        if self.deleted {
            None
        } else {
            self.attachment.as_ref()
        }
    }
}

/// Draft of an outgoing message. The store assigns id and timestamp on
/// append.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub session: SessionKey,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
}

/// Field-level partial update of a message record.
///
/// Absent fields leave the record untouched, so concurrent status and
/// deletion updates both take effect. Status regressions are ignored,
/// which makes reissuing a patch after a transient failure safe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePatch {
    pub status: Option<DeliveryStatus>,
    pub read_at: Option<DateTime<Utc>>,
    /// Set to soft-delete: flags the record and replaces the body with the
    /// given placeholder text. The attachment is dropped at the same time.
    pub delete_with_placeholder: Option<String>,
}

impl MessagePatch {
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(status) = self.status {
            if message.status.can_advance_to(status) {
                message.status = status;
            }
        }
        if let Some(read_at) = self.read_at {
            if message.read_at.is_none() {
                message.read_at = Some(read_at);
            }
        }
        if let Some(placeholder) = &self.delete_with_placeholder {
            message.deleted = true;
            message.body = Some(placeholder.clone());
            message.attachment = None;
        }
    }
}

// ─── Typing flags ────────────────────────────────────────────────────────────

/// Typing flag for one participant within one session. Ephemeral;
/// overwritten on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStatus {
    pub session: SessionKey,
    pub user_id: String,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

impl TypingStatus {
    /// Whether a reader should treat the flag as active. A flag not
    /// refreshed within `stale_after` counts as cleared, so a writer that
    /// crashed before cleanup cannot leave an indicator stuck on.
    pub fn is_active(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.is_typing {
            return false;
        }
        match (now - self.updated_at).to_std() {
            Ok(age) => age <= stale_after,
            // updated_at ahead of the reader's clock: fresh
            Err(_) => true,
        }
    }
}
