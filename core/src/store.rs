/// Storage adapter interface
///
/// The core talks to its realtime document store exclusively through
/// [`ChatStore`]. The bundled [`SledStore`](crate::sled_store::SledStore)
/// implements it on an embedded sled database; a remote backend would
/// implement the same trait over its own client.
use crate::error::Result;
use crate::types::{
    Message, MessageDraft, MessagePatch, Presence, Session, SessionKey, TypingStatus, UserProfile,
};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// A live view over one collection: the state at subscribe time plus a
/// stream of full snapshots for every subsequent change. Snapshots are
/// absolute states, never deltas, so a lagged receiver can simply skip to
/// the freshest one. Dropping the receiver cancels the subscription.
pub struct Subscription<T> {
    pub current: T,
    pub updates: broadcast::Receiver<T>,
}

pub trait ChatStore: Send + Sync {
    // Users
    fn upsert_user(&self, user: &UserProfile) -> Result<()>;
    fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>>;
    fn list_users(&self) -> Result<Vec<UserProfile>>;
    fn set_presence(&self, user_id: &str, presence: Presence, at: DateTime<Utc>) -> Result<()>;
    fn subscribe_users(&self) -> Result<Subscription<Vec<UserProfile>>>;

    // Sessions
    /// Idempotent: if a session for the unordered pair exists it is
    /// returned unchanged. Safe under concurrent invocation by both
    /// participants; the first writer wins and the second caller observes
    /// the first's record.
    fn get_or_create_session(&self, id_a: &str, id_b: &str) -> Result<Session>;
    fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>>;
    fn subscribe_sessions(&self, user_id: &str) -> Result<Subscription<Vec<Session>>>;

    // Messages
    /// Assigns id and creation timestamp, bumps the session's
    /// last-activity stamp. Durable once `Ok` is returned.
    fn append_message(&self, draft: MessageDraft) -> Result<Message>;
    /// Messages of one session, ascending by creation time.
    fn list_messages(&self, session: &SessionKey) -> Result<Vec<Message>>;
    /// Field-level partial update; see [`MessagePatch`]. Never a
    /// whole-record overwrite.
    fn patch_message(
        &self,
        session: &SessionKey,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<Message>;
    fn subscribe_messages(&self, session: &SessionKey) -> Result<Subscription<Vec<Message>>>;

    // Typing flags
    fn set_typing(
        &self,
        session: &SessionKey,
        user_id: &str,
        is_typing: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;
    fn get_typing(&self, session: &SessionKey, user_id: &str) -> Result<Option<TypingStatus>>;
    fn subscribe_typing(&self, session: &SessionKey) -> Result<Subscription<Vec<TypingStatus>>>;
}
