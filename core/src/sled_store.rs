/// Bundled storage backend: chat documents in a sled database
///
/// Tree layout (all values JSON):
/// - `users`:         user_id -> UserProfile
/// - `sessions`:      session key -> Session
/// - `messages`:      {session}\x00{created_at_micros:020}\x00{id} -> Message
/// - `message_index`: message id -> messages key
/// - `typing`:        {session}\x00{user_id} -> TypingStatus
use crate::error::{ChatError, Result};
use crate::store::{ChatStore, Subscription};
use crate::types::{
    Message, MessageDraft, MessagePatch, Presence, Session, SessionKey, TypingStatus, UserProfile,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Key separator inside composite tree keys. Never appears in session keys
/// or user ids.
const KEY_SEPARATOR: char = '\x00';

pub struct SledStore {
    #[allow(dead_code)]
    db: sled::Db,
    users: sled::Tree,
    sessions: sled::Tree,
    messages: sled::Tree,
    message_index: sled::Tree,
    typing: sled::Tree,
    watchers: Mutex<Watchers>,
}

/// Lazily created snapshot fan-out channels. Holding this lock while a
/// snapshot is computed and sent keeps snapshot delivery ordered.
struct Watchers {
    users: Option<broadcast::Sender<Vec<UserProfile>>>,
    sessions: HashMap<String, broadcast::Sender<Vec<Session>>>,
    messages: HashMap<SessionKey, broadcast::Sender<Vec<Message>>>,
    typing: HashMap<SessionKey, broadcast::Sender<Vec<TypingStatus>>>,
}

impl SledStore {
    /// Open or create the chat database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ChatError::Storage(format!("create data dir: {}", e)))?;
        let db = sled::open(data_dir.join("chat.db"))
            .map_err(|e| ChatError::Storage(format!("open chat DB: {}", e)))?;
        Self::from_db(db)
    }

    /// Open a throwaway database (backing files removed on drop).
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::Storage(format!("open temporary chat DB: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| ChatError::Storage(format!("open tree {}: {}", name, e)))
        };
        Ok(Self {
            users: open_tree("users")?,
            sessions: open_tree("sessions")?,
            messages: open_tree("messages")?,
            message_index: open_tree("message_index")?,
            typing: open_tree("typing")?,
            watchers: Mutex::new(Watchers {
                users: None,
                sessions: HashMap::new(),
                messages: HashMap::new(),
                typing: HashMap::new(),
            }),
            db,
        })
    }

    fn lock_watchers(&self) -> std::sync::MutexGuard<'_, Watchers> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn message_key(session: &SessionKey, created_at: DateTime<Utc>, id: &str) -> String {
        format!(
            "{}{}{:020}{}{}",
            session.as_str(),
            KEY_SEPARATOR,
            created_at.timestamp_micros(),
            KEY_SEPARATOR,
            id
        )
    }

    fn typing_key(session: &SessionKey, user_id: &str) -> String {
        format!("{}{}{}", session.as_str(), KEY_SEPARATOR, user_id)
    }

    fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    // ─── Snapshot fan-out ────────────────────────────────────────────────────

    fn notify_users(&self) {
        let watchers = self.lock_watchers();
        if let Some(tx) = &watchers.users {
            match self.list_users() {
                Ok(snapshot) => {
                    let _ = tx.send(snapshot);
                }
                Err(e) => warn!("Failed to snapshot users for notification: {}", e),
            }
        }
    }

    fn notify_sessions(&self, participants: &[String; 2]) {
        let watchers = self.lock_watchers();
        for user_id in participants {
            if let Some(tx) = watchers.sessions.get(user_id) {
                match self.list_sessions(user_id) {
                    Ok(snapshot) => {
                        let _ = tx.send(snapshot);
                    }
                    Err(e) => warn!("Failed to snapshot sessions for {}: {}", user_id, e),
                }
            }
        }
    }

    fn notify_messages(&self, session: &SessionKey) {
        let watchers = self.lock_watchers();
        if let Some(tx) = watchers.messages.get(session) {
            match self.list_messages(session) {
                Ok(snapshot) => {
                    let _ = tx.send(snapshot);
                }
                Err(e) => warn!("Failed to snapshot messages for {}: {}", session, e),
            }
        }
    }

    fn notify_typing(&self, session: &SessionKey) {
        let watchers = self.lock_watchers();
        if let Some(tx) = watchers.typing.get(session) {
            match self.list_typing(session) {
                Ok(snapshot) => {
                    let _ = tx.send(snapshot);
                }
                Err(e) => warn!("Failed to snapshot typing flags for {}: {}", session, e),
            }
        }
    }

    fn list_typing(&self, session: &SessionKey) -> Result<Vec<TypingStatus>> {
        let prefix = format!("{}{}", session.as_str(), KEY_SEPARATOR);
        let mut out = Vec::new();
        for entry in self.typing.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = entry.map_err(|e| ChatError::Storage(format!("scan typing: {}", e)))?;
            out.push(Self::decode(&raw)?);
        }
        Ok(out)
    }

    fn get_session(&self, key: &SessionKey) -> Result<Option<Session>> {
        match self
            .sessions
            .get(key.as_str().as_bytes())
            .map_err(|e| ChatError::Storage(format!("get session: {}", e)))?
        {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Bump the session's last-activity stamp (read-modify-write; both
    /// participants' session lists are re-broadcast).
    fn touch_session(&self, key: &SessionKey, at: DateTime<Utc>) -> Result<()> {
        let mut session = self
            .get_session(key)?
            .ok_or_else(|| ChatError::NotFound(format!("session {}", key)))?;
        session.last_activity = at;
        self.sessions
            .insert(key.as_str().as_bytes(), Self::encode(&session)?)
            .map_err(|e| ChatError::Storage(format!("touch session: {}", e)))?;
        self.notify_sessions(&session.participants);
        Ok(())
    }
}

impl ChatStore for SledStore {
    fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.users
            .insert(user.user_id.as_bytes(), Self::encode(user)?)
            .map_err(|e| ChatError::Storage(format!("upsert user: {}", e)))?;
        self.notify_users();
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        match self
            .users
            .get(user_id.as_bytes())
            .map_err(|e| ChatError::Storage(format!("get user: {}", e)))?
        {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn list_users(&self) -> Result<Vec<UserProfile>> {
        let mut out = Vec::new();
        for entry in self.users.iter() {
            let (_, raw) = entry.map_err(|e| ChatError::Storage(format!("scan users: {}", e)))?;
            out.push(Self::decode(&raw)?);
        }
        Ok(out)
    }

    fn set_presence(&self, user_id: &str, presence: Presence, at: DateTime<Utc>) -> Result<()> {
        let mut user = self
            .get_user(user_id)?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))?;
        user.presence = presence;
        user.last_seen = at;
        self.users
            .insert(user_id.as_bytes(), Self::encode(&user)?)
            .map_err(|e| ChatError::Storage(format!("set presence: {}", e)))?;
        self.notify_users();
        Ok(())
    }

    fn subscribe_users(&self) -> Result<Subscription<Vec<UserProfile>>> {
        let mut watchers = self.lock_watchers();
        let tx = watchers
            .users
            .get_or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        let updates = tx.subscribe();
        let current = self.list_users()?;
        Ok(Subscription { current, updates })
    }

    fn get_or_create_session(&self, id_a: &str, id_b: &str) -> Result<Session> {
        if id_a == id_b {
            return Err(ChatError::InvalidInput(
                "a session needs two distinct participants".to_string(),
            ));
        }
        let key = SessionKey::for_pair(id_a, id_b);
        if let Some(existing) = self.get_session(&key)? {
            return Ok(existing);
        }

        let session = Session::new(id_a, id_b, Utc::now());
        let encoded = Self::encode(&session)?;
        match self
            .sessions
            .compare_and_swap(
                key.as_str().as_bytes(),
                None as Option<&[u8]>,
                Some(encoded),
            )
            .map_err(|e| ChatError::Storage(format!("create session: {}", e)))?
        {
            Ok(()) => {
                self.notify_sessions(&session.participants);
                Ok(session)
            }
            // Lost the race: the other participant created it first
            Err(cas) => match cas.current {
                Some(raw) => Self::decode(&raw),
                None => Err(ChatError::Storage(format!(
                    "session {} vanished during creation",
                    key
                ))),
            },
        }
    }

    fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let (_, raw) =
                entry.map_err(|e| ChatError::Storage(format!("scan sessions: {}", e)))?;
            let session: Session = Self::decode(&raw)?;
            if session.has_participant(user_id) {
                out.push(session);
            }
        }
        Ok(out)
    }

    fn subscribe_sessions(&self, user_id: &str) -> Result<Subscription<Vec<Session>>> {
        let mut watchers = self.lock_watchers();
        let tx = watchers
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        let updates = tx.subscribe();
        let current = self.list_sessions(user_id)?;
        Ok(Subscription { current, updates })
    }

    fn append_message(&self, draft: MessageDraft) -> Result<Message> {
        if draft.sender_id == draft.receiver_id {
            return Err(ChatError::InvalidInput(
                "sender and receiver must differ".to_string(),
            ));
        }
        let session = self
            .get_session(&draft.session)?
            .ok_or_else(|| ChatError::NotFound(format!("session {}", draft.session)))?;
        if !session.has_participant(&draft.sender_id) || !session.has_participant(&draft.receiver_id)
        {
            return Err(ChatError::InvalidInput(format!(
                "sender and receiver must both belong to session {}",
                session.key
            )));
        }

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session: draft.session,
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            body: draft.body,
            attachment: draft.attachment,
            created_at: now,
            status: crate::types::DeliveryStatus::Sent,
            deleted: false,
            read_at: None,
        };

        let key = Self::message_key(&message.session, message.created_at, &message.id);
        self.messages
            .insert(key.as_bytes(), Self::encode(&message)?)
            .map_err(|e| ChatError::Storage(format!("append message: {}", e)))?;
        self.message_index
            .insert(message.id.as_bytes(), key.as_bytes())
            .map_err(|e| ChatError::Storage(format!("index message: {}", e)))?;

        self.touch_session(&message.session, now)?;
        self.notify_messages(&message.session);
        Ok(message)
    }

    fn list_messages(&self, session: &SessionKey) -> Result<Vec<Message>> {
        let prefix = format!("{}{}", session.as_str(), KEY_SEPARATOR);
        let mut out = Vec::new();
        // Keys embed the zero-padded creation timestamp, so the scan is
        // already in ascending creation order.
        for entry in self.messages.scan_prefix(prefix.as_bytes()) {
            let (_, raw) =
                entry.map_err(|e| ChatError::Storage(format!("scan messages: {}", e)))?;
            out.push(Self::decode(&raw)?);
        }
        Ok(out)
    }

    fn patch_message(
        &self,
        session: &SessionKey,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<Message> {
        let key = self
            .message_index
            .get(message_id.as_bytes())
            .map_err(|e| ChatError::Storage(format!("lookup message: {}", e)))?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

        // CAS loop: a concurrent patch (status advance racing a soft
        // delete) restarts the merge on the fresh record, so both field
        // updates land
        loop {
            let raw = self
                .messages
                .get(&key)
                .map_err(|e| ChatError::Storage(format!("get message: {}", e)))?
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;

            let mut message: Message = Self::decode(&raw)?;
            if &message.session != session {
                return Err(ChatError::NotFound(format!(
                    "message {} in session {}",
                    message_id, session
                )));
            }

            patch.apply_to(&mut message);
            let swapped = self
                .messages
                .compare_and_swap(&key, Some(&raw), Some(Self::encode(&message)?))
                .map_err(|e| ChatError::Storage(format!("patch message: {}", e)))?;
            if swapped.is_ok() {
                self.notify_messages(session);
                return Ok(message);
            }
        }
    }

    fn subscribe_messages(&self, session: &SessionKey) -> Result<Subscription<Vec<Message>>> {
        let mut watchers = self.lock_watchers();
        let tx = watchers
            .messages
            .entry(session.clone())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        let updates = tx.subscribe();
        let current = self.list_messages(session)?;
        Ok(Subscription { current, updates })
    }

    fn set_typing(
        &self,
        session: &SessionKey,
        user_id: &str,
        is_typing: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let status = TypingStatus {
            session: session.clone(),
            user_id: user_id.to_string(),
            is_typing,
            updated_at: at,
        };
        self.typing
            .insert(
                Self::typing_key(session, user_id).as_bytes(),
                Self::encode(&status)?,
            )
            .map_err(|e| ChatError::Storage(format!("set typing: {}", e)))?;
        self.notify_typing(session);
        Ok(())
    }

    fn get_typing(&self, session: &SessionKey, user_id: &str) -> Result<Option<TypingStatus>> {
        match self
            .typing
            .get(Self::typing_key(session, user_id).as_bytes())
            .map_err(|e| ChatError::Storage(format!("get typing: {}", e)))?
        {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn subscribe_typing(&self, session: &SessionKey) -> Result<Subscription<Vec<TypingStatus>>> {
        let mut watchers = self.lock_watchers();
        let tx = watchers
            .typing
            .entry(session.clone())
            .or_insert_with(|| broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY).0);
        let updates = tx.subscribe();
        let current = self.list_typing(session)?;
        Ok(Subscription { current, updates })
    }
}
