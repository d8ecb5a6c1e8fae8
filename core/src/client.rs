/// Session context and per-conversation lifecycle
///
/// A `ChatClient` is built from a freshly authenticated identity; nothing
/// here reads ambient global state. One conversation is active at a time,
/// and switching conversations tears the previous one's subscriptions
/// down before the new ones are established.
use crate::auth::UserIdentity;
use crate::config::Config;
use crate::delivery;
use crate::error::{ChatError, Result};
use crate::presence::PresenceTracker;
use crate::roster::{peer_flag_active, RosterView};
use crate::store::{ChatStore, Subscription};
use crate::types::{Attachment, Message, MessageDraft, Session, SessionKey, TypingStatus, UserProfile};
use crate::typing::TypingController;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events emitted to the embedding UI from an open conversation.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Full ordered snapshot of the conversation.
    MessagesUpdated(Vec<Message>),
    /// The peer's typing indicator changed.
    PeerTyping(bool),
}

/// Per-signin context. Construct after authentication; call
/// [`ChatClient::sign_out`] on teardown.
pub struct ChatClient {
    store: Arc<dyn ChatStore>,
    config: Config,
    identity: UserIdentity,
    presence: PresenceTracker,
    active: Option<SessionHandle>,
}

impl ChatClient {
    /// Build the context for an authenticated user and mark them online.
    pub fn new(store: Arc<dyn ChatStore>, config: Config, identity: UserIdentity) -> Self {
        let presence = PresenceTracker::new(store.clone());
        presence.online(&identity.user_id);
        info!("Chat client ready for {}", identity.user_id);
        Self {
            store,
            config,
            identity,
            presence,
            active: None,
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Live user directory (everyone registered, with presence), for the
    /// roster's search view and contact display.
    pub fn user_directory(&self) -> Result<Subscription<Vec<UserProfile>>> {
        self.presence.subscribe_users()
    }

    /// Live roster for this user. The caller owns the returned view and
    /// its watcher lifecycle.
    pub fn roster(&self) -> Result<RosterView> {
        RosterView::open(
            self.store.clone(),
            self.config.clone(),
            self.identity.user_id.clone(),
        )
    }

    /// Open (or switch to) the conversation with `peer_id`. The previous
    /// conversation, if any, is closed first so its subscriptions cannot
    /// bleed into the new one.
    pub fn open_session(&mut self, peer_id: &str) -> Result<&SessionHandle> {
        if let Some(previous) = self.active.take() {
            debug!("Closing conversation {} before switching", previous.session().key);
            previous.close();
        }
        let session = self
            .store
            .get_or_create_session(&self.identity.user_id, peer_id)?;
        let handle = SessionHandle::open(
            self.store.clone(),
            self.config.clone(),
            self.identity.user_id.clone(),
            session,
        )?;
        Ok(&*self.active.insert(handle))
    }

    pub fn active_session(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }

    /// Close the active conversation, if any.
    pub fn close_session(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.close();
        }
    }

    /// Tear the context down: close the open conversation and go offline.
    pub fn sign_out(mut self) {
        self.close_session();
        self.presence.offline(&self.identity.user_id);
        info!("Chat client torn down for {}", self.identity.user_id);
    }
}

/// One open conversation: live message/typing subscriptions plus the
/// operations the conversation view needs.
pub struct SessionHandle {
    session: Session,
    self_id: String,
    peer_id: String,
    store: Arc<dyn ChatStore>,
    config: Config,
    typing: TypingController,
    messages: Arc<RwLock<Vec<Message>>>,
    events: broadcast::Sender<SessionEvent>,
    pump: JoinHandle<()>,
    typing_watch: JoinHandle<()>,
}

impl SessionHandle {
    fn open(
        store: Arc<dyn ChatStore>,
        config: Config,
        self_id: String,
        session: Session,
    ) -> Result<Self> {
        let peer_id = session
            .peer_of(&self_id)
            .ok_or_else(|| {
                ChatError::InvalidInput(format!(
                    "{} is not a participant of session {}",
                    self_id, session.key
                ))
            })?
            .to_string();

        let (events, _) = broadcast::channel(config.channel_capacity);
        let messages = Arc::new(RwLock::new(Vec::new()));

        let msg_sub = store.subscribe_messages(&session.key)?;
        let typ_sub = store.subscribe_typing(&session.key)?;

        let pump = tokio::spawn(run_message_pump(
            store.clone(),
            session.key.clone(),
            self_id.clone(),
            messages.clone(),
            events.clone(),
            msg_sub.current,
            msg_sub.updates,
        ));
        let typing_watch = tokio::spawn(run_typing_watch(
            config.clone(),
            peer_id.clone(),
            events.clone(),
            typ_sub.current,
            typ_sub.updates,
        ));

        let typing = TypingController::new(
            store.clone(),
            session.key.clone(),
            self_id.clone(),
            config.typing_debounce,
        );

        Ok(Self {
            session,
            self_id,
            peer_id,
            store,
            config,
            typing,
            messages,
            events,
            pump,
            typing_watch,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current conversation snapshot, ascending by creation time.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a message. Drafts with neither text nor attachment are
    /// rejected locally, before any store call. Sending also clears our
    /// typing flag.
    pub fn send(&self, body: Option<String>, attachment: Option<Attachment>) -> Result<Message> {
        let body = body
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        if body.is_none() && attachment.is_none() {
            return Err(ChatError::InvalidInput(
                "a message needs text or an attachment".to_string(),
            ));
        }

        let message = self.store.append_message(MessageDraft {
            session: self.session.key.clone(),
            sender_id: self.self_id.clone(),
            receiver_id: self.peer_id.clone(),
            body,
            attachment,
        })?;

        if let Err(e) = self.typing.clear() {
            warn!("Failed to clear typing flag after send: {}", e);
        }
        Ok(message)
    }

    /// Mark every incoming message in the current snapshot as read. Call
    /// once the conversation view has actually rendered. Individual patch
    /// failures are logged; the next call retries them.
    pub fn mark_read(&self) {
        let snapshot = self.messages();
        for (id, patch) in delivery::mark_read(&snapshot, &self.self_id, Utc::now()) {
            if let Err(e) = self.store.patch_message(&self.session.key, &id, &patch) {
                warn!("Failed to mark {} read: {}", id, e);
            }
        }
    }

    /// Soft-delete one of our own messages. The record keeps its delivery
    /// status; its body becomes the configured placeholder.
    pub fn delete_message(&self, message_id: &str) -> Result<Message> {
        let snapshot = self.messages();
        let message = snapshot
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        let patch = delivery::soft_delete(message, &self.self_id, &self.config.deleted_placeholder)?;
        self.store.patch_message(&self.session.key, message_id, &patch)
    }

    /// Forward one local input event into the typing debouncer.
    pub fn typing_input(&self) -> Result<()> {
        self.typing.on_input()
    }

    /// Cancel the subscriptions and clear our typing flag. Also runs on
    /// drop (without the flag write).
    pub fn close(&self) {
        self.pump.abort();
        self.typing_watch.abort();
        if let Err(e) = self.typing.clear() {
            warn!("Failed to clear typing flag on close: {}", e);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.pump.abort();
        self.typing_watch.abort();
    }
}

async fn run_message_pump(
    store: Arc<dyn ChatStore>,
    session: SessionKey,
    self_id: String,
    state: Arc<RwLock<Vec<Message>>>,
    events: broadcast::Sender<SessionEvent>,
    initial: Vec<Message>,
    mut rx: broadcast::Receiver<Vec<Message>>,
) {
    ingest(&store, &session, &self_id, &state, &events, initial);
    loop {
        match rx.recv().await {
            Ok(snapshot) => ingest(&store, &session, &self_id, &state, &events, snapshot),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Message stream for {} lagged {} snapshots", session, n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Apply one snapshot: acknowledge delivery of incoming `sent` messages,
/// publish the snapshot to the view. Acknowledgement failures are logged
/// only; the messages stay `sent`, so the next snapshot retries them.
fn ingest(
    store: &Arc<dyn ChatStore>,
    session: &SessionKey,
    self_id: &str,
    state: &Arc<RwLock<Vec<Message>>>,
    events: &broadcast::Sender<SessionEvent>,
    snapshot: Vec<Message>,
) {
    for (id, patch) in delivery::acknowledge(&snapshot, self_id) {
        if let Err(e) = store.patch_message(session, &id, &patch) {
            warn!("Failed to acknowledge delivery of {}: {}", id, e);
        }
    }
    *state.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
    let _ = events.send(SessionEvent::MessagesUpdated(snapshot));
}

async fn run_typing_watch(
    config: Config,
    peer_id: String,
    events: broadcast::Sender<SessionEvent>,
    initial: Vec<TypingStatus>,
    mut rx: broadcast::Receiver<Vec<TypingStatus>>,
) {
    let mut last = peer_flag_active(&initial, &peer_id, &config);
    if last {
        let _ = events.send(SessionEvent::PeerTyping(true));
    }

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                let active = peer_flag_active(&snapshot, &peer_id, &config);
                if active != last {
                    last = active;
                    let _ = events.send(SessionEvent::PeerTyping(active));
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
