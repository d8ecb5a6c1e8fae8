/// Roster aggregation: per-session previews, unread counts, peer typing
///
/// The aggregate is mutated only by watcher tasks reacting to store
/// snapshots; UI actions go through the store and show up here like any
/// other change.
use crate::config::Config;
use crate::error::Result;
use crate::store::ChatStore;
use crate::types::{DeliveryStatus, Message, Session, SessionKey, TypingStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Preview of the most recent message in a session.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePreview {
    pub text: String,
    pub at: DateTime<Utc>,
    pub outgoing: bool,
    pub status: DeliveryStatus,
    pub deleted: bool,
}

/// One roster row: the signed-in user's view of a single session.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub session: SessionKey,
    pub peer_id: String,
    pub last_message: Option<MessagePreview>,
    /// Messages addressed to the signed-in user still in sent/delivered.
    pub unread_count: usize,
    pub peer_typing: bool,
}

#[derive(Debug, Clone)]
pub enum RosterEvent {
    EntryUpdated(RosterEntry),
}

type EntryMap = Arc<RwLock<HashMap<SessionKey, RosterEntry>>>;

pub struct RosterView {
    entries: EntryMap,
    events: broadcast::Sender<RosterEvent>,
    root_task: JoinHandle<()>,
    session_tasks: Arc<Mutex<HashMap<SessionKey, JoinHandle<()>>>>,
}

impl RosterView {
    /// Subscribe to the signed-in user's session list and start one
    /// watcher per session. New sessions (including ones the peer
    /// creates later) are picked up from the session-list stream.
    pub fn open(store: Arc<dyn ChatStore>, config: Config, self_id: String) -> Result<Self> {
        let entries: EntryMap = Arc::new(RwLock::new(HashMap::new()));
        let (events, _) = broadcast::channel(config.channel_capacity);
        let session_tasks: Arc<Mutex<HashMap<SessionKey, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sub = store.subscribe_sessions(&self_id)?;
        for session in &sub.current {
            watch_session(
                &store,
                &config,
                &self_id,
                session,
                &entries,
                &events,
                &session_tasks,
            );
        }

        let root_task = {
            let store = store.clone();
            let config = config.clone();
            let self_id = self_id.clone();
            let entries = entries.clone();
            let events = events.clone();
            let session_tasks = session_tasks.clone();
            let mut rx = sub.updates;
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(sessions) => {
                            for session in &sessions {
                                watch_session(
                                    &store,
                                    &config,
                                    &self_id,
                                    session,
                                    &entries,
                                    &events,
                                    &session_tasks,
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Session stream lagged {} snapshots", n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Ok(Self {
            entries,
            events,
            root_task,
            session_tasks,
        })
    }

    /// Current roster, most recent activity first. Sessions without any
    /// message yet are omitted; they surface through the user directory
    /// until their first message arrives.
    pub fn entries(&self) -> Vec<RosterEntry> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<RosterEntry> = map
            .values()
            .filter(|e| e.last_message.is_some())
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            let a_at = a.last_message.as_ref().map(|p| p.at);
            let b_at = b.last_message.as_ref().map(|p| p.at);
            b_at.cmp(&a_at)
        });
        list
    }

    pub fn entry(&self, session: &SessionKey) -> Option<RosterEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.events.subscribe()
    }

    /// Cancel every watcher. Also runs on drop.
    pub fn close(&self) {
        self.root_task.abort();
        let tasks = self.session_tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.values() {
            task.abort();
        }
    }
}

impl Drop for RosterView {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start a watcher for `session` unless one is already running.
#[allow(clippy::too_many_arguments)]
fn watch_session(
    store: &Arc<dyn ChatStore>,
    config: &Config,
    self_id: &str,
    session: &Session,
    entries: &EntryMap,
    events: &broadcast::Sender<RosterEvent>,
    session_tasks: &Arc<Mutex<HashMap<SessionKey, JoinHandle<()>>>>,
) {
    let peer_id = match session.peer_of(self_id) {
        Some(peer) => peer.to_string(),
        None => return,
    };

    let mut tasks = session_tasks.lock().unwrap_or_else(|e| e.into_inner());
    if tasks.contains_key(&session.key) {
        return;
    }

    let task = tokio::spawn(run_session_watcher(
        store.clone(),
        config.clone(),
        self_id.to_string(),
        peer_id,
        session.key.clone(),
        entries.clone(),
        events.clone(),
    ));
    tasks.insert(session.key.clone(), task);
}

async fn run_session_watcher(
    store: Arc<dyn ChatStore>,
    config: Config,
    self_id: String,
    peer_id: String,
    session: SessionKey,
    entries: EntryMap,
    events: broadcast::Sender<RosterEvent>,
) {
    let messages = match store.subscribe_messages(&session) {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Roster cannot watch messages of {}: {}", session, e);
            return;
        }
    };
    let typing = match store.subscribe_typing(&session) {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Roster cannot watch typing flags of {}: {}", session, e);
            return;
        }
    };

    apply_messages(
        &config, &self_id, &peer_id, &session, &entries, &events, &messages.current,
    );
    apply_typing(&config, &peer_id, &session, &entries, &events, &typing.current);

    let mut msg_rx = messages.updates;
    let mut typ_rx = typing.updates;
    loop {
        tokio::select! {
            res = msg_rx.recv() => match res {
                Ok(snapshot) => apply_messages(
                    &config, &self_id, &peer_id, &session, &entries, &events, &snapshot,
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            res = typ_rx.recv() => match res {
                Ok(snapshot) => apply_typing(
                    &config, &peer_id, &session, &entries, &events, &snapshot,
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn apply_messages(
    config: &Config,
    self_id: &str,
    peer_id: &str,
    session: &SessionKey,
    entries: &EntryMap,
    events: &broadcast::Sender<RosterEvent>,
    snapshot: &[Message],
) {
    let last_message = snapshot.last().map(|m| preview(m, self_id, config));
    let unread_count = unread_count(snapshot, self_id);

    let entry = {
        let mut map = entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(session.clone()).or_insert_with(|| RosterEntry {
            session: session.clone(),
            peer_id: peer_id.to_string(),
            last_message: None,
            unread_count: 0,
            peer_typing: false,
        });
        entry.last_message = last_message;
        entry.unread_count = unread_count;
        entry.clone()
    };
    let _ = events.send(RosterEvent::EntryUpdated(entry));
}

fn apply_typing(
    config: &Config,
    peer_id: &str,
    session: &SessionKey,
    entries: &EntryMap,
    events: &broadcast::Sender<RosterEvent>,
    snapshot: &[TypingStatus],
) {
    let peer_typing = peer_flag_active(snapshot, peer_id, config);

    let entry = {
        let mut map = entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(session.clone()).or_insert_with(|| RosterEntry {
            session: session.clone(),
            peer_id: peer_id.to_string(),
            last_message: None,
            unread_count: 0,
            peer_typing: false,
        });
        if entry.peer_typing == peer_typing {
            return;
        }
        entry.peer_typing = peer_typing;
        entry.clone()
    };
    let _ = events.send(RosterEvent::EntryUpdated(entry));
}

/// Count of messages addressed to `self_id` not yet read. A deleted
/// message still counts until it is read.
pub fn unread_count(messages: &[Message], self_id: &str) -> usize {
    messages
        .iter()
        .filter(|m| {
            m.receiver_id == self_id
                && matches!(m.status, DeliveryStatus::Sent | DeliveryStatus::Delivered)
        })
        .count()
}

pub fn peer_flag_active(snapshot: &[TypingStatus], peer_id: &str, config: &Config) -> bool {
    snapshot
        .iter()
        .find(|t| t.user_id == peer_id)
        .map(|t| t.is_active(Utc::now(), config.typing_stale_after))
        .unwrap_or(false)
}

/// Roster preview line for `message`, from `self_id`'s point of view.
pub fn preview(message: &Message, self_id: &str, config: &Config) -> MessagePreview {
    let body = if message.deleted {
        config.deleted_placeholder.clone()
    } else if let Some(attachment) = &message.attachment {
        if attachment.is_image() { "Photo" } else { "File" }.to_string()
    } else {
        truncate(
            message.body.as_deref().unwrap_or_default(),
            config.preview_max_len,
        )
    };

    let outgoing = message.is_outgoing(self_id);
    let text = if outgoing {
        format!("You: {}", body)
    } else {
        body
    };

    MessagePreview {
        text,
        at: message.created_at,
        outgoing,
        status: message.status,
        deleted: message.deleted,
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_len.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}
