/// Presence bookkeeping tied to the auth lifecycle
///
/// Writes are best-effort: a client killed before teardown simply leaves
/// its last stamp behind, and readers see a stale "online" until the next
/// sign-in corrects it.
use crate::error::Result;
use crate::store::{ChatStore, Subscription};
use crate::types::{Presence, UserProfile};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PresenceTracker {
    store: Arc<dyn ChatStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Mark `user_id` online and stamp last-seen. Called on successful
    /// authentication.
    pub fn online(&self, user_id: &str) {
        match self.store.set_presence(user_id, Presence::Online, Utc::now()) {
            Ok(()) => debug!("{} is online", user_id),
            Err(e) => warn!("Failed to mark {} online: {}", user_id, e),
        }
    }

    /// Mark `user_id` offline and stamp last-seen. Called on sign-out or
    /// detected disconnect.
    pub fn offline(&self, user_id: &str) {
        match self.store.set_presence(user_id, Presence::Offline, Utc::now()) {
            Ok(()) => debug!("{} is offline", user_id),
            Err(e) => warn!("Failed to mark {} offline: {}", user_id, e),
        }
    }

    /// Live directory of all registered users, for contact display.
    pub fn subscribe_users(&self) -> Result<Subscription<Vec<UserProfile>>> {
        self.store.subscribe_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sled_store::SledStore;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            user_id: id.to_string(),
            firstname: id.to_string(),
            lastname: "Test".to_string(),
            email: format!("{}@example.com", id),
            presence: Presence::Offline,
            last_seen: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_online_offline_stamps() {
        let store = Arc::new(SledStore::temporary().unwrap());
        store.upsert_user(&profile("alice")).unwrap();
        let tracker = PresenceTracker::new(store.clone());

        tracker.online("alice");
        let online = store.get_user("alice").unwrap().unwrap();
        assert_eq!(online.presence, Presence::Online);

        tracker.offline("alice");
        let offline = store.get_user("alice").unwrap().unwrap();
        assert_eq!(offline.presence, Presence::Offline);
        assert!(offline.last_seen >= online.last_seen);
    }

    #[test]
    fn test_unknown_user_is_nonfatal() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let tracker = PresenceTracker::new(store);
        // Logs and carries on
        tracker.online("ghost");
        tracker.offline("ghost");
    }
}
