/// End-to-end chat flows
/// Two clients over one shared store: first contact, receipts, deletion,
/// roster aggregation, auth lifecycle.
use std::sync::Arc;
use std::time::Duration;

use talklink_core::auth::{AuthProvider, Credentials, LocalAuthProvider, NewUser, UserIdentity};
use talklink_core::{
    ChatClient, ChatStore, Config, DeliveryStatus, Presence, SessionKey, SledStore, UserProfile,
};
use tokio::time::sleep;

fn profile(id: &str, first: &str) -> UserProfile {
    UserProfile {
        user_id: id.to_string(),
        firstname: first.to_string(),
        lastname: "Tester".to_string(),
        email: format!("{}@example.com", id),
        presence: Presence::Offline,
        last_seen: chrono::Utc::now(),
        created_at: chrono::Utc::now(),
    }
}

fn identity(id: &str, first: &str) -> UserIdentity {
    UserIdentity {
        user_id: id.to_string(),
        email: format!("{}@example.com", id),
        firstname: first.to_string(),
        lastname: "Tester".to_string(),
    }
}

fn setup_users(store: &Arc<SledStore>) {
    store.upsert_user(&profile("alice", "Alice")).unwrap();
    store.upsert_user(&profile("bob", "Bob")).unwrap();
}

/// Poll until `check` passes; watcher tasks run in the background.
async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn test_first_contact_delivery_and_read() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("alice", "Alice"),
    );
    let mut bob = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("bob", "Bob"),
    );

    let alice_roster = alice.roster().unwrap();

    // No prior session: first contact creates it with the derived key
    let a_session = alice.open_session("bob").unwrap();
    assert_eq!(a_session.session().key, SessionKey::for_pair("alice", "bob"));
    let b_session = bob.open_session("alice").unwrap();
    assert_eq!(a_session.session().key, b_session.session().key);
    assert_eq!(store.list_sessions("alice").unwrap().len(), 1);

    let sent = a_session.send(Some("hi".to_string()), None).unwrap();
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.sender_id, "alice");
    assert_eq!(sent.receiver_id, "bob");

    // Bob's live subscription acknowledges delivery on its own
    {
        let handle = b_session;
        let id = sent.id.clone();
        wait_until("delivery acknowledgement", move || {
            handle
                .messages()
                .iter()
                .any(|m| m.id == id && m.status == DeliveryStatus::Delivered)
        })
        .await;
    }

    // Bob renders the conversation: the message flips to read, stamped
    b_session.mark_read();
    let read = store
        .list_messages(&sent.session)
        .unwrap()
        .into_iter()
        .find(|m| m.id == sent.id)
        .unwrap();
    assert_eq!(read.status, DeliveryStatus::Read);
    assert!(read.read_at.is_some());

    // Alice sent the message, so her unread count stays at zero
    {
        let roster = &alice_roster;
        let key = sent.session.clone();
        wait_until("alice roster entry", move || roster.entry(&key).is_some()).await;
    }
    let entry = alice_roster.entry(&sent.session).unwrap();
    assert_eq!(entry.unread_count, 0);
    assert!(entry.last_message.as_ref().unwrap().text.starts_with("You: "));

    alice.sign_out();
    bob.sign_out();
}

#[tokio::test]
async fn test_delete_preserves_status_and_hides_content() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);
    let config = Config::default();

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        config.clone(),
        identity("alice", "Alice"),
    );
    let mut bob = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        config.clone(),
        identity("bob", "Bob"),
    );

    let a_session = alice.open_session("bob").unwrap();
    let b_session = bob.open_session("alice").unwrap();

    let sent = a_session
        .send(
            Some("secret".to_string()),
            Some(talklink_core::Attachment::from_bytes(b"img", "image/png")),
        )
        .unwrap();

    // Bob reads it before the deletion
    {
        let handle = b_session;
        let id = sent.id.clone();
        wait_until("delivery acknowledgement", move || {
            handle
                .messages()
                .iter()
                .any(|m| m.id == id && m.status == DeliveryStatus::Delivered)
        })
        .await;
    }
    b_session.mark_read();

    // Only the sender may delete
    assert!(b_session.delete_message(&sent.id).is_err());
    let deleted = a_session.delete_message(&sent.id).unwrap();

    // Read status and timestamps survive; content does not
    assert_eq!(deleted.status, DeliveryStatus::Read);
    assert!(deleted.read_at.is_some());
    assert_eq!(deleted.created_at, sent.created_at);
    assert!(deleted.deleted);
    assert_eq!(
        deleted.rendered_body(&config.deleted_placeholder),
        Some(config.deleted_placeholder.as_str())
    );
    assert!(deleted.rendered_attachment().is_none());

    // A re-fetch by the other side agrees
    let refetched = store
        .list_messages(&sent.session)
        .unwrap()
        .into_iter()
        .find(|m| m.id == sent.id)
        .unwrap();
    assert!(refetched.deleted);
    assert_eq!(refetched.body.as_deref(), Some(config.deleted_placeholder.as_str()));
    assert!(refetched.attachment.is_none());

    alice.sign_out();
    bob.sign_out();
}

#[tokio::test]
async fn test_roster_unread_and_ordering() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);
    store.upsert_user(&profile("carol", "Carol")).unwrap();

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("alice", "Alice"),
    );
    let mut bob = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("bob", "Bob"),
    );
    let mut carol = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("carol", "Carol"),
    );

    // Bob's roster is open before anyone writes to him
    let bob_roster = bob.roster().unwrap();

    let a_session = alice.open_session("bob").unwrap();
    a_session.send(Some("one".to_string()), None).unwrap();
    a_session.send(Some("two".to_string()), None).unwrap();
    a_session.send(Some("three".to_string()), None).unwrap();

    let ab = SessionKey::for_pair("alice", "bob");
    {
        let roster = &bob_roster;
        let key = ab.clone();
        wait_until("three unread from alice", move || {
            roster.entry(&key).map(|e| e.unread_count) == Some(3)
        })
        .await;
    }
    let entry = bob_roster.entry(&ab).unwrap();
    assert_eq!(entry.peer_id, "alice");
    assert_eq!(entry.last_message.as_ref().unwrap().text, "three");

    // Carol messages later; her session moves to the top of Bob's roster
    let c_session = carol.open_session("bob").unwrap();
    c_session.send(Some("hello from carol".to_string()), None).unwrap();

    let bc = SessionKey::for_pair("bob", "carol");
    {
        let roster = &bob_roster;
        let key = bc.clone();
        wait_until("carol's session on the roster", move || {
            roster.entry(&key).is_some()
        })
        .await;
    }
    let entries = bob_roster.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].session, bc);
    assert_eq!(entries[1].session, ab);

    // Bob opens the conversation with Alice and reads it
    let b_session = bob.open_session("alice").unwrap();
    {
        let handle = b_session;
        wait_until("alice's messages visible to bob", move || {
            handle.messages().len() == 3
        })
        .await;
    }
    b_session.mark_read();

    {
        let roster = &bob_roster;
        let key = ab.clone();
        wait_until("unread drains to zero", move || {
            roster.entry(&key).map(|e| e.unread_count) == Some(0)
        })
        .await;
    }

    bob_roster.close();
    alice.sign_out();
    bob.sign_out();
    carol.sign_out();
}

#[tokio::test]
async fn test_peer_typing_surfaces_and_clears() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("alice", "Alice"),
    );
    let mut bob = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("bob", "Bob"),
    );

    let a_session = alice.open_session("bob").unwrap();
    let b_session = bob.open_session("alice").unwrap();
    let mut bob_events = b_session.subscribe();

    a_session.typing_input().unwrap();

    let mut saw_typing = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(100), bob_events.recv()).await {
            Ok(Ok(talklink_core::SessionEvent::PeerTyping(true))) => {
                saw_typing = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_typing, "bob never saw alice typing");

    // Sending clears the flag immediately
    a_session.send(Some("done".to_string()), None).unwrap();
    let mut saw_cleared = false;
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(100), bob_events.recv()).await {
            Ok(Ok(talklink_core::SessionEvent::PeerTyping(false))) => {
                saw_cleared = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_cleared, "typing flag never cleared after send");

    alice.sign_out();
    bob.sign_out();
}

#[tokio::test]
async fn test_auth_and_presence_lifecycle() {
    // On-disk stores: the same paths a real deployment would use
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path()).unwrap());
    let auth = LocalAuthProvider::open(dir.path(), store.clone() as Arc<dyn ChatStore>).unwrap();

    let registered = auth
        .sign_up(NewUser {
            firstname: "Alice".to_string(),
            lastname: "Archer".to_string(),
            email: "alice@example.com".to_string(),
            password: "hunter2".to_string(),
        })
        .unwrap();

    // Duplicate registration is surfaced as an auth failure
    assert!(auth
        .sign_up(NewUser {
            firstname: "Mallory".to_string(),
            lastname: "Imposter".to_string(),
            email: "alice@example.com".to_string(),
            password: "other".to_string(),
        })
        .is_err());

    let identity = auth
        .sign_in(&Credentials {
            email: "alice@example.com".to_string(),
            password: "hunter2".to_string(),
        })
        .unwrap();
    assert_eq!(identity, registered);

    let client = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity.clone(),
    );
    let online = store.get_user(&identity.user_id).unwrap().unwrap();
    assert_eq!(online.presence, Presence::Online);

    // The directory sees the registered user with live presence
    let directory = client.user_directory().unwrap();
    assert_eq!(directory.current.len(), 1);
    assert_eq!(directory.current[0].presence, Presence::Online);

    client.sign_out();
    auth.sign_out(&identity.user_id).unwrap();
    let offline = store.get_user(&identity.user_id).unwrap().unwrap();
    assert_eq!(offline.presence, Presence::Offline);
    assert!(offline.last_seen >= online.last_seen);
}

#[tokio::test]
async fn test_switching_conversations_cancels_subscriptions() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);
    store.upsert_user(&profile("carol", "Carol")).unwrap();

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("alice", "Alice"),
    );

    alice.open_session("bob").unwrap();
    let first_key = alice.active_session().unwrap().session().key.clone();

    // Switching replaces the active handle
    alice.open_session("carol").unwrap();
    let second = alice.active_session().unwrap();
    assert_ne!(second.session().key, first_key);
    assert_eq!(second.peer_id(), "carol");

    // The old session still works at the store level; only the handle is gone
    assert_eq!(store.list_sessions("alice").unwrap().len(), 2);

    alice.sign_out();
}

#[tokio::test]
async fn test_empty_draft_rejected_locally() {
    let store = Arc::new(SledStore::temporary().unwrap());
    setup_users(&store);

    let mut alice = ChatClient::new(
        store.clone() as Arc<dyn ChatStore>,
        Config::default(),
        identity("alice", "Alice"),
    );
    let session = alice.open_session("bob").unwrap();

    assert!(session.send(None, None).is_err());
    assert!(session.send(Some("   ".to_string()), None).is_err());
    assert!(store
        .list_messages(&SessionKey::for_pair("alice", "bob"))
        .unwrap()
        .is_empty());

    // Attachment-only drafts are fine
    let sent = session
        .send(
            None,
            Some(talklink_core::Attachment::from_bytes(b"doc", "application/pdf")),
        )
        .unwrap();
    assert!(sent.body.is_none());
    assert!(sent.attachment.is_some());

    alice.sign_out();
}
