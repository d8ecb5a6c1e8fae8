/// TalkLink - two-party chat synchronization core
///
/// Message delivery state, typing indicators, unread aggregation and
/// presence for a chat client, backend-agnostic behind the `ChatStore`
/// adapter. Ships a sled-backed store and a local auth provider so the
/// whole core runs without any network service.

pub mod auth;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod presence;
pub mod roster;
pub mod sled_store;
pub mod store;
pub mod types;
pub mod typing;

pub use auth::{AuthProvider, Credentials, LocalAuthProvider, NewUser, UserIdentity};
pub use client::{ChatClient, SessionEvent, SessionHandle};
pub use config::Config;
pub use error::{ChatError, Result};
pub use roster::{RosterEntry, RosterEvent, RosterView};
pub use sled_store::SledStore;
pub use store::{ChatStore, Subscription};
pub use types::{
    Attachment, DeliveryStatus, Message, Presence, Session, SessionKey, TypingStatus, UserProfile,
};
