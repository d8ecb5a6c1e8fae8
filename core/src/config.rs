/// Configuration for the chat core
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TYPING_DEBOUNCE_MS: u64 = 1500;
const DEFAULT_TYPING_STALE_MS: u64 = 5000;
const DEFAULT_PREVIEW_MAX_LEN: usize = 50;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Tunables shared by every component of the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input inactivity window after which the typing flag clears
    pub typing_debounce: Duration,

    /// Readers treat a typing flag older than this as cleared
    pub typing_stale_after: Duration,

    /// Maximum characters of message text in roster previews
    pub preview_max_len: usize,

    /// Text shown in place of a soft-deleted message body
    pub deleted_placeholder: String,

    /// Capacity of snapshot/event broadcast channels
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            typing_debounce: Duration::from_millis(DEFAULT_TYPING_DEBOUNCE_MS),
            typing_stale_after: Duration::from_millis(DEFAULT_TYPING_STALE_MS),
            preview_max_len: DEFAULT_PREVIEW_MAX_LEN,
            deleted_placeholder: DEFAULT_DELETED_PLACEHOLDER.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
