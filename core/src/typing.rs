/// Debounced typing-indicator writer
///
/// The first input event of a burst writes the flag once; later events
/// only move the debounce deadline. When the deadline passes with no
/// further input the flag is cleared with a single write. Must run on a
/// tokio runtime.
use crate::error::Result;
use crate::store::ChatStore;
use crate::types::SessionKey;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

pub struct TypingController {
    store: Arc<dyn ChatStore>,
    session: SessionKey,
    user_id: String,
    debounce: Duration,
    state: Arc<Mutex<TypingState>>,
}

#[derive(Default)]
struct TypingState {
    typing: bool,
    /// Bumped on every input; a debounce timer only fires if it still
    /// holds the generation it was armed with.
    generation: u64,
}

fn lock(state: &Mutex<TypingState>) -> MutexGuard<'_, TypingState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl TypingController {
    pub fn new(
        store: Arc<dyn ChatStore>,
        session: SessionKey,
        user_id: String,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            session,
            user_id,
            debounce,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    /// Record one local input event.
    ///
    /// If the flag write fails the local state is left untouched, so the
    /// next input retries it.
    pub fn on_input(&self) -> Result<()> {
        let generation = {
            let mut state = lock(&self.state);
            if !state.typing {
                self.store
                    .set_typing(&self.session, &self.user_id, true, Utc::now())?;
                state.typing = true;
            }
            state.generation += 1;
            state.generation
        };

        let state = self.state.clone();
        let store = self.store.clone();
        let session = self.session.clone();
        let user_id = self.user_id.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let fire = {
                let mut state = lock(&state);
                if state.generation == generation && state.typing {
                    state.typing = false;
                    true
                } else {
                    false
                }
            };
            if fire {
                if let Err(e) = store.set_typing(&session, &user_id, false, Utc::now()) {
                    warn!("Failed to clear typing flag for {}: {}", user_id, e);
                }
            }
        });

        Ok(())
    }

    /// Clear the flag immediately (message sent, or conversation closed).
    /// Disarms any pending debounce timer.
    pub fn clear(&self) -> Result<()> {
        let was_typing = {
            let mut state = lock(&self.state);
            state.generation += 1;
            let was = state.typing;
            state.typing = false;
            was
        };
        if was_typing {
            self.store
                .set_typing(&self.session, &self.user_id, false, Utc::now())?;
        }
        Ok(())
    }
}
