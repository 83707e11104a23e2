//! Conversation state.
//!
//! A [`Conversation`] is a cheap, clonable handle over one ordered message
//! history plus an optional system message.  Clones share the same history,
//! which lets a background stream producer append to the caller's
//! conversation.
//!
//! The internal lock only protects individual appends.  Running two rounds
//! against the same conversation at the same time is not supported; callers
//! must serialize access per conversation or use stateless mode, which runs
//! against a [`Conversation::scratch`] copy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::Message;

#[derive(Debug, Default)]
struct ConversationState {
    system: Option<String>,
    history: Vec<Message>,
}

/// Shared, ordered message history.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    state: Arc<Mutex<ConversationState>>,
}

impl Conversation {
    /// Create an empty conversation without a system message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty conversation with a system message.
    pub fn with_system(system: impl Into<String>) -> Self {
        let conversation = Self::new();
        conversation.set_system(Some(system.into()));
        conversation
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace (or clear) the system message.
    pub fn set_system(&self, system: Option<String>) {
        self.lock().system = system;
    }

    /// The current system message.
    pub fn system(&self) -> Option<String> {
        self.lock().system.clone()
    }

    /// Append a message.
    pub fn push(&self, message: Message) {
        self.lock().history.push(message);
    }

    /// Snapshot of everything sent to a provider: the system message first
    /// (if any), then the history in order.
    pub fn messages(&self) -> Vec<Message> {
        let state = self.lock();
        let mut out = Vec::with_capacity(state.history.len() + 1);
        if let Some(system) = &state.system {
            out.push(Message::system(system.clone()));
        }
        out.extend(state.history.iter().cloned());
        out
    }

    /// Snapshot of the history without the system message.
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    /// Number of history messages (the system message is not counted).
    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().history.is_empty()
    }

    /// Drop all history, keeping the system message.
    pub fn clear(&self) {
        self.lock().history.clear();
    }

    /// A disposable, independent conversation carrying over only the system
    /// message.
    pub fn scratch(&self) -> Self {
        let scratch = Self::new();
        scratch.set_system(self.system());
        scratch
    }

    /// Whether two handles refer to the same underlying history.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
