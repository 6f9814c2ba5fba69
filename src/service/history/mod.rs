//! Conversation history storage.
//!
//! Transcripts are keyed by conversation key (the thread root timestamp) and
//! expire after a fixed time-to-live that is refreshed on every append.

pub mod surreal;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::base::types::{HistoryEntry, Res, Void};

// Traits.

/// Generic history store trait that clients must implement.
///
/// Implementations own the time-to-live policy: an expired transcript must read
/// back as empty, and the next append must start a fresh transcript.
#[async_trait]
pub trait GenericHistoryStore: Send + Sync + 'static {
    /// Load the ordered transcript for a conversation key.
    ///
    /// Returns an empty list when the key is unknown or expired.
    async fn load(&self, key: &str) -> Res<Vec<HistoryEntry>>;

    /// Append entries, in order, to the transcript for a conversation key.
    async fn append(&self, key: &str, entries: &[HistoryEntry]) -> Void;
}

// Structs.

/// History client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct HistoryClient {
    inner: Arc<dyn GenericHistoryStore>,
}

impl Deref for HistoryClient {
    type Target = dyn GenericHistoryStore;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl HistoryClient {
    pub fn new(inner: Arc<dyn GenericHistoryStore>) -> Self {
        Self { inner }
    }

    /// Append a single user message.
    pub async fn append_user(&self, key: &str, text: &str) -> Void {
        self.append(key, &[HistoryEntry::user(text)]).await
    }

    /// Append a single assistant message.
    pub async fn append_ai(&self, key: &str, text: &str) -> Void {
        self.append(key, &[HistoryEntry::assistant(text)]).await
    }
}
