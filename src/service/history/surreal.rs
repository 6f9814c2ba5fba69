//! SurrealDB implementation of the history store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::{
    Surreal,
    engine::any::{self, Any},
    opt::auth::Root,
};
use tracing::{debug, info, instrument};

use crate::base::{
    config::Config,
    types::{HistoryEntry, Res, Void},
};

use super::{GenericHistoryStore, HistoryClient};

// Extra methods on `HistoryClient` applied by the surreal implementation.

impl HistoryClient {
    /// Connects to the database described by the configuration.
    pub async fn surreal(config: &Config) -> Res<Self> {
        let credentials = match (&config.db_username, &config.db_password) {
            (Some(username), Some(password)) => Some((username.as_str(), password.as_str())),
            _ => None,
        };

        let store = SurrealHistoryStore::connect(
            &config.db_endpoint,
            credentials,
            &config.db_namespace,
            &config.db_database,
            &config.history_table,
            config.history_ttl(),
        )
        .await?;

        Ok(Self { inner: Arc::new(store) })
    }

    /// Creates an in-memory store, mostly useful for tests.
    pub async fn surreal_memory(ttl: Duration) -> Res<Self> {
        let store = SurrealHistoryStore::connect("mem://", None, "rag", "bot", "transcript", ttl).await?;

        Ok(Self { inner: Arc::new(store) })
    }
}

// Structs.

/// A transcript row: every message of one conversation plus its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranscriptRecord {
    messages: Vec<HistoryEntry>,
    expires_at: DateTime<Utc>,
}

/// SurrealDB history store.
#[derive(Clone)]
pub struct SurrealHistoryStore {
    db: Surreal<Any>,
    table: String,
    ttl: chrono::Duration,
}

impl SurrealHistoryStore {
    /// Connect, optionally sign in, and select the namespace and database.
    #[instrument(name = "SurrealHistoryStore::connect", skip(credentials))]
    pub async fn connect(endpoint: &str, credentials: Option<(&str, &str)>, namespace: &str, database: &str, table: &str, ttl: Duration) -> Res<Self> {
        let db = any::connect(endpoint).await?;

        if let Some((username, password)) = credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        info!("History store initialized successfully.");

        Ok(Self {
            db,
            table: table.to_string(),
            ttl: chrono::Duration::from_std(ttl)?,
        })
    }

    /// Read the record for a key, dropping it if it has expired.
    async fn live_record(&self, key: &str) -> Res<Option<TranscriptRecord>> {
        let record: Option<TranscriptRecord> = self.db.select((self.table.as_str(), key)).await?;

        Ok(record.filter(|r| r.expires_at > Utc::now()))
    }
}

#[async_trait]
impl GenericHistoryStore for SurrealHistoryStore {
    #[instrument(skip(self))]
    async fn load(&self, key: &str) -> Res<Vec<HistoryEntry>> {
        let messages = self.live_record(key).await?.map(|r| r.messages).unwrap_or_default();

        debug!("Loaded {} history entries.", messages.len());

        Ok(messages)
    }

    #[instrument(skip(self, entries))]
    async fn append(&self, key: &str, entries: &[HistoryEntry]) -> Void {
        let mut messages = self.live_record(key).await?.map(|r| r.messages).unwrap_or_default();
        messages.extend_from_slice(entries);

        let record = TranscriptRecord {
            messages,
            expires_at: Utc::now() + self.ttl,
        };

        let _: Option<TranscriptRecord> = self.db.upsert((self.table.as_str(), key)).content(record).await?;

        Ok(())
    }
}

// Tests.
