//! Knowledge retrieval over a pre-built vector index.

pub mod pinecone;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::base::types::{Passage, Res};

// Traits.

/// Generic retriever trait that clients must implement.
#[async_trait]
pub trait GenericRetriever: Send + Sync + 'static {
    /// Return the passages most relevant to the query, best first.
    async fn search(&self, query: &str) -> Res<Vec<Passage>>;
}

// Structs.

/// Retriever client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct RetrieverClient {
    inner: Arc<dyn GenericRetriever>,
}

impl Deref for RetrieverClient {
    type Target = dyn GenericRetriever;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl RetrieverClient {
    pub fn new(inner: Arc<dyn GenericRetriever>) -> Self {
        Self { inner }
    }
}
