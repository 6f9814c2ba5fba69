//! Library root for `rag-bot`.
//!
//! Rag-bot answers @-mentions in Slack from a knowledge base:
//! - Keeps a time-boxed transcript per thread
//! - Rephrases follow-up questions into standalone search queries
//! - Retrieves relevant passages from a vector index
//! - Streams the answer into the thread by editing a single message
//!
//! The bot integrates with Slack for chat, SurrealDB for history, Pinecone for
//! retrieval, and OpenAI for generation. The architecture is built around
//! extensible traits that allow for different implementations of each service.

pub mod base;
pub mod interaction;
pub mod runtime;
pub mod service;

use base::{config::Config, types::Void};
use rustls::crypto;
use tracing::info;

/// Public async entry for the binary crate.
///
/// Sets up necessary services and starts the rag-bot runtime:
/// - Initializes the crypto provider
/// - Creates the runtime context with history, LLM, retriever, and chat clients
/// - Starts the chat listener for processing mentions
pub async fn start(config: Config) -> Void {
    info!("Starting rag-bot ...");

    // Start the crypto provider.
    crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install the default crypto provider."))?;

    // Initialize the runtime.
    let runtime = runtime::Runtime::new(config).await?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
