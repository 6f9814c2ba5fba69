//! Service integrations for external APIs and clients.
//!
//! This module contains implementations for various services used by the rag-bot:
//! - Chat services (e.g., Slack)
//! - History storage (e.g., SurrealDB)
//! - LLM services (e.g., OpenAI)
//! - Knowledge retrieval (e.g., Pinecone)
//!
//! Each service module defines both generic traits and concrete implementations,
//! allowing for extensibility and easy testing.

pub mod chat;
pub mod history;
pub mod llm;
pub mod retriever;
