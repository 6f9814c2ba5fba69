//! Event handling and user interactions for rag-bot.
//!
//! This module provides functionality for answering mentions:
//! - Sequencing one turn (placeholder, history, retrieval, generation, persistence)
//! - Streaming a growing answer into a single chat message

pub mod mention;
pub mod stream;
