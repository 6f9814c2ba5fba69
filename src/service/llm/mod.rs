//! Integration with Large Language Model services.
//!
//! This module provides a thin wrapper around LLM clients (e.g., OpenAI)
//! for rephrasing questions into search queries, embedding those queries,
//! and streaming answers token by token.

pub mod openai;

use crate::base::{
    prompts::PASSAGE_SEPARATOR,
    types::{AnswerContext, HistoryEntry, Passage, Res},
};
use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use std::{ops::Deref, pin::Pin};

// Types.

/// A stream of answer tokens, in generation order.
///
/// Dropping the stream aborts the underlying request.
pub type TokenStream = Pin<Box<dyn Stream<Item = Res<String>> + Send>>;

// Traits.

/// Generic LLM client trait that clients must implement.
///
/// This trait defines the core functionality for interacting with large language models.
/// Implementing this trait allows different LLM providers to be used with the rag-bot.
#[async_trait]
pub trait GenericLlmClient: Send + Sync + 'static {
    /// Rewrite the latest user message into a standalone search query.
    ///
    /// The history gives the model enough context to resolve pronouns and
    /// follow-up questions like "what about the other one?".
    async fn rephrase_query(&self, history: &[HistoryEntry], user_message: &str) -> Res<String>;

    /// Embed a search query for vector lookup.
    async fn embed_query(&self, text: &str) -> Res<Vec<f32>>;

    /// Start generating an answer, returning the token stream.
    async fn generate_answer_stream(&self, context: &AnswerContext) -> Res<TokenStream>;
}

// Structs.

/// LLM client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct LlmClient {
    inner: Arc<dyn GenericLlmClient>,
}

impl Deref for LlmClient {
    type Target = dyn GenericLlmClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl LlmClient {
    pub fn new(inner: Arc<dyn GenericLlmClient>) -> Self {
        Self { inner }
    }
}

// Helpers.

/// Stuff retrieved passages into a single context block, best match first.
pub fn format_passages(passages: &[Passage]) -> String {
    passages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join(PASSAGE_SEPARATOR)
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_passages_keeps_rank_order() {
        let passages = vec![
            Passage { text: "Refunds take 5 days.".to_string(), score: 0.91 },
            Passage { text: "Contact billing for disputes.".to_string(), score: 0.72 },
        ];

        assert_eq!(format_passages(&passages), "Refunds take 5 days.\n\nContact billing for disputes.");
    }

    #[test]
    fn test_format_passages_empty() {
        assert_eq!(format_passages(&[]), "");
    }
}
