//! OpenAI implementation of the LLM client.

use std::sync::Arc;
use std::time::Duration;

use crate::base::{
    config::Config,
    types::{AnswerContext, HistoryEntry, Res, Role},
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse, CreateEmbeddingRequestArgs,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::{GenericLlmClient, LlmClient, TokenStream, format_passages};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

// Extra methods on `LlmClient` applied by the openai implementation.

impl LlmClient {
    pub fn openai(config: &Config) -> Self {
        let client = OpenAiLlmClient::new(config);
        Self { inner: Arc::new(client) }
    }
}

// Specific implementations.

/// OpenAI LLM client implementation.
#[derive(Clone)]
pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    config: Config,
}

impl OpenAiLlmClient {
    /// Create a new OpenAI LLM client.
    #[instrument(name = "OpenAiLlmClient::new", skip_all)]
    pub fn new(config: &Config) -> Self {
        let cfg = OpenAIConfig::new().with_api_key(config.openai_api_key.clone());

        Self {
            client: Client::with_config(cfg),
            config: config.clone(),
        }
    }

    /// Make a chat completion call, retrying failures and timeouts with exponential backoff.
    async fn call_openai_api(&self, request: CreateChatCompletionRequest) -> Res<CreateChatCompletionResponse> {
        let mut retries = 0;

        loop {
            let failure = match timeout(REQUEST_TIMEOUT, self.client.chat().create(request.clone())).await {
                Ok(Ok(response)) => {
                    debug!("OpenAI API call succeeded after {} attempts", retries + 1);
                    return Ok(response);
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {REQUEST_TIMEOUT:?}"),
            };

            if retries >= MAX_RETRIES {
                return Err(anyhow::anyhow!("OpenAI API call failed after {MAX_RETRIES} retries: {failure}"));
            }

            retries += 1;
            warn!("OpenAI API call failed, retrying {retries}/{MAX_RETRIES}: {failure}");

            tokio::time::sleep(retry_delay(retries)).await;
        }
    }
}

/// Backoff before the given retry (1-based): 1s, 2s, 4s, ...
fn retry_delay(retry: u32) -> Duration {
    RETRY_BASE_DELAY * 2_u32.saturating_pow(retry.saturating_sub(1))
}

#[async_trait]
impl GenericLlmClient for OpenAiLlmClient {
    #[instrument(name = "OpenAiLlmClient::rephrase_query", skip_all)]
    async fn rephrase_query(&self, history: &[HistoryEntry], user_message: &str) -> Res<String> {
        let messages = build_rephrase_messages(history, user_message, &self.config.rephrase_directive)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.openai_model)
            .temperature(self.config.openai_temperature)
            .messages(messages)
            .build()?;

        let response = self.call_openai_api(request).await?;
        let query = response.choices.first().and_then(|choice| choice.message.content.clone()).unwrap_or_default();

        debug!("Rephrased query: {query}");

        // An empty rephrase is useless for search; fall back to the user's own words.
        if query.trim().is_empty() {
            return Ok(user_message.to_string());
        }

        Ok(query.trim().to_string())
    }

    #[instrument(name = "OpenAiLlmClient::embed_query", skip_all)]
    async fn embed_query(&self, text: &str) -> Res<Vec<f32>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.config.openai_embedding_model)
            .input(text.to_string())
            .build()?;

        let response = timeout(REQUEST_TIMEOUT, self.client.embeddings().create(request))
            .await
            .map_err(|_| anyhow::anyhow!("OpenAI embedding call timed out after {REQUEST_TIMEOUT:?}"))??;

        response
            .data
            .into_iter()
            .next()
            .map(|embedding| embedding.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding response contained no vectors."))
    }

    #[instrument(name = "OpenAiLlmClient::generate_answer_stream", skip_all)]
    async fn generate_answer_stream(&self, context: &AnswerContext) -> Res<TokenStream> {
        let messages = build_answer_messages(context, &self.config.answer_directive)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.openai_model)
            .temperature(self.config.openai_temperature)
            .stream(true)
            .messages(messages)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        let tokens = stream.filter_map(|item| async move {
            match item {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|content| !content.is_empty())
                    .map(Ok),
                Err(err) => Some(Err(anyhow::anyhow!("OpenAI stream failed: {err}"))),
            }
        });

        Ok(Box::pin(tokens))
    }
}

// Prompt builders.

/// Convert transcript entries into chat messages.
fn history_messages(history: &[HistoryEntry]) -> Res<Vec<ChatCompletionRequestMessage>> {
    history
        .iter()
        .map(|entry| {
            Ok(match entry.role {
                Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessageArgs::default().content(entry.text.clone()).build()?),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessageArgs::default().content(entry.text.clone()).build()?),
            })
        })
        .collect()
}

/// History, then the new message, then the instruction to produce a search query.
pub fn build_rephrase_messages(history: &[HistoryEntry], user_message: &str, directive: &str) -> Res<Vec<ChatCompletionRequestMessage>> {
    let mut messages = history_messages(history)?;

    messages.push(ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessageArgs::default().content(user_message).build()?));
    messages.push(ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessageArgs::default().content(directive).build()?));

    Ok(messages)
}

/// System directive with the retrieved context, then history, then the new message.
pub fn build_answer_messages(context: &AnswerContext, directive: &str) -> Res<Vec<ChatCompletionRequestMessage>> {
    let system = format!("{directive}\n\n{}", format_passages(&context.passages));

    let mut messages = vec![ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessageArgs::default().content(system).build()?)];

    messages.extend(history_messages(&context.history)?);
    messages.push(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default().content(context.user_message.clone()).build()?,
    ));

    Ok(messages)
}

// Tests.
