//! Runtime services and shared state for the rag-bot.

use tracing::instrument;

use crate::{
    base::{
        config::Config,
        types::{Res, Void},
    },
    interaction::mention::TurnServices,
    service::{chat::ChatClient, history::HistoryClient, llm::LlmClient, retriever::RetrieverClient},
};

/// Runtime service context that can be shared across the application.
///
/// This struct holds the history store, LLM, retriever, and chat clients along
/// with the configuration. It is designed to be trivially cloneable, allowing it
/// to be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// The history store client instance.
    pub history: HistoryClient,
    /// The LLM client instance.
    pub llm: LlmClient,
    /// The retriever client instance.
    pub retriever: RetrieverClient,
    /// The chat client instance.
    pub chat: ChatClient,
}

impl Runtime {
    /// Create a new runtime instance.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> Res<Self> {
        // Initialize the history store.
        let history = HistoryClient::surreal(&config).await?;

        // Initialize the LLM client.
        let llm = LlmClient::openai(&config);

        // Initialize the retriever.
        let retriever = RetrieverClient::pinecone(&config, llm.clone()).await?;

        // Initialize the chat client.
        let chat = ChatClient::slack(&config, history.clone(), llm.clone(), retriever.clone()).await?;

        Ok(Self {
            config,
            history,
            llm,
            retriever,
            chat,
        })
    }

    /// Services for running a turn outside of the chat listener.
    pub fn services(&self) -> TurnServices {
        TurnServices {
            config: self.config.clone(),
            history: self.history.clone(),
            llm: self.llm.clone(),
            retriever: self.retriever.clone(),
            chat: self.chat.clone(),
        }
    }

    pub async fn start(&self) -> Void {
        self.chat.start().await
    }
}
