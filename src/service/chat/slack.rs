//! Slack implementation of the chat client.
//!
//! This module provides functionality for interacting with Slack:
//! - Receiving mentions over Socket Mode or the HTTP Events API
//! - Posting placeholder messages into threads
//! - Editing those messages as answers stream in

use crate::{
    base::{
        config::{Config, SlackMode},
        types::{MentionEvent, Res, Void},
    },
    interaction::{
        self,
        mention::TurnServices,
    },
    service::{history::HistoryClient, llm::LlmClient, retriever::RetrieverClient},
};
use async_trait::async_trait;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use slack_morphism::prelude::*;
use tracing::{info, instrument, warn};

use std::sync::Arc;

use super::{ChatClient, GenericChatClient, events};

// Type aliases.

type FullClient = slack_morphism::SlackClient<SlackClientHyperConnector<HttpsConnector<HttpConnector>>>;

// Extra methods on `ChatClient` applied by the slack implementation.

impl ChatClient {
    /// Creates a new Slack chat client.
    pub async fn slack(config: &Config, history: HistoryClient, llm: LlmClient, retriever: RetrieverClient) -> Res<Self> {
        let client = SlackChatClient::new(config, history, llm, retriever).await?;
        Ok(Self { inner: Arc::new(client) })
    }
}

impl From<SlackChatClient> for ChatClient {
    fn from(client: SlackChatClient) -> Self {
        Self { inner: Arc::new(client) }
    }
}

impl From<&SlackAppMentionEvent> for MentionEvent {
    fn from(event: &SlackAppMentionEvent) -> Self {
        Self {
            channel: event.channel.0.clone(),
            text: event.content.text.clone().unwrap_or_default(),
            ts: event.origin.ts.0.clone(),
            thread_ts: event.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
            user: Some(event.user.0.clone()),
        }
    }
}

// Structs.

/// User state for the slack socket client.
struct SlackUserState {
    services: TurnServices,
}

/// Slack client implementation.
#[derive(Clone)]
pub struct SlackChatClient {
    config: Config,
    app_token: SlackApiToken,
    bot_token: SlackApiToken,
    bot_user_id: String,
    client: Arc<FullClient>,
    history: HistoryClient,
    llm: LlmClient,
    retriever: RetrieverClient,
}

impl SlackChatClient {
    /// Create a new Slack chat client.
    #[instrument(name = "SlackChatClient::new", skip_all)]
    pub async fn new(config: &Config, history: HistoryClient, llm: LlmClient, retriever: RetrieverClient) -> Res<Self> {
        // Initialize tokens.

        let app_token = SlackApiToken::new(SlackApiTokenValue(config.slack_app_token.clone()));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.slack_bot_token.clone()));

        // Initialize the Slack client.

        let https_connector = HttpsConnector::<HttpConnector>::builder().with_native_roots()?.https_only().enable_all_versions().build();
        let connector = SlackClientHyperConnector::with_connector(https_connector);
        let client = Arc::new(slack_morphism::SlackClient::new(connector));

        // Get the bot's user ID.

        let session = client.open_session(&bot_token);
        let bot_user = session.auth_test().await?;
        let bot_user_id = bot_user.user_id.0;

        info!("Slack bot user ID: {}", bot_user_id);

        Ok(Self {
            config: config.clone(),
            app_token,
            bot_token,
            bot_user_id,
            client,
            history,
            llm,
            retriever,
        })
    }

    /// Services for turns dispatched by this client.
    fn services(&self) -> TurnServices {
        TurnServices {
            config: self.config.clone(),
            history: self.history.clone(),
            llm: self.llm.clone(),
            retriever: self.retriever.clone(),
            chat: ChatClient::from(self.clone()),
        }
    }

    /// Listen for events over Socket Mode until shutdown.
    async fn start_socket_mode(&self) -> Void {
        let socket_mode_callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        let listener_environment = Arc::new(SlackClientEventsListenerEnvironment::new(self.client.clone()).with_user_state(SlackUserState { services: self.services() }));

        let socket_mode_listener = Arc::new(SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment.clone(),
            socket_mode_callbacks,
        ));

        // Register an app token to listen for events.
        socket_mode_listener.listen_for(&self.app_token).await?;

        // Start WS connections and wait for Ctrl-C to shutdown.
        socket_mode_listener.serve().await;

        Ok(())
    }
}

#[async_trait]
impl GenericChatClient for SlackChatClient {
    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn start(&self) -> Void {
        match self.config.slack_mode {
            SlackMode::Socket => {
                info!("Listening for Slack events over Socket Mode ...");
                self.start_socket_mode().await
            }
            SlackMode::Http => {
                info!("Listening for Slack events on `{}` ...", self.config.http_listen_addr);
                events::serve(&self.config.http_listen_addr, self.services()).await
            }
        }
    }

    #[instrument(skip(self, text))]
    async fn post_message(&self, channel_id: &str, thread_ts: &str, text: &str) -> Res<String> {
        let message = SlackMessageContent::new().with_text(text.to_string());

        let request = SlackApiChatPostMessageRequest::new(SlackChannelId(channel_id.to_string()), message).with_thread_ts(SlackTs(thread_ts.to_string()));

        let session = self.client.open_session(&self.bot_token);

        let response = session.chat_post_message(&request).await.map_err(|e| anyhow::anyhow!("Failed to post message: {}", e))?;

        Ok(response.ts.0)
    }

    #[instrument(skip(self, text))]
    async fn update_message(&self, channel_id: &str, ts: &str, text: &str) -> Void {
        let message = SlackMessageContent::new().with_text(text.to_string());

        let request = SlackApiChatUpdateRequest::new(SlackChannelId(channel_id.to_string()), message, SlackTs(ts.to_string()));

        let session = self.client.open_session(&self.bot_token);

        let _ = session.chat_update(&request).await.map_err(|e| anyhow::anyhow!("Failed to update message: {}", e))?;

        Ok(())
    }
}

// Event dispatch shared by both delivery modes.

/// Start a turn for a mention, unless the bot mentioned itself.
pub fn dispatch_app_mention(event: &SlackAppMentionEvent, services: &TurnServices) {
    if event.user.0 == services.chat.bot_user_id() {
        warn!("Skipping app mention authored by the bot.");
        return;
    }

    interaction::mention::handle_app_mention(MentionEvent::from(event), services.clone());
}

// Socket mode listener callbacks for Slack.

/// Handles push events from Slack.
#[instrument(skip_all)]
async fn handle_push_event(event_callback: SlackPushEventCallback, _client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    match event_callback.event {
        SlackEventCallbackBody::AppMention(slack_app_mention_event) => {
            info!("Received app mention event ...");
            dispatch_app_mention(&slack_app_mention_event, &user_state.services);
        }
        _ => {
            warn!("Received unhandled push event.")
        }
    }

    Ok(())
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mention_event_from_slack_threaded() {
        let event: SlackAppMentionEvent = serde_json::from_value(serde_json::json!({
            "type": "app_mention",
            "user": "U0ALICE",
            "text": "<@U0BOT> where are the docs?",
            "ts": "1700000000.000500",
            "thread_ts": "1700000000.000100",
            "channel": "C0HELP",
            "event_ts": "1700000000.000500"
        }))
        .unwrap();

        let mention = MentionEvent::from(&event);

        assert_eq!(mention.channel, "C0HELP");
        assert_eq!(mention.text, "<@U0BOT> where are the docs?");
        assert_eq!(mention.ts, "1700000000.000500");
        assert_eq!(mention.thread_ts.as_deref(), Some("1700000000.000100"));
        assert_eq!(mention.user.as_deref(), Some("U0ALICE"));
        assert_eq!(mention.conversation_key(), "1700000000.000100");
    }

    #[test]
    fn test_mention_event_from_slack_top_level() {
        let event: SlackAppMentionEvent = serde_json::from_value(serde_json::json!({
            "type": "app_mention",
            "user": "U0ALICE",
            "text": "<@U0BOT> hello",
            "ts": "1700000000.000500",
            "channel": "C0HELP",
            "event_ts": "1700000000.000500"
        }))
        .unwrap();

        let mention = MentionEvent::from(&event);

        assert_eq!(mention.thread_ts, None);
        assert_eq!(mention.conversation_key(), "1700000000.000500");
    }
}
