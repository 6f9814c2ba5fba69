//! Handles a single mention of the bot: one question, one streamed answer.

use futures::StreamExt;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, error, info, instrument, warn};

use crate::{
    base::{
        config::Config,
        types::{AnswerContext, HistoryEntry, MentionEvent, MessageRef, Res},
    },
    interaction::stream::{StreamSettings, StreamingSession},
    service::{chat::ChatClient, history::HistoryClient, llm::LlmClient, retriever::RetrieverClient},
};

/// The services one turn needs.
///
/// This is trivially cloneable, so it can be moved into a spawned task.
#[derive(Clone)]
pub struct TurnServices {
    pub config: Config,
    pub history: HistoryClient,
    pub llm: LlmClient,
    pub retriever: RetrieverClient,
    pub chat: ChatClient,
}

/// Handles the app mention event.
///
/// Spawns a new task to run the turn so the event can be acknowledged right away.
#[instrument(skip_all)]
pub fn handle_app_mention(event: MentionEvent, services: TurnServices) {
    tokio::spawn(
        async move {
            // Process the event.
            let result = run_turn(&event, &services).await;

            // Log any errors.
            if let Err(err) = &result {
                error!("Error while handling: {}", err);
            }
        }
        .in_current_span(),
    );
}

/// Run one full turn and return the published answer.
///
/// The whole turn shares one deadline of `turn_timeout` from the moment the
/// mention is picked up. If anything fails after the placeholder is posted, the
/// placeholder keeps its last streamed state and the error is returned.
#[instrument(skip_all, fields(channel = %event.channel, key = %event.conversation_key()))]
pub async fn run_turn(event: &MentionEvent, services: &TurnServices) -> Res<String> {
    let deadline = Instant::now() + services.config.turn_timeout();
    let user_message = strip_self_mentions(&event.text, services.chat.bot_user_id());
    let key = event.conversation_key();

    // Post the placeholder that the answer will stream into.

    let placeholder_ts = services.chat.post_message(&event.channel, key, &services.config.typing_marker).await?;
    let target = MessageRef {
        channel: event.channel.clone(),
        ts: placeholder_ts,
    };

    // Load history, rephrase, then retrieve.

    let prepared = timeout_at(deadline, async {
        // A broken store only costs us context.
        let history = match services.history.load(key).await {
            Ok(history) => history,
            Err(err) => {
                warn!("Failed to load history, continuing without it: {}", err);
                Vec::new()
            }
        };

        let query = if history.is_empty() {
            user_message.clone()
        } else {
            services.llm.rephrase_query(&history, &user_message).await?
        };

        let passages = services.retriever.search(&query).await?;

        info!("Retrieved {} passages for the query.", passages.len());

        Ok::<_, anyhow::Error>((history, passages))
    })
    .await;

    let (history, passages) = match prepared {
        Ok(prepared) => prepared?,
        Err(_) => {
            warn!("Turn timed out before generation; clearing the placeholder.");
            StreamingSession::start(services.chat.clone(), target, StreamSettings::from_config(&services.config))
                .on_stream_end(None)
                .await;

            return Err(anyhow::anyhow!("Turn timed out after {:?} before generation started.", services.config.turn_timeout()));
        }
    };

    // Generate, streaming into the placeholder.

    let context = AnswerContext {
        user_message: user_message.clone(),
        history,
        passages,
    };

    let answer = stream_answer(services, target, &context, deadline).await?;

    // Persist the exchange.

    let entries = [HistoryEntry::user(user_message), HistoryEntry::assistant(answer.clone())];
    if let Err(err) = services.history.append(key, &entries).await {
        warn!("Failed to append history: {}", err);
    }

    Ok(answer)
}

/// Drive the answer stream through a streaming session until the turn deadline.
async fn stream_answer(services: &TurnServices, target: MessageRef, context: &AnswerContext, deadline: Instant) -> Res<String> {
    let mut session = StreamingSession::start(services.chat.clone(), target, StreamSettings::from_config(&services.config));

    let consumed = timeout_at(deadline, async {
        let mut tokens = services.llm.generate_answer_stream(context).await?;

        while let Some(token) = tokens.next().await {
            session.on_token(&token?);
        }

        Ok::<(), anyhow::Error>(())
    })
    .await;

    match consumed {
        Ok(Ok(())) => Ok(session.on_stream_end(None).await),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            // The generation future (and its request) was dropped by the timeout.
            warn!("Answer generation timed out; publishing {} accumulated bytes as the answer.", session.text().len());
            Ok(session.on_stream_end(None).await)
        }
    }
}

/// Remove `<@BOT>` and `<@BOT|name>` mention markup for the given bot, then trim.
///
/// Mentions of other users are kept.
pub fn strip_self_mentions(text: &str, bot_user_id: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<@") {
        result.push_str(&rest[..start]);

        let Some(len) = rest[start..].find('>') else {
            // Unterminated markup is plain text.
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let token = &rest[start..start + len + 1];
        let user_id = token[2..token.len() - 1].split('|').next().unwrap_or_default();

        if user_id != bot_user_id {
            result.push_str(token);
        }

        rest = &rest[start + len + 1..];
    }

    result.push_str(rest);

    result.trim().to_string()
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: &str, thread_ts: Option<&str>) -> MentionEvent {
        MentionEvent {
            channel: "C0HELP".to_string(),
            text: "<@U0BOT> hi".to_string(),
            ts: ts.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            user: Some("U0ALICE".to_string()),
        }
    }

    #[test]
    fn test_conversation_key_uses_thread_root() {
        assert_eq!(event("1700000000.000500", Some("1700000000.000100")).conversation_key(), "1700000000.000100");
    }

    #[test]
    fn test_conversation_key_falls_back_to_own_ts() {
        assert_eq!(event("1700000000.000500", None).conversation_key(), "1700000000.000500");
    }

    #[test]
    fn test_strip_self_mentions() {
        assert_eq!(strip_self_mentions("<@U0BOT> what is the refund policy?", "U0BOT"), "what is the refund policy?");
        assert_eq!(strip_self_mentions("<@U0BOT|helper> hello", "U0BOT"), "hello");
        assert_eq!(strip_self_mentions("ask <@U0ALICE> or <@U0BOT>", "U0BOT"), "ask <@U0ALICE> or");
        assert_eq!(strip_self_mentions("<@U0BOT>", "U0BOT"), "");
    }

    #[test]
    fn test_strip_self_mentions_keeps_unterminated_markup() {
        assert_eq!(strip_self_mentions("<@U0BOT> 2 <@ 3", "U0BOT"), "2 <@ 3");
    }
}
