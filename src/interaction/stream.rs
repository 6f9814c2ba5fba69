//! Streams a growing answer into a single chat message.
//!
//! Chat platforms rate limit message edits, so a [`StreamingSession`] only
//! publishes the accumulated text once the current interval has elapsed since
//! the previous publish. The interval doubles whenever the publish count
//! exceeds ten times the interval (in base units), so long answers cost
//! O(log n) edits rather than one per token.
//!
//! Edits are performed by a per-session publisher task, strictly in order, so
//! token ingestion never waits on the chat platform.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{Instrument, debug, instrument, warn};

use crate::{
    base::{config::Config, prompts::TYPING_MARKER, types::MessageRef},
    service::chat::ChatClient,
};

/// Publishes per interval before the interval doubles.
const PUBLISHES_PER_INTERVAL_UNIT: u32 = 10;

/// Tuning for a streaming session.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Starting (and minimum) gap between publishes.
    pub base_interval: Duration,
    /// Appended to every partial publish, never to the final one.
    pub marker: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            marker: TYPING_MARKER.to_string(),
        }
    }
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_interval: config.stream_update_interval(),
            marker: config.typing_marker.clone(),
        }
    }
}

/// Controller state for one answer-generation call.
///
/// Created when generation starts and consumed by [`StreamingSession::on_stream_end`].
/// Dropping a session without ending it leaves the message at its last partial state.
pub struct StreamingSession {
    settings: StreamSettings,
    text: String,
    multiplier: u32,
    last_publish: Instant,
    publish_count: u32,
    tx: mpsc::UnboundedSender<String>,
    publisher: JoinHandle<()>,
}

impl StreamingSession {
    /// Start a session targeting an existing message.
    pub fn start(chat: ChatClient, target: MessageRef, settings: StreamSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = tokio::spawn(run_publisher(chat, target, rx).in_current_span());

        Self {
            settings,
            text: String::new(),
            multiplier: 1,
            last_publish: Instant::now(),
            publish_count: 0,
            tx,
            publisher,
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current minimum gap between publishes.
    pub fn interval(&self) -> Duration {
        self.settings.base_interval * self.multiplier
    }

    /// Number of partial publishes performed so far.
    pub fn publish_count(&self) -> u32 {
        self.publish_count
    }

    /// Ingest one token, publishing a partial update if the interval has elapsed.
    pub fn on_token(&mut self, token: &str) {
        self.text.push_str(token);

        let now = Instant::now();

        if now.duration_since(self.last_publish) <= self.interval() {
            return;
        }

        self.publish(format!("{}{}", self.text, self.settings.marker));
        self.last_publish = now;
        self.publish_count += 1;

        if self.publish_count > PUBLISHES_PER_INTERVAL_UNIT.saturating_mul(self.multiplier) {
            self.multiplier = self.multiplier.saturating_mul(2);
            debug!("Backing off message updates to {:?}.", self.interval());
        }
    }

    /// Publish the complete answer without the marker and wait for every edit to land.
    ///
    /// Uses `final_text` when supplied, otherwise the accumulated text. Returns the
    /// published text.
    #[instrument(skip_all)]
    pub async fn on_stream_end(self, final_text: Option<String>) -> String {
        let Self { text, tx, publisher, .. } = self;

        let text = final_text.unwrap_or(text);

        if tx.send(text.clone()).is_err() {
            warn!("Message publisher stopped before the final update.");
        }

        // Closing the channel lets the publisher drain the queue and exit.
        drop(tx);

        if let Err(err) = publisher.await {
            warn!("Message publisher failed: {}", err);
        }

        text
    }

    fn publish(&self, text: String) {
        if self.tx.send(text).is_err() {
            warn!("Message publisher stopped; dropping partial update.");
        }
    }
}

/// Apply queued edits in order until the session closes the channel.
async fn run_publisher(chat: ChatClient, target: MessageRef, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        // A lost edit is cosmetic: the next one carries the catch-up text.
        if let Err(err) = chat.update_message(&target.channel, &target.ts, &text).await {
            warn!("Failed to update message `{}`: {}", target.ts, err);
        }
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::time::advance;

    use super::*;
    use crate::{
        base::types::{Res, Void},
        service::chat::GenericChatClient,
    };

    /// Records every edit attempt; optionally fails the first few.
    #[derive(Default)]
    struct RecordingChat {
        updates: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    impl RecordingChat {
        fn failing(count: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(count),
                ..Default::default()
            }
        }

        fn updates(&self) -> Vec<String> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenericChatClient for RecordingChat {
        fn bot_user_id(&self) -> &str {
            "U0BOT"
        }

        async fn start(&self) -> Void {
            Ok(())
        }

        async fn post_message(&self, _channel_id: &str, _thread_ts: &str, _text: &str) -> Res<String> {
            Ok("1700000000.000900".to_string())
        }

        async fn update_message(&self, _channel_id: &str, _ts: &str, text: &str) -> Void {
            self.updates.lock().unwrap().push(text.to_string());

            let failed = self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
            if failed {
                return Err(anyhow::anyhow!("ratelimited"));
            }

            Ok(())
        }
    }

    fn target() -> MessageRef {
        MessageRef {
            channel: "C0HELP".to_string(),
            ts: "1700000000.000900".to_string(),
        }
    }

    fn start(recorder: &Arc<RecordingChat>) -> StreamingSession {
        StreamingSession::start(ChatClient::new(recorder.clone()), target(), StreamSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_partial_then_final() {
        let recorder = Arc::new(RecordingChat::default());
        let mut session = start(&recorder);

        advance(Duration::from_millis(100)).await;
        session.on_token("Hel");
        advance(Duration::from_millis(200)).await;
        session.on_token("lo");
        advance(Duration::from_millis(300)).await;
        session.on_token(", ");
        advance(Duration::from_millis(600)).await;
        session.on_token("world");
        advance(Duration::from_millis(300)).await;
        session.on_token("!");

        assert_eq!(session.publish_count(), 1);

        let answer = session.on_stream_end(None).await;

        assert_eq!(answer, "Hello, world!");
        assert_eq!(recorder.updates(), vec!["Hello, world\n\nTyping...".to_string(), "Hello, world!".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_publish_until_interval_strictly_elapsed() {
        let recorder = Arc::new(RecordingChat::default());
        let mut session = start(&recorder);

        session.on_token("first");
        advance(Duration::from_secs(1)).await;
        session.on_token(" second");

        assert_eq!(session.publish_count(), 0);

        advance(Duration::from_millis(1)).await;
        session.on_token(" third");

        assert_eq!(session.publish_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_stream_publishes_once() {
        let recorder = Arc::new(RecordingChat::default());
        let session = start(&recorder);

        let answer = session.on_stream_end(None).await;

        assert_eq!(answer, "");
        assert_eq!(recorder.updates(), vec![String::new()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplied_final_text_wins() {
        let recorder = Arc::new(RecordingChat::default());
        let mut session = start(&recorder);

        session.on_token("partial");

        let answer = session.on_stream_end(Some("complete answer".to_string())).await;

        assert_eq!(answer, "complete answer");
        assert_eq!(recorder.updates(), vec!["complete answer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_doubles_after_ten_times_interval_publishes() {
        let recorder = Arc::new(RecordingChat::default());
        let mut session = start(&recorder);

        for _ in 0..10 {
            advance(Duration::from_millis(1500)).await;
            session.on_token("x");
        }

        assert_eq!(session.publish_count(), 10);
        assert_eq!(session.interval(), Duration::from_secs(1));

        advance(Duration::from_millis(1500)).await;
        session.on_token("x");

        assert_eq!(session.publish_count(), 11);
        assert_eq!(session.interval(), Duration::from_secs(2));

        // 1.5s no longer clears the doubled interval.
        advance(Duration::from_millis(1500)).await;
        session.on_token("x");
        assert_eq!(session.publish_count(), 11);

        advance(Duration::from_millis(1500)).await;
        session.on_token("x");
        assert_eq!(session.publish_count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_stream_backs_off_geometrically() {
        let recorder = Arc::new(RecordingChat::default());
        let mut session = start(&recorder);

        let mut previous = session.interval();
        let mut expected = String::new();

        for i in 0..500 {
            advance(Duration::from_millis(1500)).await;

            let token = format!("{i} ");
            expected.push_str(&token);
            session.on_token(&token);

            assert!(session.interval() >= previous);
            previous = session.interval();
        }

        assert_eq!(session.publish_count(), 96);
        assert_eq!(session.interval(), Duration::from_secs(16));

        let answer = session.on_stream_end(None).await;
        let updates = recorder.updates();

        assert_eq!(answer, expected);
        assert_eq!(updates.len(), 97);
        assert_eq!(updates.last(), Some(&expected));
        assert!(updates[..96].iter().all(|u| u.ends_with("\n\nTyping...")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_does_not_stop_ingestion() {
        let recorder = Arc::new(RecordingChat::failing(1));
        let mut session = start(&recorder);

        advance(Duration::from_millis(1100)).await;
        session.on_token("a");
        advance(Duration::from_millis(1100)).await;
        session.on_token("b");

        let answer = session.on_stream_end(None).await;

        assert_eq!(answer, "ab");
        assert_eq!(
            recorder.updates(),
            vec!["a\n\nTyping...".to_string(), "ab\n\nTyping...".to_string(), "ab".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_marker() {
        let recorder = Arc::new(RecordingChat::default());
        let settings = StreamSettings {
            base_interval: Duration::from_millis(250),
            marker: " …".to_string(),
        };
        let mut session = StreamingSession::start(ChatClient::new(recorder.clone()), target(), settings);

        advance(Duration::from_millis(300)).await;
        session.on_token("Thinking");

        let answer = session.on_stream_end(None).await;

        assert_eq!(answer, "Thinking");
        assert_eq!(recorder.updates(), vec!["Thinking …".to_string(), "Thinking".to_string()]);
    }
}
