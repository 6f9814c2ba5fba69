//! Load configuration via `config` crate with env-override support.

use std::{ops::Deref, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::base::prompts;

use super::types::Res;

/// Default OpenAI chat model to use
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Default sampling temperature for the OpenAI chat model
fn default_openai_temperature() -> f32 {
    0.0
}

/// Default OpenAI embedding model used for query embeddings
fn default_openai_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}

/// Default rephrase directive.
fn default_rephrase_directive() -> String {
    prompts::REPHRASE_DIRECTIVE.to_string()
}

/// Default answer directive.
fn default_answer_directive() -> String {
    prompts::ANSWER_DIRECTIVE.to_string()
}

/// Default number of passages returned by the retriever.
fn default_retriever_top_k() -> u32 {
    4
}

/// Default table that holds conversation transcripts.
fn default_history_table() -> String {
    "transcript".to_string()
}

/// Default database endpoint (in-memory).
fn default_db_endpoint() -> String {
    "mem://".to_string()
}

fn default_db_namespace() -> String {
    "rag".to_string()
}

fn default_db_database() -> String {
    "bot".to_string()
}

/// Default Slack delivery mode.
fn default_slack_mode() -> SlackMode {
    SlackMode::Socket
}

/// Default listen address for the HTTP events endpoint.
fn default_http_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

/// Default base interval between streamed message edits.
fn default_stream_update_interval_ms() -> u64 {
    1000
}

/// Default in-progress marker.
fn default_typing_marker() -> String {
    prompts::TYPING_MARKER.to_string()
}

/// Default upper bound for a single turn.
fn default_turn_timeout_secs() -> u64 {
    300
}

/// How Slack delivers events to the bot.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlackMode {
    /// Socket Mode over a websocket, authenticated with the app-level token.
    #[default]
    Socket,
    /// Events API over HTTP, authenticated with the signing secret.
    Http,
}

/// Configuration for the rag-bot application.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub inner: Arc<ConfigInner>,
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigInner {
    /// OpenAI API key (`OPENAI_API_KEY`).
    pub openai_api_key: String,
    /// OpenAI chat model used for both rephrasing and answering (`OPENAI_MODEL`).
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Sampling temperature for the chat model (`OPENAI_TEMPERATURE`).
    /// Value between 0 and 2.
    #[serde(default = "default_openai_temperature")]
    pub openai_temperature: f32,
    /// OpenAI embedding model used to embed search queries (`OPENAI_EMBEDDING_MODEL`).
    /// Must match the model the index was built with.
    #[serde(default = "default_openai_embedding_model")]
    pub openai_embedding_model: String,
    /// Optional custom rephrase directive (`REPHRASE_DIRECTIVE`).
    #[serde(default = "default_rephrase_directive")]
    pub rephrase_directive: String,
    /// Optional custom answer directive (`ANSWER_DIRECTIVE`).
    #[serde(default = "default_answer_directive")]
    pub answer_directive: String,
    /// Pinecone API key (`PINECONE_API_KEY`).
    pub pinecone_api_key: String,
    /// Name of the pre-built Pinecone index (`PINECONE_INDEX`).
    pub pinecone_index: String,
    /// Number of passages to retrieve per query (`RETRIEVER_TOP_K`).
    #[serde(default = "default_retriever_top_k")]
    pub retriever_top_k: u32,
    /// Table holding conversation transcripts (`HISTORY_TABLE`).
    #[serde(default = "default_history_table")]
    pub history_table: String,
    /// Transcript time-to-live in hours (`HISTORY_TTL_HOURS`).
    pub history_ttl_hours: u32,
    /// Database endpoint URL (`DB_ENDPOINT`), e.g. `ws://localhost:8000` or `mem://`.
    #[serde(default = "default_db_endpoint")]
    pub db_endpoint: String,
    /// Database username (`DB_USERNAME`).
    pub db_username: Option<String>,
    /// Database password (`DB_PASSWORD`).
    pub db_password: Option<String>,
    /// Database namespace (`DB_NAMESPACE`).
    #[serde(default = "default_db_namespace")]
    pub db_namespace: String,
    /// Database name (`DB_DATABASE`).
    #[serde(default = "default_db_database")]
    pub db_database: String,
    /// Slack app token (`SLACK_APP_TOKEN`).
    pub slack_app_token: String,
    /// Slack bot token (`SLACK_BOT_TOKEN`).
    pub slack_bot_token: String,
    /// Slack signing secret (`SLACK_SIGNING_SECRET`).
    pub slack_signing_secret: String,
    /// Event delivery mode (`SLACK_MODE`): `socket` or `http`.
    #[serde(default = "default_slack_mode")]
    pub slack_mode: SlackMode,
    /// Listen address for the HTTP events endpoint (`HTTP_LISTEN_ADDR`).
    #[serde(default = "default_http_listen_addr")]
    pub http_listen_addr: String,
    /// Base interval between streamed edits, in milliseconds (`STREAM_UPDATE_INTERVAL_MS`).
    #[serde(default = "default_stream_update_interval_ms")]
    pub stream_update_interval_ms: u64,
    /// Marker appended to partial answers (`TYPING_MARKER`).
    #[serde(default = "default_typing_marker")]
    pub typing_marker: String,
    /// Upper bound for answer generation, in seconds (`TURN_TIMEOUT_SECS`).
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Config {
    pub fn load(explicit_path: Option<&std::path::Path>) -> Res<Self> {
        let mut cfg = config::Config::builder().add_source(config::Environment::default().prefix("RAG_BOT"));

        if let Some(p) = explicit_path {
            cfg = cfg.add_source(config::File::from(p.to_path_buf()));
        } else if std::path::Path::new(".hidden/config.toml").exists() {
            cfg = cfg.add_source(config::File::with_name(".hidden/config.toml"));
        }

        let result = Config {
            inner: Arc::new(cfg.build()?.try_deserialize()?),
        };

        result.validate()?;

        Ok(result)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Res<()> {
        if !(0.0..=2.0).contains(&self.openai_temperature) {
            return Err(anyhow::anyhow!("OpenAI temperature must be between 0 and 2."));
        }

        if self.retriever_top_k < 1 {
            return Err(anyhow::anyhow!("Retriever top k must be at least 1."));
        }

        if self.history_ttl_hours < 1 {
            return Err(anyhow::anyhow!("History TTL must be at least 1 hour."));
        }

        if self.stream_update_interval_ms < 1 {
            return Err(anyhow::anyhow!("Stream update interval must be at least 1 millisecond."));
        }

        if self.turn_timeout_secs < 1 {
            return Err(anyhow::anyhow!("Turn timeout must be at least 1 second."));
        }

        Ok(())
    }

    /// Transcript time-to-live.
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.history_ttl_hours) * 60 * 60)
    }

    /// Base interval between streamed edits.
    pub fn stream_update_interval(&self) -> Duration {
        Duration::from_millis(self.stream_update_interval_ms)
    }

    /// Upper bound for answer generation.
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_inner() -> ConfigInner {
        ConfigInner {
            openai_temperature: 0.3,
            retriever_top_k: 4,
            history_ttl_hours: 1,
            stream_update_interval_ms: 1000,
            turn_timeout_secs: 300,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = Config { inner: Arc::new(valid_inner()) };

        assert!(config.validate().is_ok());
        assert_eq!(config.history_ttl(), Duration::from_secs(3600));
        assert_eq!(config.stream_update_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_temperature() {
        let config = Config {
            inner: Arc::new(ConfigInner { openai_temperature: 2.5, ..valid_inner() }),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nan_temperature() {
        let config = Config {
            inner: Arc::new(ConfigInner { openai_temperature: f32::NAN, ..valid_inner() }),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = Config {
            inner: Arc::new(ConfigInner { history_ttl_hours: 0, ..valid_inner() }),
        };

        assert!(config.validate().is_err());
    }

    const COMPLETE_TOML: &str = r#"
openai_api_key = "sk-test"
pinecone_api_key = "pc-test"
pinecone_index = "handbook"
history_ttl_hours = 2
slack_app_token = "xapp-test"
slack_bot_token = "xoxb-test"
slack_signing_secret = "secret"
"#;

    fn write_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("rag-bot-{}-{name}.toml", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_applies_defaults() {
        let path = write_config("complete", COMPLETE_TOML);

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.slack_bot_token, "xoxb-test");
        assert_eq!(config.history_ttl(), Duration::from_secs(2 * 60 * 60));
        assert_eq!(config.retriever_top_k, 4);
        assert_eq!(config.slack_mode, SlackMode::Socket);
        assert_eq!(config.typing_marker, "\n\nTyping...");
        assert_eq!(config.turn_timeout(), Duration::from_secs(300));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_fails_without_required_value() {
        let contents = COMPLETE_TOML.replace("slack_bot_token = \"xoxb-test\"\n", "");
        let path = write_config("missing-bot-token", &contents);

        let result = Config::load(Some(&path));

        std::fs::remove_file(path).unwrap();

        let err = result.unwrap_err().to_string();
        assert!(err.contains("slack_bot_token"), "unexpected error: {err}");
    }

    #[test]
    fn test_load_fails_on_out_of_range_value() {
        let path = write_config("bad-ttl", &COMPLETE_TOML.replace("history_ttl_hours = 2", "history_ttl_hours = 0"));

        let result = Config::load(Some(&path));

        std::fs::remove_file(path).unwrap();

        assert!(result.is_err());
    }

    #[test]
    fn test_slack_mode_parses_lowercase() {
        let mode: SlackMode = serde_json::from_str("\"http\"").unwrap();

        assert_eq!(mode, SlackMode::Http);
    }
}
