//! Pinecone implementation of the retriever.
//!
//! Queries are embedded with the LLM client and matched against an existing
//! index. Passage text is read from the `text` metadata key, which is where
//! the ingestion pipeline stores each chunk.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::{
    base::{
        config::Config,
        types::{Passage, Res},
    },
    service::llm::LlmClient,
};

use super::{GenericRetriever, RetrieverClient};

const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2024-07";
const TEXT_METADATA_KEY: &str = "text";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Extra methods on `RetrieverClient` applied by the pinecone implementation.

impl RetrieverClient {
    pub async fn pinecone(config: &Config, llm: LlmClient) -> Res<Self> {
        let retriever = PineconeRetriever::new(config, llm).await?;
        Ok(Self { inner: Arc::new(retriever) })
    }
}

// Wire types.

#[derive(Debug, Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: u32,
    include_metadata: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Value>,
}

// Structs.

/// Pinecone retriever.
#[derive(Clone)]
pub struct PineconeRetriever {
    http: reqwest::Client,
    api_key: String,
    query_url: String,
    top_k: u32,
    llm: LlmClient,
}

impl PineconeRetriever {
    /// Resolve the index host and build the retriever.
    #[instrument(name = "PineconeRetriever::new", skip_all)]
    pub async fn new(config: &Config, llm: LlmClient) -> Res<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        let describe: DescribeIndexResponse = http
            .get(format!("{CONTROL_PLANE_URL}/indexes/{}", config.pinecone_index))
            .header("Api-Key", &config.pinecone_api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!("Pinecone index `{}` resolved to `{}`.", config.pinecone_index, describe.host);

        Ok(Self {
            http,
            api_key: config.pinecone_api_key.clone(),
            query_url: query_url(&describe.host),
            top_k: config.retriever_top_k,
            llm,
        })
    }
}

#[async_trait]
impl GenericRetriever for PineconeRetriever {
    #[instrument(name = "PineconeRetriever::search", skip(self))]
    async fn search(&self, query: &str) -> Res<Vec<Passage>> {
        let vector = self.llm.embed_query(query).await?;

        let request = QueryRequest {
            vector: &vector,
            top_k: self.top_k,
            include_metadata: true,
        };

        let response: QueryResponse = self
            .http
            .post(&self.query_url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let passages = into_passages(response);

        debug!("Retrieved {} passages.", passages.len());

        Ok(passages)
    }
}

// Helpers.

/// The control plane reports a bare host; data plane calls need a scheme.
fn query_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/query")
    } else {
        format!("https://{host}/query")
    }
}

/// Keep matches that carry text, ordered by descending score.
fn into_passages(response: QueryResponse) -> Vec<Passage> {
    let mut passages = response
        .matches
        .into_iter()
        .filter_map(|m| {
            let text = m.metadata.as_ref()?.get(TEXT_METADATA_KEY)?.as_str()?.to_string();
            Some(Passage { text, score: m.score })
        })
        .collect::<Vec<_>>();

    passages.sort_by(|a, b| b.score.total_cmp(&a.score));

    passages
}

// Tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_url_adds_scheme() {
        assert_eq!(query_url("docs-abc123.svc.pinecone.io"), "https://docs-abc123.svc.pinecone.io/query");
        assert_eq!(query_url("http://localhost:5081"), "http://localhost:5081/query");
    }

    #[test]
    fn test_query_request_uses_camel_case() {
        let vector = [0.1f32, 0.2];
        let request = QueryRequest {
            vector: &vector,
            top_k: 4,
            include_metadata: true,
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["topK"], 4);
        assert_eq!(json["includeMetadata"], true);
    }

    #[test]
    fn test_into_passages_sorts_and_skips_textless_matches() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "matches": [
                { "id": "a", "score": 0.52, "metadata": { "text": "Shipping takes a week.", "source": "faq.md" } },
                { "id": "b", "score": 0.87, "metadata": { "text": "Refunds take 5 days." } },
                { "id": "c", "score": 0.99 },
                { "id": "d", "score": 0.95, "metadata": { "source": "empty.md" } }
            ],
            "namespace": ""
        }))
        .unwrap();

        let passages = into_passages(response);

        let texts = passages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>();

        assert_eq!(texts, vec!["Refunds take 5 days.", "Shipping takes a week."]);
        assert!(passages[0].score > passages[1].score);
    }
}
