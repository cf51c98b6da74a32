use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::BackendError;
use crate::ingest::types::{KeepAlive, Page, ScrollBackend, ScrollQuery};

/// Longest error body kept in a `BackendError::Protocol`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source", default)]
    source: Value,
}

/// Scroll API client for an Elasticsearch-compatible search backend.
pub struct ElasticBackend {
    base: String,
    client: Client,
}

impl ElasticBackend {
    pub fn new(host: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: host.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn read_page(resp: Response) -> Result<Page, BackendError> {
        let resp = check_status(resp).await?;
        let body: ScrollResponse = resp.json().await?;
        Ok(Page {
            cursor: body.scroll_id,
            hits: body.hits.hits.into_iter().map(|h| h.source).collect(),
        })
    }
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(BackendError::Protocol {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ScrollBackend for ElasticBackend {
    async fn ping(&self) -> Result<bool, BackendError> {
        let resp = self.client.head(format!("{}/", self.base)).send().await?;
        Ok(resp.status().is_success())
    }

    async fn open(&self, query: &ScrollQuery) -> Result<Page, BackendError> {
        let url = format!("{}/{}/_search", self.base, query.index);
        let resp = self
            .client
            .post(url)
            .query(&[
                ("scroll", query.keep_alive.to_string()),
                ("size", query.page_size.to_string()),
            ])
            .json(&query.to_body())
            .send()
            .await?;
        Self::read_page(resp).await
    }

    async fn advance(&self, cursor: &str, keep_alive: KeepAlive) -> Result<Page, BackendError> {
        let resp = self
            .client
            .post(format!("{}/_search/scroll", self.base))
            .json(&json!({ "scroll": keep_alive.to_string(), "scroll_id": cursor }))
            .send()
            .await?;
        Self::read_page(resp).await
    }

    async fn release(&self, cursor: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .delete(format!("{}/_search/scroll", self.base))
            .json(&json!({ "scroll_id": [cursor] }))
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }

    fn name(&self) -> &str {
        &self.base
    }
}
