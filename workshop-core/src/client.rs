use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::de;
use crate::page;
use crate::rate_limit::RateLimiter;

const DEFAULT_API_URL: &str = "https://api.steampowered.com";
const DEFAULT_PAGE_URL: &str = "https://steamcommunity.com";
const DETAILS_PATH: &str = "/ISteamRemoteStorage/GetPublishedFileDetails/v1/";
const ITEM_PAGE_PATH: &str = "/sharedfiles/filedetails/";
const CLIENT_USER_AGENT: &str = concat!("workshopd/", env!("CARGO_PKG_VERSION"));
const DEFAULT_SCRAPE_DELAY: Duration = Duration::from_millis(2000);

pub const RESULT_OK: i32 = 1;
pub const RESULT_FILE_NOT_FOUND: i32 = 9;
pub const VISIBILITY_PUBLIC: i32 = 0;
pub const FILE_TYPE_COLLECTION: i32 = 2;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("catalog unavailable after {attempts} attempts: {last}")]
    Unavailable {
        attempts: u32,
        #[source]
        last: Box<CatalogError>,
    },
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Request(_) => true,
            CatalogError::Api { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
                    )
            }
            CatalogError::Url(_) | CatalogError::Unavailable { .. } => false,
        }
    }
}

/// Linear backoff for batch requests: retry `n` waits `n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.step.saturating_mul(retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step: Duration::from_millis(1000),
        }
    }
}

/// Every requested id maps to its entry, or `None` when the catalog omitted it.
pub type BatchDetails = HashMap<String, Option<CatalogEntry>>;

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    api_url: Url,
    page_url: Url,
    retry: RetryPolicy,
    scrape_limiter: Arc<RateLimiter>,
}

impl CatalogClient {
    pub fn new() -> Result<Self, CatalogError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_PAGE_URL)
    }

    pub fn with_base_urls(api_url: &str, page_url: &str) -> Result<Self, CatalogError> {
        Ok(Self {
            http: Client::new(),
            api_url: Url::parse(api_url)?,
            page_url: Url::parse(page_url)?,
            retry: RetryPolicy::default(),
            scrape_limiter: Arc::new(RateLimiter::new(DEFAULT_SCRAPE_DELAY)),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_scrape_delay(mut self, delay: Duration) -> Self {
        self.scrape_limiter = Arc::new(RateLimiter::new(delay));
        self
    }

    /// Fetches details for `ids` in one request, retrying the whole batch on
    /// failure. Never returns partial results.
    pub async fn fetch_batch(&self, ids: &[String]) -> Result<BatchDetails, CatalogError> {
        let unique = dedup_preserving_order(ids);
        if unique.is_empty() {
            return Ok(HashMap::new());
        }

        let mut retry = 0u32;
        loop {
            match self.request_details(&unique).await {
                Ok(entries) => {
                    if retry > 0 {
                        tracing::info!(
                            count = unique.len(),
                            retries = retry,
                            "catalog batch succeeded after retrying"
                        );
                    }
                    let mut by_id: HashMap<String, CatalogEntry> = entries
                        .into_iter()
                        .map(|entry| (entry.id.clone(), entry))
                        .collect();
                    return Ok(unique
                        .into_iter()
                        .map(|id| {
                            let entry = by_id.remove(&id);
                            (id, entry)
                        })
                        .collect());
                }
                Err(err) if retry < self.retry.max_retries => {
                    retry += 1;
                    let delay = self.retry.delay(retry);
                    tracing::warn!(
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "catalog batch request failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(CatalogError::Unavailable {
                        attempts: retry + 1,
                        last: Box::new(err),
                    });
                }
            }
        }
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        let mut details = self.fetch_batch(&[id.to_string()]).await?;
        Ok(details.remove(id).flatten())
    }

    /// Prefers the structured file type; falls back to inspecting the public
    /// item page when the catalog does not report one.
    pub async fn is_container(&self, id: &str) -> Result<bool, CatalogError> {
        if let Some(entry) = self.fetch_one(id).await?
            && let Some(is_collection) = entry.is_collection()
        {
            return Ok(is_collection);
        }
        let html = self.fetch_item_page(id).await?;
        Ok(page::has_container_markup(&html))
    }

    /// Child item ids scraped from the container's public page. An empty list
    /// means nothing could be discovered, including on failure.
    pub async fn container_children(&self, id: &str) -> Vec<String> {
        match self.fetch_item_page(id).await {
            Ok(html) => page::child_item_ids(&html, id),
            Err(err) => {
                tracing::warn!(container_id = id, error = %err, "failed to load container page");
                Vec::new()
            }
        }
    }

    async fn request_details(&self, ids: &[String]) -> Result<Vec<CatalogEntry>, CatalogError> {
        let url = self.endpoint(DETAILS_PATH)?;
        let mut form = vec![
            ("itemcount".to_string(), ids.len().to_string()),
            ("format".to_string(), "json".to_string()),
        ];
        for (index, id) in ids.iter().enumerate() {
            form.push((format!("publishedfileids[{index}]"), id.clone()));
        }

        let response = self
            .http
            .post(url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;
        let envelope: DetailsEnvelope = Self::handle_response(response).await?;
        if envelope.response.result != RESULT_OK {
            tracing::debug!(
                result = envelope.response.result,
                "catalog envelope reported non-success result"
            );
        }

        let mut entries = Vec::with_capacity(envelope.response.details.len());
        for raw in envelope.response.details {
            match serde_json::from_value::<CatalogEntry>(raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::debug!(error = %err, "skipping malformed catalog entry"),
            }
        }
        Ok(entries)
    }

    async fn fetch_item_page(&self, id: &str) -> Result<String, CatalogError> {
        let mut url = self.page_endpoint(ITEM_PAGE_PATH)?;
        url.query_pairs_mut().append_pair("id", id);
        self.scrape_limiter
            .execute(|| async {
                let response = self
                    .http
                    .get(url)
                    .header(USER_AGENT, CLIENT_USER_AGENT)
                    .header(
                        ACCEPT,
                        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                    )
                    .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5")
                    .send()
                    .await?;
                if response.status().is_success() {
                    Ok(response.text().await?)
                } else {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    Err(CatalogError::Api { status, body })
                }
            })
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, CatalogError> {
        Ok(self.api_url.join(path)?)
    }

    fn page_endpoint(&self, path: &str) -> Result<Url, CatalogError> {
        Ok(self.page_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CatalogError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CatalogError::Api { status, body })
        }
    }
}

fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CatalogEntry {
    #[serde(rename = "publishedfileid")]
    pub id: String,
    #[serde(default, deserialize_with = "de::integer")]
    pub result: i32,
    #[serde(default, deserialize_with = "de::integer")]
    pub creator_app_id: u32,
    #[serde(default, deserialize_with = "de::integer")]
    pub consumer_app_id: u32,
    #[serde(default, deserialize_with = "de::integer")]
    pub visibility: i32,
    #[serde(default, deserialize_with = "de::flag")]
    pub banned: bool,
    #[serde(default, deserialize_with = "de::integer")]
    pub file_size: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "de::integer")]
    pub time_created: i64,
    #[serde(default, deserialize_with = "de::integer")]
    pub time_updated: i64,
    #[serde(default, deserialize_with = "de::optional_integer")]
    pub file_type: Option<i32>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl CatalogEntry {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_OK
    }

    pub fn is_not_found(&self) -> bool {
        self.result == RESULT_FILE_NOT_FOUND
    }

    pub fn is_public(&self) -> bool {
        self.visibility == VISIBILITY_PUBLIC
    }

    /// `None` when the catalog did not report a file type.
    pub fn is_collection(&self) -> Option<bool> {
        self.file_type.map(|kind| kind == FILE_TYPE_COLLECTION)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(|tag| tag.tag.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tag {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
struct DetailsEnvelope {
    response: DetailsResponse,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default, deserialize_with = "de::integer")]
    result: i32,
    #[serde(default, rename = "publishedfiledetails")]
    details: Vec<serde_json::Value>,
}
