//! Google Cloud Storage over the JSON API
//!
//! Uses `objects.list` with `prefix`/`pageToken` paging and `objects.get`
//! with `alt=media`. Authentication is an optional OAuth bearer token.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use super::ObjectStore;
use crate::error::{PipelineError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

pub struct GcsStore {
    client: Client,
    api_url: String,
    bucket: String,
    /// Empty, or ends with `/`
    prefix: String,
    token: Option<String>,
    root_uri: String,
}

impl GcsStore {
    pub fn new(api_url: &str, bucket: String, prefix: String, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PipelineError::storage(format!("Failed to build HTTP client: {}", e)))?;

        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            p => format!("{}/", p),
        };
        let root_uri = format!("gs://{}/{}", bucket, prefix).trim_end_matches('/').to_string();

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bucket,
            prefix,
            token,
            root_uri,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let hint = match status {
            StatusCode::NOT_FOUND => " (object or bucket does not exist)",
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                " (set METAL_ACCESS_TOKEN or GOOGLE_OAUTH_ACCESS_TOKEN)"
            },
            _ => "",
        };
        Err(PipelineError::storage(format!(
            "{} failed with HTTP {}{}: {}",
            what,
            status.as_u16(),
            hint,
            body.trim()
        )))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn root_uri(&self) -> &str {
        &self.root_uri
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = format!("{}{}", self.prefix, prefix);
        let url = format!("{}/storage/v1/b/{}/o", self.api_url, self.bucket);
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", full_prefix.clone()), ("fields", "items(name),nextPageToken".to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let response = self
                .authorize(self.client.get(&url).query(&query))
                .send()
                .await
                .map_err(|e| PipelineError::storage(format!("Failed to list {}: {}", self.root_uri, e)))?;
            let page: ObjectList = self
                .check(response, &format!("Listing gs://{}/{}", self.bucket, full_prefix))
                .await?
                .json()
                .await
                .map_err(|e| PipelineError::storage(format!("Invalid listing response: {}", e)))?;

            keys.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| item.name.strip_prefix(self.prefix.as_str()).map(str::to_string)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Listed {} objects under gs://{}/{}", keys.len(), self.bucket, full_prefix);
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = format!("{}{}", self.prefix, key);
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_url,
            self.bucket,
            urlencoding::encode(&full_key)
        );

        let response = self
            .authorize(self.client.get(&url).query(&[("alt", "media")]))
            .send()
            .await
            .map_err(|e| PipelineError::storage(format!("Failed to download gs://{}/{}: {}", self.bucket, full_key, e)))?;

        let bytes = self
            .check(response, &format!("Download of gs://{}/{}", self.bucket, full_key))
            .await?
            .bytes()
            .await
            .map_err(|e| PipelineError::storage(format!("Failed to read GCS response body: {}", e)))?;

        debug!("Downloaded {} bytes from gs://{}/{}", bytes.len(), self.bucket, full_key);
        Ok(bytes.to_vec())
    }
}
