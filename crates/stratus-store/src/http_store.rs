//! Read-only object store over the edge HTTP surface
//!
//! Key-to-URL mapping is direct: `chunks/<hash>` is served at
//! `GET /chunks/<hash>`, directory listings come back as JSON hash arrays,
//! and ranged reads must honor strict `206 Partial Content` semantics.
//! A plain 200 for a Range request is an error, never a fallback.

use crate::error::{Result, StoreError};
use crate::object_store::ObjectStore;
use async_trait::async_trait;
use reqwest::StatusCode;

/// Client view of a Stratus edge.
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.base_url)
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self
            .client
            .head(self.url_for(key))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::UnexpectedResponse {
                key: key.to_string(),
                detail: format!("HEAD returned {status}"),
            }),
        }
    }

    async fn put(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
        Err(StoreError::ReadOnly)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Http(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(StoreError::UnexpectedResponse {
                key: key.to_string(),
                detail: format!("GET returned {status}"),
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // The edge serves listings with or without the trailing slash;
        // request the bare form.
        let response = self
            .client
            .get(self.url_for(prefix.trim_end_matches('/')))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        match response.status() {
            StatusCode::OK => {
                let names: Vec<String> = response
                    .json()
                    .await
                    .map_err(|e| StoreError::UnexpectedResponse {
                        key: prefix.to_string(),
                        detail: format!("listing is not a JSON array: {e}"),
                    })?;
                let mut keys: Vec<String> =
                    names.into_iter().map(|n| format!("{prefix}{n}")).collect();
                keys.sort();
                Ok(keys)
            }
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(StoreError::UnexpectedResponse {
                key: prefix.to_string(),
                detail: format!("GET returned {status}"),
            }),
        }
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(StoreError::PackFetchInvalid(format!("{key}: empty range")));
        }
        let end = offset + len - 1;
        let response = self
            .client
            .get(self.url_for(key))
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(StoreError::PackFetchInvalid(format!(
                "{key}: expected 206, got {}",
                response.status()
            )));
        }
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::PackFetchInvalid(format!("{key}: missing Content-Range"))
            })?;
        let expected_prefix = format!("bytes {offset}-{end}/");
        if !content_range.starts_with(&expected_prefix) {
            return Err(StoreError::PackFetchInvalid(format!(
                "{key}: Content-Range {content_range} does not match requested {offset}-{end}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        if bytes.len() as u64 != len {
            return Err(StoreError::PackFetchInvalid(format!(
                "{key}: got {} bytes for a {len}-byte range",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }
}
