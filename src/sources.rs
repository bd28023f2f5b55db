//! HTTP image source for TheCatAPI/TheDogAPI-style search endpoints.
//!
//! A search call returns JSON whose first hit carries a `url`; the image is then
//! downloaded from that URL. Bytes and URL are returned together or not at all.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SourceDescriptor;
use crate::contract::{FetchedImage, ImageSource};
use crate::error::FetchError;

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Many(Vec<SearchHit>),
    One(SearchHit),
}

/// Extracts the image URL from a search response body.
pub fn image_url_from_search(body: &str, endpoint: &str) -> Result<String, FetchError> {
    let parsed: SearchResponse = serde_json::from_str(body).map_err(|e| FetchError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;
    let hit = match parsed {
        SearchResponse::Many(hits) => hits.into_iter().next(),
        SearchResponse::One(hit) => Some(hit),
    };
    hit.and_then(|h| h.url)
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| FetchError::NoImage {
            endpoint: endpoint.to_string(),
        })
}

pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, api_key: Option<&str>) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await.map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch_image(&self, source: &SourceDescriptor) -> Result<FetchedImage, FetchError> {
        let endpoint = source.endpoint.as_str();
        debug!(source = %source.key, endpoint, "Searching for image");

        let body = self
            .get(endpoint, Some(source.api_key()))
            .await?
            .text()
            .await
            .map_err(|source| FetchError::Http {
                url: endpoint.to_string(),
                source,
            })?;
        let image_url = image_url_from_search(&body, endpoint)?;

        let bytes = self
            .get(&image_url, None)
            .await?
            .bytes()
            .await
            .map_err(|source| FetchError::Http {
                url: image_url.clone(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(FetchError::NoImage {
                endpoint: image_url,
            });
        }

        info!(source = %source.key, url = %image_url, size = bytes.len(), "Fetched image");
        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            origin_url: image_url,
        })
    }
}
