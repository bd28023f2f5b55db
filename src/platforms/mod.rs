//! Platform publishers.
//!
//! Each publisher gets only its own [`PlatformConfig`], talks to one API over a
//! shared [`reqwest::Client`], and reports what happened as [`Posted`] or a
//! typed [`PublishError`]. Response interpretation lives in plain functions so
//! it can be tested without a network.
//!
//! [`Posted`]: crate::contract::Posted

pub mod bluesky;
pub mod oauth1;
pub mod tumblr;
pub mod twitter;

use std::sync::Arc;

use reqwest::multipart::Part;

use crate::config::{Platform, PlatformConfig};
use crate::contract::{ErrorDetail, PlatformToggle, Publisher};
use crate::error::PublishError;
use crate::normalize::ImageAsset;

pub use bluesky::BlueskyPublisher;
pub use tumblr::TumblrPublisher;
pub use twitter::{Clock, SystemClock, TwitterPublisher};

/// One publisher per platform, in [`Platform::ALL`] order.
pub fn default_publishers(
    client: reqwest::Client,
    toggle: Arc<dyn PlatformToggle>,
) -> Vec<Arc<dyn Publisher>> {
    vec![
        Arc::new(TwitterPublisher::new(client.clone())),
        Arc::new(TumblrPublisher::new(client.clone(), toggle)),
        Arc::new(BlueskyPublisher::new(client)),
    ]
}

/// Status and body of a response, with transport failures mapped to a transient error.
pub(crate) async fn read_reply(
    platform: Platform,
    step: &str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<(u16, String), PublishError> {
    let response = response.map_err(|e| PublishError::http(platform, step, e))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| PublishError::http(platform, step, e))?;
    Ok((status, body))
}

/// Keeps JSON bodies structured so notifications can attach them as `.json`.
pub(crate) fn body_detail(body: &str) -> ErrorDetail {
    serde_json::from_str(body)
        .map(ErrorDetail::Json)
        .unwrap_or_else(|_| ErrorDetail::Text(body.to_string()))
}

pub(crate) fn image_part(platform: Platform, asset: &ImageAsset) -> Result<Part, PublishError> {
    Part::bytes(asset.encoded().to_vec())
        .file_name(asset.file_name())
        .mime_str(asset.mime_type())
        .map_err(|e| PublishError::http(platform, "attaching image", e))
}

/// Signs one request with the account's OAuth 1.0a keys.
pub(crate) fn oauth_header(
    platform: Platform,
    method: &str,
    url: &str,
    credentials: &oauth1::Credentials<'_>,
) -> Result<String, PublishError> {
    oauth1::authorization(method, url, &[], credentials).map_err(|e| PublishError::Misconfigured {
        platform,
        message: format!("cannot sign request: {e}"),
        detail: None,
    })
}

/// A publisher was handed another platform's settings.
pub(crate) fn foreign_config(platform: Platform, config: &PlatformConfig) -> PublishError {
    PublishError::Misconfigured {
        platform,
        message: format!("received {} settings", config.platform()),
        detail: None,
    }
}

pub(crate) fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}
