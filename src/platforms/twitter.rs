//! Twitter/X: upload the media, then create a post that references it.
//!
//! The free API tier allows only a handful of posts a day, so posting is limited
//! to hours that are a multiple of `posting_interval_hours`, and a 429 on either
//! step is reported as a skip rather than a failure.

use async_trait::async_trait;
use chrono::Timelike;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::Form;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::oauth1::Credentials;
use super::{body_detail, foreign_config, image_part, is_success, oauth_header, read_reply};
use crate::config::{Platform, PlatformConfig, TwitterConfig};
use crate::contract::{ErrorDetail, Posted, Publisher, SkipReason};
use crate::error::PublishError;
use crate::normalize::ImageAsset;

const PLATFORM: Platform = Platform::Twitter;

/// Source of the local wall-clock hour.
pub trait Clock: Send + Sync {
    fn local_hour(&self) -> u32;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

pub fn within_window(hour: u32, interval_hours: u32) -> bool {
    interval_hours <= 1 || hour % interval_hours == 0
}

/// Result of one API step that went through.
#[derive(Debug, PartialEq)]
pub enum Step {
    Done(String),
    RateLimited,
}

/// Interprets a media upload or post creation reply. Both carry `data.id` on success.
pub fn interpret_reply(step: &str, status: u16, body: &str) -> Result<Step, PublishError> {
    if status == 429 {
        return Ok(Step::RateLimited);
    }
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if !is_success(status) {
        return Err(
            PublishError::transient(PLATFORM, format!("{step} returned HTTP {status}"))
                .with_detail(body_detail(body)),
        );
    }
    let Some(value) = parsed else {
        return Err(PublishError::transient(PLATFORM, format!("{step} returned a non-JSON body"))
            .with_detail(body_detail(body)));
    };

    let has_errors = value
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| !errors.is_empty());
    let id = value
        .pointer("/data/id")
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|id| !id.is_empty());

    match id {
        Some(id) if !has_errors => Ok(Step::Done(id)),
        _ => Err(
            PublishError::transient(PLATFORM, format!("{step} response carried errors or no id"))
                .with_detail(ErrorDetail::Json(value)),
        ),
    }
}

pub fn status_url(tweet_id: &str) -> String {
    format!("https://x.com/i/status/{tweet_id}")
}

fn credentials(cfg: &TwitterConfig) -> Credentials<'_> {
    Credentials {
        consumer_key: &cfg.consumer_key,
        consumer_secret: &cfg.consumer_secret,
        token: &cfg.access_token,
        token_secret: &cfg.access_token_secret,
    }
}

pub struct TwitterPublisher {
    client: reqwest::Client,
    clock: Box<dyn Clock>,
}

impl TwitterPublisher {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_clock(client, Box::new(SystemClock))
    }

    pub fn with_clock(client: reqwest::Client, clock: Box<dyn Clock>) -> Self {
        Self { client, clock }
    }

    async fn upload_media(&self, cfg: &TwitterConfig, asset: &ImageAsset) -> Result<Step, PublishError> {
        let step = "media upload";
        let form = Form::new()
            .text("media_category", "tweet_image")
            .part("media", image_part(PLATFORM, asset)?);
        let url = format!("{}/2/media/upload", cfg.api_base.trim_end_matches('/'));
        let auth = oauth_header(PLATFORM, "POST", &url, &credentials(cfg))?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, auth)
            .multipart(form)
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, step, response).await?;
        interpret_reply(step, status, &body)
    }

    async fn create_post(&self, cfg: &TwitterConfig, media_id: &str) -> Result<Step, PublishError> {
        let step = "post creation";
        let url = format!("{}/2/tweets", cfg.api_base.trim_end_matches('/'));
        let auth = oauth_header(PLATFORM, "POST", &url, &credentials(cfg))?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, auth)
            .json(&json!({ "media": { "media_ids": [media_id] } }))
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, step, response).await?;
        interpret_reply(step, status, &body)
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    async fn publish(
        &self,
        source_key: &str,
        config: &PlatformConfig,
        asset: &ImageAsset,
        _origin_url: &str,
    ) -> Result<Posted, PublishError> {
        let PlatformConfig::Twitter(cfg) = config else {
            return Err(foreign_config(PLATFORM, config));
        };
        if !cfg.enabled {
            return Ok(Posted::Skipped(SkipReason::Disabled));
        }
        let hour = self.clock.local_hour();
        if !within_window(hour, cfg.posting_interval_hours) {
            info!(
                source = %source_key,
                hour,
                interval = cfg.posting_interval_hours,
                "Outside Twitter posting window, skipping"
            );
            return Ok(Posted::Skipped(SkipReason::OutsideWindow { hour }));
        }

        let media_id = match self.upload_media(cfg, asset).await? {
            Step::Done(id) => id,
            Step::RateLimited => {
                warn!(source = %source_key, "Twitter rate limit hit during media upload, skipping post");
                return Ok(Posted::Skipped(SkipReason::RateLimited));
            }
        };
        match self.create_post(cfg, &media_id).await? {
            Step::Done(id) => {
                let url = status_url(&id);
                info!(source = %source_key, %url, "Posted to Twitter");
                Ok(Posted::Url(url))
            }
            Step::RateLimited => {
                warn!(source = %source_key, "Twitter rate limit hit, skipping post");
                Ok(Posted::Skipped(SkipReason::RateLimited))
            }
        }
    }
}
