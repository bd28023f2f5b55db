//! Bluesky over plain XRPC: log in, upload the blob, create the post record.
//!
//! Every step is a separate request and any of them failing fails the attempt;
//! the retry wrapper then starts again from a fresh session.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{body_detail, foreign_config, is_success, read_reply};
use crate::config::{BlueskyConfig, Platform, PlatformConfig};
use crate::contract::{ErrorDetail, Posted, Publisher, SkipReason};
use crate::error::PublishError;
use crate::normalize::ImageAsset;

const PLATFORM: Platform = Platform::Bluesky;

static POST_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^at://([^/]+)/app\.bsky\.feed\.post/([A-Za-z0-9._:~-]+)$")
        .expect("post uri pattern is valid")
});

struct Session {
    did: String,
    access_jwt: String,
}

/// Record key of an `app.bsky.feed.post` AT-URI.
pub fn post_rkey(uri: &str) -> Option<String> {
    POST_URI.captures(uri).map(|c| c[2].to_string())
}

pub fn post_url(username: &str, uri: &str) -> Option<String> {
    post_rkey(uri).map(|rkey| format!("https://bsky.app/profile/{username}/post/{rkey}"))
}

/// The `app.bsky.feed.post` record for a single image with no text.
pub fn post_record(blob: Value, alt_text: &str, width: u32, height: u32, created_at: &str) -> Value {
    json!({
        "$type": "app.bsky.feed.post",
        "text": "",
        "createdAt": created_at,
        "embed": {
            "$type": "app.bsky.embed.images",
            "images": [{
                "alt": alt_text,
                "image": blob,
                "aspectRatio": { "width": width, "height": height },
            }],
        },
    })
}

fn expect_json(step: &str, status: u16, body: &str) -> Result<Value, PublishError> {
    if !is_success(status) {
        return Err(
            PublishError::transient(PLATFORM, format!("{step} returned HTTP {status}"))
                .with_detail(body_detail(body)),
        );
    }
    serde_json::from_str(body).map_err(|e| {
        PublishError::transient(PLATFORM, format!("{step} returned unreadable JSON: {e}"))
            .with_detail(body_detail(body))
    })
}

fn field<'a>(step: &str, value: &'a Value, pointer: &str) -> Result<&'a Value, PublishError> {
    value.pointer(pointer).ok_or_else(|| {
        PublishError::transient(PLATFORM, format!("{step} reply is missing {pointer}"))
            .with_detail(ErrorDetail::Json(value.clone()))
    })
}

fn str_field(step: &str, value: &Value, pointer: &str) -> Result<String, PublishError> {
    field(step, value, pointer)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PublishError::transient(PLATFORM, format!("{step} reply has a non-string {pointer}")))
}

pub struct BlueskyPublisher {
    client: reqwest::Client,
}

impl BlueskyPublisher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn xrpc(cfg: &BlueskyConfig, method: &str) -> String {
        format!("{}/xrpc/{method}", cfg.service.trim_end_matches('/'))
    }

    async fn login(&self, cfg: &BlueskyConfig) -> Result<Session, PublishError> {
        let step = "login";
        let response = self
            .client
            .post(Self::xrpc(cfg, "com.atproto.server.createSession"))
            .json(&json!({ "identifier": cfg.username, "password": cfg.app_password }))
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, step, response).await?;
        let value = expect_json(step, status, &body)?;
        Ok(Session {
            did: str_field(step, &value, "/did")?,
            access_jwt: str_field(step, &value, "/accessJwt")?,
        })
    }

    async fn upload_blob(&self, cfg: &BlueskyConfig, session: &Session, asset: &ImageAsset) -> Result<Value, PublishError> {
        let step = "blob upload";
        let response = self
            .client
            .post(Self::xrpc(cfg, "com.atproto.repo.uploadBlob"))
            .bearer_auth(&session.access_jwt)
            .header(reqwest::header::CONTENT_TYPE, asset.mime_type())
            .body(asset.encoded().to_vec())
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, step, response).await?;
        let value = expect_json(step, status, &body)?;
        field(step, &value, "/blob").cloned()
    }

    async fn create_record(&self, cfg: &BlueskyConfig, session: &Session, record: Value) -> Result<String, PublishError> {
        let step = "post creation";
        let response = self
            .client
            .post(Self::xrpc(cfg, "com.atproto.repo.createRecord"))
            .bearer_auth(&session.access_jwt)
            .json(&json!({
                "repo": session.did,
                "collection": "app.bsky.feed.post",
                "record": record,
            }))
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, step, response).await?;
        let value = expect_json(step, status, &body)?;
        str_field(step, &value, "/uri")
    }
}

#[async_trait]
impl Publisher for BlueskyPublisher {
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
        let PlatformConfig::Bluesky(cfg) = config else {
            return Err(foreign_config(PLATFORM, config));
        };
        if !cfg.enabled {
            return Ok(Posted::Skipped(SkipReason::Disabled));
        }

        let session = self.login(cfg).await?;
        debug!(source = %source_key, did = %session.did, "Logged in to Bluesky");
        let blob = self.upload_blob(cfg, &session, asset).await?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let record = post_record(blob, &cfg.alt_text, asset.width(), asset.height(), &created_at);
        let uri = self.create_record(cfg, &session, record).await?;

        let url = post_url(&cfg.username, &uri).ok_or_else(|| {
            PublishError::transient(PLATFORM, format!("unexpected post uri {uri:?}"))
        })?;
        info!(source = %source_key, %url, "Posted to Bluesky");
        Ok(Posted::Url(url))
    }
}
