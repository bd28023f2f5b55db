//! Tumblr: a single multipart photo post with tags.
//!
//! Tumblr answers a post to a blog the token cannot write to with a specific
//! message. That is a configuration problem no retry will fix, so the publisher
//! switches Tumblr off for the source and persists the change.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::Form;
use serde_json::Value;
use tracing::{error, info};

use super::oauth1::Credentials;
use super::{body_detail, foreign_config, image_part, is_success, oauth_header, read_reply};
use crate::config::{Platform, PlatformConfig, TumblrConfig};
use crate::contract::{PlatformToggle, Posted, Publisher, SkipReason};
use crate::error::PublishError;
use crate::normalize::ImageAsset;

const PLATFORM: Platform = Platform::Tumblr;

/// Text Tumblr returns when the blog does not belong to the authorised account.
pub const WRONG_BLOG_MESSAGE: &str = "You cannot post to this blog";

#[derive(Debug, PartialEq)]
pub enum Reply {
    Posted { id: String },
    WrongBlog,
    Failed { message: String },
}

/// Classifies a post reply by its payload, not just the HTTP status.
pub fn interpret_reply(http_status: u16, body: &str) -> Reply {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Reply::Failed {
            message: format!("HTTP {http_status} with a non-JSON body"),
        };
    };

    let meta_status = value
        .pointer("/meta/status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(http_status);
    if meta_status >= 300 || !is_success(http_status) {
        if mentions_wrong_blog(&value) {
            return Reply::WrongBlog;
        }
        let msg = value
            .pointer("/meta/msg")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        return Reply::Failed {
            message: format!("status {meta_status} ({msg})"),
        };
    }

    let id = ["/response/id_string", "/response/id", "/id"]
        .iter()
        .find_map(|p| match value.pointer(p) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });
    match id {
        Some(id) => Reply::Posted { id },
        None => Reply::Failed {
            message: "reply carried no post id".to_string(),
        },
    }
}

fn mentions_wrong_blog(value: &Value) -> bool {
    let matches = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .is_some_and(|s| s.contains(WRONG_BLOG_MESSAGE))
    };
    if matches(value.get("response")) {
        return true;
    }
    value
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors
                .iter()
                .any(|e| matches(e.get("detail")) || matches(e.get("title")))
        })
}

pub fn post_url(blogname: &str, id: &str) -> String {
    format!("https://{blogname}.tumblr.com/post/{id}")
}

fn credentials(cfg: &TumblrConfig) -> Credentials<'_> {
    Credentials {
        consumer_key: &cfg.consumer_key,
        consumer_secret: &cfg.consumer_secret,
        token: &cfg.oauth_token,
        token_secret: &cfg.oauth_token_secret,
    }
}

pub struct TumblrPublisher {
    client: reqwest::Client,
    toggle: Arc<dyn PlatformToggle>,
}

impl TumblrPublisher {
    pub fn new(client: reqwest::Client, toggle: Arc<dyn PlatformToggle>) -> Self {
        Self { client, toggle }
    }
}

#[async_trait]
impl Publisher for TumblrPublisher {
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
        let PlatformConfig::Tumblr(cfg) = config else {
            return Err(foreign_config(PLATFORM, config));
        };
        if !cfg.enabled {
            return Ok(Posted::Skipped(SkipReason::Disabled));
        }

        let form = Form::new()
            .text("type", "photo")
            .text("state", "published")
            .text("tags", cfg.tags.join(","))
            .part("data", image_part(PLATFORM, asset)?);
        let url = format!(
            "{}/v2/blog/{}/post",
            cfg.api_base.trim_end_matches('/'),
            cfg.blogname
        );
        let auth = oauth_header(PLATFORM, "POST", &url, &credentials(cfg))?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, auth)
            .multipart(form)
            .send()
            .await;
        let (status, body) = read_reply(PLATFORM, "photo post", response).await?;

        match interpret_reply(status, &body) {
            Reply::Posted { id } => {
                let url = post_url(&cfg.blogname, &id);
                info!(source = %source_key, %url, "Posted to Tumblr");
                Ok(Posted::Url(url))
            }
            Reply::WrongBlog => {
                // The match is on free text, so keep the raw reply for whoever has to check it.
                error!(
                    source = %source_key,
                    blog = %cfg.blogname,
                    status,
                    response = %body,
                    "Tumblr refused the post for this blog; disabling Tumblr for this source"
                );
                if let Err(e) = self.toggle.disable(source_key, PLATFORM) {
                    error!(source = %source_key, error = %e, "Failed to persist disabled Tumblr flag");
                }
                Err(PublishError::Misconfigured {
                    platform: PLATFORM,
                    message: format!(
                        "cannot post to blog {:?}; check the blogname and which account the token was issued for",
                        cfg.blogname
                    ),
                    detail: Some(body_detail(&body)),
                })
            }
            Reply::Failed { message } => {
                Err(PublishError::transient(PLATFORM, message).with_detail(body_detail(&body)))
            }
        }
    }
}
