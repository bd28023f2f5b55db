//! Discord webhook notification sink.
//!
//! A notification becomes one embed. Error details travel as an attachment
//! (`error.txt` or `response.json`), which forces a multipart request with the
//! JSON in `payload_json`. Discord's 429 replies carry `retry_after`; the sink
//! waits and tries again a bounded number of times, unless shutdown cuts the
//! wait short.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contract::{ErrorDetail, Level, Notification, Notifier};
use crate::error::NotifyError;

pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const DEFAULT_RETRY_AFTER_SECS: f64 = 5.0;
const MAX_RETRY_AFTER_SECS: f64 = 60.0;

const GREEN: u32 = 0x00FF00;
const AMBER: u32 = 0xFFA500;
const RED: u32 = 0xFF0000;

/// File attached next to the embed.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: &'static str,
    pub bytes: Vec<u8>,
}

pub fn colour(level: Level) -> u32 {
    match level {
        Level::Success => GREEN,
        Level::Warning => AMBER,
        Level::Error => RED,
    }
}

/// Webhook JSON body plus the optional attachment it refers to.
pub fn build_payload(notification: &Notification) -> Result<(Value, Option<Attachment>), NotifyError> {
    let mut embed = json!({
        "title": notification.title,
        "description": notification.description,
        "color": colour(notification.level),
    });
    if let Some(url) = &notification.url {
        embed["fields"] = json!([{ "name": "URL", "value": url, "inline": false }]);
    }
    if let Some(image) = &notification.image_url {
        embed["thumbnail"] = json!({ "url": image });
    }

    let mut payload = json!({ "embeds": [embed] });
    if notification.mention_everyone {
        payload["content"] = json!("@everyone");
    }

    let attachment = match &notification.error {
        None => None,
        Some(ErrorDetail::Text(text)) => Some(Attachment {
            filename: "error.txt",
            bytes: text.clone().into_bytes(),
        }),
        Some(ErrorDetail::Json(value)) => Some(Attachment {
            filename: "response.json",
            bytes: serde_json::to_vec_pretty(value)?,
        }),
    };
    if let Some(file) = &attachment {
        payload["attachments"] = json!([{ "id": 0, "filename": file.filename }]);
    }
    Ok((payload, attachment))
}

/// Seconds to wait from a 429 body, clamped to something sane.
pub fn retry_after(body: &str) -> Duration {
    let secs = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(Value::as_f64))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs_f64(secs.clamp(0.0, MAX_RETRY_AFTER_SECS))
}

pub struct DiscordWebhook {
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl DiscordWebhook {
    pub fn new(client: reqwest::Client, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    async fn send_once(
        &self,
        target: &str,
        payload: &Value,
        attachment: Option<&Attachment>,
    ) -> Result<reqwest::Response, NotifyError> {
        let request = self.client.post(target);
        let request = match attachment {
            None => request.json(payload),
            Some(file) => {
                let part = Part::bytes(file.bytes.clone()).file_name(file.filename);
                let form = Form::new()
                    .text("payload_json", serde_json::to_string(payload)?)
                    .part("files[0]", part);
                request.multipart(form)
            }
        };
        Ok(request.send().await?)
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    async fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        let (payload, attachment) = build_payload(notification)?;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self.send_once(target, &payload, attachment.as_ref()).await?;
            let status = response.status();
            if status.is_success() {
                debug!(title = %notification.title, "Notification delivered");
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() != 429 {
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            if attempt == MAX_RATE_LIMIT_RETRIES {
                break;
            }
            let wait = retry_after(&body);
            warn!(attempt = attempt + 1, wait_secs = wait.as_secs_f64(), "Webhook rate limited, waiting");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(title = %notification.title, "Shutdown requested, dropping rate-limited notification");
                    return Err(NotifyError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        Err(NotifyError::RateLimited(MAX_RATE_LIMIT_RETRIES))
    }
}
