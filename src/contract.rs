//! # contract: seams between the pipeline and the outside world
//!
//! The orchestrator in [`crate::publish`] only talks to these traits:
//! - [`ImageSource`] fetches raw bytes plus the URL they came from.
//! - [`Publisher`] posts a normalised image to one platform.
//! - [`Notifier`] delivers a human-readable outcome to a webhook.
//! - [`PlatformToggle`] lets a publisher switch its own platform off.
//!
//! ## Mocking & Testing
//! Every trait is annotated for `mockall`; the generated `Mock*` types are
//! exported under the `test-export-mocks` feature (on by default) so the
//! integration tests can drive a full cycle without network access.

use async_trait::async_trait;
use mockall::automock;
use std::fmt;

use crate::config::{Platform, PlatformConfig, SourceDescriptor};
use crate::error::{ConfigError, FetchError, NotifyError, PublishError};
use crate::normalize::ImageAsset;

/// Raw bytes as served by a source, together with where they were served from.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub origin_url: String,
}

/// Diagnostic payload attached to failures and forwarded to notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    Text(String),
    Json(serde_json::Value),
}

/// What a publisher achieved in a single call.
#[derive(Debug, Clone, PartialEq)]
pub enum Posted {
    /// Canonical link to the new post.
    Url(String),
    /// Nothing was posted, and that is fine.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// The platform only accepts posts at certain hours.
    OutsideWindow { hour: u32 },
    RateLimited,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("platform disabled"),
            SkipReason::OutsideWindow { hour } => {
                write!(f, "outside posting window (hour {hour})")
            }
            SkipReason::RateLimited => f.write_str("rate limit exceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Warning,
    Error,
}

/// A structured message for the notification sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub level: Level,
    pub url: Option<String>,
    pub error: Option<ErrorDetail>,
    /// Origin image, shown as a thumbnail when the sink supports it.
    pub image_url: Option<String>,
    pub mention_everyone: bool,
}

impl Notification {
    pub fn success(description: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: "Success".to_string(),
            description: description.into(),
            level: Level::Success,
            url: Some(url.into()),
            error: None,
            image_url: None,
            mention_everyone: false,
        }
    }

    pub fn failure(description: impl Into<String>, error: Option<ErrorDetail>) -> Self {
        Self {
            title: "Error".to_string(),
            description: description.into(),
            level: Level::Error,
            url: None,
            error,
            image_url: None,
            mention_everyone: true,
        }
    }

    pub fn skipped(description: impl Into<String>) -> Self {
        Self {
            title: "Skipped".to_string(),
            description: description.into(),
            level: Level::Warning,
            url: None,
            error: None,
            image_url: None,
            mention_everyone: false,
        }
    }

    pub fn with_image(mut self, image_url: Option<&str>) -> Self {
        self.image_url = image_url.map(str::to_string);
        self
    }
}

/// Something that can produce an image for a configured source.
///
/// Bytes and origin URL come back together or not at all.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, source: &SourceDescriptor) -> Result<FetchedImage, FetchError>;
}

/// One platform's publishing client.
///
/// A publisher sees only its own [`PlatformConfig`] plus the key of the source
/// it posts for. It must not touch shared state, and may only change its own
/// platform's `enabled` flag (through a [`PlatformToggle`]) when it detects a
/// permanent misconfiguration.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> Platform;

    async fn publish(
        &self,
        source_key: &str,
        config: &PlatformConfig,
        asset: &ImageAsset,
        origin_url: &str,
    ) -> Result<Posted, PublishError>;
}

/// Notification sink. `target` is the destination address (webhook URL).
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Persists "this platform is off" for one source.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait PlatformToggle: Send + Sync {
    fn disable(&self, source_key: &str, platform: Platform) -> Result<(), ConfigError>;
}
