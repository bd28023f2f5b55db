//! Error taxonomy for the publish pipeline.
//!
//! Every error knows whether repeating the operation could help
//! ([`FetchError::is_retryable`], [`PublishError::is_retryable`], ...). The
//! retry wrapper and the orchestrator use that answer to choose between
//! "try again", "skip" and "give up" without inspecting messages.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::Platform;
use crate::contract::ErrorDetail;

/// Failure to obtain raw image bytes from a source API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{endpoint} returned no image url")]
    NoImage { endpoint: String },

    #[error("could not read search response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl FetchError {
    /// Upstream image APIs are flaky; every fetch failure is worth another try.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Failure to turn fetched bytes into a publishable [`crate::normalize::ImageAsset`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("image could not be decoded: {0}")]
    InvalidImage(#[source] image::ImageError),

    #[error("unsupported image type: {format}")]
    UnsupportedFormat { format: String },

    #[error("image could not be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("image is still {size} bytes after {passes} passes (budget {budget} bytes)")]
    BudgetUnreachable { passes: u32, size: u64, budget: u64 },

    #[error("scratch file {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NormalizeError {
    /// A bad image is the source's fault, so a fresh fetch may fix it.
    /// Encoder, budget and disk failures will not go away on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NormalizeError::InvalidImage(_) | NormalizeError::UnsupportedFormat { .. }
        )
    }
}

/// Failure of one publish attempt on one platform.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{platform}: {message}")]
    Transient {
        platform: Platform,
        message: String,
        detail: Option<ErrorDetail>,
    },

    /// The platform configuration is wrong and the platform has been disabled.
    #[error("{platform} misconfigured: {message}")]
    Misconfigured {
        platform: Platform,
        message: String,
        detail: Option<ErrorDetail>,
    },
}

impl PublishError {
    pub fn transient(platform: Platform, message: impl Into<String>) -> Self {
        PublishError::Transient {
            platform,
            message: message.into(),
            detail: None,
        }
    }

    /// Wraps a transport error (connect failure, timeout, bad body) from one request step.
    pub fn http(platform: Platform, step: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() { "timed out" } else { "failed" };
        PublishError::Transient {
            platform,
            message: format!("{step} {kind}"),
            detail: Some(ErrorDetail::Text(err.to_string())),
        }
    }

    pub fn with_detail(mut self, new_detail: ErrorDetail) -> Self {
        match &mut self {
            PublishError::Transient { detail, .. } | PublishError::Misconfigured { detail, .. } => {
                *detail = Some(new_detail)
            }
        }
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Transient { .. })
    }

    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            PublishError::Transient { detail, .. } | PublishError::Misconfigured { detail, .. } => {
                detail.as_ref()
            }
        }
    }
}

/// Failure to deliver a notification. Always logged and swallowed by callers.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("webhook payload could not be serialised: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("webhook still rate limited after {0} tries")]
    RateLimited(u32),

    #[error("shutdown while waiting out a webhook rate limit")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialise config: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no config found, wrote a default one to {path}; fill in credentials and enable platforms")]
    TemplateCreated { path: PathBuf },

    #[error("no source with key {0:?} in config")]
    UnknownSource(String),
}
