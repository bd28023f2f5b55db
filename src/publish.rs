//! Coordinating module for the fetch-normalise-publish cycle.
//!
//! Per source: fetch, validate and normalise under one retry budget, publish to
//! every platform concurrently under a retry budget each, notify once all
//! platforms have resolved, then release the image. Nothing that goes wrong for
//! one source stops the next one.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, Platform, PlatformConfig, SourceDescriptor};
use crate::contract::{
    ErrorDetail, FetchedImage, ImageSource, Notification, Notifier, Posted, Publisher, SkipReason,
};
use crate::error::{FetchError, NormalizeError, PublishError};
use crate::normalize::{normalize, ImageAsset, NormalizeSettings};
use crate::retry::{retry, Attempt, RetryError, RetryPolicy};

/// Where a source's cycle stopped when no image could be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Validate,
    Normalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Validate => "validation",
            Stage::Normalize => "normalisation",
        })
    }
}

/// Outcome of one platform for one source in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishResult {
    Skipped(SkipReason),
    Succeeded { url: String },
    Failed {
        reason: String,
        detail: Option<ErrorDetail>,
    },
    /// Shutdown arrived before this platform reached an outcome.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    /// Every platform resolved (or was cut short by shutdown); results in publisher order.
    Published(Vec<(Platform, PublishResult)>),
    /// No usable image, so no platform was attempted.
    NoImage { stage: Stage, reason: String },
    Cancelled,
}

/// Everything that happened to one source in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub source_key: String,
    pub source_name: String,
    pub origin_url: Option<String>,
    pub outcome: SourceOutcome,
}

impl CycleReport {
    pub fn result(&self, platform: Platform) -> Option<&PublishResult> {
        match &self.outcome {
            SourceOutcome::Published(results) => results
                .iter()
                .find(|(p, _)| *p == platform)
                .map(|(_, r)| r),
            _ => None,
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source_name, self.source_key)?;
        if let Some(url) = &self.origin_url {
            write!(f, " <- {url}")?;
        }
        match &self.outcome {
            SourceOutcome::Published(results) => {
                for (platform, result) in results {
                    match result {
                        PublishResult::Succeeded { url } => write!(f, "\n  {platform}: posted {url}")?,
                        PublishResult::Skipped(reason) => write!(f, "\n  {platform}: skipped, {reason}")?,
                        PublishResult::Failed { reason, .. } => write!(f, "\n  {platform}: FAILED, {reason}")?,
                        PublishResult::Cancelled => write!(f, "\n  {platform}: cancelled")?,
                    }
                }
                Ok(())
            }
            SourceOutcome::NoImage { stage, reason } => {
                write!(f, "\n  no image ({stage} failed): {reason}")
            }
            SourceOutcome::Cancelled => write!(f, "\n  cancelled"),
        }
    }
}

#[derive(Debug, Error)]
enum AcquireError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("normalisation worker failed: {0}")]
    Worker(String),
}

impl AcquireError {
    fn is_retryable(&self) -> bool {
        match self {
            AcquireError::Fetch(e) => e.is_retryable(),
            AcquireError::Normalize(e) => e.is_retryable(),
            AcquireError::Worker(_) => false,
        }
    }

    fn stage(&self) -> Stage {
        match self {
            AcquireError::Fetch(_) => Stage::Fetch,
            AcquireError::Normalize(NormalizeError::UnsupportedFormat { .. }) => Stage::Validate,
            AcquireError::Normalize(_) | AcquireError::Worker(_) => Stage::Normalize,
        }
    }
}

/// The publish orchestrator. Holds its collaborators, never the config.
pub struct Pipeline {
    source: Arc<dyn ImageSource>,
    publishers: Vec<Arc<dyn Publisher>>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn ImageSource>,
        publishers: Vec<Arc<dyn Publisher>>,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            publishers,
            notifier,
            cancel,
        }
    }

    /// Runs one cycle over every enabled source, one source at a time.
    pub async fn run_cycle(&self, config: &Config) -> Vec<CycleReport> {
        let span = info_span!("cycle", id = %Uuid::new_v4());
        self.run_sources(config).instrument(span).await
    }

    async fn run_sources(&self, config: &Config) -> Vec<CycleReport> {
        let selected: Vec<&SourceDescriptor> = config
            .sources
            .iter()
            .filter(|s| {
                let take = s.enabled && s.any_platform_enabled();
                if !take {
                    debug!(source = %s.key, "[CYCLE] Source disabled or has no enabled platform, skipping");
                }
                take
            })
            .collect();
        info!(sources = selected.len(), "[CYCLE] Starting cycle");

        let mut reports = Vec::with_capacity(selected.len());
        for source in selected {
            if self.cancel.is_cancelled() {
                info!("[CYCLE] Shutdown requested, not starting further sources");
                break;
            }
            let span = info_span!("source", source = %source.key);
            let report = self.process_source(config, source).instrument(span).await;
            reports.push(report);
        }

        info!(sources = reports.len(), "[CYCLE] Cycle finished");
        reports
    }

    /// Runs one source through the whole state machine. Always yields a report.
    pub async fn process_source(&self, config: &Config, source: &SourceDescriptor) -> CycleReport {
        let settings = &config.settings;
        let mut report = CycleReport {
            source_key: source.key.clone(),
            source_name: source.name.clone(),
            origin_url: None,
            outcome: SourceOutcome::Cancelled,
        };

        let (asset, origin_url) = match self
            .acquire(source, settings.fetch_policy(), settings.normalize_settings())
            .await
        {
            Ok(acquired) => acquired,
            Err(RetryError::Cancelled) => {
                info!("[CYCLE] Cancelled while fetching");
                return report;
            }
            Err(e) => {
                let stage = e.error().map(AcquireError::stage).unwrap_or(Stage::Fetch);
                let reason = describe(&e);
                error!(%stage, reason = %reason, "[CYCLE] No usable image, skipping source this cycle");
                report.outcome = SourceOutcome::NoImage { stage, reason };
                self.report(source, &report).await;
                return report;
            }
        };
        report.origin_url = Some(origin_url.clone());

        let results = self
            .publish_all(source, &asset, &origin_url, settings.publish_policy())
            .await;
        report.outcome = SourceOutcome::Published(results);

        self.report(source, &report).await;

        if let Err(e) = asset.cleanup() {
            warn!(error = %e, "[CYCLE] Failed to remove scratch image");
        }
        report
    }

    async fn acquire(
        &self,
        source: &SourceDescriptor,
        policy: RetryPolicy,
        normalize_settings: NormalizeSettings,
    ) -> Result<(ImageAsset, String), RetryError<AcquireError>> {
        let what = format!("{} image", source.key);
        retry(policy, &self.cancel, &what, |_| {
            let settings = normalize_settings.clone();
            async move {
                let FetchedImage { bytes, origin_url } = match self.source.fetch_image(source).await {
                    Ok(fetched) => fetched,
                    Err(e) => return Attempt::classify(Err(AcquireError::from(e)), AcquireError::is_retryable),
                };
                if bytes.is_empty() || origin_url.is_empty() {
                    return Attempt::Empty;
                }
                let normalized = tokio::task::spawn_blocking(move || normalize(bytes, &settings))
                    .await
                    .map_err(|e| AcquireError::Worker(e.to_string()))
                    .and_then(|r| r.map_err(AcquireError::from));
                Attempt::classify(
                    normalized.map(|asset| (asset, origin_url)),
                    AcquireError::is_retryable,
                )
            }
        })
        .await
    }

    async fn publish_all(
        &self,
        source: &SourceDescriptor,
        asset: &ImageAsset,
        origin_url: &str,
        policy: RetryPolicy,
    ) -> Vec<(Platform, PublishResult)> {
        let attempts = self.publishers.iter().map(|publisher| async move {
            let platform = publisher.platform();
            let config = source.platform_config(platform);
            if !config.enabled() {
                return (platform, PublishResult::Skipped(SkipReason::Disabled));
            }
            let span = info_span!("publish", %platform);
            let result = self
                .publish_one(publisher.as_ref(), &source.key, &config, asset, origin_url, policy)
                .instrument(span)
                .await;
            (platform, result)
        });
        join_all(attempts).await
    }

    async fn publish_one(
        &self,
        publisher: &dyn Publisher,
        source_key: &str,
        config: &PlatformConfig,
        asset: &ImageAsset,
        origin_url: &str,
        policy: RetryPolicy,
    ) -> PublishResult {
        let what = format!("{source_key} {}", config.platform());
        let outcome = retry(policy, &self.cancel, &what, |_| async move {
            match publisher.publish(source_key, config, asset, origin_url).await {
                Ok(Posted::Url(url)) if url.is_empty() => Attempt::Empty,
                other => Attempt::classify(other, PublishError::is_retryable),
            }
        })
        .await;

        match outcome {
            Ok(Posted::Url(url)) => {
                info!(%url, "[CYCLE] Published");
                PublishResult::Succeeded { url }
            }
            Ok(Posted::Skipped(reason)) => {
                info!(%reason, "[CYCLE] Platform skipped");
                PublishResult::Skipped(reason)
            }
            Err(RetryError::Cancelled) => {
                info!("[CYCLE] Cancelled before the platform resolved");
                PublishResult::Cancelled
            }
            Err(e) => {
                let reason = describe(&e);
                error!(reason = %reason, "[CYCLE] Publishing failed");
                PublishResult::Failed {
                    detail: e.error().and_then(|pe| pe.detail().cloned()),
                    reason,
                }
            }
        }
    }

    /// Sends one notification per terminal outcome. Delivery problems are logged only.
    async fn report(&self, source: &SourceDescriptor, report: &CycleReport) {
        let image = report.origin_url.as_deref();
        let deliveries: Vec<(Option<&str>, Notification)> = match &report.outcome {
            SourceOutcome::Cancelled => Vec::new(),
            SourceOutcome::NoImage { stage, reason } => vec![(
                source.alert_webhook.as_deref().filter(|h| !h.is_empty()),
                Notification::failure(
                    format!("Could not get an image from {} ({stage} failed).", source.name),
                    Some(ErrorDetail::Text(reason.clone())),
                ),
            )],
            SourceOutcome::Published(results) => results
                .iter()
                .filter_map(|(platform, result)| {
                    let notification = match result {
                        PublishResult::Succeeded { url } => Some(Notification::success(
                            format!("Posted a {} photo to {platform}.", source.name),
                            url.clone(),
                        )),
                        PublishResult::Failed { reason, detail } => Some(Notification::failure(
                            format!("Failed to post to {platform}: {reason}"),
                            detail.clone().or_else(|| Some(ErrorDetail::Text(reason.clone()))),
                        )),
                        PublishResult::Skipped(SkipReason::RateLimited) => Some(Notification::skipped(
                            format!("{platform} rate limit exceeded, skipped this post."),
                        )),
                        PublishResult::Skipped(_) | PublishResult::Cancelled => None,
                    }?;
                    Some((source.platform_webhook(*platform), notification.with_image(image)))
                })
                .collect(),
        };

        for (target, notification) in deliveries {
            let Some(target) = target else {
                debug!(title = %notification.title, "[CYCLE] No webhook configured, not notifying");
                continue;
            };
            if let Err(e) = self.notifier.notify(target, &notification).await {
                warn!(error = %e, title = %notification.title, "[CYCLE] Failed to deliver notification");
            }
        }
    }
}

fn describe<E: fmt::Display>(err: &RetryError<E>) -> String {
    match err {
        RetryError::Exhausted {
            attempts,
            last: Some(e),
        } => format!("gave up after {attempts} attempts: {e}"),
        RetryError::Exhausted { attempts, last: None } => {
            format!("gave up after {attempts} attempts: nothing returned")
        }
        RetryError::Aborted { error, .. } => error.to_string(),
        RetryError::Cancelled => "cancelled".to_string(),
    }
}
