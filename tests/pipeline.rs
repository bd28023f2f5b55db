//! Full cycles against mocked sources, publishers and notifier.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hourly_photos::config::{Config, Platform};
use hourly_photos::contract::{
    FetchedImage, Level, MockImageSource, MockNotifier, MockPublisher, Notification, Posted, Publisher,
    SkipReason,
};
use hourly_photos::error::{FetchError, NotifyError, PublishError};
use hourly_photos::publish::{Pipeline, PublishResult, SourceOutcome, Stage};
use image::{DynamicImage, ImageFormat, RgbImage};
use tokio_util::sync::CancellationToken;

const ORIGIN: &str = "https://cdn2.thecatapi.com/images/abc.jpg";

fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(40, 30, |x, y| image::Rgb([(x * 6) as u8, (y * 8) as u8, 90]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Cat source only, all three platforms on with webhooks, no retry delays.
fn config(scratch: &Path) -> Config {
    let mut config = Config::default_template();
    config.sources.truncate(1);
    config.settings.scratch_dir = scratch.to_path_buf();
    config.settings.fetch_retry_delay_secs = 0;
    config.settings.publish_retry_delay_secs = 0;
    config.settings.publish_attempts = 3;
    let cat = &mut config.sources[0];
    cat.alert_webhook = Some("https://hooks/alert".into());
    cat.twitter.enabled = true;
    cat.twitter.webhook = Some("https://hooks/twitter".into());
    cat.tumblr.enabled = true;
    cat.tumblr.webhook = Some("https://hooks/tumblr".into());
    cat.bluesky.enabled = true;
    cat.bluesky.webhook = Some("https://hooks/bluesky".into());
    config
}

fn good_source() -> MockImageSource {
    let mut source = MockImageSource::new();
    source.expect_fetch_image().returning(|_| {
        Ok(FetchedImage {
            bytes: png_bytes(),
            origin_url: ORIGIN.to_string(),
        })
    });
    source
}

fn publisher(
    platform: Platform,
    calls: Arc<AtomicUsize>,
    reply: impl Fn() -> Result<Posted, PublishError> + Send + Sync + 'static,
) -> Arc<dyn Publisher> {
    let mut p = MockPublisher::new();
    p.expect_platform().return_const(platform);
    p.expect_publish().returning(move |_, config, asset, origin| {
        assert_eq!(config.platform(), platform, "publisher got another platform's settings");
        assert!(asset.size_bytes() > 0);
        assert_eq!(origin, ORIGIN);
        calls.fetch_add(1, Ordering::SeqCst);
        reply()
    });
    Arc::new(p)
}

type Sent = Arc<Mutex<Vec<(String, Notification)>>>;

fn recording_notifier() -> (MockNotifier, Sent) {
    let sent: Sent = Arc::default();
    let log = sent.clone();
    let mut notifier = MockNotifier::new();
    notifier.expect_notify().returning(move |target, n| {
        log.lock().unwrap().push((target.to_string(), n.clone()));
        Ok(())
    });
    (notifier, sent)
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
}

#[tokio::test]
async fn one_failing_platform_does_not_affect_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let (twitter_calls, tumblr_calls, bluesky_calls) = (counter(), counter(), counter());
    let publishers = vec![
        publisher(Platform::Twitter, twitter_calls.clone(), || {
            Ok(Posted::Url("https://x.com/i/status/1".into()))
        }),
        publisher(Platform::Tumblr, tumblr_calls.clone(), || {
            Err(PublishError::transient(Platform::Tumblr, "status 500 (Internal Server Error)"))
        }),
        publisher(Platform::Bluesky, bluesky_calls.clone(), || {
            Ok(Posted::Url("https://bsky.app/profile/c/post/3k".into()))
        }),
    ];
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&config(dir.path())).await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.origin_url.as_deref(), Some(ORIGIN));
    assert_eq!(
        report.result(Platform::Twitter),
        Some(&PublishResult::Succeeded {
            url: "https://x.com/i/status/1".into()
        })
    );
    assert!(matches!(
        report.result(Platform::Tumblr),
        Some(PublishResult::Failed { reason, .. }) if reason.contains("gave up after 3 attempts")
    ));
    assert_eq!(
        report.result(Platform::Bluesky),
        Some(&PublishResult::Succeeded {
            url: "https://bsky.app/profile/c/post/3k".into()
        })
    );
    assert_eq!(twitter_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tumblr_calls.load(Ordering::SeqCst), 3);
    assert_eq!(bluesky_calls.load(Ordering::SeqCst), 1);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    let tumblr = sent.iter().find(|(t, _)| t == "https://hooks/tumblr").unwrap();
    assert_eq!(tumblr.1.level, Level::Error);
    assert!(tumblr.1.mention_everyone);
    assert_eq!(tumblr.1.image_url.as_deref(), Some(ORIGIN));
    let twitter = sent.iter().find(|(t, _)| t == "https://hooks/twitter").unwrap();
    assert_eq!(twitter.1.url.as_deref(), Some("https://x.com/i/status/1"));

    assert!(scratch_is_empty(dir.path()), "scratch image must be released");
}

#[tokio::test]
async fn rate_limit_is_a_single_call_skip() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sources[0].tumblr.enabled = false;
    cfg.sources[0].bluesky.enabled = false;

    let calls = counter();
    let publishers = vec![publisher(Platform::Twitter, calls.clone(), || {
        Ok(Posted::Skipped(SkipReason::RateLimited))
    })];
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(
        reports[0].result(Platform::Twitter),
        Some(&PublishResult::Skipped(SkipReason::RateLimited))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://hooks/twitter");
    assert_eq!(sent[0].1.level, Level::Warning);
}

#[tokio::test]
async fn outside_window_and_disabled_are_logged_not_notified() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sources[0].bluesky.enabled = false;

    let (twitter_calls, bluesky_calls) = (counter(), counter());
    let publishers = vec![
        publisher(Platform::Twitter, twitter_calls.clone(), || {
            Ok(Posted::Skipped(SkipReason::OutsideWindow { hour: 3 }))
        }),
        publisher(Platform::Bluesky, bluesky_calls.clone(), || {
            Ok(Posted::Url("https://bsky.app/profile/c/post/1".into()))
        }),
    ];
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(
        reports[0].result(Platform::Bluesky),
        Some(&PublishResult::Skipped(SkipReason::Disabled))
    );
    assert_eq!(bluesky_calls.load(Ordering::SeqCst), 0);
    assert_eq!(twitter_calls.load(Ordering::SeqCst), 1);
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failing_source_is_skipped_and_the_next_source_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    let mut dog = cfg.sources[0].clone();
    dog.key = "dog".into();
    dog.name = "TheDogAPI".into();
    cfg.sources.push(dog);

    let cat_fetches = counter();
    let fetches = cat_fetches.clone();
    let mut source = MockImageSource::new();
    source.expect_fetch_image().returning(move |s| {
        if s.key == "cat" {
            fetches.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status {
                url: "https://api.thecatapi.com".into(),
                status: 503,
            })
        } else {
            Ok(FetchedImage {
                bytes: png_bytes(),
                origin_url: ORIGIN.to_string(),
            })
        }
    });

    let mut twitter = MockPublisher::new();
    twitter.expect_platform().return_const(Platform::Twitter);
    twitter
        .expect_publish()
        .withf(|key, _, _, _| key.to_string() == "dog")
        .times(1)
        .returning(|_, _, _, _| Ok(Posted::Url("https://x.com/i/status/9".into())));
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(source),
        vec![Arc::new(twitter)],
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(reports.len(), 2);
    assert!(matches!(
        &reports[0].outcome,
        SourceOutcome::NoImage { stage: Stage::Fetch, reason } if reason.contains("503")
    ));
    assert_eq!(cat_fetches.load(Ordering::SeqCst), 3);
    assert_eq!(
        reports[1].result(Platform::Twitter),
        Some(&PublishResult::Succeeded {
            url: "https://x.com/i/status/9".into()
        })
    );

    let sent = sent.lock().unwrap();
    let alert = sent.iter().find(|(t, _)| t == "https://hooks/alert").unwrap();
    assert_eq!(alert.1.level, Level::Error);
}

#[tokio::test]
async fn empty_and_undecodable_fetches_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sources[0].tumblr.enabled = false;
    cfg.sources[0].bluesky.enabled = false;

    let fetches = counter();
    let n = fetches.clone();
    let mut source = MockImageSource::new();
    source.expect_fetch_image().returning(move |_| {
        let bytes = match n.fetch_add(1, Ordering::SeqCst) {
            0 => Vec::new(),
            1 => b"<html>not an image</html>".to_vec(),
            _ => png_bytes(),
        };
        Ok(FetchedImage {
            bytes,
            origin_url: ORIGIN.to_string(),
        })
    });

    let calls = counter();
    let publishers = vec![publisher(Platform::Twitter, calls.clone(), || {
        Ok(Posted::Url("https://x.com/i/status/2".into()))
    })];
    let (notifier, _) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(source),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(fetches.load(Ordering::SeqCst), 3);
    assert!(matches!(
        reports[0].result(Platform::Twitter),
        Some(PublishResult::Succeeded { .. })
    ));
}

#[tokio::test]
async fn misconfiguration_is_not_retried_and_is_reported_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sources[0].twitter.enabled = false;
    cfg.sources[0].bluesky.enabled = false;

    let calls = counter();
    let publishers = vec![publisher(Platform::Tumblr, calls.clone(), || {
        Err(PublishError::Misconfigured {
            platform: Platform::Tumblr,
            message: "cannot post to blog \"notmine\"".into(),
            detail: None,
        })
    })];
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        reports[0].result(Platform::Tumblr),
        Some(PublishResult::Failed { reason, .. }) if reason.contains("misconfigured")
    ));
    assert_eq!(sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn budget_failure_stops_the_source_without_publishing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.settings.max_image_bytes = 10;
    cfg.settings.max_compression_passes = 2;

    let calls = counter();
    let publishers = vec![publisher(Platform::Twitter, calls.clone(), || {
        Ok(Posted::Url("https://x.com/i/status/3".into()))
    })];
    let (notifier, _) = recording_notifier();
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&cfg).await;

    assert!(matches!(
        &reports[0].outcome,
        SourceOutcome::NoImage { stage: Stage::Normalize, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn cancelled_pipeline_starts_no_source() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut source = MockImageSource::new();
    source.expect_fetch_image().times(0);
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(Arc::new(source), Vec::new(), Arc::new(notifier), cancel);

    let reports = pipeline.run_cycle(&config(dir.path())).await;

    assert!(reports.is_empty());
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_mid_publish_still_reports_what_was_posted() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.sources[0].bluesky.enabled = false;
    // Long enough that only the shutdown can end Tumblr's retry wait.
    cfg.settings.publish_retry_delay_secs = 30;

    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    let (twitter_calls, tumblr_calls) = (counter(), counter());
    let publishers = vec![
        publisher(Platform::Twitter, twitter_calls.clone(), || {
            Ok(Posted::Url("https://x.com/i/status/5".into()))
        }),
        publisher(Platform::Tumblr, tumblr_calls.clone(), move || {
            trip.cancel();
            Err(PublishError::transient(Platform::Tumblr, "status 503 (Service Unavailable)"))
        }),
    ];
    let (notifier, sent) = recording_notifier();
    let pipeline = Pipeline::new(Arc::new(good_source()), publishers, Arc::new(notifier), cancel);

    let reports = pipeline.run_cycle(&cfg).await;

    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].outcome, SourceOutcome::Published(_)));
    assert_eq!(
        reports[0].result(Platform::Twitter),
        Some(&PublishResult::Succeeded {
            url: "https://x.com/i/status/5".into()
        })
    );
    assert_eq!(reports[0].result(Platform::Tumblr), Some(&PublishResult::Cancelled));
    assert_eq!(tumblr_calls.load(Ordering::SeqCst), 1);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1, "only the real outcome is notified");
    assert_eq!(sent[0].0, "https://hooks/twitter");
    assert_eq!(sent[0].1.level, Level::Success);
    assert!(scratch_is_empty(dir.path()));
}

#[tokio::test]
async fn failed_notification_delivery_is_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let (twitter_calls, tumblr_calls, bluesky_calls) = (counter(), counter(), counter());
    let publishers = vec![
        publisher(Platform::Twitter, twitter_calls.clone(), || {
            Ok(Posted::Url("https://x.com/i/status/6".into()))
        }),
        publisher(Platform::Tumblr, tumblr_calls.clone(), || {
            Err(PublishError::transient(Platform::Tumblr, "status 500 (Internal Server Error)"))
        }),
        publisher(Platform::Bluesky, bluesky_calls.clone(), || {
            Ok(Posted::Url("https://bsky.app/profile/c/post/6".into()))
        }),
    ];
    let deliveries = counter();
    let attempts = deliveries.clone();
    let mut notifier = MockNotifier::new();
    notifier.expect_notify().returning(move |_, _| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Status {
            status: 500,
            body: "discord is down".into(),
        })
    });
    let pipeline = Pipeline::new(
        Arc::new(good_source()),
        publishers,
        Arc::new(notifier),
        CancellationToken::new(),
    );

    let reports = pipeline.run_cycle(&config(dir.path())).await;

    assert_eq!(twitter_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tumblr_calls.load(Ordering::SeqCst), 3);
    assert_eq!(bluesky_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        reports[0].result(Platform::Twitter),
        Some(PublishResult::Succeeded { .. })
    ));
    assert!(matches!(
        reports[0].result(Platform::Tumblr),
        Some(PublishResult::Failed { .. })
    ));
    assert!(matches!(
        reports[0].result(Platform::Bluesky),
        Some(PublishResult::Succeeded { .. })
    ));
    assert_eq!(deliveries.load(Ordering::SeqCst), 3, "every outcome was still attempted");
    assert!(scratch_is_empty(dir.path()));
}
