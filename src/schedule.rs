//! Hourly trigger: wait for the top of the hour, take a fresh config snapshot,
//! run one cycle, repeat until cancelled.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, TimeZone};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::publish::{Pipeline, SourceOutcome};

/// The next whole hour strictly after `now`.
pub fn next_top_of_hour<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let hour = TimeDelta::hours(1);
    match now.clone().duration_trunc(hour) {
        Ok(start) => start + hour,
        Err(_) => now.clone() + hour,
    }
}

pub fn until_next_hour<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    (next_top_of_hour(now) - now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Runs a cycle at the top of every hour until `cancel` fires.
///
/// The config is reloaded before each cycle; if reloading fails the previous
/// snapshot is used again.
pub async fn run_hourly(store: &ConfigStore, pipeline: &Pipeline, cancel: &CancellationToken) {
    loop {
        let wait = until_next_hour(&chrono::Local::now());
        info!(wait_secs = wait.as_secs(), "Waiting for the next hour");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let config = match store.reload() {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, path = %store.path().display(), "Config reload failed, keeping previous snapshot");
                store.snapshot()
            }
        };

        let reports = pipeline.run_cycle(&config).await;
        let without_image = reports
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::NoImage { .. }))
            .count();
        info!(sources = reports.len(), without_image, "Hourly cycle complete");
        if cancel.is_cancelled() {
            break;
        }
    }
    info!("Scheduler stopped");
}
