pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod load_config;
pub mod normalize;
pub mod notify;
pub mod platforms;
pub mod publish;
pub mod retry;
pub mod schedule;
pub mod sources;

use std::time::Duration;

pub const USER_AGENT: &str = concat!("HourlyAnimalPhotos/", env!("CARGO_PKG_VERSION"));

/// The one HTTP client shared by sources, publishers and the notifier.
///
/// Every request carries `timeout`; hitting it fails that attempt like any other error.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}
