use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::contract::PlatformToggle;
use crate::error::ConfigError;
use crate::normalize::NormalizeSettings;
use crate::retry::RetryPolicy;

/// A destination the pipeline can publish to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Tumblr,
    Bluesky,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Twitter, Platform::Tumblr, Platform::Bluesky];
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Twitter => "Twitter",
            Platform::Tumblr => "Tumblr",
            Platform::Bluesky => "Bluesky",
        })
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// Knobs shared by every source and platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Byte budget for the encoded image, decimal (1 MB = 1,000,000 bytes).
    pub max_image_bytes: u64,
    pub fetch_attempts: u32,
    pub fetch_retry_delay_secs: u64,
    pub publish_attempts: u32,
    pub publish_retry_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub max_compression_passes: u32,
    pub reduced_quality: u8,
    pub scratch_dir: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_image_bytes: 1_000_000,
            fetch_attempts: 3,
            fetch_retry_delay_secs: 5,
            publish_attempts: 3,
            publish_retry_delay_secs: 10,
            request_timeout_secs: 30,
            max_compression_passes: 32,
            reduced_quality: 75,
            scratch_dir: PathBuf::from("./jobs"),
        }
    }
}

impl PipelineSettings {
    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_attempts,
            Duration::from_secs(self.fetch_retry_delay_secs),
        )
    }

    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_attempts,
            Duration::from_secs(self.publish_retry_delay_secs),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn normalize_settings(&self) -> NormalizeSettings {
        NormalizeSettings {
            max_bytes: self.max_image_bytes,
            reduced_quality: self.reduced_quality,
            max_passes: self.max_compression_passes,
            scratch_dir: self.scratch_dir.clone(),
            ..NormalizeSettings::default()
        }
    }
}

/// Static identity of an image source plus the platforms it feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub key: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Key picked up from `<KEY>_API_KEY` at load time; never written back to disk.
    #[serde(skip)]
    pub env_api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Webhook for failures that happen before any platform is attempted.
    #[serde(default)]
    pub alert_webhook: Option<String>,
    #[serde(default)]
    pub twitter: TwitterConfig,
    #[serde(default)]
    pub tumblr: TumblrConfig,
    #[serde(default)]
    pub bluesky: BlueskyConfig,
}

impl SourceDescriptor {
    pub fn api_key(&self) -> &str {
        match &self.env_api_key {
            Some(key) if self.api_key.is_empty() => key,
            _ => &self.api_key,
        }
    }

    pub fn platform_enabled(&self, platform: Platform) -> bool {
        match platform {
            Platform::Twitter => self.twitter.enabled,
            Platform::Tumblr => self.tumblr.enabled,
            Platform::Bluesky => self.bluesky.enabled,
        }
    }

    pub fn any_platform_enabled(&self) -> bool {
        Platform::ALL.iter().any(|p| self.platform_enabled(*p))
    }

    pub fn platform_webhook(&self, platform: Platform) -> Option<&str> {
        let hook = match platform {
            Platform::Twitter => &self.twitter.webhook,
            Platform::Tumblr => &self.tumblr.webhook,
            Platform::Bluesky => &self.bluesky.webhook,
        };
        hook.as_deref().filter(|h| !h.is_empty())
    }

    /// The settings one publisher gets to see for this source.
    pub fn platform_config(&self, platform: Platform) -> PlatformConfig {
        match platform {
            Platform::Twitter => PlatformConfig::Twitter(self.twitter.clone()),
            Platform::Tumblr => PlatformConfig::Tumblr(self.tumblr.clone()),
            Platform::Bluesky => PlatformConfig::Bluesky(self.bluesky.clone()),
        }
    }

    fn platform_enabled_mut(&mut self, platform: Platform) -> &mut bool {
        match platform {
            Platform::Twitter => &mut self.twitter.enabled,
            Platform::Tumblr => &mut self.tumblr.enabled,
            Platform::Bluesky => &mut self.bluesky.enabled,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitterConfig {
    pub enabled: bool,
    pub username: String,
    /// OAuth 1.0a app (consumer) key pair.
    pub consumer_key: String,
    pub consumer_secret: String,
    /// OAuth 1.0a user token pair for the posting account.
    pub access_token: String,
    pub access_token_secret: String,
    /// Post only when the local hour is a multiple of this (2 = even hours).
    pub posting_interval_hours: u32,
    pub webhook: Option<String>,
    pub api_base: String,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            access_token: String::new(),
            access_token_secret: String::new(),
            posting_interval_hours: 2,
            webhook: None,
            api_base: "https://api.x.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TumblrConfig {
    pub enabled: bool,
    pub blogname: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub oauth_token: String,
    pub oauth_token_secret: String,
    pub tags: Vec<String>,
    pub webhook: Option<String>,
    pub api_base: String,
}

impl Default for TumblrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            blogname: String::new(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            oauth_token: String::new(),
            oauth_token_secret: String::new(),
            tags: Vec::new(),
            webhook: None,
            api_base: "https://api.tumblr.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlueskyConfig {
    pub enabled: bool,
    pub username: String,
    pub app_password: String,
    pub alt_text: String,
    pub service: String,
    pub webhook: Option<String>,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            app_password: String::new(),
            alt_text: String::new(),
            service: "https://bsky.social".to_string(),
            webhook: None,
        }
    }
}

/// One platform's subtree of a [`SourceDescriptor`], handed to its publisher per call.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformConfig {
    Twitter(TwitterConfig),
    Tumblr(TumblrConfig),
    Bluesky(BlueskyConfig),
}

impl PlatformConfig {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformConfig::Twitter(_) => Platform::Twitter,
            PlatformConfig::Tumblr(_) => Platform::Tumblr,
            PlatformConfig::Bluesky(_) => Platform::Bluesky,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            PlatformConfig::Twitter(c) => c.enabled,
            PlatformConfig::Tumblr(c) => c.enabled,
            PlatformConfig::Bluesky(c) => c.enabled,
        }
    }
}

impl Config {
    pub fn trace_loaded(&self) {
        info!(
            sources_count = self.sources.len(),
            max_image_bytes = self.settings.max_image_bytes,
            "Loaded Config"
        );
        for source in &self.sources {
            info!(
                source = %source.key,
                enabled = source.enabled,
                twitter = source.twitter.enabled,
                tumblr = source.tumblr.enabled,
                bluesky = source.bluesky.enabled,
                "Loaded source"
            );
        }
    }

    pub fn source(&self, key: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.key == key)
    }

    /// Checks everything call sites would otherwise have to re-check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        if s.max_image_bytes == 0 {
            return invalid("settings.max_image_bytes must be positive");
        }
        if s.fetch_attempts == 0 || s.publish_attempts == 0 {
            return invalid("settings.fetch_attempts and settings.publish_attempts must be at least 1");
        }
        if s.request_timeout_secs == 0 {
            return invalid("settings.request_timeout_secs must be positive");
        }
        if s.max_compression_passes == 0 {
            return invalid("settings.max_compression_passes must be at least 1");
        }
        if !(1..=100).contains(&s.reduced_quality) {
            return invalid("settings.reduced_quality must be between 1 and 100");
        }

        let mut keys = HashSet::new();
        for source in &self.sources {
            if source.key.trim().is_empty() {
                return invalid("every source needs a non-empty key");
            }
            if !keys.insert(source.key.as_str()) {
                return invalid(format!("duplicate source key {:?}", source.key));
            }
            if !source.enabled {
                continue;
            }
            if source.endpoint.trim().is_empty() {
                return invalid(format!("source {:?} has no endpoint", source.key));
            }
            validate_platforms(source)?;
        }
        Ok(())
    }

    /// Config written when none exists yet: both animal APIs, every platform off.
    pub fn default_template() -> Self {
        let source = |key: &str, name: &str, endpoint: &str, tags: &[&str]| SourceDescriptor {
            key: key.to_string(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            api_key: String::new(),
            env_api_key: None,
            enabled: true,
            alert_webhook: None,
            twitter: TwitterConfig::default(),
            tumblr: TumblrConfig {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..TumblrConfig::default()
            },
            bluesky: BlueskyConfig::default(),
        };

        Config {
            settings: PipelineSettings::default(),
            sources: vec![
                source(
                    "cat",
                    "TheCatAPI",
                    "https://api.thecatapi.com/v1/images/search?mime_types=jpg,png",
                    CAT_TAGS,
                ),
                source(
                    "dog",
                    "TheDogAPI",
                    "https://api.thedogapi.com/v1/images/search?mime_types=jpg,png",
                    DOG_TAGS,
                ),
            ],
        }
    }

    /// Writes the config atomically: a sibling temp file renamed over `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(yaml.as_bytes()).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        debug!(path = %path.display(), "Config written");
        Ok(())
    }
}

fn validate_platforms(source: &SourceDescriptor) -> Result<(), ConfigError> {
    let key = &source.key;
    let t = &source.twitter;
    if t.enabled {
        let missing = missing_fields(&[
            ("consumer_key", &t.consumer_key),
            ("consumer_secret", &t.consumer_secret),
            ("access_token", &t.access_token),
            ("access_token_secret", &t.access_token_secret),
        ]);
        if !missing.is_empty() {
            return invalid(format!("{key}.twitter is enabled but {missing} is missing"));
        }
        if !(1..=24).contains(&t.posting_interval_hours) {
            return invalid(format!(
                "{key}.twitter.posting_interval_hours must be between 1 and 24"
            ));
        }
    }
    let tb = &source.tumblr;
    if tb.enabled {
        let missing = missing_fields(&[
            ("blogname", &tb.blogname),
            ("consumer_key", &tb.consumer_key),
            ("consumer_secret", &tb.consumer_secret),
            ("oauth_token", &tb.oauth_token),
            ("oauth_token_secret", &tb.oauth_token_secret),
        ]);
        if !missing.is_empty() {
            return invalid(format!("{key}.tumblr is enabled but {missing} is missing"));
        }
    }
    let b = &source.bluesky;
    if b.enabled && (b.username.is_empty() || b.app_password.is_empty()) {
        return invalid(format!(
            "{key}.bluesky is enabled but username or app_password is missing"
        ));
    }
    Ok(())
}

fn missing_fields(fields: &[(&str, &String)]) -> String {
    fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid<T>(msg: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}

/// Owns the config file and hands out immutable snapshots.
///
/// A cycle works on one [`Arc<Config>`] from [`ConfigStore::snapshot`] and never
/// sees changes made while it runs. [`ConfigStore::disable_platform`] and
/// [`ConfigStore::reload`] are serialised by a writer lock, write through to
/// disk, and only then swap the snapshot.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = crate::load_config::load_config(&path)?;
        Ok(Self::new(path, config))
    }

    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(config)),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-reads the file. On failure the previous snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = Arc::new(crate::load_config::load_config(&self.path)?);
        self.swap(fresh.clone());
        Ok(fresh)
    }

    pub fn disable_platform(&self, source_key: &str, platform: Platform) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.snapshot()).clone();
        let source = next
            .sources
            .iter_mut()
            .find(|s| s.key == source_key)
            .ok_or_else(|| ConfigError::UnknownSource(source_key.to_string()))?;

        let enabled = source.platform_enabled_mut(platform);
        if !*enabled {
            return Ok(());
        }
        *enabled = false;

        next.save(&self.path)?;
        self.swap(Arc::new(next));
        warn!(source = %source_key, %platform, path = %self.path.display(), "Platform disabled and config saved");
        Ok(())
    }

    fn swap(&self, config: Arc<Config>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

impl PlatformToggle for ConfigStore {
    fn disable(&self, source_key: &str, platform: Platform) -> Result<(), ConfigError> {
        self.disable_platform(source_key, platform)
    }
}

pub const CAT_TAGS: &[&str] = &[
    "cat",
    "cats",
    "cat photo",
    "cat photos",
    "cat photographer",
    "cat photography",
    "hourly cat",
    "hourly cats",
    "hourly cat photo",
    "hourly cat photos",
    "kitten",
    "kittens",
    "kitty",
    "kitties",
    "kitty cat",
    "kitty cats",
    "kitty cat photo",
    "kitty cat photos",
    "meow",
];

pub const DOG_TAGS: &[&str] = &[
    "dog",
    "dogs",
    "dog photo",
    "dog photos",
    "puppy",
    "puppies",
    "puppy photo",
    "puppy photos",
    "hourly dog",
    "hourly dogs",
    "hourly dog photo",
    "hourly dog photos",
    "bark",
    "woof",
];
