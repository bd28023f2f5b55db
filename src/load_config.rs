use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;

/// Name of the environment variable holding a source's API key, e.g. `CAT_API_KEY`.
pub fn api_key_var(source_key: &str) -> String {
    let key: String = source_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{key}_API_KEY")
}

/// Loads the YAML config, injects API keys from the environment and validates it once.
///
/// When the file does not exist a default template is written in its place and
/// [`ConfigError::TemplateCreated`] is returned, so the operator can fill it in.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(config_path = ?path_ref, "Config file not found, writing default template");
            Config::default_template().save(path_ref)?;
            return Err(ConfigError::TemplateCreated {
                path: path_ref.to_path_buf(),
            });
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(ConfigError::Io {
                path: path_ref.to_path_buf(),
                source: e,
            });
        }
    };

    let mut config: Config = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(ConfigError::Parse {
                path: path_ref.to_path_buf(),
                source: e,
            });
        }
    };

    for source in &mut config.sources {
        let var = api_key_var(&source.key);
        if let Ok(key) = std::env::var(&var) {
            if !key.is_empty() {
                info!(source = %source.key, var = %var, "API key found in env");
                source.env_api_key = Some(key);
            }
        }
    }

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Config failed validation");
        return Err(e);
    }

    config.trace_loaded();
    Ok(config)
}
