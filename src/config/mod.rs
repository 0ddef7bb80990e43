//! Configuration module for the skein core.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;

use chrono::Duration;

use crate::errors::{CoreError, CoreResult};

/// Core configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a resolved role is served from cache
    pub role_ttl: Duration,
    /// First path segment of every upload destination
    pub upload_prefix: String,
    /// Collection holding `{id}.role` profile records
    pub profile_collection: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role_ttl: Duration::seconds(300),
            upload_prefix: "uploads".to_string(),
            profile_collection: crate::models::collections::USERS.to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first if present.
    pub fn from_env() -> CoreResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars()
    }

    /// Load configuration from the current process environment only.
    pub fn from_vars() -> CoreResult<Self> {
        let defaults = Self::default();

        let role_ttl = match env::var("SKEIN_ROLE_TTL_SECS") {
            Ok(raw) => {
                let secs: i64 = raw.trim().parse().map_err(|_| {
                    CoreError::Config(format!("Invalid SKEIN_ROLE_TTL_SECS value: {}", raw))
                })?;
                if secs < 0 {
                    return Err(CoreError::Config(
                        "SKEIN_ROLE_TTL_SECS must not be negative".to_string(),
                    ));
                }
                Duration::try_seconds(secs).ok_or_else(|| {
                    CoreError::Config(format!("SKEIN_ROLE_TTL_SECS out of range: {}", secs))
                })?
            }
            Err(_) => defaults.role_ttl,
        };

        let upload_prefix = env::var("SKEIN_UPLOAD_PREFIX")
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or(defaults.upload_prefix);

        let profile_collection =
            env::var("SKEIN_PROFILE_COLLECTION").unwrap_or(defaults.profile_collection);

        let log_level = env::var("SKEIN_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_json = match env::var("SKEIN_LOG_FORMAT") {
            Ok(format) => match format.trim().to_lowercase().as_str() {
                "json" => true,
                "text" | "pretty" | "" => false,
                other => {
                    return Err(CoreError::Config(format!(
                        "Invalid SKEIN_LOG_FORMAT value: {}",
                        other
                    )))
                }
            },
            Err(_) => defaults.log_json,
        };

        Ok(Self {
            role_ttl,
            upload_prefix,
            profile_collection,
            log_level,
            log_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VARS: [&str; 5] = [
        "SKEIN_ROLE_TTL_SECS",
        "SKEIN_UPLOAD_PREFIX",
        "SKEIN_PROFILE_COLLECTION",
        "SKEIN_LOG_LEVEL",
        "SKEIN_LOG_FORMAT",
    ];

    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let _guard = ENV_LOCK.lock();
        clear_env();

        let config = Config::from_vars().unwrap();

        assert_eq!(config.role_ttl, Duration::seconds(300));
        assert_eq!(config.upload_prefix, "uploads");
        assert_eq!(config.profile_collection, "users");
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
    }

    #[test]
    fn test_invalid_ttl_is_a_config_error() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        env::set_var("SKEIN_ROLE_TTL_SECS", "soon");

        let err = Config::from_vars().unwrap_err();
        assert_eq!(err.error_code(), crate::errors::codes::CONFIG_ERROR);

        clear_env();
    }

    #[test]
    fn test_out_of_range_ttl_is_a_config_error() {
        let _guard = ENV_LOCK.lock();
        clear_env();
        env::set_var("SKEIN_ROLE_TTL_SECS", i64::MAX.to_string());

        let err = Config::from_vars().unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        clear_env();
    }

    #[test]
    fn test_dotenv_file_overrides_defaults() {
        let _guard = ENV_LOCK.lock();
        clear_env();

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "SKEIN_ROLE_TTL_SECS=30").unwrap();
        writeln!(file, "SKEIN_UPLOAD_PREFIX=/files/").unwrap();
        writeln!(file, "SKEIN_LOG_FORMAT=json").unwrap();
        drop(file);

        dotenvy::from_path(&path).unwrap();
        let config = Config::from_vars().unwrap();

        assert_eq!(config.role_ttl, Duration::seconds(30));
        assert_eq!(config.upload_prefix, "files");
        assert!(config.log_json);

        clear_env();
    }
}
