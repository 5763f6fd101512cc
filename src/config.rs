use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("cannot parse {name}={value:?} as {kind}")]
    Parse {
        name: String,
        value: String,
        kind: &'static str,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Platform
    pub discord_token: String,

    // Database
    pub database_path: PathBuf,

    // Identity hashing
    pub pii_pepper: String,

    // S3 storage (image mirroring disabled when unset)
    pub s3_bucket: Option<String>,
    pub s3_region: String,

    // Image pipeline caps
    pub image_max_mb: u64,
    pub image_max_w: u32,
    pub image_max_h: u32,

    // Staff bootstrap
    pub staff_csv_path: Option<PathBuf>,

    // Sync behavior
    pub enable_historical_sync: bool,
    pub force_full_sync: bool,
    pub run_mode: RunMode,
    pub exit_after_sync: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep the event loop and periodic delta sync running.
    Watch,
    /// Exit once startup work (including any sync) completes.
    Once,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            discord_token: required_env("DISCORD_TOKEN")?,
            database_path: PathBuf::from(env_or("DATABASE_PATH", "./data/mirror.sqlite")),
            pii_pepper: required_env("PII_PEPPER")?,
            s3_bucket: env_var("S3_BUCKET"),
            s3_region: env_or("S3_REGION", "us-east-1"),
            image_max_mb: parse_env("IMAGE_MAX_MB", 10)?,
            image_max_w: parse_env("IMAGE_MAX_W", 1920)?,
            image_max_h: parse_env("IMAGE_MAX_H", 1080)?,
            staff_csv_path: env_var("STAFF_CSV_PATH").map(PathBuf::from),
            enable_historical_sync: parse_env_bool("ENABLE_HISTORICAL_SYNC", true)?,
            force_full_sync: parse_env_bool("FORCE_FULL_SYNC", false)?,
            run_mode: parse_run_mode(&env_or("RUN_MODE", "watch"))?,
            exit_after_sync: parse_env_bool("EXIT_AFTER_SYNC", false)?,
            poll_interval: Duration::from_secs(parse_env("POLL_INTERVAL_SECS", 300)?),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord_token.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "DISCORD_TOKEN".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.pii_pepper.trim().len() != 64
            || !self.pii_pepper.trim().chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(ConfigError::InvalidValue {
                name: "PII_PEPPER".to_string(),
                message: "must be 64 hex characters".to_string(),
            });
        }
        if self.image_max_mb == 0 {
            return Err(ConfigError::InvalidValue {
                name: "IMAGE_MAX_MB".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.image_max_w == 0 || self.image_max_h == 0 {
            return Err(ConfigError::InvalidValue {
                name: "IMAGE_MAX_W/IMAGE_MAX_H".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let Some(bucket) = &self.s3_bucket {
            if bucket.is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "S3_BUCKET".to_string(),
                    message: "cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether attachment mirroring is configured.
    #[must_use]
    pub fn images_enabled(&self) -> bool {
        self.s3_bucket.is_some()
    }
}

/// Read an environment variable, treating empty and whitespace-only values
/// as unset.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    env_var(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_or(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

/// Parse an optional variable via `FromStr`, falling back to `default` when
/// unset.
fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    let Some(value) = env_var(name) else {
        return Ok(default);
    };
    value.trim().parse().map_err(|_| ConfigError::Parse {
        name: name.to_string(),
        value,
        kind: std::any::type_name::<T>(),
    })
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = env_var(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Parse {
            name: name.to_string(),
            value,
            kind: "bool",
        }),
    }
}

fn parse_run_mode(value: &str) -> Result<RunMode, ConfigError> {
    if value.eq_ignore_ascii_case("watch") {
        Ok(RunMode::Watch)
    } else if value.eq_ignore_ascii_case("once") {
        Ok(RunMode::Once)
    } else {
        Err(ConfigError::InvalidValue {
            name: "RUN_MODE".to_string(),
            message: format!("expected 'watch' or 'once', got '{value}'"),
        })
    }
}
