//! Configuration management for Autopost

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub posting: PostingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingConfig {
    /// Target channel handed to the delivery collaborator
    pub channel: String,

    /// Line appended to every caption (e.g. the channel handle)
    #[serde(default)]
    pub signature: Option<String>,

    #[serde(default = "default_min_interval", with = "duration_str")]
    pub min_interval_between_posts: Duration,

    #[serde(default = "default_min_interval", with = "duration_str")]
    pub min_interval_between_pauses: Duration,

    /// Queue length below which a low-queue alert is raised
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,

    /// How often the posting interval is recomputed while armed
    #[serde(default = "default_rate_refresh", with = "duration_str")]
    pub rate_refresh: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Relative tolerance applied to the histogram sum
    #[serde(default = "default_approximation")]
    pub approximation: f64,

    /// Maximum perceptual hash distance (inclusive) for two media to match
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            approximation: default_approximation(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Steady,
    Tiered,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Inclusive upper bound on queue length; `None` matches everything else
    #[serde(default)]
    pub up_to: Option<u64>,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_edition")]
    pub edition: Edition,

    /// Steady edition: span over which the whole queue should drain
    #[serde(default = "default_window", with = "duration_str")]
    pub window: Duration,

    #[serde(default = "default_floor", with = "duration_str")]
    pub floor: Duration,

    #[serde(default = "default_ceiling", with = "duration_str")]
    pub ceiling: Duration,

    /// Fixed edition: constant interval
    #[serde(default = "default_fixed_interval", with = "duration_str")]
    pub interval: Duration,

    /// Tiered edition: steps ordered by `up_to`
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            edition: default_edition(),
            window: default_window(),
            floor: default_floor(),
            ceiling: default_ceiling(),
            interval: default_fixed_interval(),
            tiers: default_tiers(),
        }
    }
}

fn default_min_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_alert_threshold() -> u64 {
    10
}

fn default_rate_refresh() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_approximation() -> f64 {
    0.05
}

fn default_similarity_threshold() -> u32 {
    8
}

fn default_edition() -> Edition {
    Edition::Steady
}

fn default_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_floor() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_ceiling() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_fixed_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_tiers() -> Vec<TierConfig> {
    let minutes = |m: u64| Duration::from_secs(m * 60);
    vec![
        TierConfig {
            up_to: Some(5),
            interval: minutes(120),
        },
        TierConfig {
            up_to: Some(20),
            interval: minutes(60),
        },
        TierConfig {
            up_to: Some(50),
            interval: minutes(30),
        },
        TierConfig {
            up_to: None,
            interval: minutes(15),
        },
    ]
}

/// Human-readable durations ("5m", "1h 30m") in TOML
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot express
    pub fn validate(&self) -> Result<()> {
        let approximation = self.matching.approximation;
        if !(approximation > 0.0 && approximation < 1.0) {
            return Err(invalid(
                "matching.approximation",
                format!("must be between 0 and 1 (exclusive), got {}", approximation),
            ));
        }

        if self.posting.channel.trim().is_empty() {
            return Err(ConfigError::MissingField("posting.channel".to_string()).into());
        }

        if self.posting.rate_refresh.is_zero() {
            return Err(invalid("posting.rate_refresh", "must be greater than zero"));
        }

        let rate = &self.rate;
        match rate.edition {
            Edition::Steady => {
                if rate.window.is_zero() || rate.floor.is_zero() {
                    return Err(invalid("rate", "window and floor must be greater than zero"));
                }
                if rate.floor > rate.ceiling {
                    return Err(invalid("rate.floor", "must not exceed rate.ceiling"));
                }
            }
            Edition::Fixed => {
                if rate.interval.is_zero() {
                    return Err(invalid("rate.interval", "must be greater than zero"));
                }
            }
            Edition::Tiered => crate::rate::TieredPolicy::from_config(&rate.tiers).map(|_| ())?,
        }

        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/autopost/queue.db".to_string(),
            },
            posting: PostingConfig {
                channel: "@channel".to_string(),
                signature: Some("@channel".to_string()),
                min_interval_between_posts: default_min_interval(),
                min_interval_between_pauses: default_min_interval(),
                alert_threshold: default_alert_threshold(),
                rate_refresh: default_rate_refresh(),
            },
            matching: MatchingConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> crate::error::AutopostError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autopost").join("config.toml"))
}

/// Resolve the database path, letting `AUTOPOST_DB_PATH` override the config
pub fn resolve_db_path(configured: &str) -> PathBuf {
    let raw = std::env::var("AUTOPOST_DB_PATH").unwrap_or_else(|_| configured.to_string());
    PathBuf::from(shellexpand::tilde(&raw).to_string())
}
