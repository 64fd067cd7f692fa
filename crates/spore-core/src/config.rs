//! spore.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DEFAULT_PAGE_SIZE, Tag};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SporeConfig {
    pub provider: ProviderConfig,
    pub reservation: ReservationConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub backend: ProviderBackend,
    /// Seed file for the memory backend.
    pub fixture: Option<PathBuf>,
    /// Memory backend only: settle transitional statuses on each listing.
    #[serde(default)]
    pub auto_advance: bool,
    pub region_id: String,
    pub zone_id: String,
    pub security_group_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    pub key: String,
    pub value: String,
}

impl ReservationConfig {
    pub fn tag(&self) -> Tag {
        Tag::new(&self.key, &self.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_min")]
    pub min_interval: String,
    #[serde(default = "default_refresh_max")]
    pub max_interval: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_interval: default_refresh_min(),
            max_interval: default_refresh_max(),
        }
    }
}

impl RefreshConfig {
    /// Parsed `(min, max)` refresh bounds.
    pub fn bounds(&self) -> ConfigResult<(Duration, Duration)> {
        let min = parse_field("refresh.min_interval", &self.min_interval)?;
        let max = parse_field("refresh.max_interval", &self.max_interval)?;
        Ok((min, max))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_settle_period")]
    pub settle_period: String,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: String,
    /// Failed starts tolerated per window; 0 retries on every pass.
    #[serde(default)]
    pub max_start_attempts: u32,
    #[serde(default = "default_start_retry_window")]
    pub start_retry_window: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_period: default_settle_period(),
            restart_delay: default_restart_delay(),
            max_start_attempts: 0,
            start_retry_window: default_start_retry_window(),
        }
    }
}

impl LifecycleConfig {
    pub fn settle_period(&self) -> ConfigResult<Duration> {
        parse_field("lifecycle.settle_period", &self.settle_period)
    }

    pub fn restart_delay(&self) -> ConfigResult<Duration> {
        parse_field("lifecycle.restart_delay", &self.restart_delay)
    }

    pub fn start_retry_window(&self) -> ConfigResult<Duration> {
        parse_field("lifecycle.start_retry_window", &self.start_retry_window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl SporeConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content)?;

        // Relative fixture paths are resolved against the config file.
        if let Some(fixture) = config.provider.fixture.take() {
            let resolved = match path.parent() {
                Some(dir) if fixture.is_relative() => dir.join(fixture),
                _ => fixture,
            };
            config.provider.fixture = Some(resolved);
        }
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: SporeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let required = [
            ("provider.region_id", &self.provider.region_id),
            ("provider.zone_id", &self.provider.zone_id),
            ("provider.security_group_id", &self.provider.security_group_id),
            ("reservation.key", &self.reservation.key),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }

        if self.provider.page_size == 0 {
            return Err(ConfigError::Invalid(
                "provider.page_size must be at least 1".to_string(),
            ));
        }

        let (min, max) = self.refresh.bounds()?;
        if min > max {
            return Err(ConfigError::Invalid(format!(
                "refresh.min_interval ({min:?}) exceeds refresh.max_interval ({max:?})"
            )));
        }

        self.lifecycle.settle_period()?;
        self.lifecycle.restart_delay()?;
        self.lifecycle.start_retry_window()?;
        Ok(())
    }
}

/// Parse a duration string like "500ms", "30s", "5m", or "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600))
    } else {
        None
    }
}

fn parse_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_refresh_min() -> String {
    "30s".to_string()
}

fn default_refresh_max() -> String {
    "60s".to_string()
}

fn default_settle_period() -> String {
    "2s".to_string()
}

fn default_restart_delay() -> String {
    "3s".to_string()
}

fn default_start_retry_window() -> String {
    "10m".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[provider]
region_id = "cn-hangzhou"
zone_id = "cn-hangzhou-b"
security_group_id = "sg-pool"

[reservation]
key = "spore"
value = "used"
"#;

    #[test]
    fn test_parse_minimal_uses_defaults() {
        let config = SporeConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.provider.backend, ProviderBackend::Memory);
        assert_eq!(config.provider.page_size, 50);
        assert_eq!(
            config.refresh.bounds().unwrap(),
            (Duration::from_secs(30), Duration::from_secs(60))
        );
        assert_eq!(config.lifecycle.settle_period().unwrap(), Duration::from_secs(2));
        assert_eq!(config.lifecycle.restart_delay().unwrap(), Duration::from_secs(3));
        assert_eq!(config.lifecycle.max_start_attempts, 0);
        assert_eq!(config.api.listen, "0.0.0.0:8080");
        assert_eq!(config.log.format, LogFormat::Text);
        assert_eq!(config.reservation.tag(), Tag::new("spore", "used"));
    }

    #[test]
    fn test_rejects_inverted_refresh_bounds() {
        let toml_str = format!("{MINIMAL}\n[refresh]\nmin_interval = \"2m\"\nmax_interval = \"30s\"\n");
        let err = SporeConfig::parse(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_rejects_bad_duration() {
        let toml_str = format!("{MINIMAL}\n[lifecycle]\nsettle_period = \"soon\"\n");
        let err = SporeConfig::parse(&toml_str).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "lifecycle.settle_period", .. }
        ));
    }

    #[test]
    fn test_rejects_empty_region() {
        let toml_str = MINIMAL.replace("cn-hangzhou\"", "\"");
        let err = SporeConfig::parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("provider.region_id"));
    }

    #[test]
    fn test_parse_duration_values() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn test_from_file_resolves_relative_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spore.toml");
        let content = MINIMAL.replace(
            "[provider]\n",
            "[provider]\nfixture = \"fleet.toml\"\nauto_advance = true\n",
        );
        std::fs::write(&path, content).unwrap();

        let config = SporeConfig::from_file(&path).unwrap();
        assert_eq!(config.provider.fixture, Some(dir.path().join("fleet.toml")));
        assert!(config.provider.auto_advance);
    }

    #[test]
    fn test_from_file_missing() {
        let err = SporeConfig::from_file(Path::new("/nonexistent/spore.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
