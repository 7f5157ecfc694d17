use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use tracing::debug;

use crate::advertisement::ScanFilterKind;
use crate::error::ConfigError;
use crate::lifecycle::ConnectBackoff;
use crate::scheduler::ScanTiming;

const CONFIG_FILE_NAME: &str = "config.json";

/// Gateway timing and scan settings.
///
/// ```
/// use std::time::Duration;
///
/// let config = blegate::GatewayConfig::builder()
///     .watch_period(Duration::from_secs(30))
///     .build();
/// assert_eq!(Duration::from_secs(20), config.connect_timeout_floor());
/// assert_eq!(Duration::from_secs(30), config.watch_period());
/// ```
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct GatewayConfig {
    #[builder(default = Duration::from_secs(20))]
    #[serde_as(as = "DurationSeconds<u64>")]
    connect_timeout_floor: Duration,
    #[builder(default = Duration::from_secs(2))]
    #[serde_as(as = "DurationSeconds<u64>")]
    connect_timeout_increment: Duration,
    #[builder(default = Duration::from_secs(60))]
    #[serde_as(as = "DurationSeconds<u64>")]
    connect_timeout_ceiling: Duration,
    #[builder(default = Duration::from_secs(60))]
    #[serde_as(as = "DurationSeconds<u64>")]
    watch_period: Duration,
    #[builder(default = Duration::from_secs(2))]
    #[serde_as(as = "DurationSeconds<u64>")]
    watch_burst: Duration,
    #[builder(default = Duration::from_secs(3))]
    #[serde_as(as = "DurationSeconds<u64>")]
    scan_timeout: Duration,
    #[builder(default)]
    scan_filter: ScanFilterKind,
    #[builder(default = 256)]
    event_capacity: usize,
    #[builder(default)]
    watch: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayConfig {
    /// Platform default location of the configuration file.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "blegate").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Loads `path` when given, otherwise the default location if a file
    /// exists there, otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an existing file is unreadable or invalid.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks the backoff bounds and that scan durations are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BackoffBounds`] or [`ConfigError::ZeroDuration`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_floor > self.connect_timeout_ceiling {
            return Err(ConfigError::BackoffBounds {
                floor: self.connect_timeout_floor,
                ceiling: self.connect_timeout_ceiling,
            });
        }
        for (field, value) in [
            ("watch_period", self.watch_period),
            ("watch_burst", self.watch_burst),
            ("connect_timeout_floor", self.connect_timeout_floor),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    /// Applies command-line overrides on top of file values.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(value) = overrides.connect_timeout_floor {
            self.connect_timeout_floor = value;
        }
        if let Some(value) = overrides.connect_timeout_ceiling {
            self.connect_timeout_ceiling = value;
        }
        if let Some(value) = overrides.watch_period {
            self.watch_period = value;
        }
        if let Some(value) = overrides.watch_burst {
            self.watch_burst = value;
        }
        self
    }

    #[must_use]
    pub fn connect_timeout_floor(&self) -> Duration {
        self.connect_timeout_floor
    }

    #[must_use]
    pub fn connect_timeout_ceiling(&self) -> Duration {
        self.connect_timeout_ceiling
    }

    #[must_use]
    pub fn watch_period(&self) -> Duration {
        self.watch_period
    }

    #[must_use]
    pub fn watch_burst(&self) -> Duration {
        self.watch_burst
    }

    #[must_use]
    pub fn event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }

    /// Addresses watched from startup.
    #[must_use]
    pub fn watch(&self) -> &[String] {
        &self.watch
    }

    #[must_use]
    pub fn backoff(&self) -> ConnectBackoff {
        ConnectBackoff::new(
            self.connect_timeout_floor,
            self.connect_timeout_increment,
            self.connect_timeout_ceiling,
        )
    }

    #[must_use]
    pub fn scan_timing(&self) -> ScanTiming {
        ScanTiming {
            watch_period: self.watch_period,
            watch_burst: self.watch_burst,
            scan_timeout: self.scan_timeout,
            scan_filter: self.scan_filter,
        }
    }
}

/// Per-run overrides collected from command-line flags.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ConfigOverrides {
    pub connect_timeout_floor: Option<Duration>,
    pub connect_timeout_ceiling: Option<Duration>,
    pub watch_period: Option<Duration>,
    pub watch_burst: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file should be created");
        file.write_all(contents.as_bytes())
            .expect("temp file should be writable");
        file
    }

    #[test]
    fn defaults_match_documented_timings() {
        let config = GatewayConfig::default();

        assert_eq!(
            ConnectBackoff::new(
                Duration::from_secs(20),
                Duration::from_secs(2),
                Duration::from_secs(60)
            ),
            config.backoff()
        );
        let timing = config.scan_timing();
        assert_eq!(Duration::from_secs(60), timing.watch_period);
        assert_eq!(Duration::from_secs(2), timing.watch_burst);
        assert_eq!(Duration::from_secs(3), timing.scan_timeout);
        assert_eq!(ScanFilterKind::Plain, timing.scan_filter);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let file = write_config(r#"{"watch_period": 30, "scan_filter": "beacon", "watch": ["AA"]}"#);

        let config = GatewayConfig::load(file.path()).expect("config should load");

        assert_eq!(Duration::from_secs(30), config.watch_period());
        assert_eq!(ScanFilterKind::Beacon, config.scan_timing().scan_filter);
        assert_eq!(Duration::from_secs(20), config.connect_timeout_floor());
        assert_eq!(["AA".to_string()], config.watch());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let file = write_config(r#"{"watch_perod": 30}"#);

        assert_matches!(
            GatewayConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        );
    }

    #[test]
    fn missing_explicit_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("absent.json");

        assert_matches!(
            GatewayConfig::load_or_default(Some(&path)),
            Err(ConfigError::Read { .. })
        );
    }

    #[test]
    fn floor_above_ceiling_is_rejected() {
        let file = write_config(r#"{"connect_timeout_floor": 90, "connect_timeout_ceiling": 60}"#);

        assert_matches!(
            GatewayConfig::load(file.path()),
            Err(ConfigError::BackoffBounds { .. })
        );
    }

    #[rstest]
    #[case::period(r#"{"watch_period": 0}"#, "watch_period")]
    #[case::burst(r#"{"watch_burst": 0}"#, "watch_burst")]
    fn zero_scan_durations_are_rejected(#[case] contents: &str, #[case] expected: &str) {
        let file = write_config(contents);

        assert_matches!(
            GatewayConfig::load(file.path()),
            Err(ConfigError::ZeroDuration { field }) if field == expected
        );
    }

    #[test]
    fn overrides_replace_file_values() {
        let overrides = ConfigOverrides {
            watch_burst: Some(Duration::from_millis(500)),
            ..ConfigOverrides::default()
        };

        let config = GatewayConfig::default().with_overrides(&overrides);

        assert_eq!(Duration::from_millis(500), config.watch_burst());
        assert_eq!(Duration::from_secs(60), config.watch_period());
    }
}
