use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::cli::connect::ConnectArgs;
use crate::cli::scan::ScanArgs;
use crate::cli::watch::WatchArgs;
use crate::config::ConfigOverrides;
use crate::error::{CliConfigError, FixtureError};
use crate::radio::fake::{FakeRadioConfig, ScanFixture};

/// Command-line options for the BLE gateway.
#[derive(Debug, Parser)]
#[command(name = "blegate", about = "Scan, watch and talk to BLE peripherals.")]
pub struct Args {
    /// Configuration file; defaults to `config.json` in the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format; defaults to pretty on a terminal and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Initial connect timeout (e.g. `20s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    connect_timeout_floor: Option<Duration>,
    /// Upper bound for the connect timeout.
    #[arg(long, global = true, value_parser = parse_duration)]
    connect_timeout_ceiling: Option<Duration>,
    /// Interval between watch bursts.
    #[arg(long, global = true, value_parser = parse_duration)]
    watch_period: Option<Duration>,
    /// Length of each watch burst.
    #[arg(long, global = true, value_parser = parse_duration)]
    watch_burst: Option<Duration>,
    /// Uses the fake radio with fixture-driven scan results.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `address|name|rssi|advertisement-hex;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use blegate::{Args, Command, ScanArgs};
    ///
    /// let args = Args::new(Command::Scan(ScanArgs::default()));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            config: None,
            log_level: None,
            output: None,
            connect_timeout_floor: None,
            connect_timeout_ceiling: None,
            watch_period: None,
            watch_burst: None,
            fake: false,
            fake_scan: None,
            command,
        }
    }

    /// Enables fake radio mode with pre-parsed fixtures.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        self.fake = true;
        self.fake_scan = Some(fake.scan_fixture);
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.connect_timeout_floor = overrides.connect_timeout_floor;
        self.connect_timeout_ceiling = overrides.connect_timeout_ceiling;
        self.watch_period = overrides.watch_period;
        self.watch_burst = overrides.watch_burst;
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    /// Timing flags given on the command line.
    #[must_use]
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            connect_timeout_floor: self.connect_timeout_floor,
            connect_timeout_ceiling: self.connect_timeout_ceiling,
            watch_period: self.watch_period,
            watch_burst: self.watch_burst,
        }
    }

    /// Splits parsed CLI arguments into command and optional fake-radio settings.
    ///
    /// # Errors
    ///
    /// Returns an error if fake mode is enabled without a scan fixture.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let fake_args = if self.fake {
            let Some(scan_fixture) = self.fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs { scan_fixture })
        } else {
            None
        };

        Ok((self.command, fake_args))
    }
}

/// Fake radio arguments for programmatic runs.
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
}

impl FakeArgs {
    pub(crate) fn into_radio_config(self) -> FakeRadioConfig {
        self.scan_fixture.into()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an ad-hoc scan and list every device seen.
    Scan(ScanArgs),
    /// Watch addresses with periodic short scans and print each sighting.
    Watch(WatchArgs),
    /// Connect, print the attribute tree and optionally stream notifications.
    Connect(ConnectArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Watch(_) => "watch",
            Self::Connect(_) => "connect",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn fake_mode_requires_scan_fixture() {
        let result = Args::try_parse_from(["blegate", "--fake", "scan"]);

        let error = result.expect_err("missing --fake-scan should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_scan_requires_fake_mode() {
        let result = Args::try_parse_from(["blegate", "--fake-scan", "AA:BB|Lamp|-40|-", "scan"]);

        let error = result.expect_err("--fake-scan should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn invalid_fixture_is_a_value_error() {
        let result = Args::try_parse_from(["blegate", "--fake", "--fake-scan", "AA:BB", "scan"]);

        let error = result.expect_err("a record with one field should be rejected");
        assert_eq!(ErrorKind::ValueValidation, error.kind());
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let cli = Args::try_parse_from([
            "blegate",
            "--fake",
            "--fake-scan",
            "AA:BB|Lamp|-40|-",
            "watch",
            "AA:BB",
        ])
        .expect("valid fake arguments should parse");

        let (command, fake_args) = cli
            .into_command_and_fake_args()
            .expect("valid fake arguments should resolve fake settings");
        assert_matches!(command, Command::Watch(_));
        assert_matches!(fake_args, Some(_));
    }

    #[test]
    fn timing_flags_become_overrides() {
        let cli = Args::try_parse_from([
            "blegate",
            "--watch-period",
            "30s",
            "--connect-timeout-floor",
            "5s",
            "scan",
        ])
        .expect("timing flags should parse");

        let overrides = cli.overrides();
        assert_eq!(Some(Duration::from_secs(30)), overrides.watch_period);
        assert_eq!(Some(Duration::from_secs(5)), overrides.connect_timeout_floor);
        assert_eq!(None, overrides.watch_burst);
    }

    #[rstest]
    #[case::error(LogLevel::Error, LevelFilter::ERROR)]
    #[case::trace(LogLevel::Trace, LevelFilter::TRACE)]
    fn log_levels_map_to_filters(#[case] level: LogLevel, #[case] expected: LevelFilter) {
        assert_eq!(expected, level.as_level_filter());
    }
}
