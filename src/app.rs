use std::io;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument};

use crate::cli::ui::Painter;
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::config::GatewayConfig;
use crate::gateway::Gateway;
use crate::radio::fake::FakeRadio;
use crate::radio::{BtleplugRadio, Radio};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Creates a radio backed by the first system Bluetooth adapter.
///
/// # Errors
///
/// Returns an error if no adapter is available.
pub async fn real_radio() -> Result<Arc<dyn Radio>> {
    Ok(Arc::new(BtleplugRadio::new().await?))
}

/// Creates a radio backed by fake scan fixtures.
#[must_use]
pub fn fake_radio(fake_args: FakeArgs) -> Arc<dyn Radio> {
    Arc::new(FakeRadio::new(fake_args.into_radio_config()))
}

/// Runs the CLI command against the given radio.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = blegate::Args::try_parse_from([
///     "blegate",
///     "--fake",
///     "--fake-scan",
///     "AA:BB:CC:DD:EE:FF|Lamp|-40|-",
///     "scan",
///     "--timeout",
///     "50ms",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let radio = match maybe_fake_args {
///     Some(fake_args) => blegate::fake_radio(fake_args),
///     None => blegate::real_radio().await?,
/// };
/// let mut out = Vec::new();
/// blegate::run(
///     command,
///     &mut out,
///     radio,
///     blegate::GatewayConfig::default(),
///     blegate::OutputFormat::Json,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter is
/// unavailable, BLE interaction fails, or output writing fails.
pub async fn run<W>(
    command: Command,
    out: &mut W,
    radio: Arc<dyn Radio>,
    config: GatewayConfig,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        out,
        &SystemTerminalClient,
        radio,
        config,
        None,
        output_format,
    )
    .await
}

/// Runs the CLI command with an injected terminal client and explicit
/// telemetry settings.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter is
/// unavailable, BLE interaction fails, or output writing fails.
#[instrument(
    skip(out, terminal_client, radio, config),
    level = "info",
    fields(command = command.name(), ?log_level)
)]
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    radio: Arc<dyn Radio>,
    config: GatewayConfig,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "blegate",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let gateway = Gateway::new(radio, config);
    gateway.open().await?;

    let result: Result<()> = async {
        gateway.ensure_available().await?;
        match &command {
            Command::Scan(args) => {
                crate::cli::scan::run(&gateway, args, out, &painter, output_format).await
            }
            Command::Watch(args) => {
                crate::cli::watch::run(&gateway, args, out, &painter, output_format).await
            }
            Command::Connect(args) => {
                crate::cli::connect::run(&gateway, args, out, &painter, output_format).await
            }
        }
    }
    .await;

    gateway.close().await;
    info!(ok = result.is_ok(), "command finished");
    result
}
