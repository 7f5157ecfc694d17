use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::{info, instrument};

use crate::advertisement::ScanFilterKind;
use crate::cli::OutputFormat;
use crate::cli::command::parse_duration;
use crate::gateway::Gateway;

use super::ui::{DiscoveryTableView, Painter};

/// Arguments for the `scan` command.
#[derive(Debug, Default, Args)]
pub struct ScanArgs {
    /// How long to scan (e.g. `3s`); defaults to the configured scan timeout.
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
    /// Only report beacon-shaped advertisements.
    #[arg(long)]
    beacons: bool,
}

impl ScanArgs {
    #[must_use]
    pub fn new(timeout: Option<Duration>, beacons: bool) -> Self {
        Self { timeout, beacons }
    }

    fn filter(&self) -> Option<ScanFilterKind> {
        self.beacons.then_some(ScanFilterKind::Beacon)
    }
}

/// Executes the `scan` command. Ctrl+C ends the scan early.
#[instrument(skip(gateway, out, painter), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    gateway: &Gateway,
    args: &ScanArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let scan = gateway.start_scan(args.filter(), args.timeout);
    tokio::pin!(scan);
    let found = tokio::select! {
        result = &mut scan => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; stopping scan");
            let ((), result) = tokio::join!(gateway.stop_scan(), &mut scan);
            result?
        }
    };

    match output_format {
        OutputFormat::Pretty => writeln!(out, "{}", DiscoveryTableView::new(&found, painter))?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &found)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
