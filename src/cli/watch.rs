use std::io;

use anyhow::Result;
use clap::Args;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::cli::OutputFormat;
use crate::events::GatewayEvent;
use crate::gateway::Gateway;

use super::ui::{BeaconLineView, Painter, WatchListView};

/// Arguments for the `watch` command.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Addresses to watch.
    #[arg(required = true)]
    addresses: Vec<String>,
    /// Stop after this many watch bursts. If omitted, watch until Ctrl+C.
    #[arg(long)]
    bursts: Option<usize>,
}

impl WatchArgs {
    #[must_use]
    pub fn new(addresses: Vec<String>, bursts: Option<usize>) -> Self {
        Self { addresses, bursts }
    }
}

/// Executes the `watch` command.
#[instrument(skip(gateway, out, painter), level = "info", fields(?output_format))]
pub(crate) async fn run<W>(
    gateway: &Gateway,
    args: &WatchArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let mut events = gateway.subscribe_events();
    let mut was_scanning = gateway.state().scanning;
    let mut bursts = 0_usize;
    gateway.watch(args.addresses.iter().cloned()).await;

    while args.bursts.is_none_or(|limit| bursts < limit) {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping watch");
                break;
            }
        };
        match event {
            Ok(GatewayEvent::BeaconUpdated(entry)) => match output_format {
                OutputFormat::Pretty => writeln!(out, "{}", BeaconLineView::new(&entry, painter))?,
                OutputFormat::Json => {
                    serde_json::to_writer(&mut *out, &entry)?;
                    writeln!(out)?;
                }
            },
            Ok(GatewayEvent::StateChanged(state)) => {
                if was_scanning && !state.scanning {
                    bursts += 1;
                    debug!(bursts, "watch burst completed");
                }
                was_scanning = state.scanning;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch output lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let entries = gateway.beacons().await;
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out)?;
            writeln!(out, "{}", WatchListView::new(&entries, painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
