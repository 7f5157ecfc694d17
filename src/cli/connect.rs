use std::io;

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use futures::stream::select_all;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::address::Address;
use crate::attribute::Service;
use crate::cli::OutputFormat;
use crate::gateway::Gateway;
use crate::lifecycle::ConnectionRecord;
use crate::subscriptions::Notification;

use super::ui::{AttributeTreeView, NotificationView, Painter};

/// Arguments for the `connect` command.
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Device address.
    address: String,
    /// Characteristic path (`service/characteristic`) to subscribe to. Repeatable.
    #[arg(long = "subscribe", value_name = "PATH")]
    subscriptions: Vec<String>,
    /// Stop after this many notifications. If omitted, listen until Ctrl+C.
    #[arg(long)]
    max_notifications: Option<usize>,
}

impl ConnectArgs {
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        subscriptions: Vec<String>,
        max_notifications: Option<usize>,
    ) -> Self {
        Self {
            address: address.into(),
            subscriptions,
            max_notifications,
        }
    }
}

#[derive(Serialize)]
struct ConnectReport<'a> {
    connection: &'a ConnectionRecord,
    services: &'a [Service],
}

/// Executes the `connect` command. The device is disconnected before
/// returning, also when a later step fails.
#[instrument(skip(gateway, out, painter), level = "info", fields(address = %args.address))]
pub(crate) async fn run<W>(
    gateway: &Gateway,
    args: &ConnectArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let address = Address::from(args.address.as_str());
    let record = gateway.connect(&address).await?;
    let session = run_connected(gateway, args, &record, out, painter, output_format).await;

    if let Err(error) = gateway.disconnect(address.as_str()).await {
        debug!(%error, "failed to disconnect cleanly");
    }
    session
}

async fn run_connected<W>(
    gateway: &Gateway,
    args: &ConnectArgs,
    record: &ConnectionRecord,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let address = record.address().as_str();
    let services = gateway.discover(address).await?;
    match output_format {
        OutputFormat::Pretty => writeln!(
            out,
            "{}",
            AttributeTreeView::new(address, record.rssi(), &services, painter)
        )?,
        OutputFormat::Json => {
            serde_json::to_writer_pretty(
                &mut *out,
                &ConnectReport {
                    connection: record,
                    services: &services,
                },
            )?;
            writeln!(out)?;
        }
    }

    if args.subscriptions.is_empty() {
        return Ok(());
    }

    let mut streams = Vec::with_capacity(args.subscriptions.len());
    for path in &args.subscriptions {
        let subscription = gateway
            .subscribe(address, path)
            .await
            .with_context(|| format!("failed to subscribe to {path}"))?;
        streams.push(subscription.into_stream());
    }
    info!(count = streams.len(), "listening for notifications");

    let mut notifications = select_all(streams);
    let mut received = 0_usize;
    while args.max_notifications.is_none_or(|limit| received < limit) {
        let notification: Notification = tokio::select! {
            next = notifications.next() => match next {
                Some(notification) => notification,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        received += 1;
        match output_format {
            OutputFormat::Pretty => writeln!(
                out,
                "{}",
                NotificationView::new(received, &notification, painter)
            )?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *out, &notification)?;
                writeln!(out)?;
            }
        }
    }

    for path in &args.subscriptions {
        if let Err(error) = gateway.unsubscribe(address, path).await {
            debug!(%error, %path, "failed to unsubscribe cleanly");
        }
    }
    Ok(())
}
