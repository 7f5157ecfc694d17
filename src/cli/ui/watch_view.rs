use std::fmt::{self, Display, Formatter};

use crate::scheduler::WatchEntry;
use crate::utils::or_dash;

use super::painter::Painter;
use super::table::Table;

/// One line per watch-scan sighting.
pub(crate) struct BeaconLineView<'a> {
    entry: &'a WatchEntry,
    painter: &'a Painter,
}

impl<'a> BeaconLineView<'a> {
    pub(crate) fn new(entry: &'a WatchEntry, painter: &'a Painter) -> Self {
        Self { entry, painter }
    }
}

impl Display for BeaconLineView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let seen = self.entry.last_seen();
        write!(
            f,
            "{} {} {}",
            self.painter.value(self.entry.address()),
            self.painter.rssi(seen.and_then(|device| device.rssi())),
            self.painter.muted(or_dash(seen.and_then(|device| device.name()))),
        )
    }
}

/// Final state of the watch list.
pub(crate) struct WatchListView<'a> {
    entries: &'a [WatchEntry],
    painter: &'a Painter,
}

impl<'a> WatchListView<'a> {
    pub(crate) fn new(entries: &'a [WatchEntry], painter: &'a Painter) -> Self {
        Self { entries, painter }
    }
}

impl Display for WatchListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows = self
            .entries
            .iter()
            .map(|entry| {
                let seen = entry.last_seen();
                vec![
                    entry.address().to_string(),
                    or_dash(seen.and_then(|device| device.name())).to_string(),
                    self.painter.rssi(seen.and_then(|device| device.rssi())),
                    if seen.is_some() { "yes" } else { "no" }.to_string(),
                ]
            })
            .collect();
        write!(f, "{}", Table::grid(["address", "name", "rssi", "seen"], rows))
    }
}
