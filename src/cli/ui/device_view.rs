use std::fmt::{self, Display, Formatter};

use crate::advertisement::DeviceDiscovered;
use crate::utils::or_dash;

use super::painter::Painter;
use super::table::Table;

/// Renders scan results as one row per device followed by a count.
pub(crate) struct DiscoveryTableView<'a> {
    devices: &'a [DeviceDiscovered],
    painter: &'a Painter,
}

impl<'a> DiscoveryTableView<'a> {
    pub(crate) fn new(devices: &'a [DeviceDiscovered], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for DiscoveryTableView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rows: Vec<Vec<String>> = self
            .devices
            .iter()
            .map(|device| {
                let beacon = device
                    .advertisement()
                    .beacon_kind()
                    .map(|kind| kind.to_string());
                vec![
                    self.painter.value(device.address().as_str()),
                    or_dash(device.name()).to_string(),
                    self.painter.rssi(device.rssi()),
                    or_dash(beacon.as_deref()).to_string(),
                ]
            })
            .collect();
        let table = Table::grid(["address", "name", "rssi", "beacon"], rows);
        if !table.is_empty() {
            writeln!(f, "{table}")?;
        }

        let summary = match self.devices.len() {
            1 => "1 device found".to_string(),
            count => format!("{count} devices found"),
        };
        write!(f, "{}", self.painter.success(summary))
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::address::Address;
    use crate::advertisement::Advertisement;

    #[test]
    fn discovery_table_lists_each_device() {
        let devices = vec![
            DeviceDiscovered::new(
                Address::from("AA:BB"),
                Some(-65),
                Some("Lamp".to_string()),
                Advertisement::default(),
            ),
            DeviceDiscovered::address_only(Address::from("CC:DD")),
        ];
        let painter = Painter::new(false);

        assert_snapshot!(DiscoveryTableView::new(&devices, &painter).to_string(), @r"
        ╭─────────┬──────┬─────────┬────────╮
        │ address │ name │ rssi    │ beacon │
        ├─────────┼──────┼─────────┼────────┤
        │ AA:BB   │ Lamp │ -65 dBm │ -      │
        │ CC:DD   │ -    │ -       │ -      │
        ╰─────────┴──────┴─────────┴────────╯
        2 devices found
        ");
    }

    #[test]
    fn empty_scan_prints_only_the_summary() {
        let painter = Painter::new(false);

        assert_eq!(
            "0 devices found",
            DiscoveryTableView::new(&[], &painter).to_string()
        );
    }
}
