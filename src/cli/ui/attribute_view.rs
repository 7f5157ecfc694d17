use std::fmt::{self, Display, Formatter};

use crate::attribute::Service;
use crate::subscriptions::Notification;
use crate::utils::format_hex;

use super::painter::Painter;
use super::table::Table;

/// Renders a discovered attribute tree, one row per characteristic and descriptor.
pub(crate) struct AttributeTreeView<'a> {
    address: &'a str,
    rssi: Option<i16>,
    services: &'a [Service],
    painter: &'a Painter,
}

impl<'a> AttributeTreeView<'a> {
    pub(crate) fn new(
        address: &'a str,
        rssi: Option<i16>,
        services: &'a [Service],
        painter: &'a Painter,
    ) -> Self {
        Self {
            address,
            rssi,
            services,
            painter,
        }
    }
}

impl Display for AttributeTreeView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({})",
            self.painter.heading("Connected to"),
            self.painter.value(self.address),
            self.painter.rssi(self.rssi),
        )?;

        let mut rows = Vec::new();
        for service in self.services {
            for characteristic in service.characteristics() {
                rows.push(vec![
                    characteristic.path().to_string(),
                    characteristic.properties().labels().join(","),
                    format_hex(characteristic.value()),
                ]);
                for descriptor in characteristic.descriptors() {
                    rows.push(vec![
                        self.painter.muted(descriptor.path()),
                        String::new(),
                        format_hex(descriptor.value()),
                    ]);
                }
            }
        }
        write!(f, "{}", Table::grid(["path", "properties", "value"], rows))
    }
}

/// One line per received notification.
pub(crate) struct NotificationView<'a> {
    index: usize,
    notification: &'a Notification,
    painter: &'a Painter,
}

impl<'a> NotificationView<'a> {
    pub(crate) fn new(index: usize, notification: &'a Notification, painter: &'a Painter) -> Self {
        Self {
            index,
            notification,
            painter,
        }
    }
}

impl Display for NotificationView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.painter.muted(format!("#{}", self.index)),
            self.notification.path(),
            self.painter.value(format_hex(self.notification.value())),
        )
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::attribute::{Characteristic, CharacteristicProperties, Descriptor};

    #[test]
    fn tree_lists_characteristics_before_their_descriptors() {
        let properties = CharacteristicProperties {
            read: true,
            notify: true,
            ..CharacteristicProperties::default()
        };
        let services = vec![Service::new(
            "180f",
            vec![Characteristic::new(
                "180f",
                "2a19",
                properties,
                vec![0x64],
                vec![Descriptor::new("180f/2a19", "2902", vec![0, 0])],
            )],
        )];
        let painter = Painter::new(false);

        assert_snapshot!(AttributeTreeView::new("AA:BB", Some(-65), &services, &painter).to_string(), @r"
        Connected to AA:BB (-65 dBm)
        ╭────────────────┬─────────────┬───────╮
        │ path           │ properties  │ value │
        ├────────────────┼─────────────┼───────┤
        │ 180f/2a19      │ read,notify │ 64    │
        │ 180f/2a19/2902 │             │ 00 00 │
        ╰────────────────┴─────────────┴───────╯
        ");
    }

    #[test]
    fn notification_line_shows_index_path_and_bytes() {
        let notification = Notification::new("AA:BB", "180f/2a19", vec![0x63]);
        let painter = Painter::new(false);

        assert_eq!(
            "#1 180f/2a19 63",
            NotificationView::new(1, &notification, &painter).to_string()
        );
    }
}
