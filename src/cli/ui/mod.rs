mod attribute_view;
mod device_view;
mod painter;
mod table;
mod watch_view;

pub(crate) use self::attribute_view::{AttributeTreeView, NotificationView};
pub(crate) use self::device_view::DiscoveryTableView;
pub(crate) use self::painter::Painter;
pub(crate) use self::watch_view::{BeaconLineView, WatchListView};
