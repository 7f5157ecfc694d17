pub(crate) mod command;
pub(crate) mod connect;
pub(crate) mod scan;
pub(crate) mod ui;
pub(crate) mod watch;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::connect::ConnectArgs;
pub use self::scan::ScanArgs;
pub use self::watch::WatchArgs;
