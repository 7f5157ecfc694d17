use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::utils::format_rssi;

const STRONG_SIGNAL_DBM: i16 = -60;
const WEAK_SIGNAL_DBM: i16 = -80;

/// Applies colour and style to terminal text.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().cyan())
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().green())
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().dimmed())
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold())
    }

    /// Renders signal strength coloured by band.
    pub(crate) fn rssi(&self, rssi: Option<i16>) -> String {
        let text = format_rssi(rssi);
        let style = match rssi {
            None => return self.muted(text),
            Some(value) if value >= STRONG_SIGNAL_DBM => OwoStyle::new().green(),
            Some(value) if value >= WEAK_SIGNAL_DBM => OwoStyle::new().yellow(),
            Some(_) => OwoStyle::new().red(),
        };
        self.paint(&text, style)
    }

    fn paint(&self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}
