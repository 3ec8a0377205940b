use serde::{Deserialize, Serialize};
use std::fmt;

/// Host environment signal pushed into the multiplexer.
///
/// Browser hosts map `online`/`offline`, window `focus`/`blur` and
/// `visibilitychange` onto these; native hosts may emit them from their own
/// reachability and foreground/background notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEvent {
    Online,
    Offline,
    Focus,
    Blur,
    Visible,
    Hidden,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkEvent::Online => "online",
            NetworkEvent::Offline => "offline",
            NetworkEvent::Focus => "focus",
            NetworkEvent::Blur => "blur",
            NetworkEvent::Visible => "visible",
            NetworkEvent::Hidden => "hidden",
        };
        write!(f, "{}", name)
    }
}
