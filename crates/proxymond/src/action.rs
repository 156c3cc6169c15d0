//! Control verbs understood by the primary instance.

use std::fmt;

/// Verb requested by an invocation or carried by the command channel.
///
/// [`Action::None`] means "no verb requested" and is never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Enable proxy monitoring.
    Start,
    /// Disable proxy monitoring.
    Stop,
    /// Tear the primary instance down.
    Quit,
    /// Nothing requested.
    None,
}

impl Action {
    /// Verbs that own a signal object, in slot order.
    pub const SIGNALLED: [Self; 3] = [Self::Start, Self::Stop, Self::Quit];

    /// Resolves the command-line flags by precedence `Quit > Stop > Start`.
    #[must_use]
    pub const fn from_flags(start: bool, stop: bool, quit: bool) -> Self {
        if quit {
            Self::Quit
        } else if stop {
            Self::Stop
        } else if start {
            Self::Start
        } else {
            Self::None
        }
    }

    /// Fixed slot of the verb's signal object, if it has one.
    #[must_use]
    pub const fn slot(self) -> Option<usize> {
        match self {
            Self::Start => Some(0),
            Self::Stop => Some(1),
            Self::Quit => Some(2),
            Self::None => None,
        }
    }

    /// Suffix appended to the base name to form the signal object name.
    #[must_use]
    pub const fn channel_suffix(self) -> Option<&'static str> {
        match self {
            Self::Start => Some("_Start"),
            Self::Stop => Some("_Stop"),
            Self::Quit => Some("_Quit"),
            Self::None => None,
        }
    }

    /// Upper-case name shown to users.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Quit => "QUIT",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.display_name())
    }
}
