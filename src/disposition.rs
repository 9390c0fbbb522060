use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Final outcome a scanner plugin can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Disposition {
    /// Go on with the next plugin
    #[default]
    NoOpinion,
    Accept,
    Delete,
    Reject,
    Defer,
}

impl Disposition {
    pub const ALL: [Disposition; 5] = [
        Disposition::NoOpinion,
        Disposition::Accept,
        Disposition::Delete,
        Disposition::Reject,
        Disposition::Defer,
    ];

    pub fn code(self) -> i32 {
        match self {
            Disposition::NoOpinion => 0,
            Disposition::Accept => 1,
            Disposition::Delete => 2,
            Disposition::Reject => 3,
            Disposition::Defer => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.code() == code)
    }

    /// Anything but `NoOpinion` stops the scanner pipeline.
    pub fn is_terminal(self) -> bool {
        self != Disposition::NoOpinion
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::NoOpinion => "DUNNO",
            Disposition::Accept => "ACCEPT",
            Disposition::Delete => "DELETE",
            Disposition::Reject => "REJECT",
            Disposition::Defer => "DEFER",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Disposition {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DUNNO" | "NOOPINION" | "NO_OPINION" => Ok(Disposition::NoOpinion),
            "ACCEPT" => Ok(Disposition::Accept),
            // DISCARD is the MTA word for it
            "DELETE" | "DISCARD" => Ok(Disposition::Delete),
            "REJECT" => Ok(Disposition::Reject),
            "DEFER" => Ok(Disposition::Defer),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

impl TryFrom<String> for Disposition {
    type Error = UnknownAction;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Disposition> for String {
    fn from(value: Disposition) -> Self {
        value.as_str().to_string()
    }
}

/// Raw action code as reported by a plugin.
///
/// Plugins may hand back codes outside the known range; those are kept as-is
/// so the session can refuse them instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActionCode(i32);

impl ActionCode {
    pub const DUNNO: ActionCode = ActionCode(0);

    pub fn from_raw(code: i32) -> Self {
        ActionCode(code)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    /// `None` for codes that do not name a known disposition.
    pub fn disposition(self) -> Option<Disposition> {
        Disposition::from_code(self.0)
    }

    pub fn is_valid(self) -> bool {
        self.disposition().is_some()
    }
}

impl Default for ActionCode {
    fn default() -> Self {
        ActionCode::DUNNO
    }
}

impl From<Disposition> for ActionCode {
    fn from(value: Disposition) -> Self {
        ActionCode(value.code())
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disposition() {
            Some(disposition) => f.write_str(disposition.as_str()),
            None => write!(f, "INVALID ACTION CODE {}", self.0),
        }
    }
}

/// What a scanner plugin returns: an action, optionally with a reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: ActionCode,
    pub message: Option<String>,
}

impl Verdict {
    pub fn with_message(disposition: Disposition, message: impl Into<String>) -> Self {
        Self {
            action: disposition.into(),
            message: Some(message.into()),
        }
    }

    pub fn from_code(code: i32) -> Self {
        Self {
            action: ActionCode::from_raw(code),
            message: None,
        }
    }
}

impl From<Disposition> for Verdict {
    fn from(value: Disposition) -> Self {
        Self {
            action: value.into(),
            message: None,
        }
    }
}
