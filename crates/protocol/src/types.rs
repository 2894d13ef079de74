use serde::{Deserialize, Serialize};

/// Server-side lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "expired")]
    Expired,
}

impl SessionState {
    /// Returns `true` once the session can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Active)
    }
}
