//! Presence Status
//!
//! A user's aggregate status, derived from their live connections across all
//! devices and processes. The most active connection wins: online beats away
//! beats offline.

use serde::{Deserialize, Serialize};

/// Aggregate presence status of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one live connection heartbeated recently.
    Online,
    /// Connections exist but none showed activity within the idle threshold.
    Away,
    /// No live connections anywhere.
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
