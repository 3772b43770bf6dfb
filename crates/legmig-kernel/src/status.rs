use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of one migration run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Ongoing,
    Success,
    Failed,
    Restart,
    Done,
    Paused,
}

impl RunStatus {
    /// Statuses that represent unresolved work; at most one row per migrator
    /// may sit in one of these.
    pub const ACTIVE: [RunStatus; 3] = [RunStatus::Pending, RunStatus::Ongoing, RunStatus::Failed];

    pub const ALL: [RunStatus; 7] = [
        RunStatus::Pending,
        RunStatus::Ongoing,
        RunStatus::Success,
        RunStatus::Failed,
        RunStatus::Restart,
        RunStatus::Done,
        RunStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Ongoing => "ongoing",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Restart => "restart",
            RunStatus::Done => "done",
            RunStatus::Paused => "paused",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matches_display() {
        for status in RunStatus::ALL {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("active".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_pending_ongoing_failed_are_active() {
        let active: Vec<_> = RunStatus::ALL.iter().filter(|s| s.is_active()).collect();
        assert_eq!(
            active,
            vec![&RunStatus::Pending, &RunStatus::Ongoing, &RunStatus::Failed]
        );
    }
}
