use serde::{Deserialize, Serialize};
use std::fmt;

/// Task status as stored in `tasks.status`.
///
/// Variants are declared from most to least pessimistic, so the derived `Ord`
/// is the order used to fold a tree into its group status:
/// `aborting < error < initializing < running < pending < success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Cancellation requested while running; not terminal
    Aborting,
    /// Task failed
    Error,
    /// Group placeholder whose sub-tasks are still being enumerated
    Initializing,
    /// Claimed by a processor
    Running,
    /// Waiting to be claimed
    Pending,
    /// Task completed and its output is set
    Success,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Aborting,
        Self::Error,
        Self::Initializing,
        Self::Running,
        Self::Pending,
        Self::Success,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborting => "aborting",
            Self::Error => "error",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Success => "success",
        }
    }

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Most pessimistic status of `statuses`, or `None` when empty.
    pub fn most_pessimistic<I>(statuses: I) -> Option<TaskStatus>
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        statuses.into_iter().min()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aborting" => Ok(Self::Aborting),
            "error" => Ok(Self::Error),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Severity of a persisted task log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Debug,
    Log,
    Warn,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "log" => Ok(Self::Log),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log severity: {s}")),
        }
    }
}
