//! # System Constants
//!
//! Names shared between the scheduler and the store: notification channels,
//! built-in task types and operational defaults.

pub use crate::state_machine::{LogSeverity, TaskStatus};

/// Notification channel naming. Each status has exactly one channel,
/// `tasks_<status>`, whose payload is the decimal task id.
pub mod channels {
    use crate::state_machine::TaskStatus;

    pub const CHANNEL_PREFIX: &str = "tasks";
    pub const CHANNEL_SEPARATOR: char = '_';

    /// Channel carrying transitions into `status`
    pub fn channel_for(status: TaskStatus) -> String {
        format!("{CHANNEL_PREFIX}{CHANNEL_SEPARATOR}{}", status.as_str())
    }
}

/// Built-in control task types
pub mod task_types {
    pub const DELAY: &str = "delayTask";
    pub const ERROR: &str = "errorTask";
    pub const FOR_EACH: &str = "forEachTask";
    pub const GROUP: &str = "groupTask";
    pub const GROUP_OUTPUTS: &str = "groupOutputsTask";
    pub const REDUCE: &str = "reduceTasks";
    pub const AFTER_REDUCE: &str = "afterReduceTasks";
}

pub mod system {
    /// Default page size when listing root tasks
    pub const DEFAULT_TASK_PAGE_SIZE: i64 = 25;
    /// Default number of log lines returned per page
    pub const DEFAULT_LOG_PAGE_SIZE: i64 = 25;
    /// Capacity of the in-process notification broadcast
    pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;
    /// Pause before re-reading a notification stream that returned an error
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
}
