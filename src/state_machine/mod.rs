// Task status vocabulary shared by the listener, processor and scheduler.
//
// Transitions themselves are single statements against the store; this module
// only defines the closed set of states and their total order.

pub mod states;

pub use states::{LogSeverity, TaskStatus};
