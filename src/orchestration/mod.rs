//! # Orchestration
//!
//! The three roles built over the task store:
//!
//! - [`TaskListener`] - one notification connection plus the shared store primitives
//! - [`TaskProcessor`] - claims and executes ready tasks, one at a time
//! - [`TaskScheduler`] - creation, listing, trees, abort and `wait`
//!
//! ```text
//! create -> pending --notify--> processors race on claim_ready
//!        -> running -> success | error --notify--> waiters, dependents
//! ```

pub mod context;
pub mod listener;
pub mod processor;
pub mod scheduler;
pub mod single_flight;

pub use context::{Services, TaskGroup, TaskHandlerContext, TaskLogger, TaskSpawner};
pub use listener::TaskListener;
pub use processor::TaskProcessor;
pub use scheduler::TaskScheduler;
pub use single_flight::{SingleFlight, SingleFlightTrigger};
