//! # Registry
//!
//! Task handler lookup by task type.

pub mod handler_registry;

pub use handler_registry::{FnHandler, HandlerRegistry, TaskHandler};
