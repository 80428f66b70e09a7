pub mod task;
pub mod task_log;
pub mod task_relation;
pub mod task_tree;

// Re-export core models for easy access
pub use task::{CreateTaskParams, Task, TaskEvent};
pub use task_log::TaskLog;
pub use task_relation::TaskRelation;
pub use task_tree::{format_task_tree, TaskListQuery, TaskTreeNode};
