pub mod config;
pub mod distributed;
pub mod errors;
pub mod queue;
pub mod task;

pub use crate::{
    config::QueueConfig,
    errors::{Error, Result},
    queue::{CancelOutcome, Queue, QueueStats},
    task::{CachePolicy, Direction, FailureKind, Task, TaskId, TaskState},
};

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");
