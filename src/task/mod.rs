pub mod registry;

use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::queue::{cache::Fingerprint, WorkerId};

pub type TaskId = u64;

/// Whether a file is shipped to the worker before execution or pulled back afterwards
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// Whether a worker may keep an input file around for later tasks
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    Cache,
    NoCache,
}

/// Where the master side of a file lives
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Buffer(Vec<u8>),
}

/// A file a task needs or produces
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub(crate) source: FileSource,
    pub(crate) remote_name: String,
    pub(crate) direction: Direction,
    pub(crate) cache: CachePolicy,
    pub(crate) fingerprint: Option<Fingerprint>,
}

impl FileSpec {
    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Buffer(_) => None,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache
    }

    /// Content fingerprint. Only known after the file has been sent to a worker at least once.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    /// Outputs are always pulled fresh, so only inputs can be cached
    pub fn is_cacheable(&self) -> bool {
        self.direction == Direction::Input && self.cache == CachePolicy::Cache
    }
}

/// Lifecycle of a task. `Done` and `Failed` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Submitted,
    Dispatching,
    Running,
    Retrieving,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Assigned to a worker and holding one of its slots
    pub fn is_dispatched(self) -> bool {
        matches!(
            self,
            TaskState::Dispatching | TaskState::Running | TaskState::Retrieving
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Submitted => "submitted",
            TaskState::Dispatching => "dispatching",
            TaskState::Running => "running",
            TaskState::Retrieving => "retrieving",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a task ended up in `TaskState::Failed`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    TransferError,
    WorkerLost,
    ExecutionFailure,
    Cancelled,
}

impl FailureKind {
    /// Transfer errors and lost workers are worth another attempt, the others are final
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::TransferError | FailureKind::WorkerLost)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TransferError => "transfer error",
            FailureKind::WorkerLost => "worker lost",
            FailureKind::ExecutionFailure => "execution failure",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// One unit of work: a shell command plus the files it consumes and produces.
///
/// A `Task` is described by the application, handed over to `Queue::submit()` and returned by
/// `Queue::wait()` once it has reached a terminal state. Dropping a retrieved task releases it.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) id: Option<TaskId>,
    pub(crate) command: String,
    pub(crate) tag: Option<String>,
    pub(crate) files: Vec<FileSpec>,
    pub(crate) state: TaskState,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) host: Option<String>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) output: Vec<u8>,
    pub(crate) failure: Option<Failure>,
    pub(crate) retries: u32,
    pub(crate) submitted_at: Option<OffsetDateTime>,
    pub(crate) finished_at: Option<OffsetDateTime>,
    pub(crate) execution_time: Option<Duration>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,

    // Bookkeeping while the task is out on a worker
    pub(crate) dispatched_at: Option<Instant>,
    pub(crate) pending_outputs: usize,
    pub(crate) transfer_error: Option<String>,
    pub(crate) cancel_requested: bool,
}

impl Task {
    pub fn new<T>(command: T) -> Self
    where
        T: Into<String>,
    {
        Self {
            id: None,
            command: command.into(),
            tag: None,
            files: Vec::new(),
            state: TaskState::Created,
            worker: None,
            host: None,
            exit_code: None,
            output: Vec::new(),
            failure: None,
            retries: 0,
            submitted_at: None,
            finished_at: None,
            execution_time: None,
            bytes_sent: 0,
            bytes_received: 0,
            dispatched_at: None,
            pending_outputs: 0,
            transfer_error: None,
            cancel_requested: false,
        }
    }

    /// Declares a file on the local file system that is sent to (`Direction::Input`) or
    /// retrieved from (`Direction::Output`) the worker under `remote_name`
    pub fn specify_file<P, R>(
        &mut self,
        local_path: P,
        remote_name: R,
        direction: Direction,
        cache: CachePolicy,
    ) -> &mut Self
    where
        P: Into<PathBuf>,
        R: Into<String>,
    {
        self.files.push(FileSpec {
            source: FileSource::Path(local_path.into()),
            remote_name: remote_name.into(),
            direction,
            cache,
            fingerprint: None,
        });
        self
    }

    /// Declares an input file whose contents are held in memory
    pub fn specify_buffer<D, R>(&mut self, data: D, remote_name: R, cache: CachePolicy) -> &mut Self
    where
        D: Into<Vec<u8>>,
        R: Into<String>,
    {
        self.files.push(FileSpec {
            source: FileSource::Buffer(data.into()),
            remote_name: remote_name.into(),
            direction: Direction::Input,
            cache,
            fingerprint: None,
        });
        self
    }

    pub fn specify_tag<T>(&mut self, tag: T) -> &mut Self
    where
        T: Into<String>,
    {
        self.tag = Some(tag.into());
        self
    }

    /// Assigned on submission
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn files(&self) -> &[FileSpec] {
        &self.files
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Captured standard output of the command
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Host name of the worker that ran the final attempt
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn submitted_at(&self) -> Option<OffsetDateTime> {
        self.submitted_at
    }

    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        self.finished_at
    }

    /// Wall time between dispatch and the result message of the final attempt
    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Done
    }

    pub(crate) fn inputs(&self) -> impl Iterator<Item = &FileSpec> {
        self.files
            .iter()
            .filter(|spec| spec.direction == Direction::Input)
    }

    pub(crate) fn outputs(&self) -> impl Iterator<Item = &FileSpec> {
        self.files
            .iter()
            .filter(|spec| spec.direction == Direction::Output)
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "(unsubmitted)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_never_cacheable() {
        let mut task = Task::new("cat in.txt > out.txt");
        task.specify_file("in.txt", "in.txt", Direction::Input, CachePolicy::Cache)
            .specify_file("out.txt", "out.txt", Direction::Output, CachePolicy::Cache)
            .specify_buffer(b"abc".to_vec(), "buf", CachePolicy::NoCache);

        let cacheable = task
            .files()
            .iter()
            .map(FileSpec::is_cacheable)
            .collect::<Vec<_>>();
        assert_eq!(cacheable, vec![true, false, false]);
        assert_eq!(task.inputs().count(), 2);
        assert_eq!(task.outputs().count(), 1);
    }

    #[test]
    fn fresh_task_is_created() {
        let task = Task::new("true");
        assert_eq!(task.state(), TaskState::Created);
        assert_eq!(task.id(), None);
        assert!(!task.is_success());
        assert_eq!(task.to_string(), "(unsubmitted)");
    }

    #[test]
    fn only_transfer_and_worker_failures_are_retried() {
        assert!(FailureKind::TransferError.is_retryable());
        assert!(FailureKind::WorkerLost.is_retryable());
        assert!(!FailureKind::ExecutionFailure.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }
}
