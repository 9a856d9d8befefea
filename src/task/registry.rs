use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    path::{Component, Path},
    time::Instant,
};

use log::{debug, warn};
use time::OffsetDateTime;

use crate::{
    errors::{Error, Result},
    queue::WorkerId,
    task::{Direction, Failure, FailureKind, Task, TaskId, TaskState},
};

/// Holds every submitted task until the application retrieves it.
///
/// Tasks waiting for a worker are kept in submission order (requeued tasks jump the line), and
/// terminal tasks are kept in completion order.
#[derive(Debug)]
pub struct TaskRegistry {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    complete: VecDeque<TaskId>,
    total_submitted: u64,
    total_completed: u64,
    total_retrieved: u64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            // IDs start at 1, like the worker-facing protocol expects
            next_id: 1,
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            complete: VecDeque::new(),
            total_submitted: 0,
            total_completed: 0,
            total_retrieved: 0,
        }
    }

    /// Takes ownership of a task, assigns it a fresh ID and queues it up for scheduling
    pub fn submit(&mut self, mut task: Task) -> Result<TaskId> {
        validate(&task)?;

        let id = self.next_id;
        self.next_id += 1;
        task.id = Some(id);
        task.submitted_at = Some(OffsetDateTime::now_utc());
        self.tasks.insert(id, task);
        self.mark_ready(id)?;
        self.total_submitted += 1;
        debug!("Task {} submitted", id);
        Ok(id)
    }

    /// `Created` -> `Submitted`
    pub fn mark_ready(&mut self, id: TaskId) -> Result<()> {
        self.transition(id, &[TaskState::Created], TaskState::Submitted)?;
        self.ready.push_back(id);
        Ok(())
    }

    /// `Submitted` -> `Dispatching`
    pub fn mark_dispatching(&mut self, id: TaskId, worker: WorkerId) -> Result<()> {
        let task = self.transition(id, &[TaskState::Submitted], TaskState::Dispatching)?;
        task.worker = Some(worker);
        task.dispatched_at = Some(Instant::now());
        self.ready.retain(|&ready_id| ready_id != id);
        Ok(())
    }

    /// `Dispatching` -> `Running`
    pub fn mark_running(&mut self, id: TaskId) -> Result<()> {
        self.transition(id, &[TaskState::Dispatching], TaskState::Running)?;
        Ok(())
    }

    /// `Running` -> `Retrieving`. Records what the worker reported about the execution.
    pub fn mark_retrieving(&mut self, id: TaskId, exit_code: i32, output: Vec<u8>) -> Result<()> {
        let task = self.transition(id, &[TaskState::Running], TaskState::Retrieving)?;
        task.exit_code = Some(exit_code);
        task.bytes_received += output.len() as u64;
        task.output = output;
        task.execution_time = task.dispatched_at.map(|start| start.elapsed());
        Ok(())
    }

    /// `Retrieving` -> `Done`
    pub fn mark_done(&mut self, id: TaskId) -> Result<()> {
        let task = self.transition(id, &[TaskState::Retrieving], TaskState::Done)?;
        task.finished_at = Some(OffsetDateTime::now_utc());
        task.dispatched_at = None;
        self.complete.push_back(id);
        self.total_completed += 1;
        Ok(())
    }

    /// Any non-terminal state -> `Failed`
    pub fn mark_failed<T>(&mut self, id: TaskId, kind: FailureKind, reason: T) -> Result<()>
    where
        T: Into<String>,
    {
        let task = self.transition(
            id,
            &[
                TaskState::Created,
                TaskState::Submitted,
                TaskState::Dispatching,
                TaskState::Running,
                TaskState::Retrieving,
            ],
            TaskState::Failed,
        )?;
        let failure = Failure {
            kind,
            reason: reason.into(),
        };
        warn!("Task {} failed ({})", id, failure);
        task.failure = Some(failure);
        task.finished_at = Some(OffsetDateTime::now_utc());
        task.dispatched_at = None;
        self.ready.retain(|&ready_id| ready_id != id);
        self.complete.push_back(id);
        self.total_completed += 1;
        Ok(())
    }

    /// Dispatched state -> `Submitted`, without consuming retry budget. The task is put at the
    /// front of the line.
    pub fn requeue(&mut self, id: TaskId) -> Result<()> {
        let task = self.transition(
            id,
            &[
                TaskState::Dispatching,
                TaskState::Running,
                TaskState::Retrieving,
            ],
            TaskState::Submitted,
        )?;
        task.worker = None;
        task.dispatched_at = None;
        task.pending_outputs = 0;
        task.transfer_error = None;
        task.exit_code = None;
        task.output.clear();
        self.ready.push_front(id);
        Ok(())
    }

    /// Requeues the task if it has retries left, fails it with the given cause otherwise.
    /// Returns the state the task ended up in.
    pub fn retry_or_fail<T>(
        &mut self,
        id: TaskId,
        kind: FailureKind,
        reason: T,
        budget: u32,
    ) -> Result<TaskState>
    where
        T: Into<String>,
    {
        let task = self.tasks.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        let reason = reason.into();
        if kind.is_retryable() && task.retries < budget {
            task.retries += 1;
            warn!(
                "Task {} will be retried ({}: {}), attempt {} of {}",
                id,
                kind,
                reason,
                task.retries + 1,
                budget + 1
            );
            self.requeue(id)?;
            Ok(TaskState::Submitted)
        } else {
            self.mark_failed(id, kind, reason)?;
            Ok(TaskState::Failed)
        }
    }

    /// Takes a task that has not been dispatched yet out of the registry
    pub fn cancel_submitted(&mut self, id: TaskId) -> Result<Task> {
        self.transition(id, &[TaskState::Submitted], TaskState::Failed)?;
        self.ready.retain(|&ready_id| ready_id != id);
        let mut task = self.tasks.remove(&id).ok_or(Error::UnknownTask(id))?;
        task.failure = Some(Failure {
            kind: FailureKind::Cancelled,
            reason: "cancelled before dispatch".into(),
        });
        task.finished_at = Some(OffsetDateTime::now_utc());
        Ok(task)
    }

    /// Removes and returns the oldest terminal task, if any
    pub fn take_completed(&mut self) -> Option<Task> {
        while let Some(id) = self.complete.pop_front() {
            if let Some(task) = self.tasks.remove(&id) {
                self.total_retrieved += 1;
                return Some(task);
            }
        }
        None
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// IDs of the tasks waiting for a worker, in the order they should be considered
    pub fn ready(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready.iter().copied()
    }

    /// The oldest task with the given tag that has not reached a terminal state yet
    pub fn find_by_tag(&self, tag: &str) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|task| !task.state.is_terminal() && task.tag.as_deref() == Some(tag))
            .and_then(|task| task.id)
    }

    /// IDs of all tasks that have not reached a terminal state yet
    pub fn outstanding(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, task)| !task.state.is_terminal())
            .map(|(&id, _)| id)
            .collect()
    }

    /// No task is known at all, neither in flight nor waiting for retrieval
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// At least one task may still reach a terminal state
    pub fn has_outstanding(&self) -> bool {
        self.tasks.len() > self.complete.len()
    }

    pub fn count(&self, state: TaskState) -> usize {
        match state {
            TaskState::Submitted => self.ready.len(),
            _ => self.tasks.values().filter(|task| task.state == state).count(),
        }
    }

    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }

    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }

    pub fn total_retrieved(&self) -> u64 {
        self.total_retrieved
    }

    /// Drops every task. Used when the queue shuts down.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.ready.clear();
        self.complete.clear();
    }

    fn transition(
        &mut self,
        id: TaskId,
        allowed: &[TaskState],
        to: TaskState,
    ) -> Result<&mut Task> {
        let task = self.tasks.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        if !allowed.contains(&task.state) {
            return Err(Error::InvalidTransition {
                task: id,
                from: task.state,
                to,
            });
        }
        task.state = to;
        Ok(task)
    }
}

/// Rejects tasks that can not possibly be executed
fn validate(task: &Task) -> Result<()> {
    if task.state != TaskState::Created {
        return Err(Error::InvalidTask("the task has already been submitted".into()));
    }
    if task.command.trim().is_empty() {
        return Err(Error::InvalidTask("the command is empty".into()));
    }

    let mut inputs = HashSet::new();
    let mut outputs = HashSet::new();
    for spec in &task.files {
        let remote_path = Path::new(&spec.remote_name);
        let escapes_sandbox = remote_path
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if spec.remote_name.is_empty() || escapes_sandbox {
            return Err(Error::InvalidTask(format!(
                "\"{}\" is not a valid remote file name",
                spec.remote_name
            )));
        }
        let names = match spec.direction {
            Direction::Input => &mut inputs,
            Direction::Output => &mut outputs,
        };
        if !names.insert(spec.remote_name.as_str()) {
            return Err(Error::InvalidTask(format!(
                "the remote file name \"{}\" is used more than once",
                spec.remote_name
            )));
        }
    }
    Ok(())
}
