use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::QueueConfig,
    distributed::{Message, StagedFile},
    errors::{Error, Result},
    queue::{
        cache::{FileCacheTracker, Fingerprint, Residency},
        scheduler::choose_worker,
        workers::{ConnectionId, WorkerId, WorkerRegistry, WorkerState},
        CancelOutcome, QueueStats,
    },
    task::{
        registry::TaskRegistry, Direction, FailureKind, FileSource, FileSpec, Task, TaskId,
        TaskState,
    },
};

/// Fast abort only kicks in once the average execution time is based on this many tasks
const FAST_ABORT_MIN_SAMPLES: u64 = 10;

/// A scheduling decision the dispatcher has to carry out
#[derive(Debug, Clone)]
pub(crate) struct Assignment {
    pub worker: WorkerId,
    pub connection: ConnectionId,
    pub task_id: TaskId,
    pub command: String,
    pub inputs: Vec<FileSpec>,
    pub outputs: Vec<String>,
}

/// An input after the dispatcher has looked at it outside of the lock. The fingerprint of `spec`
/// is set for cacheable inputs only, `data` is left out for inputs already resident on the worker.
#[derive(Debug)]
pub(crate) struct PreparedInput {
    pub spec: FileSpec,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Totals {
    files_sent: u64,
    bytes_sent: u64,
    bytes_received: u64,
    execution_time: Duration,
    timed_tasks: u64,
}

/// Every piece of shared state of a queue. All mutations happen through `&mut Core` while the
/// queue's mutex is held. Messages for workers are collected in an outbox that the dispatcher
/// drains after each round.
#[derive(Debug)]
pub(crate) struct Core {
    pub config: QueueConfig,
    pub tasks: TaskRegistry,
    pub workers: WorkerRegistry,
    pub cache: FileCacheTracker,
    pub shutting_down: bool,
    known_fingerprints: HashMap<PathBuf, Fingerprint>,
    outbox: Vec<(ConnectionId, Message)>,
    retiring: Vec<ConnectionId>,
    totals: Totals,
}

impl Core {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            tasks: TaskRegistry::new(),
            workers: WorkerRegistry::new(),
            cache: FileCacheTracker::new(),
            shutting_down: false,
            known_fingerprints: HashMap::new(),
            outbox: Vec::new(),
            retiring: Vec::new(),
            totals: Totals::default(),
        }
    }

    pub fn submit(&mut self, task: Task) -> Result<TaskId> {
        self.tasks.submit(task)
    }

    pub fn handshake(
        &mut self,
        connection: ConnectionId,
        hostname: String,
        address: SocketAddr,
        capacity: u32,
    ) -> Result<WorkerId> {
        let capacity = usize::try_from(capacity).map_err(|_e| Error::ArchitectureError)?;
        self.workers.register(connection, hostname, address, capacity)
    }

    pub fn heard_from(&mut self, worker: WorkerId) {
        // The worker might have been removed in the meantime
        let _ = self.workers.heartbeat(worker);
    }

    /// Assigns waiting tasks to workers with free slots, in queue order, until either runs out
    pub fn schedule(&mut self) -> Vec<Assignment> {
        let mut assignments = Vec::new();
        let ready = self.tasks.ready().collect::<Vec<_>>();

        for task_id in ready {
            if !self.workers.has_free_slots() {
                break;
            }
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            let Some(worker_id) = choose_worker(
                task,
                self.config.algorithm,
                &self.workers,
                &self.cache,
                &self.known_fingerprints,
            ) else {
                break;
            };
            let assignment = match self.assign(task_id, worker_id) {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!("Could not assign task {} to worker #{}: {}", task_id, worker_id, e);
                    continue;
                }
            };
            assignments.push(assignment);
        }
        assignments
    }

    fn assign(&mut self, task_id: TaskId, worker_id: WorkerId) -> Result<Assignment> {
        self.workers.reserve(worker_id, task_id)?;
        if let Err(e) = self.tasks.mark_dispatching(task_id, worker_id) {
            self.workers.release(worker_id, task_id);
            return Err(e);
        }

        let worker = self.workers.get(worker_id)?;
        let (connection, hostname) = (worker.connection, worker.hostname.clone());
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        task.host = Some(hostname);
        debug!("Task {} goes to worker #{}", task_id, worker_id);

        Ok(Assignment {
            worker: worker_id,
            connection,
            task_id,
            command: task.command.clone(),
            inputs: task.inputs().cloned().collect(),
            outputs: task
                .outputs()
                .map(|spec| spec.remote_name.clone())
                .collect(),
        })
    }

    /// Decides for each input whether it has to be pushed to `worker`. Cacheable inputs sharing a
    /// fingerprint are pushed once, the others are taken from the worker's cache.
    pub fn plan_transfers<'a, I>(&self, worker: WorkerId, inputs: I) -> Vec<Residency>
    where
        I: IntoIterator<Item = &'a FileSpec>,
    {
        let mut pushed = HashSet::new();
        inputs
            .into_iter()
            .map(|spec| match (self.cache.resolve(worker, spec), spec.fingerprint) {
                (Residency::NeedsTransfer, Some(fingerprint))
                    if spec.is_cacheable() && !pushed.insert(fingerprint) =>
                {
                    Residency::Cached
                }
                (residency, _) => residency,
            })
            .collect()
    }

    /// Queues the transfers and the run command of an assignment. Cacheable inputs are recorded
    /// as resident as soon as their `Put` is queued.
    pub fn stage(&mut self, assignment: &Assignment, inputs: Vec<PreparedInput>) -> Result<()> {
        let task_id = assignment.task_id;
        let worker = assignment.worker;
        let task = self.owned_task_mut(worker, task_id)?;
        if task.state != TaskState::Dispatching {
            return Err(Error::InvalidTransition {
                task: task_id,
                from: task.state,
                to: TaskState::Running,
            });
        }
        if task.cancel_requested {
            return self.finish_cancelled(worker, task_id);
        }

        for input in &inputs {
            if let Some(fingerprint) = input.spec.fingerprint {
                self.note_fingerprint(task_id, &input.spec.remote_name, fingerprint);
            }
        }

        let plan = self.plan_transfers(worker, inputs.iter().map(|input| &input.spec));
        if let Some((input, _)) = inputs.iter().zip(&plan).find(|&(input, residency)| {
            *residency == Residency::NeedsTransfer && input.data.is_none()
        }) {
            let reason = format!("no data to send for \"{}\"", input.spec.remote_name);
            return self.transfer_failed(worker, task_id, reason);
        }

        let mut staged = Vec::with_capacity(inputs.len());
        let mut messages = Vec::new();
        let mut bytes_sent = 0;
        for (PreparedInput { spec, data }, residency) in inputs.into_iter().zip(plan) {
            let cache_key = spec.fingerprint.filter(|_| spec.is_cacheable());
            if let (Residency::NeedsTransfer, Some(data)) = (residency, data) {
                bytes_sent += data.len() as u64;
                if let Some(fingerprint) = cache_key {
                    self.cache.record(worker, fingerprint, spec.remote_name.as_str());
                }
                messages.push(Message::Put {
                    task_id,
                    remote_name: spec.remote_name.clone(),
                    cache_key,
                    data,
                });
            }
            staged.push(StagedFile {
                remote_name: spec.remote_name,
                cache_key,
            });
        }

        self.totals.files_sent += messages.len() as u64;
        self.totals.bytes_sent += bytes_sent;
        if let Ok(worker) = self.workers.get_mut(worker) {
            worker.bytes_sent += bytes_sent;
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.bytes_sent += bytes_sent;
        }

        messages.push(Message::Run {
            task_id,
            command: assignment.command.clone(),
            inputs: staged,
            outputs: assignment.outputs.clone(),
        });
        self.outbox.extend(
            messages
                .into_iter()
                .map(|message| (assignment.connection, message)),
        );
        Ok(())
    }

    fn note_fingerprint(&mut self, task_id: TaskId, remote_name: &str, fingerprint: Fingerprint) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if let Some(spec) = task
            .files
            .iter_mut()
            .find(|spec| spec.direction == Direction::Input && spec.remote_name == remote_name)
        {
            spec.fingerprint = Some(fingerprint);
            if let FileSource::Path(path) = &spec.source {
                self.known_fingerprints.insert(path.clone(), fingerprint);
            }
        }
    }

    /// An input could not be read or sent. The task gets its slot back and is retried or failed.
    pub fn transfer_failed<T>(&mut self, worker: WorkerId, task_id: TaskId, reason: T) -> Result<()>
    where
        T: Into<String>,
    {
        self.owned_task_mut(worker, task_id)?;
        self.release_slot(worker, task_id);
        self.tasks.retry_or_fail(
            task_id,
            FailureKind::TransferError,
            reason,
            self.config.retry_budget,
        )?;
        Ok(())
    }

    pub fn task_started(&mut self, worker: WorkerId, task_id: TaskId) -> Result<()> {
        self.owned_task_mut(worker, task_id)?;
        self.tasks.mark_running(task_id)?;
        debug!("Task {} is running on worker #{}", task_id, worker);
        Ok(())
    }

    /// The command has finished. Asks the worker for each output file, or finishes the task
    /// right away if it has none.
    pub fn task_result(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
        exit_code: i32,
        output: Vec<u8>,
    ) -> Result<()> {
        let task = self.owned_task_mut(worker, task_id)?;
        if task.cancel_requested {
            return self.finish_cancelled(worker, task_id);
        }
        if task.state == TaskState::Dispatching {
            self.tasks.mark_running(task_id)?;
        }

        let output_len = output.len() as u64;
        self.tasks.mark_retrieving(task_id, exit_code, output)?;
        self.totals.bytes_received += output_len;
        if let Ok(worker) = self.workers.get_mut(worker) {
            worker.bytes_received += output_len;
        }

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        let outputs = task
            .outputs()
            .map(|spec| spec.remote_name.clone())
            .collect::<Vec<_>>();
        task.pending_outputs = outputs.len();
        if outputs.is_empty() {
            return self.finish(worker, task_id);
        }

        let connection = self.workers.get(worker)?.connection;
        self.outbox
            .extend(outputs.into_iter().map(|remote_name| {
                (
                    connection,
                    Message::Get {
                        task_id,
                        remote_name,
                    },
                )
            }));
        Ok(())
    }

    /// Local path an output file of a retrieving task is written to
    pub fn output_destination(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
        remote_name: &str,
    ) -> Result<PathBuf> {
        let task = self.owned_task_mut(worker, task_id)?;
        if task.state != TaskState::Retrieving {
            return Err(Error::Protocol(format!(
                "task {task_id} is {} and does not expect output files",
                task.state
            )));
        }
        task.outputs()
            .find(|spec| spec.remote_name == remote_name)
            .and_then(|spec| spec.local_path())
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "task {task_id} has no output file \"{remote_name}\""
                ))
            })
    }

    /// One output file of a retrieving task has been dealt with, successfully (number of bytes
    /// written) or not (reason)
    pub fn output_stored(
        &mut self,
        worker: WorkerId,
        task_id: TaskId,
        remote_name: &str,
        outcome: std::result::Result<u64, String>,
    ) -> Result<()> {
        let task = self.owned_task_mut(worker, task_id)?;
        match outcome {
            Ok(bytes) => {
                task.bytes_received += bytes;
                self.totals.bytes_received += bytes;
                if let Ok(worker) = self.workers.get_mut(worker) {
                    worker.bytes_received += bytes;
                }
            }
            Err(reason) => {
                warn!(
                    "Retrieving \"{}\" of task {} failed: {}",
                    remote_name, task_id, reason
                );
                task.transfer_error
                    .get_or_insert_with(|| format!("\"{remote_name}\": {reason}"));
            }
        }

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        task.pending_outputs = task.pending_outputs.saturating_sub(1);
        if task.pending_outputs == 0 {
            self.finish(worker, task_id)?;
        }
        Ok(())
    }

    /// The worker confirms that it killed a cancelled task
    pub fn task_cancelled(&mut self, worker: WorkerId, task_id: TaskId) -> Result<()> {
        self.owned_task_mut(worker, task_id)?;
        self.finish_cancelled(worker, task_id)
    }

    fn finish(&mut self, worker_id: WorkerId, task_id: TaskId) -> Result<()> {
        self.release_slot(worker_id, task_id);

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        let exit_code = task.exit_code.unwrap_or_default();
        let transfer_error = task.transfer_error.take();
        let execution_time = task.execution_time.unwrap_or_default();

        self.totals.execution_time += execution_time;
        self.totals.timed_tasks += 1;
        if let Ok(worker) = self.workers.get_mut(worker_id) {
            worker.tasks_completed += 1;
            worker.total_task_time += execution_time;
        }

        if exit_code != 0 {
            self.tasks.mark_failed(
                task_id,
                FailureKind::ExecutionFailure,
                format!("command exited with status {exit_code}"),
            )
        } else if let Some(reason) = transfer_error {
            self.tasks
                .retry_or_fail(
                    task_id,
                    FailureKind::TransferError,
                    reason,
                    self.config.retry_budget,
                )
                .map(|_state| ())
        } else {
            self.tasks.mark_done(task_id)?;
            info!(
                "Task {} done after {:.2}s",
                task_id,
                execution_time.as_secs_f64()
            );
            Ok(())
        }
    }

    fn finish_cancelled(&mut self, worker: WorkerId, task_id: TaskId) -> Result<()> {
        self.release_slot(worker, task_id);
        self.tasks
            .mark_failed(task_id, FailureKind::Cancelled, "cancelled by the application")
    }

    /// Frees the slot a task held and lets the worker clean up after it
    fn release_slot(&mut self, worker_id: WorkerId, task_id: TaskId) {
        if self.workers.release(worker_id, task_id) {
            if let Ok(worker) = self.workers.get(worker_id) {
                self.outbox
                    .push((worker.connection, Message::Release { task_id }));
            }
        }
    }

    /// Removes a worker. Its cache entries are forgotten and the tasks it held are retried or
    /// failed with `FailureKind::WorkerLost`.
    pub fn disconnect(&mut self, worker_id: WorkerId, reason: &str) {
        let Some(worker) = self.workers.remove(worker_id) else {
            return;
        };
        debug!(
            "Forgetting {} cached file(s) of worker {}",
            self.cache.files_on(worker_id),
            worker.label()
        );
        self.cache.forget_worker(worker_id);
        if worker.tasks.is_empty() {
            info!("Worker {} left: {}", worker.label(), reason);
        } else {
            warn!(
                "Worker {} lost with {} task(s): {}",
                worker.label(),
                worker.tasks.len(),
                reason
            );
        }

        for task_id in worker.tasks {
            let cancelled = self
                .tasks
                .get(task_id)
                .is_some_and(|task| task.cancel_requested);
            let outcome = if cancelled {
                self.tasks.mark_failed(
                    task_id,
                    FailureKind::Cancelled,
                    "cancelled by the application",
                )
            } else {
                self.tasks
                    .retry_or_fail(
                        task_id,
                        FailureKind::WorkerLost,
                        format!("worker {} went away: {}", worker.hostname, reason),
                        self.config.retry_budget,
                    )
                    .map(|_state| ())
            };
            if let Err(e) = outcome {
                warn!("Could not recover task {}: {}", task_id, e);
            }
        }
    }

    pub fn cancel(&mut self, task_id: TaskId) -> Result<CancelOutcome> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        match task.state {
            TaskState::Submitted => {
                let task = self.tasks.cancel_submitted(task_id)?;
                info!("Task {} cancelled before dispatch", task_id);
                Ok(CancelOutcome::Removed(task))
            }
            TaskState::Dispatching | TaskState::Running => {
                if !task.cancel_requested {
                    task.cancel_requested = true;
                    let connection = task
                        .worker
                        .and_then(|worker| self.workers.get(worker).ok())
                        .map(|worker| worker.connection);
                    if let Some(connection) = connection {
                        self.outbox.push((connection, Message::Cancel { task_id }));
                    }
                    info!("Asked worker to cancel task {}", task_id);
                }
                Ok(CancelOutcome::Signalled)
            }
            _ => Ok(CancelOutcome::Unaffected),
        }
    }

    pub fn cancel_by_tag(&mut self, tag: &str) -> Option<CancelOutcome> {
        let task_id = self.tasks.find_by_tag(tag)?;
        self.cancel(task_id).ok()
    }

    /// Cancels every outstanding task. Returns the ones that could be removed right away.
    pub fn cancel_all(&mut self) -> Vec<Task> {
        self.tasks
            .outstanding()
            .into_iter()
            .filter_map(|task_id| match self.cancel(task_id) {
                Ok(CancelOutcome::Removed(task)) => Some(task),
                _ => None,
            })
            .collect()
    }

    /// Tells up to `n` workers (all of them if `n` is 0) to exit, idle ones first. Their tasks go
    /// back to the queue without being charged a retry.
    pub fn shut_down_workers(&mut self, n: usize) -> usize {
        let mut candidates = self
            .workers
            .iter()
            .map(|worker| (worker.state() != WorkerState::Ready, worker.id))
            .collect::<Vec<_>>();
        candidates.sort_unstable();
        let n = if n == 0 { candidates.len() } else { n };

        let mut count = 0;
        for (_busy, worker_id) in candidates.into_iter().take(n) {
            let Some(worker) = self.workers.remove(worker_id) else {
                continue;
            };
            self.cache.forget_worker(worker_id);
            self.outbox.push((worker.connection, Message::Exit));
            self.retiring.push(worker.connection);
            info!("Shutting down worker {}", worker.label());

            for task_id in worker.tasks {
                let cancelled = self
                    .tasks
                    .get(task_id)
                    .is_some_and(|task| task.cancel_requested);
                let outcome = if cancelled {
                    self.tasks.mark_failed(
                        task_id,
                        FailureKind::Cancelled,
                        "cancelled by the application",
                    )
                } else {
                    self.tasks.requeue(task_id)
                };
                if let Err(e) = outcome {
                    warn!("Could not recover task {}: {}", task_id, e);
                }
            }
            count += 1;
        }
        count
    }

    /// Workers to be dropped: those silent for longer than the liveness window, and (with fast
    /// abort enabled) those running a task for much longer than average
    pub fn lost_workers(&self, now: Instant) -> Vec<(WorkerId, String)> {
        let mut lost = self
            .workers
            .silent_since(now, self.config.liveness_window)
            .into_iter()
            .map(|worker| {
                (
                    worker,
                    format!(
                        "silent for more than {}s",
                        self.config.liveness_window.as_secs_f64()
                    ),
                )
            })
            .collect::<Vec<_>>();

        if let Some(limit) = self.fast_abort_limit() {
            for worker in self.workers.iter() {
                if lost.iter().any(|(id, _)| *id == worker.id) {
                    continue;
                }
                let too_slow = worker.tasks.iter().any(|&task_id| {
                    self.tasks.get(task_id).is_some_and(|task| {
                        task.state == TaskState::Running
                            && task
                                .dispatched_at
                                .is_some_and(|start| now.saturating_duration_since(start) > limit)
                    })
                });
                if too_slow {
                    lost.push((
                        worker.id,
                        format!(
                            "task running longer than {:.1}s (fast abort)",
                            limit.as_secs_f64()
                        ),
                    ));
                }
            }
        }
        lost
    }

    fn fast_abort_limit(&self) -> Option<Duration> {
        let multiplier = self.config.fast_abort_multiplier?;
        if self.totals.timed_tasks < FAST_ABORT_MIN_SAMPLES {
            return None;
        }
        let samples = u32::try_from(self.totals.timed_tasks).ok()?;
        Some((self.totals.execution_time / samples).mul_f64(multiplier))
    }

    /// Workers that have not been heard from for the keepalive interval
    pub fn quiet_workers(&self, now: Instant) -> Vec<ConnectionId> {
        self.workers
            .iter()
            .filter(|worker| {
                now.saturating_duration_since(worker.last_heard) > self.config.keepalive_interval
            })
            .map(|worker| worker.connection)
            .collect()
    }

    /// Discards whatever was still queued for a closed connection, so a new connection reusing
    /// its handle does not receive it
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        self.outbox.retain(|(queued_for, _)| *queued_for != connection);
        self.retiring.retain(|&retiring| retiring != connection);
    }

    pub fn drain_outbox(&mut self) -> Vec<(ConnectionId, Message)> {
        std::mem::take(&mut self.outbox)
    }

    /// Connections to close once their pending messages are out
    pub fn drain_retiring(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.retiring)
    }

    /// Drops all tasks and returns the connections of all workers, which are to be told to exit
    pub fn shut_down(&mut self) -> Vec<ConnectionId> {
        self.shutting_down = true;
        self.tasks.clear();
        self.outbox.clear();
        let connections = self
            .workers
            .iter()
            .map(|worker| worker.connection)
            .collect::<Vec<_>>();
        let ids = self
            .workers
            .iter()
            .map(|worker| worker.id)
            .collect::<Vec<_>>();
        for id in ids {
            self.workers.remove(id);
            self.cache.forget_worker(id);
        }
        connections
    }

    /// Next terminal task, if any
    pub fn take_completed(&mut self) -> Option<Task> {
        self.tasks.take_completed()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drops the fingerprints learned from local paths once no task could be dispatched again.
    /// Returns whether the queue is idle.
    pub fn forget_fingerprints_if_idle(&mut self) -> bool {
        if self.tasks.has_outstanding() {
            return false;
        }
        self.known_fingerprints.clear();
        true
    }

    pub fn hungry(&self) -> usize {
        let submitted = self.tasks.total_submitted();
        if submitted < 100 {
            return (100 - submitted) as usize;
        }
        // 110 % of all slots, rounded up
        let wanted = (self.workers.total_capacity() * 11 + 9) / 10;
        wanted.saturating_sub(self.tasks.count(TaskState::Submitted))
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            workers_connecting: self.workers.pending_handshakes(),
            workers_ready: self.workers.count(WorkerState::Ready),
            workers_busy: self.workers.count(WorkerState::Busy),
            workers_full: self.workers.count(WorkerState::Full),
            capacity: self.workers.total_capacity(),
            tasks_waiting: self.tasks.count(TaskState::Submitted),
            tasks_running: self.tasks.count(TaskState::Dispatching)
                + self.tasks.count(TaskState::Running),
            tasks_retrieving: self.tasks.count(TaskState::Retrieving),
            tasks_complete: self.tasks.count(TaskState::Done) + self.tasks.count(TaskState::Failed),
            total_tasks_submitted: self.tasks.total_submitted(),
            total_tasks_completed: self.tasks.total_completed(),
            total_tasks_retrieved: self.tasks.total_retrieved(),
            total_workers_joined: self.workers.total_joined(),
            total_workers_removed: self.workers.total_removed(),
            total_files_sent: self.totals.files_sent,
            total_bytes_sent: self.totals.bytes_sent,
            total_bytes_received: self.totals.bytes_received,
            total_execution_time: self.totals.execution_time,
        }
    }

    /// The task, provided it is currently assigned to `worker`
    fn owned_task_mut(&mut self, worker: WorkerId, task_id: TaskId) -> Result<&mut Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(Error::UnknownTask(task_id))?;
        if task.worker != Some(worker) || !task.state.is_dispatched() {
            return Err(Error::Protocol(format!(
                "task {task_id} is not assigned to worker #{worker}"
            )));
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CachePolicy;

    fn address() -> SocketAddr {
        "10.0.0.1:51000".parse().unwrap()
    }

    fn core(retry_budget: u32) -> Core {
        Core::new(QueueConfig::default().with_retry_budget(retry_budget))
    }

    /// Stages an assignment the way the dispatcher does it, with buffer contents only
    fn stage(core: &mut Core, assignment: &Assignment) {
        let inputs = assignment
            .inputs
            .iter()
            .map(|spec| {
                let data = match &spec.source {
                    FileSource::Buffer(data) => data.clone(),
                    FileSource::Path(_) => b"file contents".to_vec(),
                };
                let mut spec = spec.clone();
                spec.fingerprint = spec
                    .is_cacheable()
                    .then(|| Fingerprint::of_bytes(&data));
                PreparedInput {
                    spec,
                    data: Some(data),
                }
            })
            .collect();
        core.stage(assignment, inputs).unwrap();
    }

    fn run_to_completion(core: &mut Core, assignment: &Assignment, exit_code: i32) {
        core.task_started(assignment.worker, assignment.task_id)
            .unwrap();
        core.task_result(assignment.worker, assignment.task_id, exit_code, Vec::new())
            .unwrap();
    }

    fn puts(messages: &[(ConnectionId, Message)]) -> Vec<(ConnectionId, String)> {
        messages
            .iter()
            .filter_map(|(connection, message)| match message {
                Message::Put { remote_name, .. } => Some((*connection, remote_name.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn capacity_is_respected() {
        let mut core = core(3);
        let worker = core.handshake(1, "node".into(), address(), 1).unwrap();
        for _ in 0..3 {
            core.submit(Task::new("true")).unwrap();
        }

        let first = core.schedule();
        assert_eq!(first.len(), 1);
        assert!(core.schedule().is_empty());
        assert_eq!(core.stats().tasks_waiting, 2);

        stage(&mut core, &first[0]);
        run_to_completion(&mut core, &first[0], 0);
        assert_eq!(core.workers.get(worker).unwrap().tasks.len(), 0);

        let second = core.schedule();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, 2);
        assert!(!core.is_empty());

        let done = core.take_completed().unwrap();
        assert_eq!(done.id(), Some(1));
        assert_eq!(done.state(), TaskState::Done);
        assert_eq!(done.host(), Some("node"));
    }

    #[test]
    fn cacheable_input_is_pushed_once_per_worker() {
        let mut core = core(3);
        core.handshake(1, "node".into(), address(), 2).unwrap();
        for _ in 0..2 {
            let mut task = Task::new("wc -l reference.fa");
            task.specify_buffer(b">chr1\nACGT\n".to_vec(), "reference.fa", CachePolicy::Cache)
                .specify_buffer(b"--fast".to_vec(), "args", CachePolicy::NoCache);
            core.submit(task).unwrap();
        }

        for assignment in core.schedule() {
            stage(&mut core, &assignment);
        }
        let sent = puts(&core.drain_outbox());
        assert_eq!(
            sent,
            vec![
                (1, "reference.fa".to_string()),
                (1, "args".to_string()),
                (1, "args".to_string())
            ]
        );
        assert_eq!(core.cache.files_on(1), 1);
        assert_eq!(core.stats().total_files_sent, 3);
    }

    #[test]
    fn equal_inputs_of_one_task_are_pushed_once() {
        let mut core = core(3);
        core.handshake(1, "node".into(), address(), 1).unwrap();
        let mut task = Task::new("cmp a b");
        task.specify_buffer(b"same".to_vec(), "a", CachePolicy::Cache)
            .specify_buffer(b"same".to_vec(), "b", CachePolicy::Cache)
            .specify_buffer(b"same".to_vec(), "c", CachePolicy::NoCache);
        let id = core.submit(task).unwrap();
        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);

        let messages = core.drain_outbox();
        assert_eq!(
            puts(&messages),
            vec![(1, "a".to_string()), (1, "c".to_string())]
        );
        // "b" comes out of the worker's cache as well
        let fingerprint = Fingerprint::of_bytes(b"same");
        assert!(messages.contains(&(
            1,
            Message::Run {
                task_id: id,
                command: "cmp a b".into(),
                inputs: vec![
                    StagedFile {
                        remote_name: "a".into(),
                        cache_key: Some(fingerprint)
                    },
                    StagedFile {
                        remote_name: "b".into(),
                        cache_key: Some(fingerprint)
                    },
                    StagedFile {
                        remote_name: "c".into(),
                        cache_key: None
                    },
                ],
                outputs: Vec::new(),
            }
        )));
        assert_eq!(core.stats().total_files_sent, 2);
    }

    #[test]
    fn transfer_plan_follows_the_cache() {
        let mut core = core(3);
        let worker = core.handshake(1, "node".into(), address(), 1).unwrap();
        let fingerprint = Fingerprint::of_bytes(b"reference");
        core.cache.record(worker, fingerprint, "ref.fa");

        let mut task = Task::new("true");
        task.specify_buffer(b"reference".to_vec(), "ref.fa", CachePolicy::Cache)
            .specify_buffer(b"reference".to_vec(), "copy.fa", CachePolicy::NoCache)
            .specify_buffer(b"other".to_vec(), "other.fa", CachePolicy::Cache);
        let mut specs = task.files().to_vec();
        specs[0].fingerprint = Some(fingerprint);
        specs[1].fingerprint = Some(fingerprint);
        specs[2].fingerprint = Some(Fingerprint::of_bytes(b"other"));

        assert_eq!(
            core.plan_transfers(worker, &specs),
            vec![
                Residency::Cached,
                Residency::NeedsTransfer,
                Residency::NeedsTransfer
            ]
        );
        assert_eq!(
            core.plan_transfers(worker + 1, &specs[..1]),
            vec![Residency::NeedsTransfer]
        );
    }

    #[test]
    fn fingerprints_are_forgotten_when_idle() {
        let mut core = core(3);
        core.handshake(1, "node".into(), address(), 1).unwrap();
        let mut task = Task::new("wc -l reference.fa");
        task.specify_file(
            "/data/reference.fa",
            "reference.fa",
            Direction::Input,
            CachePolicy::Cache,
        );
        core.submit(task).unwrap();
        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        assert!(!core.forget_fingerprints_if_idle());
        assert_eq!(core.known_fingerprints.len(), 1);

        // Retrieved or not, a finished task is never dispatched again
        run_to_completion(&mut core, &assignment, 0);
        assert!(core.forget_fingerprints_if_idle());
        assert!(core.known_fingerprints.is_empty());
    }

    #[test]
    fn locality_steers_later_tasks() {
        let mut core = core(3);
        core.handshake(1, "a".into(), address(), 3).unwrap();
        core.handshake(2, "b".into(), address(), 3).unwrap();

        let mut task = Task::new("index reference.fa");
        task.specify_buffer(b">chr1\nACGT\n".to_vec(), "reference.fa", CachePolicy::Cache);
        core.submit(task.clone()).unwrap();
        let first = core.schedule();
        assert_eq!(first[0].worker, 1);
        stage(&mut core, &first[0]);

        // Worker 2 has more free slots now, but worker 1 holds the reference
        core.submit(task).unwrap();
        let second = core.schedule();
        assert_eq!(second[0].worker, 1);
    }

    #[test]
    fn lost_worker_requeues_then_fails() {
        let mut core = core(1);
        let first = core.handshake(1, "a".into(), address(), 1).unwrap();
        let id = core.submit(Task::new("sleep 1")).unwrap();

        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        core.task_started(first, id).unwrap();
        core.disconnect(first, "connection reset");
        assert_eq!(core.tasks.get(id).unwrap().state(), TaskState::Submitted);
        assert_eq!(core.tasks.get(id).unwrap().retries(), 1);
        assert!(core.workers.is_empty());

        let second = core.handshake(2, "b".into(), address(), 1).unwrap();
        let assignment = core.schedule().remove(0);
        assert_eq!(assignment.worker, second);
        stage(&mut core, &assignment);
        core.disconnect(second, "connection reset");

        let task = core.take_completed().unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.failure().map(|failure| failure.kind),
            Some(FailureKind::WorkerLost)
        );
        assert!(core.is_empty());
    }

    #[test]
    fn stale_messages_are_refused() {
        let mut core = core(3);
        let a = core.handshake(1, "a".into(), address(), 1).unwrap();
        let b = core.handshake(2, "b".into(), address(), 1).unwrap();
        let id = core.submit(Task::new("true")).unwrap();
        let assignment = core.schedule().remove(0);
        let other = if assignment.worker == a { b } else { a };

        assert!(matches!(
            core.task_started(other, id),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            core.task_started(a, 99),
            Err(Error::UnknownTask(99))
        ));
    }

    #[test]
    fn non_zero_exit_fails_after_outputs_are_pulled() {
        let mut core = core(3);
        let worker = core.handshake(1, "a".into(), address(), 1).unwrap();
        let mut task = Task::new("false");
        task.specify_file("/tmp/log.txt", "log.txt", Direction::Output, CachePolicy::NoCache);
        let id = core.submit(task).unwrap();

        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        core.drain_outbox();
        run_to_completion(&mut core, &assignment, 1);

        let messages = core.drain_outbox();
        assert!(messages.contains(&(
            1,
            Message::Get {
                task_id: id,
                remote_name: "log.txt".into()
            }
        )));
        assert_eq!(
            core.output_destination(worker, id, "log.txt").unwrap(),
            PathBuf::from("/tmp/log.txt")
        );
        assert!(core.output_destination(worker, id, "other.txt").is_err());

        core.output_stored(worker, id, "log.txt", Ok(12)).unwrap();
        assert!(core
            .drain_outbox()
            .contains(&(1, Message::Release { task_id: id })));

        let task = core.take_completed().unwrap();
        assert_eq!(task.exit_code(), Some(1));
        assert_eq!(task.bytes_received(), 12);
        assert_eq!(
            task.failure().map(|failure| failure.kind),
            Some(FailureKind::ExecutionFailure)
        );
    }

    #[test]
    fn missing_output_is_retried_as_transfer_error() {
        let mut core = core(1);
        let worker = core.handshake(1, "a".into(), address(), 1).unwrap();
        let mut task = Task::new("touch nothing");
        task.specify_file("/tmp/out.txt", "out.txt", Direction::Output, CachePolicy::NoCache);
        let id = core.submit(task).unwrap();

        for _attempt in 0..2 {
            let assignment = core.schedule().remove(0);
            stage(&mut core, &assignment);
            run_to_completion(&mut core, &assignment, 0);
            core.output_stored(worker, id, "out.txt", Err("file is missing".into()))
                .unwrap();
        }

        let task = core.take_completed().unwrap();
        assert_eq!(task.retries(), 1);
        assert_eq!(
            task.failure().map(|failure| failure.kind),
            Some(FailureKind::TransferError)
        );
    }

    #[test]
    fn empty_means_nothing_left_to_retrieve() {
        let mut core = core(3);
        assert!(core.is_empty());
        core.handshake(1, "a".into(), address(), 1).unwrap();
        core.submit(Task::new("true")).unwrap();
        assert!(!core.is_empty());

        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        run_to_completion(&mut core, &assignment, 0);
        // Terminal, but not yet retrieved
        assert!(!core.is_empty());
        assert!(core.take_completed().is_some());
        assert!(core.is_empty());
    }

    #[test]
    fn cancellation() {
        let mut core = core(3);
        let worker = core.handshake(1, "a".into(), address(), 1).unwrap();
        let running = core.submit(Task::new("sleep 100")).unwrap();
        let mut waiting = Task::new("sleep 100");
        waiting.specify_tag("later");
        let waiting = core.submit(waiting).unwrap();

        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        core.task_started(worker, running).unwrap();
        core.drain_outbox();

        match core.cancel_by_tag("later") {
            Some(CancelOutcome::Removed(task)) => assert_eq!(task.id(), Some(waiting)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            core.cancel(running).unwrap(),
            CancelOutcome::Signalled
        ));
        assert_eq!(
            core.drain_outbox(),
            vec![(1, Message::Cancel { task_id: running })]
        );

        core.task_cancelled(worker, running).unwrap();
        let task = core.take_completed().unwrap();
        assert_eq!(
            task.failure().map(|failure| failure.kind),
            Some(FailureKind::Cancelled)
        );
        assert_eq!(core.workers.get(worker).unwrap().free_slots(), 1);
        assert!(matches!(
            core.cancel(running),
            Err(Error::UnknownTask(_))
        ));
    }

    #[test]
    fn cancelled_before_staging_never_runs() {
        let mut core = core(3);
        core.handshake(1, "a".into(), address(), 1).unwrap();
        let id = core.submit(Task::new("sleep 100")).unwrap();
        let assignment = core.schedule().remove(0);

        assert!(matches!(core.cancel(id).unwrap(), CancelOutcome::Signalled));
        stage(&mut core, &assignment);
        assert!(!core
            .drain_outbox()
            .iter()
            .any(|(_, message)| matches!(message, Message::Run { .. })));
        assert_eq!(
            core.take_completed().unwrap().failure().map(|f| f.kind),
            Some(FailureKind::Cancelled)
        );
    }

    #[test]
    fn shut_down_prefers_idle_workers_and_requeues_for_free() {
        let mut core = core(0);
        let busy = core.handshake(1, "busy".into(), address(), 1).unwrap();
        let id = core.submit(Task::new("sleep 100")).unwrap();
        core.schedule();
        let idle = core.handshake(2, "idle".into(), address(), 1).unwrap();

        assert_eq!(core.shut_down_workers(1), 1);
        assert!(core.workers.get(idle).is_err());
        assert_eq!(core.drain_retiring(), vec![2]);
        assert_eq!(core.drain_outbox(), vec![(2, Message::Exit)]);

        assert_eq!(core.shut_down_workers(0), 1);
        assert!(core.workers.get(busy).is_err());
        let task = core.tasks.get(id).unwrap();
        assert_eq!(task.state(), TaskState::Submitted);
        assert_eq!(task.retries(), 0);
    }

    #[test]
    fn hungry_asks_for_more_until_the_pool_is_primed() {
        let mut core = core(3);
        assert_eq!(core.hungry(), 100);
        core.handshake(1, "a".into(), address(), 10).unwrap();
        for _ in 0..100 {
            core.submit(Task::new("true")).unwrap();
        }
        // 11 wanted, but 100 waiting
        assert_eq!(core.hungry(), 0);
        core.schedule();
        assert_eq!(core.stats().tasks_waiting, 90);
        assert_eq!(core.stats().tasks_running, 10);
        assert_eq!(core.stats().workers_full, 1);
    }

    #[test]
    fn silent_workers_are_lost() {
        let mut core = Core::new(
            QueueConfig::default()
                .with_liveness_window(Duration::from_secs(30))
                .with_keepalive_interval(Duration::from_secs(10)),
        );
        let worker = core.handshake(1, "a".into(), address(), 1).unwrap();
        let now = Instant::now();
        assert!(core.lost_workers(now).is_empty());
        assert!(core.quiet_workers(now).is_empty());

        assert_eq!(core.quiet_workers(now + Duration::from_secs(15)), vec![1]);
        let lost = core.lost_workers(now + Duration::from_secs(31));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, worker);
    }

    #[test]
    fn fast_abort_needs_history() {
        let mut core = Core::new(QueueConfig::default().with_fast_abort(2.0));
        core.handshake(1, "a".into(), address(), 1).unwrap();
        for _ in 0..FAST_ABORT_MIN_SAMPLES {
            core.submit(Task::new("true")).unwrap();
            let assignment = core.schedule().remove(0);
            stage(&mut core, &assignment);
            run_to_completion(&mut core, &assignment, 0);
        }
        core.submit(Task::new("sleep 100")).unwrap();
        let assignment = core.schedule().remove(0);
        stage(&mut core, &assignment);
        core.task_started(assignment.worker, assignment.task_id)
            .unwrap();

        let limit = core.fast_abort_limit().unwrap();
        let later = Instant::now() + limit + Duration::from_secs(1);
        let lost = core.lost_workers(later);
        assert_eq!(lost.len(), 1);
        assert!(lost[0].1.contains("fast abort"));
    }
}
