pub mod cache;
pub(crate) mod core;
pub mod scheduler;
pub mod workers;

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use mio::{Poll, Waker};

pub use crate::queue::workers::WorkerId;
use crate::{
    config::QueueConfig,
    distributed::dispatcher::{Dispatcher, WAKER},
    errors::{Error, Result},
    queue::core::Core,
    task::{Task, TaskId},
};

/// What `Queue::cancel()` did to a task
#[derive(Debug)]
pub enum CancelOutcome {
    /// The task had not been dispatched yet and is handed back right away
    Removed(Task),
    /// The worker has been told to stop. The task will be returned by `Queue::wait()`.
    Signalled,
    /// The task is already being retrieved or has finished
    Unaffected,
}

/// Snapshot of a queue's state and lifetime totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub workers_connecting: usize,
    pub workers_ready: usize,
    pub workers_busy: usize,
    pub workers_full: usize,
    /// Task slots of all connected workers
    pub capacity: usize,

    pub tasks_waiting: usize,
    pub tasks_running: usize,
    pub tasks_retrieving: usize,
    /// Terminal, but not yet returned by `Queue::wait()`
    pub tasks_complete: usize,

    pub total_tasks_submitted: u64,
    pub total_tasks_completed: u64,
    pub total_tasks_retrieved: u64,
    pub total_workers_joined: u64,
    pub total_workers_removed: u64,
    pub total_files_sent: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_execution_time: Duration,
}

/// State shared between the application and the dispatcher thread
#[derive(Debug)]
pub(crate) struct Shared {
    core: Mutex<Core>,
    /// Signalled whenever tasks may have reached a terminal state
    completed: Condvar,
}

impl Shared {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            core: Mutex::new(Core::new(config)),
            completed: Condvar::new(),
        }
    }

    /// A panicking thread can not leave the registries in a state worse than an interrupted
    /// transition, so poisoning is ignored
    pub fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        self.completed.notify_all();
    }
}

/// The master side of a pool of workers.
///
/// Tasks are submitted from the application thread and executed on whichever workers connect to
/// the queue's port. A background thread runs the network protocol; the application only ever
/// blocks in `Queue::wait()`. Dropping the queue tells all workers to exit and discards any task
/// that has not been retrieved.
#[derive(Debug)]
pub struct Queue {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    port: u16,
    dispatcher: Option<JoinHandle<()>>,
}

impl Queue {
    /// Listens on `port` on all interfaces, with default settings. Port 0 picks any free port.
    pub fn create(port: u16) -> Result<Self> {
        Self::with_config(port, QueueConfig::default())
    }

    pub fn with_config(port: u16, config: QueueConfig) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener =
            StdTcpListener::bind(addr).map_err(|source| Error::BindFailure { port, source })?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let shared = Arc::new(Shared::new(config));

        let dispatcher = Dispatcher::new(
            poll,
            mio::net::TcpListener::from_std(listener),
            Arc::clone(&shared),
        )?;
        let handle = thread::Builder::new()
            .name("workq-dispatcher".into())
            .spawn(move || dispatcher.run())?;
        info!("Listening for workers on port {}", port);

        Ok(Self {
            shared,
            waker,
            port,
            dispatcher: Some(handle),
        })
    }

    /// The port workers connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hands a task over to the queue. Fails with `Error::InvalidTask` if it can not be
    /// executed.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        let id = self.shared.lock().submit(task)?;
        self.wake();
        Ok(id)
    }

    /// Blocks until a task has reached a terminal state and returns it, or returns `None` if the
    /// timeout elapsed first. `None` as timeout waits indefinitely. Returns `None` right away if
    /// there is nothing left to wait for.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Task> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut core = self.shared.lock();
        loop {
            if let Some(task) = core.take_completed() {
                debug!("Returning task {}", task);
                return Some(task);
            }
            if core.shutting_down || !core.tasks.has_outstanding() {
                return None;
            }

            core = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    self.shared
                        .completed
                        .wait_timeout(core, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .completed
                    .wait(core)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// No task is waiting, running, or waiting to be retrieved
    pub fn empty(&self) -> bool {
        self.shared.lock().is_empty()
    }

    /// How many more tasks should be submitted to keep all workers busy
    pub fn hungry(&self) -> usize {
        self.shared.lock().hungry()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats()
    }

    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let outcome = self.shared.lock().cancel(id)?;
        self.wake();
        Ok(outcome)
    }

    /// Cancels the oldest unfinished task carrying `tag`
    pub fn cancel_by_tag(&self, tag: &str) -> Option<CancelOutcome> {
        let outcome = self.shared.lock().cancel_by_tag(tag);
        self.wake();
        outcome
    }

    /// Cancels all unfinished tasks and returns the ones that had not been dispatched yet
    pub fn cancel_all(&self) -> Vec<Task> {
        let removed = self.shared.lock().cancel_all();
        self.wake();
        removed
    }

    /// Tells up to `n` workers to exit, idle ones first. `0` means all of them.
    pub fn shut_down_workers(&self, n: usize) -> usize {
        let count = self.shared.lock().shut_down_workers(n);
        self.wake();
        count
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("Could not wake the dispatcher: {}", e);
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.shared.lock().shutting_down = true;
        self.wake();
        self.shared.notify();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("The dispatcher thread panicked");
            }
        }
        debug!("Queue on port {} shut down", self.port);
    }
}
