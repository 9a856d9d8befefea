use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::info;

use crate::{
    errors::{Error, Result},
    task::TaskId,
};

pub type WorkerId = u64;

/// Handle of the network connection a worker is attached to. Only meaningful to the dispatcher.
pub type ConnectionId = usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// No task assigned
    Ready,
    /// Some, but not all slots taken
    Busy,
    /// All slots taken
    Full,
}

/// A connected executor
#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub connection: ConnectionId,
    pub hostname: String,
    pub address: SocketAddr,
    pub capacity: usize,
    pub tasks: BTreeSet<TaskId>,
    pub last_heard: Instant,
    pub tasks_completed: u64,
    pub total_task_time: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Worker {
    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.tasks.len())
    }

    pub fn state(&self) -> WorkerState {
        if self.tasks.is_empty() {
            WorkerState::Ready
        } else if self.free_slots() == 0 {
            WorkerState::Full
        } else {
            WorkerState::Busy
        }
    }

    /// Average execution time of the tasks this worker has finished. Zero without history.
    pub fn average_task_time(&self) -> Duration {
        u32::try_from(self.tasks_completed)
            .ok()
            .filter(|&completed| completed > 0)
            .map_or(Duration::ZERO, |completed| self.total_task_time / completed)
    }

    /// "hostname (address)", for log messages
    pub fn label(&self) -> String {
        format!("{} ({})", self.hostname, self.address)
    }
}

/// Keeps track of connected workers. IDs are handed out in registration order, which makes
/// iteration order deterministic.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, Worker>,
    by_connection: HashMap<ConnectionId, WorkerId>,
    pending_handshakes: usize,
    total_joined: u64,
    total_removed: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// A connection has been accepted, but the worker has not introduced itself yet
    pub fn connection_opened(&mut self) {
        self.pending_handshakes += 1;
    }

    /// A connection went away before the handshake completed
    pub fn connection_closed(&mut self) {
        self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
    }

    /// Turns a freshly handshaken connection into a worker
    pub fn register(
        &mut self,
        connection: ConnectionId,
        hostname: String,
        address: SocketAddr,
        capacity: usize,
    ) -> Result<WorkerId> {
        if capacity == 0 {
            return Err(Error::Protocol(format!(
                "worker {hostname} ({address}) advertised zero task slots"
            )));
        }
        if self.by_connection.contains_key(&connection) {
            return Err(Error::Protocol(format!(
                "worker {hostname} ({address}) sent a second handshake"
            )));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
        self.total_joined += 1;
        self.by_connection.insert(connection, id);
        let worker = Worker {
            id,
            connection,
            hostname,
            address,
            capacity,
            tasks: BTreeSet::new(),
            last_heard: Instant::now(),
            tasks_completed: 0,
            total_task_time: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
        };
        info!(
            "Worker {} joined as #{} with {} slot(s)",
            worker.label(),
            id,
            capacity
        );
        self.workers.insert(id, worker);
        Ok(id)
    }

    pub fn heartbeat(&mut self, id: WorkerId) -> Result<()> {
        let worker = self.get_mut(id)?;
        worker.last_heard = Instant::now();
        Ok(())
    }

    pub fn available_slots(&self, id: WorkerId) -> Result<usize> {
        self.get(id).map(Worker::free_slots)
    }

    /// Takes one slot for `task`. Fails if the worker is full.
    pub fn reserve(&mut self, id: WorkerId, task: TaskId) -> Result<()> {
        let worker = self.get_mut(id)?;
        if worker.free_slots() == 0 {
            return Err(Error::Protocol(format!(
                "worker #{id} has no free slot for task {task}"
            )));
        }
        worker.tasks.insert(task);
        Ok(())
    }

    /// Gives back the slot `task` held. Returns whether it actually held one.
    pub fn release(&mut self, id: WorkerId, task: TaskId) -> bool {
        self.workers
            .get_mut(&id)
            .is_some_and(|worker| worker.tasks.remove(&task))
    }

    /// Removes a worker and hands it back, including the tasks it still held
    pub fn remove(&mut self, id: WorkerId) -> Option<Worker> {
        let worker = self.workers.remove(&id)?;
        self.by_connection.remove(&worker.connection);
        self.total_removed += 1;
        Some(worker)
    }

    pub fn get(&self, id: WorkerId) -> Result<&Worker> {
        self.workers.get(&id).ok_or(Error::UnknownWorker(id))
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Result<&mut Worker> {
        self.workers.get_mut(&id).ok_or(Error::UnknownWorker(id))
    }

    /// Workers in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// Workers that have been silent for longer than `window`
    pub fn silent_since(&self, now: Instant, window: Duration) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|worker| now.saturating_duration_since(worker.last_heard) > window)
            .map(|worker| worker.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn has_free_slots(&self) -> bool {
        self.workers.values().any(|worker| worker.free_slots() > 0)
    }

    pub fn total_capacity(&self) -> usize {
        self.workers.values().map(|worker| worker.capacity).sum()
    }

    pub fn count(&self, state: WorkerState) -> usize {
        self.workers
            .values()
            .filter(|worker| worker.state() == state)
            .count()
    }

    pub fn pending_handshakes(&self) -> usize {
        self.pending_handshakes
    }

    pub fn total_joined(&self) -> u64 {
        self.total_joined
    }

    pub fn total_removed(&self) -> u64 {
        self.total_removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut registry = WorkerRegistry::new();
        registry.connection_opened();
        assert_eq!(registry.pending_handshakes(), 1);
        let id = registry.register(3, "node1".into(), address(), 2).unwrap();
        assert_eq!(registry.pending_handshakes(), 0);

        assert_eq!(registry.available_slots(id).unwrap(), 2);
        assert_eq!(registry.get(id).unwrap().state(), WorkerState::Ready);
        registry.reserve(id, 10).unwrap();
        assert_eq!(registry.get(id).unwrap().state(), WorkerState::Busy);
        registry.reserve(id, 11).unwrap();
        assert_eq!(registry.get(id).unwrap().state(), WorkerState::Full);
        assert!(registry.reserve(id, 12).is_err());
        assert!(!registry.has_free_slots());

        assert!(registry.release(id, 10));
        assert!(!registry.release(id, 10));
        assert_eq!(registry.available_slots(id).unwrap(), 1);
    }

    #[test]
    fn ids_follow_registration_order() {
        let mut registry = WorkerRegistry::new();
        let ids = (0..3)
            .map(|connection| {
                registry
                    .register(connection, format!("node{connection}"), address(), 1)
                    .unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(
            registry.iter().map(|worker| worker.id).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(registry.get(3).unwrap().connection, 2);
        assert_eq!(registry.total_capacity(), 3);

        let removed = registry.remove(2).unwrap();
        assert_eq!(removed.hostname, "node1");
        assert_eq!(registry.total_joined(), 3);
        assert_eq!(registry.total_removed(), 1);
        assert!(matches!(registry.get(2), Err(Error::UnknownWorker(2))));

        // The connection of a removed worker may carry a new one
        assert_eq!(registry.register(1, "node1".into(), address(), 1).unwrap(), 4);
    }

    #[test]
    fn bad_handshakes_are_rejected() {
        let mut registry = WorkerRegistry::new();
        assert!(registry.register(1, "node".into(), address(), 0).is_err());
        registry.register(1, "node".into(), address(), 1).unwrap();
        assert!(registry.register(1, "node".into(), address(), 1).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn silent_workers_are_detected() {
        let mut registry = WorkerRegistry::new();
        let quiet = registry.register(1, "quiet".into(), address(), 1).unwrap();
        let chatty = registry.register(2, "chatty".into(), address(), 1).unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        registry.get_mut(chatty).unwrap().last_heard = later;
        assert_eq!(
            registry.silent_since(later, Duration::from_secs(30)),
            vec![quiet]
        );
        assert!(registry
            .silent_since(Instant::now(), Duration::from_secs(30))
            .is_empty());
    }

    #[test]
    fn average_task_time_without_history_is_zero() {
        let mut registry = WorkerRegistry::new();
        let id = registry.register(1, "node".into(), address(), 1).unwrap();
        assert_eq!(registry.get(id).unwrap().average_task_time(), Duration::ZERO);

        let worker = registry.get_mut(id).unwrap();
        worker.tasks_completed = 4;
        worker.total_task_time = Duration::from_secs(10);
        assert_eq!(worker.average_task_time(), Duration::from_millis(2500));
    }
}
