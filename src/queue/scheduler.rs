use std::{cmp::Reverse, collections::HashMap, path::PathBuf};

use rand::seq::IndexedRandom;

use crate::{
    queue::{
        cache::{FileCacheTracker, Fingerprint},
        workers::{Worker, WorkerId, WorkerRegistry},
    },
    task::{FileSource, Task},
};

/// How the scheduler picks a worker for a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ScheduleAlgorithm {
    /// Prefer the worker that already caches most of the task's inputs
    #[default]
    Files,
    /// First worker (in registration order) with a free slot
    Fcfs,
    /// Worker with the lowest average execution time so far
    Time,
    /// Any worker with a free slot
    Random,
}

/// Picks a worker with at least one free slot for `task`, or `None` if every worker is full.
///
/// `known` maps local paths to fingerprints learned from earlier transfers. It stands in for
/// inputs of this task that have not been fingerprinted themselves yet.
pub fn choose_worker(
    task: &Task,
    algorithm: ScheduleAlgorithm,
    workers: &WorkerRegistry,
    cache: &FileCacheTracker,
    known: &HashMap<PathBuf, Fingerprint>,
) -> Option<WorkerId> {
    let mut candidates = workers.iter().filter(|worker| worker.free_slots() > 0);

    match algorithm {
        ScheduleAlgorithm::Files => {
            let fingerprints = cacheable_fingerprints(task, known);
            // Ties are broken by free slots, then by registration order
            candidates
                .max_by_key(|worker| {
                    (
                        cache.resident_count(worker.id, fingerprints.iter().copied()),
                        worker.free_slots(),
                        Reverse(worker.id),
                    )
                })
                .map(|worker| worker.id)
        }
        ScheduleAlgorithm::Fcfs => candidates.next().map(|worker| worker.id),
        ScheduleAlgorithm::Time => candidates
            .min_by_key(|worker| (worker.average_task_time(), worker.id))
            .map(|worker| worker.id),
        ScheduleAlgorithm::Random => candidates
            .collect::<Vec<&Worker>>()
            .choose(&mut rand::rng())
            .map(|worker| worker.id),
    }
}

fn cacheable_fingerprints(task: &Task, known: &HashMap<PathBuf, Fingerprint>) -> Vec<Fingerprint> {
    task.inputs()
        .filter(|spec| spec.is_cacheable())
        .filter_map(|spec| {
            spec.fingerprint.or_else(|| match &spec.source {
                FileSource::Path(path) => known.get(path).copied(),
                FileSource::Buffer(data) => Some(Fingerprint::of_bytes(data)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::task::{CachePolicy, Direction};

    fn registry(capacities: &[usize]) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for (connection, &capacity) in capacities.iter().enumerate() {
            registry
                .register(
                    connection,
                    format!("node{connection}"),
                    "127.0.0.1:9000".parse().unwrap(),
                    capacity,
                )
                .unwrap();
        }
        registry
    }

    fn task_with_inputs(paths: &[&str]) -> Task {
        let mut task = Task::new("cat *");
        for path in paths {
            task.specify_file(*path, *path, Direction::Input, CachePolicy::Cache);
        }
        task
    }

    #[test]
    fn locality_wins() {
        let workers = registry(&[4, 1, 1]);
        let mut cache = FileCacheTracker::new();
        let reference = Fingerprint::of_bytes(b"reference");
        let reads = Fingerprint::of_bytes(b"reads");
        cache.record(2, reference, "ref.fa");
        cache.record(3, reference, "ref.fa");
        cache.record(3, reads, "reads.fq");

        let known = HashMap::from([
            (PathBuf::from("ref.fa"), reference),
            (PathBuf::from("reads.fq"), reads),
        ]);
        let task = task_with_inputs(&["ref.fa", "reads.fq"]);
        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Files, &workers, &cache, &known),
            Some(3)
        );

        // Without any known fingerprint, the worker with the most free slots wins
        assert_eq!(
            choose_worker(
                &task,
                ScheduleAlgorithm::Files,
                &workers,
                &cache,
                &HashMap::new()
            ),
            Some(1)
        );
    }

    #[test]
    fn ties_go_to_free_slots_then_registration_order() {
        let mut workers = registry(&[2, 2, 3]);
        let cache = FileCacheTracker::new();
        let task = task_with_inputs(&[]);

        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Files, &workers, &cache, &HashMap::new()),
            Some(3)
        );
        workers.reserve(3, 100).unwrap();
        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Files, &workers, &cache, &HashMap::new()),
            Some(1)
        );
    }

    #[test]
    fn buffers_are_fingerprinted_on_the_fly() {
        let workers = registry(&[1, 1]);
        let mut cache = FileCacheTracker::new();
        cache.record(2, Fingerprint::of_bytes(b"params"), "params.json");

        let mut task = Task::new("run --config params.json");
        task.specify_buffer(b"params".to_vec(), "params.json", CachePolicy::Cache);
        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Files, &workers, &cache, &HashMap::new()),
            Some(2)
        );
    }

    #[test]
    fn full_workers_are_skipped() {
        let mut workers = registry(&[1, 1]);
        let cache = FileCacheTracker::new();
        let task = task_with_inputs(&[]);

        workers.reserve(1, 1).unwrap();
        for algorithm in [
            ScheduleAlgorithm::Files,
            ScheduleAlgorithm::Fcfs,
            ScheduleAlgorithm::Time,
            ScheduleAlgorithm::Random,
        ] {
            assert_eq!(
                choose_worker(&task, algorithm, &workers, &cache, &HashMap::new()),
                Some(2)
            );
        }

        workers.reserve(2, 2).unwrap();
        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Files, &workers, &cache, &HashMap::new()),
            None
        );
    }

    #[test]
    fn fastest_worker_is_preferred_by_time() {
        let mut workers = registry(&[1, 1, 1]);
        for (id, seconds) in [(1, 10), (2, 2), (3, 5)] {
            let worker = workers.get_mut(id).unwrap();
            worker.tasks_completed = 1;
            worker.total_task_time = Duration::from_secs(seconds);
        }
        let cache = FileCacheTracker::new();
        let task = task_with_inputs(&[]);

        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Time, &workers, &cache, &HashMap::new()),
            Some(2)
        );
        assert_eq!(
            choose_worker(&task, ScheduleAlgorithm::Fcfs, &workers, &cache, &HashMap::new()),
            Some(1)
        );
    }
}
