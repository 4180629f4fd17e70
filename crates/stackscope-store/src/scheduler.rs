//! Priority scheduling of tile jobs.
//!
//! A bounded worker pool drains a min-heap of tile jobs ordered by
//! `(priority, submission sequence)`: lower priority values win, ties keep
//! FIFO order. Viewers submit visible tiles at low values and prefetches at
//! higher ones. Submission deduplicates against both the queue and the
//! in-progress set; cancellation is advisory, dropping a job at dequeue but
//! never pre-empting a running worker.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::assembler::TileAssembler;
use crate::types::TileCoord;

/// Default priority for plain tile requests.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Default worker count: `min(16, 2 x logical CPUs)`.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
    (2 * cpus).min(16)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Job {
    priority: i32,
    seq: u64,
    coord: TileCoord,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops first.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<Job>,
    queued: HashSet<TileCoord>,
    cancelled: HashSet<TileCoord>,
}

/// Bounded worker pool over a priority queue of tile jobs.
pub struct TileScheduler {
    state: Mutex<QueueState>,
    notify: Notify,
    in_progress: DashMap<TileCoord, ()>,
    seq: AtomicU64,
    running: AtomicBool,
    workers: usize,
}

impl TileScheduler {
    /// Create a scheduler with the default worker count.
    pub fn new() -> Self {
        Self::with_workers(default_worker_count())
    }

    /// Create a scheduler with a fixed worker count.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                cancelled: HashSet::new(),
            }),
            notify: Notify::new(),
            in_progress: DashMap::new(),
            seq: AtomicU64::new(0),
            running: AtomicBool::new(true),
            workers: workers.max(1),
        }
    }

    /// Enqueue a tile job unless it is already queued or in progress.
    ///
    /// Returns whether the job was accepted.
    pub fn submit(&self, coord: TileCoord, priority: i32) -> bool {
        if self.in_progress.contains_key(&coord) {
            trace!("Job {coord} already in progress, dropping submission");
            return false;
        }

        let mut state = self.state.lock();
        if state.queued.contains(&coord) {
            // A resubmission of a still-queued job revives it if cancelled.
            state.cancelled.remove(&coord);
            trace!("Job {coord} already queued, dropping submission");
            return false;
        }
        state.queued.insert(coord.clone());
        state.cancelled.remove(&coord);
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        state.heap.push(Job { priority, seq, coord });
        drop(state);

        self.notify.notify_one();
        true
    }

    /// Mark a job cancelled.
    ///
    /// Queued jobs are dropped at dequeue; a job already running completes.
    pub fn cancel(&self, coord: &TileCoord) {
        let mut state = self.state.lock();
        if state.queued.contains(coord) {
            state.cancelled.insert(coord.clone());
        }
    }

    /// Number of jobs waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Number of jobs currently being worked.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Stop all workers after their current job.
    pub fn shutdown(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Spawn the worker pool; each worker resolves jobs via `assembler`.
    ///
    /// Workers run until [`shutdown`](Self::shutdown); the returned handles
    /// complete once they have drained.
    pub fn spawn_workers(
        self: &Arc<Self>,
        assembler: Arc<TileAssembler>,
    ) -> Vec<JoinHandle<()>> {
        debug!("Starting {} tile workers", self.workers);
        (0..self.workers)
            .map(|worker| {
                let scheduler = Arc::clone(self);
                let assembler = Arc::clone(&assembler);
                tokio::spawn(async move {
                    scheduler.worker_loop(worker, assembler).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, assembler: Arc<TileAssembler>) {
        trace!("Worker {worker} started");
        while self.running.load(AtomicOrdering::SeqCst) {
            let Some(job) = self.next_job() else {
                // Register interest before re-checking so a submit between
                // the two cannot be missed.
                let notified = self.notify.notified();
                if self.state.lock().heap.is_empty()
                    && self.running.load(AtomicOrdering::SeqCst)
                {
                    notified.await;
                }
                continue;
            };

            if self.in_progress.insert(job.coord.clone(), ()).is_some() {
                // The same tile got picked up by another worker between
                // submission episodes; the coalescer makes rework free, but
                // skipping keeps the worker available.
                continue;
            }

            trace!(
                "Worker {worker} fetching {} (priority {}, seq {})",
                job.coord, job.priority, job.seq
            );
            assembler.tile(&job.coord).await;
            self.in_progress.remove(&job.coord);
        }
        trace!("Worker {worker} stopped");
    }

    /// Pop the best non-cancelled job, if any.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        while let Some(job) = state.heap.pop() {
            state.queued.remove(&job.coord);
            if state.cancelled.remove(&job.coord) {
                debug!("Dropping cancelled job {}", job.coord);
                continue;
            }
            return Some(job);
        }
        None
    }
}

impl Default for TileScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TileScheduler {
    fn drop(&mut self) {
        if self.running.load(AtomicOrdering::SeqCst) && !self.state.lock().heap.is_empty() {
            warn!("Scheduler dropped with jobs still queued");
        }
    }
}
