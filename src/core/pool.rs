// src/core/pool.rs

//! Bounded worker pool for module invocations.
//!
//! Every module instance owns a FIFO lane. A single scheduler task polls all
//! lanes round-robin and starts a task whenever both the global bound and the
//! lane's own `max_instances` allow it, so a saturated module never holds up
//! the others. Submissions and completions travel over one channel, which
//! keeps "new work submitted by a finishing task" ordered before "that task
//! finished" and lets the scan controller detect quiescence from the stats.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::dispatch::Lane;
use crate::core::error::ModuleError;
use crate::core::models::{Event, EventDraft};

/// One module invocation waiting for, or holding, a pool slot.
#[derive(Debug, Clone)]
pub struct Task {
    pub lane: Lane,
    pub event: Arc<Event>,
}

/// What the pool runs. `invoke` is bounded by the pool's timeout;
/// `complete` always runs afterwards, before the slot is released.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn invoke(&self, task: &Task) -> Result<Vec<EventDraft>, ModuleError>;

    async fn complete(&self, task: Task, outcome: Result<Vec<EventDraft>, ModuleError>);

    /// Human-readable name of a lane, used in timeout and panic errors.
    fn lane_name(&self, lane: Lane) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_threads: usize,
    pub timeout: Duration,
}

/// Snapshot of the pool published after every scheduler step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
    /// Tasks accepted since the pool started. Only ever grows.
    pub submitted: u64,
    pub completed: u64,
    /// Tasks discarded without running because the pool was cancelled.
    pub dropped: u64,
    pub draining: bool,
}

impl PoolStats {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.running == 0
    }
}

#[derive(Debug)]
enum Command {
    Submit(Task),
    Done(Lane),
    Shutdown,
}

/// Cloneable handle for feeding tasks to a pool.
#[derive(Debug, Clone)]
pub struct Submitter {
    tx: mpsc::UnboundedSender<Command>,
}

impl Submitter {
    /// Queues a task. Returns `false` once the pool is gone.
    pub fn submit(&self, task: Task) -> bool {
        self.tx.send(Command::Submit(task)).is_ok()
    }
}

/// Receiving half created alongside a [`Submitter`] before the pool starts,
/// so the task handler can hold a submitter of its own.
#[derive(Debug)]
pub struct PoolInbox {
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

pub fn channel() -> (Submitter, PoolInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Submitter { tx: tx.clone() }, PoolInbox { tx, rx })
}

pub struct WorkerPool {
    submitter: Submitter,
    stats: watch::Receiver<PoolStats>,
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns the scheduler loop. `lane_limits[i]` is the concurrency ceiling of lane `i`.
    pub fn start<H: TaskHandler>(
        inbox: PoolInbox,
        handler: Arc<H>,
        lane_limits: Vec<usize>,
        settings: PoolSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (stats_tx, stats) = watch::channel(PoolStats::default());
        let submitter = Submitter { tx: inbox.tx.clone() };
        let lanes = lane_limits.len();
        let scheduler = Scheduler {
            handler,
            tx: inbox.tx,
            rx: inbox.rx,
            stats_tx,
            cancel: cancel.clone(),
            limits: lane_limits.into_iter().map(|l| l.max(1)).collect(),
            queues: (0..lanes).map(|_| VecDeque::new()).collect(),
            running: vec![0; lanes],
            running_total: 0,
            max_threads: settings.max_threads.max(1),
            timeout: settings.timeout,
            cursor: 0,
            stats: PoolStats::default(),
            shutting_down: false,
        };
        debug!(lanes, max_threads = settings.max_threads, "Starting worker pool.");
        let scheduler = tokio::spawn(scheduler.run());
        Self { submitter, stats, cancel, scheduler }
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Stops accepting work and discards queued tasks. Running tasks finish on their own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the pool and waits for in-flight tasks to return.
    pub async fn shutdown(self) -> PoolStats {
        self.cancel.cancel();
        let _ = self.submitter.tx.send(Command::Shutdown);
        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "Worker pool scheduler ended abnormally.");
        }
        *self.stats.borrow()
    }
}

struct Scheduler<H: TaskHandler> {
    handler: Arc<H>,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    stats_tx: watch::Sender<PoolStats>,
    cancel: CancellationToken,
    limits: Vec<usize>,
    queues: Vec<VecDeque<Task>>,
    running: Vec<usize>,
    running_total: usize,
    max_threads: usize,
    timeout: Duration,
    cursor: usize,
    stats: PoolStats,
    shutting_down: bool,
}

impl<H: TaskHandler> Scheduler<H> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.stats.draining => self.begin_drain(),
                command = self.rx.recv() => match command {
                    Some(Command::Submit(task)) => self.enqueue(task),
                    Some(Command::Done(lane)) => self.release(lane),
                    Some(Command::Shutdown) => {
                        self.shutting_down = true;
                        self.begin_drain();
                    }
                    None => break,
                },
            }
            if !self.stats.draining {
                self.start_ready();
            }
            self.publish();
            if self.shutting_down && self.running_total == 0 {
                break;
            }
        }
        debug!(completed = self.stats.completed, dropped = self.stats.dropped, "Worker pool stopped.");
    }

    fn enqueue(&mut self, task: Task) {
        if self.stats.draining || task.lane >= self.queues.len() {
            self.stats.dropped += 1;
            return;
        }
        trace!(lane = task.lane, hash = %task.event.hash, "Task queued.");
        self.queues[task.lane].push_back(task);
        self.stats.submitted += 1;
        self.stats.queued += 1;
    }

    fn release(&mut self, lane: Lane) {
        self.running[lane] -= 1;
        self.running_total -= 1;
        self.stats.running = self.running_total;
        self.stats.completed += 1;
    }

    fn begin_drain(&mut self) {
        if self.stats.draining {
            return;
        }
        let discarded: usize = self.queues.iter().map(VecDeque::len).sum();
        for queue in &mut self.queues {
            queue.clear();
        }
        self.stats.dropped += discarded as u64;
        self.stats.queued = 0;
        self.stats.draining = true;
        debug!(discarded, running = self.running_total, "Worker pool draining.");
    }

    /// Starts as many queued tasks as the bounds allow, visiting lanes round-robin.
    fn start_ready(&mut self) {
        let lanes = self.queues.len();
        let mut idle_visits = 0;
        while self.running_total < self.max_threads && idle_visits < lanes {
            let lane = self.cursor;
            self.cursor = (self.cursor + 1) % lanes;
            if self.running[lane] < self.limits[lane] {
                if let Some(task) = self.queues[lane].pop_front() {
                    self.spawn(task);
                    idle_visits = 0;
                    continue;
                }
            }
            idle_visits += 1;
        }
    }

    fn spawn(&mut self, task: Task) {
        let lane = task.lane;
        self.running[lane] += 1;
        self.running_total += 1;
        self.stats.queued -= 1;
        self.stats.running = self.running_total;

        let handler = self.handler.clone();
        let timeout = self.timeout;
        let guard = SlotGuard { tx: self.tx.clone(), lane };
        tokio::spawn(async move {
            let _guard = guard;
            let invocation = AssertUnwindSafe(handler.invoke(&task)).catch_unwind();
            let result = tokio::time::timeout(timeout, invocation).await;
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(ModuleError::Panicked { module: handler.lane_name(lane) }),
                Err(_) => Err(ModuleError::TimedOut {
                    module: handler.lane_name(lane),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            handler.complete(task, outcome).await;
        });
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats);
    }
}

/// Returns the slot to the scheduler even if the task unwinds.
struct SlotGuard {
    tx: mpsc::UnboundedSender<Command>,
    lane: Lane,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Done(self.lane));
    }
}
