//! Priority queue and dispatch loop.
//!
//! Tasks wait here once their priority is known. The dispatch loop pairs the head of
//! the queue with an idle model instance, most urgent first and FIFO within a tier.

use crate::AppState;
use crate::errors::AdmissionError;
use crate::pool::{Lease, Purpose};
use crate::task::{Task, TaskResult};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// A queued task with its arrival sequence number.
#[derive(Debug)]
pub struct QueueEntry {
    pub task: Task,
    pub sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.effective_priority() == other.task.effective_priority()
            && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .effective_priority()
            .cmp(&other.task.effective_priority())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    closed: bool,
    total_enqueued: u64,
    total_dispatched: u64,
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub depth: usize,
    pub admitted: usize,
}

/// The dispatch queue, plus the admission slots counted against its capacity.
///
/// Arrival order is fixed when a slot is reserved, not when the task reaches the
/// queue, so tasks that spend different amounts of time being ranked still leave
/// their tier in the order they were accepted.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<QueueState>,
    capacity: Option<usize>,
    next_sequence: AtomicU64,
    /// Tasks admitted but not yet dispatched, including those still being ranked.
    admitted: AtomicUsize,
    changed: Notify,
    closing: Notify,
    settled: Notify,
}

impl Scheduler {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            next_sequence: AtomicU64::new(0),
            admitted: AtomicUsize::new(0),
            changed: Notify::new(),
            closing: Notify::new(),
            settled: Notify::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot for a newly accepted task. Returns the task's arrival sequence.
    pub fn try_admit(&self) -> Result<u64, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::ShuttingDown);
        }
        let capacity = self.capacity;
        self.admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match capacity {
                Some(cap) if n >= cap => None,
                _ => Some(n + 1),
            })
            .map_err(|_| AdmissionError::QueueFull {
                capacity: capacity.unwrap_or_default(),
            })?;
        Ok(self.next_sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// Give back a slot whose task will never reach the queue.
    pub fn abandon(&self) {
        self.release_slot();
    }

    fn release_slot(&self) {
        let previous = self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.settled.notify_waiters();
        }
    }

    /// Queue a task whose priority is resolved. Returns its sequence number.
    ///
    /// A task admitted through [`try_admit`](Self::try_admit) keeps the sequence it
    /// reserved there. Once the scheduler is closed the task is handed back; its slot
    /// stays reserved until the caller abandons it.
    pub fn enqueue(&self, mut task: Task) -> Result<u64, Task> {
        let sequence = {
            let mut state = self.lock();
            if state.closed {
                return Err(task);
            }
            let sequence = match task.sequence() {
                Some(sequence) => sequence,
                None => {
                    let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
                    task.set_sequence(sequence);
                    sequence
                }
            };
            state.total_enqueued += 1;
            debug!(
                task_id = %task.id,
                priority = %task.effective_priority(),
                sequence,
                depth = state.heap.len() + 1,
                "Enqueued task"
            );
            state.heap.push(QueueEntry { task, sequence });
            sequence
        };
        self.changed.notify_one();
        Ok(sequence)
    }

    /// Remove the most urgent, earliest-queued task.
    pub fn pop(&self) -> Option<QueueEntry> {
        let entry = {
            let mut state = self.lock();
            let entry = state.heap.pop()?;
            state.total_dispatched += 1;
            entry
        };
        self.release_slot();
        Some(entry)
    }

    /// Stop taking tasks and return everything still queued, most urgent first.
    ///
    /// Slots of the returned tasks stay reserved until the caller abandons them,
    /// so [`settled`](Self::settled) does not resolve before their results are out.
    pub fn close(&self) -> Vec<Task> {
        let stranded = {
            let mut state = self.lock();
            state.closed = true;
            let mut stranded = Vec::with_capacity(state.heap.len());
            while let Some(entry) = state.heap.pop() {
                stranded.push(entry.task);
            }
            stranded
        };
        self.closing.notify_waiters();
        stranded
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let closing = self.closing.notified();
            tokio::pin!(closing);
            closing.as_mut().enable();
            if self.is_closed() {
                return;
            }
            closing.await;
        }
    }

    /// Resolves once no admitted task is left waiting for dispatch or ranking.
    pub async fn settled(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.admitted.load(Ordering::SeqCst) == 0 {
                return;
            }
            settled.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        SchedulerStats {
            enqueued: state.total_enqueued,
            dispatched: state.total_dispatched,
            depth: state.heap.len(),
            admitted: self.admitted.load(Ordering::SeqCst),
        }
    }
}

/// Dispatch queued tasks onto idle instances until `shutdown` flips to `true`.
///
/// Generations already started when shutdown arrives are allowed to finish and
/// hand their results to the dispatcher before this returns.
#[instrument(skip_all)]
pub async fn run_dispatch_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut in_flight = JoinSet::new();
    info!("Dispatch loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let queue_changed = state.scheduler.changed.notified();
        let capacity_changed = state.pool.capacity_changed();
        tokio::pin!(queue_changed, capacity_changed);
        queue_changed.as_mut().enable();
        capacity_changed.as_mut().enable();

        while !state.scheduler.is_empty() {
            let Some(lease) = state.pool.try_acquire(Purpose::Generate) else {
                break;
            };
            let Some(entry) = state.scheduler.pop() else {
                break;
            };
            debug!(
                task_id = %entry.task.id,
                model_id = lease.instance_id(),
                sequence = entry.sequence,
                "Dispatching task"
            );
            in_flight.spawn(generate(Arc::clone(&state), lease, entry.task));
        }

        tokio::select! {
            _ = &mut queue_changed => {}
            _ = &mut capacity_changed => {}
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Generation task failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "Waiting for running generations");
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Generation task failed");
        }
    }
    info!("Dispatch loop stopped");
}

async fn generate(state: Arc<AppState>, lease: Lease, mut task: Task) {
    let model_id = lease.instance_id();
    let started = Instant::now();
    let text = std::mem::take(&mut task.text);

    let outcome = lease.generate(text, task.max_tokens).await;
    drop(lease);

    let result = match outcome {
        Ok(tool_input_json) => {
            debug!(
                task_id = %task.id,
                model_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Generation finished"
            );
            TaskResult::success(&task, model_id, tool_input_json)
        }
        Err(e) => {
            warn!(task_id = %task.id, model_id, error = %e, "Generation failed");
            TaskResult::failure(&task, model_id, e)
        }
    };
    state.complete(task.callback, result);
}
